//! Composite request identifiers.
//!
//! A custom id is `model_config-question-prompt_variation[-eval-metric]`,
//! hyphen-joined. Parsing drops the literal tokens `question`, `q` and `eval`
//! and splits on the remaining hyphens, so components are validated on the way
//! in: a component that contains a hyphen or equals one of those tokens would
//! not survive the round trip.

use crate::errors::StructuralError;
use std::fmt;

pub const FILTERED_TOKENS: [&str; 3] = ["question", "q", "eval"];
const EVAL_MARKER: &str = "eval";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomId {
    pub model_config_id: String,
    pub question_id: String,
    pub prompt_variation_id: String,
    pub metric_id: Option<String>,
}

impl CustomId {
    pub fn new(
        model_config_id: &str,
        question_id: &str,
        prompt_variation_id: &str,
    ) -> Result<Self, StructuralError> {
        for c in [model_config_id, question_id, prompt_variation_id] {
            validate_component(c)?;
        }
        Ok(Self {
            model_config_id: model_config_id.to_string(),
            question_id: question_id.to_string(),
            prompt_variation_id: prompt_variation_id.to_string(),
            metric_id: None,
        })
    }

    pub fn with_metric(mut self, metric_id: &str) -> Result<Self, StructuralError> {
        validate_component(metric_id)?;
        self.metric_id = Some(metric_id.to_string());
        Ok(self)
    }

    /// The answer-level key, i.e. this id without its metric.
    pub fn answer_key(&self) -> (String, String, String) {
        (
            self.model_config_id.clone(),
            self.question_id.clone(),
            self.prompt_variation_id.clone(),
        )
    }

    pub fn parse(raw: &str) -> Result<Self, StructuralError> {
        let parts: Vec<&str> = raw
            .split('-')
            .filter(|p| !FILTERED_TOKENS.contains(p))
            .collect();

        if parts.iter().any(|p| p.is_empty()) {
            return Err(malformed(raw, "empty component"));
        }

        match parts.as_slice() {
            [mc, q, pv] => Ok(Self {
                model_config_id: mc.to_string(),
                question_id: q.to_string(),
                prompt_variation_id: pv.to_string(),
                metric_id: None,
            }),
            [mc, q, pv, metric] => Ok(Self {
                model_config_id: mc.to_string(),
                question_id: q.to_string(),
                prompt_variation_id: pv.to_string(),
                metric_id: Some(metric.to_string()),
            }),
            _ => Err(malformed(
                raw,
                &format!("expected 3 or 4 components, found {}", parts.len()),
            )),
        }
    }

    /// Parses and checks that the leading token matches the model config the
    /// caller expects (usually derived from the file name).
    pub fn parse_expecting(
        raw: &str,
        expected_model_config: &str,
        source_file: &str,
    ) -> Result<Self, StructuralError> {
        let id = Self::parse(raw)?;
        if id.model_config_id != expected_model_config {
            return Err(StructuralError::ModelConfigMismatch {
                custom_id: raw.to_string(),
                found: id.model_config_id,
                expected: expected_model_config.to_string(),
                source_file: source_file.to_string(),
            });
        }
        Ok(id)
    }
}

impl fmt::Display for CustomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.model_config_id, self.question_id, self.prompt_variation_id
        )?;
        if let Some(m) = &self.metric_id {
            write!(f, "-{}-{}", EVAL_MARKER, m)?;
        }
        Ok(())
    }
}

fn validate_component(c: &str) -> Result<(), StructuralError> {
    let reason = if c.is_empty() {
        Some("must not be empty")
    } else if c.contains('-') {
        Some("must not contain '-'")
    } else if FILTERED_TOKENS.contains(&c) {
        Some("collides with a reserved token")
    } else if c.chars().any(char::is_whitespace) {
        Some("must not contain whitespace")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StructuralError::InvalidComponent {
            component: c.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn malformed(raw: &str, reason: &str) -> StructuralError {
    StructuralError::MalformedCustomId {
        custom_id: raw.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn component() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.]{1,12}".prop_filter("reserved token", |c| !FILTERED_TOKENS.contains(&c.as_str()))
    }

    proptest! {
        #[test]
        fn any_valid_key_round_trips(
            mc in component(),
            q in component(),
            pv in component(),
            metric in proptest::option::of(component()),
        ) {
            let mut id = CustomId::new(&mc, &q, &pv).unwrap();
            if let Some(m) = &metric {
                id = id.with_metric(m).unwrap();
            }
            let back = CustomId::parse(&id.to_string()).unwrap();
            prop_assert_eq!(back, id);
        }

        #[test]
        fn hyphenated_components_are_refused(a in component(), b in component()) {
            let joined = format!("{}-{}", a, b);
            prop_assert!(CustomId::new(&joined, "q1", "p1").is_err());
            prop_assert!(CustomId::new("mc01", "q1", &joined).is_err());
        }
    }

    #[test]
    fn answer_id_round_trips() {
        let id = CustomId::new("mc01", "q17", "p1_r2").unwrap();
        let raw = id.to_string();
        assert_eq!(raw, "mc01-q17-p1_r2");
        assert_eq!(CustomId::parse(&raw).unwrap(), id);
    }

    #[test]
    fn evaluator_id_round_trips_through_eval_token() {
        let id = CustomId::new("mc01", "q17", "p1")
            .unwrap()
            .with_metric("correctness")
            .unwrap();
        let raw = id.to_string();
        assert_eq!(raw, "mc01-q17-p1-eval-correctness");
        let back = CustomId::parse(&raw).unwrap();
        assert_eq!(back.metric_id.as_deref(), Some("correctness"));
        assert_eq!(back, id);
    }

    #[test]
    fn literal_tokens_are_filtered_when_parsing() {
        let id = CustomId::parse("mc01-question-42-p3").unwrap();
        assert_eq!(id.model_config_id, "mc01");
        assert_eq!(id.question_id, "42");
        assert_eq!(id.prompt_variation_id, "p3");
        assert_eq!(id.metric_id, None);
    }

    #[test]
    fn ambiguous_components_are_rejected() {
        assert!(CustomId::new("mc-01", "q1", "p1").is_err());
        assert!(CustomId::new("mc01", "q", "p1").is_err());
        assert!(CustomId::new("mc01", "q1", "").is_err());
        assert!(CustomId::new("mc01", "q1", "p1")
            .unwrap()
            .with_metric("eval")
            .is_err());
    }

    #[test]
    fn wrong_arity_is_malformed() {
        assert!(matches!(
            CustomId::parse("mc01-q1"),
            Err(StructuralError::MalformedCustomId { .. })
        ));
        assert!(CustomId::parse("a-b-c-d-e").is_err());
        assert!(CustomId::parse("mc01--p1").is_err());
    }

    #[test]
    fn model_config_mismatch_is_fatal() {
        let err = CustomId::parse_expecting("mc02-q1-p1", "mc01", "mc01.jsonl").unwrap_err();
        assert!(matches!(err, StructuralError::ModelConfigMismatch { .. }));
        assert!(err.to_string().contains("mc01.jsonl"));
    }
}
