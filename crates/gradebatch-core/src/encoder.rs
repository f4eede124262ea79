use crate::custom_id::CustomId;
use crate::errors::StructuralError;
use crate::model::{
    strip_provider_prefix, EvaluatorConfig, ModelConfig, PromptTemplate, Provider, Question,
    RequestRecord, ResponseRecord,
};
use anyhow::Context;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_]+)\}").expect("static regex"))
}

/// Substitutes `{name}` placeholders; unknown names are an error so that a
/// typo in a template never reaches a vendor.
pub fn render_template(template: &str, vars: &HashMap<&str, String>) -> anyhow::Result<String> {
    let mut missing = Vec::new();
    let out = placeholder_re().replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        match vars.get(name) {
            Some(v) => v.clone(),
            None => {
                missing.push(name.to_string());
                caps[0].to_string()
            }
        }
    });
    if !missing.is_empty() {
        anyhow::bail!("template uses unknown placeholder(s): {}", missing.join(", "));
    }
    Ok(out.into_owned())
}

pub fn render_options(q: &Question) -> String {
    q.options
        .iter()
        .enumerate()
        .map(|(i, o)| format!("{}. {}", q.label_for(i), o.text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn question_vars(q: &Question) -> HashMap<&'static str, String> {
    let labels: Vec<String> = (0..q.options.len()).map(|i| q.label_for(i)).collect();
    let mut vars = HashMap::new();
    vars.insert("question", q.text.clone());
    vars.insert("options", render_options(q));
    vars.insert("option_labels", labels.join(", "));
    vars
}

/// Prompt variation id for a given round; round 1 of a single-round model
/// keeps the bare id.
pub fn round_variation_id(prompt_id: &str, round: u32, repeats: u32) -> String {
    if repeats <= 1 {
        prompt_id.to_string()
    } else {
        format!("{}_r{}", prompt_id, round)
    }
}

/// Builds the provider-shaped request body for one prompt.
pub fn build_body(model: &ModelConfig, prompt: &str) -> Value {
    match model.provider() {
        Provider::Openai | Provider::Direct | Provider::Mistral => {
            let mut messages = Vec::new();
            if let Some(system) = &model.system {
                messages.push(json!({ "role": "system", "content": system }));
            }
            messages.push(json!({ "role": "user", "content": prompt }));
            // Mistral lifts the prefixed model out at job creation
            let name = match model.provider() {
                Provider::Direct => strip_provider_prefix(&model.model),
                _ => model.model.as_str(),
            };
            let mut body = Map::new();
            body.insert("model".into(), json!(name));
            body.insert("messages".into(), Value::Array(messages));
            body.insert("max_tokens".into(), json!(model.max_tokens));
            if let Some(t) = model.temperature {
                body.insert("temperature".into(), json!(t));
            }
            Value::Object(body)
        }
        Provider::Anthropic => {
            let mut body = Map::new();
            body.insert("model".into(), json!(strip_provider_prefix(&model.model)));
            body.insert("max_tokens".into(), json!(model.max_tokens));
            body.insert(
                "messages".into(),
                json!([{ "role": "user", "content": prompt }]),
            );
            if let Some(system) = &model.system {
                body.insert("system".into(), json!(system));
            }
            if let Some(t) = model.temperature {
                body.insert("temperature".into(), json!(t));
            }
            Value::Object(body)
        }
        Provider::Vertex => {
            let mut generation = Map::new();
            generation.insert("maxOutputTokens".into(), json!(model.max_tokens));
            if let Some(t) = model.temperature {
                generation.insert("temperature".into(), json!(t));
            }
            let mut body = Map::new();
            // Job-level field; the adapter lifts it out before upload.
            body.insert("model".into(), json!(model.model));
            body.insert(
                "contents".into(),
                json!([{ "role": "user", "parts": [{ "text": prompt }] }]),
            );
            if let Some(system) = &model.system {
                body.insert(
                    "systemInstruction".into(),
                    json!({ "parts": [{ "text": system }] }),
                );
            }
            body.insert("generationConfig".into(), Value::Object(generation));
            Value::Object(body)
        }
    }
}

pub fn endpoint_for(provider: Provider) -> &'static str {
    match provider {
        Provider::Anthropic => "/v1/messages",
        Provider::Vertex => "generateContent",
        Provider::Openai | Provider::Mistral | Provider::Direct => "/v1/chat/completions",
    }
}

fn request(model: &ModelConfig, custom_id: &CustomId, prompt: &str) -> RequestRecord {
    RequestRecord {
        custom_id: custom_id.to_string(),
        method: "POST".into(),
        url: endpoint_for(model.provider()).into(),
        body: build_body(model, prompt),
    }
}

/// One request per (question, prompt, round).
pub fn encode_requests(
    questions: &[Question],
    prompts: &[PromptTemplate],
    model: &ModelConfig,
) -> anyhow::Result<Vec<RequestRecord>> {
    let mut out = Vec::with_capacity(questions.len() * prompts.len() * model.repeats as usize);
    for q in questions {
        let vars = question_vars(q);
        for p in prompts {
            let text = render_template(&p.template, &vars)
                .with_context(|| format!("rendering prompt '{}' for question '{}'", p.id, q.id))?;
            for round in 1..=model.repeats {
                let pv = round_variation_id(&p.id, round, model.repeats);
                let id = CustomId::new(&model.id, &q.id, &pv)?;
                out.push(request(model, &id, &text));
            }
        }
    }
    tracing::info!(
        model_config = %model.id,
        provider = model.provider().as_str(),
        requests = out.len(),
        "encoded requests"
    );
    Ok(out)
}

/// Grading requests for every successful answer in `answers`.
///
/// The answer's structural key is kept and the evaluator metric appended, so
/// the grading results can later be joined back onto the answers.
pub fn build_evaluator_requests(
    answers: &[ResponseRecord],
    questions: &[Question],
    evaluator: &EvaluatorConfig,
    grader: &ModelConfig,
) -> anyhow::Result<Vec<RequestRecord>> {
    let by_id: HashMap<&str, &Question> = questions.iter().map(|q| (q.id.as_str(), q)).collect();
    let mut out = Vec::new();
    let mut skipped = 0usize;

    for rec in answers {
        let key = CustomId::parse(&rec.custom_id)?;
        if key.metric_id.is_some() {
            return Err(StructuralError::MalformedCustomId {
                custom_id: rec.custom_id.clone(),
                reason: "expected an answer record, found an evaluator record".into(),
            }
            .into());
        }
        let content = match (&rec.content, rec.is_success()) {
            (Some(c), true) => c,
            _ => {
                skipped += 1;
                continue;
            }
        };
        let Some(q) = by_id.get(key.question_id.as_str()) else {
            tracing::warn!(custom_id = %rec.custom_id, "no question found for answer; skipping");
            skipped += 1;
            continue;
        };

        let mut vars = question_vars(q);
        vars.insert("correct", q.correct_labels().join(", "));
        vars.insert("response", content.clone());
        let text = render_template(&evaluator.template, &vars)
            .with_context(|| format!("rendering evaluator '{}'", evaluator.id))?;

        let id = key.with_metric(&evaluator.metric)?;
        out.push(request(grader, &id, &text));
    }

    if skipped > 0 {
        tracing::warn!(
            evaluator = %evaluator.id,
            skipped,
            "answers without gradable content were skipped"
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnswerOption;

    fn question() -> Question {
        Question {
            id: "q7".into(),
            text: "Which planet is largest?".into(),
            options: vec![
                AnswerOption { label: None, text: "Mars".into(), rank: 3 },
                AnswerOption { label: None, text: "Jupiter".into(), rank: 1 },
                AnswerOption { label: None, text: "Venus".into(), rank: 2 },
            ],
        }
    }

    fn model(id: &str, name: &str, repeats: u32) -> ModelConfig {
        ModelConfig {
            id: id.into(),
            model: name.into(),
            provider: None,
            temperature: Some(0.0),
            max_tokens: 64,
            repeats,
            system: None,
        }
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let vars = question_vars(&question());
        assert!(render_template("{question} {nope}", &vars).is_err());
        let ok = render_template("Q: {question}\n{options}", &vars).unwrap();
        assert!(ok.contains("B. Jupiter"));
    }

    #[test]
    fn rounds_get_distinct_ids() {
        let prompts = vec![PromptTemplate { id: "p1".into(), template: "{question}".into() }];
        let reqs = encode_requests(&[question()], &prompts, &model("mc01", "gpt-4o", 2)).unwrap();
        let ids: Vec<_> = reqs.iter().map(|r| r.custom_id.as_str()).collect();
        assert_eq!(ids, vec!["mc01-q7-p1_r1", "mc01-q7-p1_r2"]);
        assert_eq!(reqs[0].url, "/v1/chat/completions");
        assert_eq!(reqs[0].body["messages"][0]["content"], "Which planet is largest?");
    }

    #[test]
    fn provider_bodies_differ() {
        let v = build_body(&model("mc", "gemini-1.5-pro", 1), "hi");
        assert_eq!(v["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(v["generationConfig"]["maxOutputTokens"], 64);

        let d = build_body(&model("mc", "direct/llama-3-8b", 1), "hi");
        assert_eq!(d["model"], "llama-3-8b");

        let a = build_body(&model("mc", "anthropic/claude-3-haiku", 1), "hi");
        assert_eq!(a["model"], "claude-3-haiku");
        assert_eq!(a["messages"][0]["content"], "hi");
    }

    #[test]
    fn evaluator_requests_keep_answer_key() {
        let answers = vec![
            ResponseRecord::ok("mc01-q7-p1", "B"),
            ResponseRecord::failed("mc01-q7-p2", 500, "boom"),
        ];
        let evaluator = EvaluatorConfig {
            id: "judge".into(),
            model_config: "grader".into(),
            metric: "correctness".into(),
            template: "{question}|{correct}|{response}".into(),
        };
        let reqs = build_evaluator_requests(
            &answers,
            &[question()],
            &evaluator,
            &model("grader", "gpt-4o", 1),
        )
        .unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].custom_id, "mc01-q7-p1-eval-correctness");
        assert_eq!(
            reqs[0].body["messages"][0]["content"],
            "Which planet is largest?|B|B"
        );
    }
}
