use super::super::args::{EncodeArgs, GradeArgs};
use super::{exit_codes, load, questions};
use gradebatch_core::encoder::{build_evaluator_requests, encode_requests};
use gradebatch_core::jsonl::{read_responses, write_jsonl};
use std::path::PathBuf;

pub fn cmd_encode(args: EncodeArgs) -> anyhow::Result<i32> {
    let cfg = load(&args.config)?;
    let model = cfg.model(&args.model)?;
    let prompts = cfg.prompts_by_id(&args.prompts)?;
    let questions = questions(&cfg, args.questions.as_deref())?;

    let requests = encode_requests(&questions, &prompts, model)?;
    let out = args.out_dir.join(format!("{}.jsonl", model.id));
    write_jsonl(&out, &requests)?;
    eprintln!("wrote {} requests to {}", requests.len(), out.display());
    Ok(exit_codes::OK)
}

pub fn cmd_grade(args: GradeArgs) -> anyhow::Result<i32> {
    let cfg = load(&args.config)?;
    let evaluator = cfg.evaluator(&args.evaluator)?;
    let grader = cfg.model(&evaluator.model_config)?;
    let questions = questions(&cfg, args.questions.as_deref())?;

    let answers = read_responses(&args.answers)?;
    let requests = build_evaluator_requests(&answers, &questions, evaluator, grader)?;

    let out = args.out.unwrap_or_else(|| {
        let name = args
            .answers
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "answers.jsonl".into());
        PathBuf::from("grading").join(&evaluator.id).join(name)
    });
    write_jsonl(&out, &requests)?;
    eprintln!(
        "wrote {} grading requests for {} to {}",
        requests.len(),
        evaluator.id,
        out.display()
    );
    Ok(exit_codes::OK)
}
