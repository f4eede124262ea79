use super::super::args::ReconcileArgs;
use super::exit_codes;
use gradebatch_core::reconcile::{reconcile, write_csv, EvaluatorInput};

pub fn cmd_reconcile(args: ReconcileArgs) -> anyhow::Result<i32> {
    let evaluators = args
        .evaluators
        .iter()
        .map(|raw| EvaluatorInput::parse(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let table = reconcile(&args.answers, &evaluators, args.model_config.as_deref())?;
    let path = write_csv(&table, &args.out_dir)?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}
