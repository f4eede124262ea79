use super::super::args::{MergeArgs, SplitArgs};
use super::exit_codes;
use gradebatch_core::split_merge::{merge_responses, split_failed};

pub fn cmd_split(args: SplitArgs) -> anyhow::Result<i32> {
    let s = split_failed(&args.requests, &args.responses, &args.out)?;
    println!(
        "{} of {} requests need a retry ({} missing, {} failed) -> {}",
        s.written,
        s.total,
        s.missing,
        s.failed,
        args.out.display()
    );
    Ok(exit_codes::OK)
}

pub fn cmd_merge(args: MergeArgs) -> anyhow::Result<i32> {
    let m = merge_responses(&args.inputs, &args.out)?;
    println!(
        "merged {} files into {} records ({} replaced) -> {}",
        m.files,
        m.records,
        m.overridden,
        args.out.display()
    );
    Ok(exit_codes::OK)
}
