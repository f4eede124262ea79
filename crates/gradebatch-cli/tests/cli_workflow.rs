use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use tempfile::TempDir;

const CONFIG: &str = r#"configVersion: 1
settings:
  questions: questions.jsonl
models:
  - id: mc01
    model: gpt-4o-mini
    max_tokens: 16
    repeats: 2
prompts:
  - id: p1
    template: "{question}\n{options}"
evaluators:
  - id: judge
    model_config: mc01
    template: "{question} {correct} {response}"
"#;

const QUESTIONS: &str = r#"{"id":"q1","text":"2+2?","options":[{"text":"4","rank":1},{"text":"5","rank":2}]}
"#;

fn gradebatch(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("gradebatch").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("OPENAI_API_KEY")
        .env_remove("GRADEBATCH_LOG");
    cmd
}

fn project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("experiment.yaml"), CONFIG).unwrap();
    fs::write(dir.path().join("questions.jsonl"), QUESTIONS).unwrap();
    dir
}

#[test]
fn encode_writes_one_request_per_round() {
    let dir = project();
    gradebatch(&dir)
        .args(["encode", "--model", "mc01"])
        .assert()
        .success()
        .stderr(contains("wrote 2 requests"));

    let text = fs::read_to_string(dir.path().join("requests/mc01.jsonl")).unwrap();
    let ids: Vec<String> = text
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["custom_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["mc01-q1-p1_r1", "mc01-q1-p1_r2"]);
}

#[test]
fn unknown_model_config_exits_with_config_error() {
    let dir = project();
    gradebatch(&dir)
        .args(["encode", "--model", "mc10"])
        .assert()
        .code(2)
        .stderr(contains("unknown model config id 'mc10'"));
}

#[test]
fn missing_credentials_name_the_variable() {
    let dir = project();
    gradebatch(&dir).args(["encode", "--model", "mc01"]).assert().success();
    gradebatch(&dir)
        .args(["send", "--model", "mc01"])
        .assert()
        .code(2)
        .stderr(contains("OPENAI_API_KEY"));
}

#[test]
fn send_without_request_file_is_a_config_error() {
    let dir = project();
    gradebatch(&dir)
        .env("OPENAI_API_KEY", "sk-test")
        .args(["send", "--model", "mc01"])
        .assert()
        .code(2)
        .stderr(contains("request file not found"));
}

#[test]
fn split_then_merge_recovers_failed_request() {
    let dir = TempDir::new().unwrap();
    let requests = [
        r#"{"custom_id":"mc01-q1-p1","method":"POST","url":"/v1/chat/completions","body":{"model":"gpt-4o-mini","messages":[{"role":"user","content":"one"}]}}"#,
        r#"{"custom_id":"mc01-q2-p1","method":"POST","url":"/v1/chat/completions","body":{"model":"gpt-4o-mini","messages":[{"role":"user","content":"two"}]}}"#,
        r#"{"custom_id":"mc01-q3-p1","method":"POST","url":"/v1/chat/completions","body":{"model":"gpt-4o-mini","messages":[{"role":"user","content":"three"}]}}"#,
    ];
    fs::write(dir.path().join("mc01.jsonl"), requests.join("\n") + "\n").unwrap();
    fs::write(
        dir.path().join("responses.jsonl"),
        concat!(
            r#"{"custom_id":"mc01-q1-p1","status_code":200,"content":"A","error":null}"#, "\n",
            r#"{"custom_id":"mc01-q2-p1","status_code":500,"content":null,"error":"rate limited"}"#, "\n",
            r#"{"custom_id":"mc01-q3-p1","status_code":200,"content":"C","error":null}"#, "\n",
        ),
    )
    .unwrap();

    gradebatch(&dir)
        .args(["split", "--requests", "mc01.jsonl", "--responses", "responses.jsonl", "--out", "retry/mc01.jsonl"])
        .assert()
        .success()
        .stdout(contains("1 of 3 requests need a retry"));

    let retry = fs::read_to_string(dir.path().join("retry/mc01.jsonl")).unwrap();
    assert_eq!(retry.lines().collect::<Vec<_>>(), vec![requests[1]]);

    fs::write(
        dir.path().join("retry_responses.jsonl"),
        r#"{"custom_id":"mc01-q2-p1","status_code":200,"content":"B","error":null}"#,
    )
    .unwrap();
    gradebatch(&dir)
        .args(["merge", "--out", "merged.jsonl", "responses.jsonl", "retry_responses.jsonl"])
        .assert()
        .success()
        .stdout(contains("into 3 records (1 replaced)"));

    let merged = fs::read_to_string(dir.path().join("merged.jsonl")).unwrap();
    let q2: serde_json::Value = serde_json::from_str(merged.lines().nth(1).unwrap()).unwrap();
    assert_eq!(q2["custom_id"], "mc01-q2-p1");
    assert_eq!(q2["status_code"], 200);
}

#[test]
fn reconcile_rejects_mixed_up_files() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("judge")).unwrap();
    fs::write(
        dir.path().join("mc01.jsonl"),
        r#"{"custom_id":"mc01-q1-p1","status_code":200,"content":"A","error":null}"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("judge/mc01.jsonl"),
        r#"{"custom_id":"mc02-q1-p1-eval-correctness","status_code":200,"content":"A","error":null}"#,
    )
    .unwrap();

    gradebatch(&dir)
        .args(["reconcile", "--answers", "mc01.jsonl", "--evaluator", "judge/mc01.jsonl"])
        .assert()
        .code(2)
        .stderr(contains("belongs to model config 'mc02'"));
}

#[test]
fn reconcile_writes_csv_per_model_config() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("judge")).unwrap();
    fs::write(
        dir.path().join("mc01.jsonl"),
        r#"{"custom_id":"mc01-q1-p1","status_code":200,"content":"A, final","error":null}"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("judge/mc01.jsonl"),
        r#"{"custom_id":"mc01-q1-p1-eval-correctness","status_code":200,"content":"Grade: a","error":null}"#,
    )
    .unwrap();

    gradebatch(&dir)
        .args(["reconcile", "--answers", "mc01.jsonl", "--evaluator", "judge/mc01.jsonl"])
        .assert()
        .success()
        .stdout(contains("mc01.csv"));

    let csv = fs::read_to_string(dir.path().join("results/mc01.csv")).unwrap();
    assert!(csv.starts_with("model_config_id,question_id,prompt_variation_id,response,judge_correctness,final_correctness\n"));
    assert!(csv.contains("mc01,q1,p1,\"A, final\",3,0\n"));
}

#[test]
fn init_writes_a_loadable_config() {
    let dir = TempDir::new().unwrap();
    gradebatch(&dir).args(["init"]).assert().success();
    fs::write(dir.path().join("questions.jsonl"), QUESTIONS).unwrap();
    gradebatch(&dir)
        .args(["encode", "--model", "mc02", "--strict"])
        .assert()
        .success();
    assert!(dir.path().join("requests/mc02.jsonl").exists());
}
