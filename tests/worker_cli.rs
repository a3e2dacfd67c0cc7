//! End-to-end tests that build the worker binary and drive it the way
//! the supervisor does: NDJSON on stdin, records read back from stdout.

use std::fs::write;
use std::io::Write as _;
use std::process::{Command, Output, Stdio};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use escargot::CargoBuild;
use serde_json::{Value, json};
use tempfile::tempdir;

fn worker_cmd() -> Command {
    let mut cmd = CargoBuild::new()
        .manifest_path(env!("CARGO_MANIFEST_PATH"))
        .bin("quickjs-worker")
        .current_release()
        .current_target()
        .run()
        .unwrap()
        .command();

    // The test environment must not leak capabilities into the worker.
    for name in [
        "WORKER_ID",
        "BUNDLE_PATH",
        "ALLOW_FILESYSTEM",
        "ALLOW_NETWORK",
        "ALLOW_CHILD_PROCESS",
        "ALLOW_EVAL",
        "MAX_MEMORY",
        "MAX_FDS",
        "CAPABILITIES",
    ] {
        cmd.env_remove(name);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn run_worker(bundle: &str, envs: &[(&str, &str)], input: &str) -> Output {
    let dir = tempdir().unwrap();
    let bundle_path = dir.path().join("bundle.js");
    write(&bundle_path, bundle).unwrap();

    let mut cmd = worker_cmd();
    cmd.env("BUNDLE_PATH", &bundle_path).env("WORKER_ID", "w-test");
    for (name, value) in envs {
        cmd.env(name, value);
    }

    let mut child = cmd.spawn().unwrap();
    // The worker may have exited already (startup failures), so a broken
    // pipe here is fine.
    let _ = child.stdin.take().unwrap().write_all(input.as_bytes());
    child.wait_with_output().unwrap()
}

fn records(output: &Output) -> Vec<Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout line is not a JSON object"))
        .collect()
}

fn invoke_line(id: &str, payload: Value) -> String {
    format!(
        "{}\n",
        json!({"id": id, "type": "invoke", "payload": payload})
    )
}

fn get_payload(path: &str) -> Value {
    json!({"method": "GET", "path": path, "headers": {}, "query": {}, "body": ""})
}

fn decoded_body(record: &Value) -> Vec<u8> {
    STANDARD
        .decode(record["payload"]["body"].as_str().unwrap())
        .unwrap()
}

const ECHO_BUNDLE: &str = r#"export default async (req) =>
    Response.json({method: req.method, path: new URL(req.url).pathname});"#;

#[test]
fn ready_then_response_for_an_echo_invoke() {
    let output = run_worker(ECHO_BUNDLE, &[], &invoke_line("a", get_payload("/hi")));
    assert!(output.status.success());

    let records = records(&output);
    assert_eq!(records.len(), 2);

    assert_eq!(records[0], json!({"id": "w-test", "type": "ready", "payload": {}}));

    assert_eq!(records[1]["id"], "a");
    assert_eq!(records[1]["type"], "response");
    assert_eq!(records[1]["payload"]["status"], 200);
    assert_eq!(
        records[1]["payload"]["headers"],
        json!({"content-type": "application/json"})
    );
    let body: Value = serde_json::from_slice(&decoded_body(&records[1])).unwrap();
    assert_eq!(body, json!({"method": "GET", "path": "/hi"}));
}

#[test]
fn every_stdout_line_is_an_envelope() {
    let input = format!(
        "{}{}",
        invoke_line("a", get_payload("/one")),
        invoke_line("b", get_payload("/two")),
    );
    let output = run_worker(ECHO_BUNDLE, &[], &input);

    for record in records(&output) {
        let object = record.as_object().unwrap();
        assert!(object.contains_key("id"));
        assert!(object.contains_key("type"));
        assert!(object["payload"].is_object());
    }
}

#[test]
fn query_entries_are_propagated() {
    let bundle = r#"export default (req) => Response.text(new URL(req.url).search);"#;
    let payload = json!({
        "method": "GET", "path": "/q", "headers": {},
        "query": {"x": "1", "y": "two"}, "body": "",
    });
    let output = run_worker(bundle, &[], &invoke_line("q", payload));

    let records = records(&output);
    let search = String::from_utf8(decoded_body(&records[1])).unwrap();
    let mut pairs: Vec<&str> = search.trim_start_matches('?').split('&').collect();
    pairs.sort_unstable();
    assert_eq!(pairs, ["x=1", "y=two"]);
}

#[test]
fn console_logs_precede_the_response_and_share_its_id() {
    let bundle = r#"export default (req) => {
        console.log("n=", 3);
        return Response.text("ok");
    };"#;
    let output = run_worker(bundle, &[], &invoke_line("b", get_payload("/")));

    let records = records(&output);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["type"], "ready");
    assert_eq!(
        records[1],
        json!({"id": "b", "type": "log", "payload": {"level": "info", "message": "n= 3"}})
    );
    assert_eq!(records[2]["type"], "response");
    assert_eq!(decoded_body(&records[2]), b"ok");
}

#[test]
fn a_thrown_handler_yields_one_error_and_no_response() {
    let bundle = r#"export default () => { throw new Error("boom"); };"#;
    let input = format!(
        "{}{}",
        invoke_line("x", get_payload("/")),
        invoke_line("y", get_payload("/")),
    );
    let output = run_worker(bundle, &[], &input);
    assert!(output.status.success());

    let records = records(&output);
    assert_eq!(records.len(), 3);
    for (record, id) in records[1..].iter().zip(["x", "y"]) {
        assert_eq!(record["id"], id);
        assert_eq!(record["type"], "error");
        assert_eq!(record["payload"]["code"], "HANDLER_ERROR");
        assert!(record["payload"]["message"].as_str().unwrap().contains("boom"));
    }
}

#[test]
fn an_async_rejection_is_reported_like_a_throw() {
    let bundle = r#"export default async () => { throw new Error("late"); };"#;
    let output = run_worker(bundle, &[], &invoke_line("x", get_payload("/")));

    let records = records(&output);
    assert_eq!(records[1]["type"], "error");
    assert_eq!(records[1]["payload"]["code"], "HANDLER_ERROR");
    assert!(records[1]["payload"]["message"].as_str().unwrap().contains("late"));
}

#[test]
fn eval_is_unavailable_unless_granted() {
    let bundle = r#"export default () => Response.text(typeof eval);"#;

    let output = run_worker(bundle, &[], &invoke_line("e", get_payload("/")));
    assert_eq!(decoded_body(&records(&output)[1]), b"undefined");

    let output = run_worker(bundle, &[("ALLOW_EVAL", "1")], &invoke_line("e", get_payload("/")));
    assert_eq!(decoded_body(&records(&output)[1]), b"function");
}

#[test]
fn binary_bodies_round_trip() {
    let bundle = r#"export default (req) => new Response(req.body);"#;
    let bytes: Vec<u8> = (1..=255).rev().collect();
    let payload = json!({
        "method": "POST", "path": "/echo", "headers": {},
        "query": {}, "body": STANDARD.encode(&bytes),
    });
    let output = run_worker(bundle, &[], &invoke_line("bin", payload));

    assert_eq!(decoded_body(&records(&output)[1]), bytes);
}

#[test]
fn malformed_lines_and_unknown_types_are_skipped() {
    let input = format!(
        "not json at all\n\n{}\n{}",
        json!({"id": "s", "type": "shutdown", "payload": {}}),
        invoke_line("ok", get_payload("/")),
    );
    let output = run_worker(ECHO_BUNDLE, &[], &input);
    assert!(output.status.success());

    let records = records(&output);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1]["id"], "ok");
    assert_eq!(records[1]["type"], "response");
}

#[test]
fn an_invoke_without_payload_is_an_invalid_message() {
    let output = run_worker(
        ECHO_BUNDLE,
        &[],
        "{\"id\":\"m\",\"type\":\"invoke\"}\n",
    );

    let records = records(&output);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1]["id"], "m");
    assert_eq!(records[1]["type"], "error");
    assert_eq!(records[1]["payload"]["code"], "INVALID_MESSAGE");
}

#[test]
fn a_bundle_without_handler_fails_startup() {
    let output = run_worker("const nothing = 1;", &[], "");

    assert_eq!(output.status.code(), Some(1));
    let records = records(&output);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], "bundle-load");
    assert_eq!(records[0]["type"], "error");
    assert_eq!(records[0]["payload"]["code"], "BUNDLE_LOAD_ERROR");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No handler function found"), "stderr: {stderr}");
}

#[test]
fn a_missing_bundle_path_fails_startup() {
    let mut child = worker_cmd().spawn().unwrap();
    drop(child.stdin.take());
    let output = child.wait_with_output().unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("BUNDLE_PATH"),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn worker_id_defaults_to_the_pid_form() {
    let dir = tempdir().unwrap();
    let bundle_path = dir.path().join("bundle.js");
    write(&bundle_path, ECHO_BUNDLE).unwrap();

    let mut cmd = worker_cmd();
    cmd.env("BUNDLE_PATH", &bundle_path);
    let mut child = cmd.spawn().unwrap();
    drop(child.stdin.take());
    let output = child.wait_with_output().unwrap();

    let records = records(&output);
    assert_eq!(records[0]["type"], "ready");
    assert!(
        records[0]["id"].as_str().unwrap().starts_with("worker-"),
        "got {}",
        records[0]["id"]
    );
}
