use std::path::PathBuf;

use portathread_core::{SUBSTRATE, Status};
use portathread_harness::structured_log::{
    ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome, sha256_hex, validate_log_file,
    validate_log_line,
};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("portathread-log-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

#[test]
fn emitted_file_validates_and_trace_ids_are_sequential() {
    let path = scratch("emitted.jsonl");
    {
        let mut emitter = LogEmitter::to_file(&path, "portathread", "run-7").unwrap();
        let first = emitter.emit(LogLevel::Info, "run_start").unwrap();
        assert_eq!(first.trace_id, "portathread::run-7::001");
        emitter
            .emit_entry(
                LogEntry::new(String::new(), LogLevel::Info, "scenario_result")
                    .with_scenario("once-race")
                    .with_substrate(SUBSTRATE)
                    .with_outcome(Outcome::Pass)
                    .with_status(Status::Success)
                    .with_exit_code(0)
                    .with_latency_ns(1200)
                    .with_duration_ms(3)
                    .with_details(serde_json::json!({ "racers": 100 })),
            )
            .unwrap();
        emitter.emit(LogLevel::Info, "run_end").unwrap();
        emitter.flush().unwrap();
    }

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 3);
    assert!(errors.is_empty(), "{errors:?}");

    let content = std::fs::read_to_string(&path).unwrap();
    let second = validate_log_line(content.lines().nth(1).unwrap(), 2).unwrap();
    assert_eq!(second.trace_id, "portathread::run-7::002");
    assert_eq!(second.scenario.as_deref(), Some("once-race"));
    assert_eq!(second.status.as_deref(), Some("success"));
    assert_eq!(second.outcome, Some(Outcome::Pass));
}

#[test]
fn schema_violations_carry_line_numbers() {
    let path = scratch("broken.jsonl");
    let good = LogEntry::new("a::b::001", LogLevel::Info, "ok")
        .to_jsonl()
        .unwrap();
    let body = format!(
        "{good}\n\n{}\nnot json\n{}\n",
        r#"{"timestamp":"t","trace_id":"a::b::002","level":"loud","event":"e"}"#,
        r#"{"timestamp":"t","trace_id":"flat","level":"info","event":"e","status":"weird"}"#,
    );
    std::fs::write(&path, body).unwrap();

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert_eq!(lines, 4);
    let at = |line: usize, field: &str| errors.iter().any(|e| e.line_number == line && e.field == field);
    assert!(at(3, "level"));
    assert!(at(4, "<json>"));
    assert!(at(5, "trace_id"));
    assert!(at(5, "status"));
    assert!(!errors.iter().any(|e| e.line_number == 1));
}

#[test]
fn artifact_index_hashes_the_log() {
    let path = scratch("hashed.jsonl");
    std::fs::write(&path, b"abc").unwrap();
    let mut index = ArtifactIndex::new("run-9");
    index.add_file(&path, "log").unwrap();
    index.add("elsewhere.json", "report", "00");

    let parsed: serde_json::Value = serde_json::from_str(&index.to_json().unwrap()).unwrap();
    assert_eq!(parsed["index_version"], 1);
    assert_eq!(parsed["run_id"], "run-9");
    let first = &parsed["artifacts"][0];
    assert_eq!(
        first["sha256"],
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(first["size_bytes"], 3);
    assert!(parsed["artifacts"][1].get("size_bytes").is_none());
    assert_eq!(sha256_hex(b"abc"), first["sha256"].as_str().unwrap());
}
