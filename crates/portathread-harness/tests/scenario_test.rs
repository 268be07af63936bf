use std::time::Duration;

use portathread_core::{SUBSTRATE, Status};
use portathread_harness::scenarios::{self, SCENARIOS, ScenarioConfig};
use portathread_harness::{HarnessError, LogLevel, Outcome};

fn quick() -> ScenarioConfig {
    ScenarioConfig {
        threads: 16,
        iterations: 200,
        sleep: Duration::from_millis(60),
    }
}

fn run(name: &str) -> portathread_harness::ScenarioReport {
    let report = scenarios::find(name).unwrap().run(&quick());
    assert_eq!(report.name, name);
    assert_eq!(report.substrate, SUBSTRATE);
    report
}

#[test]
fn every_scenario_passes_on_the_active_substrate() {
    for scenario in SCENARIOS {
        let report = scenario.run(&quick());
        assert_eq!(
            report.outcome,
            Outcome::Pass,
            "{}: {}",
            scenario.name,
            report.details
        );
    }
}

#[test]
fn once_race_reports_both_rounds() {
    let report = run("once-race");
    assert_eq!(report.details["first_round_counter"], 1);
    assert_eq!(report.details["second_round_counter"], 1);
    assert_eq!(report.details["racers"], 16);
}

#[test]
fn sleep_reports_zero_remaining() {
    let report = run("sleep");
    assert_eq!(report.details["remaining_ns"], 0);
    assert!(report.details["elapsed_ms"].as_u64().unwrap() >= 60);
    assert!(report.duration_ms >= 60);
}

#[test]
fn mutex_contention_loses_no_updates() {
    let report = run("mutex-contention");
    assert_eq!(report.details["observed"], 16 * 200);
}

#[test]
fn recursive_mutex_holds_out_until_last_unlock() {
    let report = run("recursive-mutex");
    assert_eq!(report.status, Some(Status::Success));
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "success");
    let probes = report.details["probes_while_held"].as_array().unwrap();
    assert!(probes.iter().all(|p| p == "busy"));
    assert_eq!(report.details["probe_after_release"], "success");
}

#[test]
fn timed_lock_gives_up() {
    let report = run("timed-lock");
    assert_eq!(report.details["status"], "timedout");
    assert_eq!(report.status, Some(Status::TimedOut));
    assert!(report.latency_ns.unwrap() >= 50_000_000);

    let entry = report.to_log_entry();
    assert_eq!(entry.status.as_deref(), Some("timedout"));
    assert_eq!(entry.latency_ns, report.latency_ns);
    assert_eq!(entry.exit_code, None);
}

#[test]
fn tss_destructor_runs_once() {
    let report = run("tss-destructor");
    assert_eq!(report.details["destructor_runs"], 1);
    assert_eq!(report.details["exit_code"], 42);
    assert_eq!(report.exit_code, Some(42));

    let entry = report.to_log_entry();
    assert_eq!(entry.exit_code, Some(42));
    assert_eq!(entry.scenario.as_deref(), Some("tss-destructor"));
    assert_eq!(entry.outcome, Some(Outcome::Pass));
    assert_eq!(entry.level, LogLevel::Info);
}

#[test]
fn reports_serialize_with_lowercase_outcome() {
    let report = run("cond-pingpong");
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["outcome"], "pass");
    assert!(json.get("status").is_none());
    assert!(json.get("exit_code").is_none());
    assert_eq!(json["details"]["volleys"], 400);
}

#[test]
fn unknown_scenario_is_rejected() {
    assert!(matches!(
        scenarios::find("deadlock-forever"),
        Err(HarnessError::UnknownScenario(_))
    ));
}
