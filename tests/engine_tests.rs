// SPDX-License-Identifier: MIT

//! Online engine tests: planned delays, confirmation, persistence

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use torchlite::engine::TorchEngine;
use torchlite::types::ValueId;

/// A use-before-init candidate on `Svc::conn`: init write at `Svc::Init|12`,
/// use at `Svc::Run|30`, 85 ms gap. The scheduler plans a
/// `min((85+1)*1.15, 100) = 98` ms delay at the write site.
fn write_candidates(dir: &TempDir) {
    let mut file = std::fs::File::create(dir.path().join("Candidates.wfl")).unwrap();
    writeln!(file, "#header").unwrap();
    writeln!(
        file,
        "Svc::conn\t85\t100000\tNullToNonNull\tSvc::Init\t12\t1\t1\t950000\tUse\tSvc::Run\t30\t2\t1"
    )
    .unwrap();
}

fn wait_for_parked(engine: &TorchEngine) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.scheduler().active_delay_count() == 0 {
        assert!(Instant::now() < deadline, "delay never registered");
        std::thread::yield_now();
    }
}

#[test]
fn test_conflicting_use_during_delay_confirms_order_violation() {
    let dir = TempDir::new().unwrap();
    write_candidates(&dir);

    let engine = Arc::new(TorchEngine::start(dir.path()).expect("engine should start"));
    engine.after_field_write("a1@Svc::conn", ValueId(0xbeef), "Svc::Init", 12);

    let writer = Arc::clone(&engine);
    let handle = std::thread::spawn(move || {
        writer.before_field_write("a1@Svc::conn", ValueId::NULL, ValueId(0xbeef), "Svc::Init", 12);
    });

    wait_for_parked(&engine);
    engine.before_method_call(ValueId(0xbeef), "Conn::Send", "Svc::Run", 30);
    handle.join().unwrap();

    assert_eq!(engine.scheduler().delay_count(), 1);
    assert_eq!(engine.scheduler().confirmed_count(), 1);
    let violations = engine.scheduler().order_violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].delayed_site, "Svc::Init|12");
    assert_eq!(violations[0].conflicting_site, "Svc::Run|30");

    // a confirmed site keeps its full probability
    assert_eq!(
        engine.scheduler().snapshot_probabilities()["Svc::Init|12"],
        1.0
    );
}

#[test]
fn test_unconfirmed_delay_decays_and_persists() {
    let dir = TempDir::new().unwrap();
    write_candidates(&dir);

    let engine = TorchEngine::start(dir.path()).expect("engine should start");
    engine.before_field_write("a1@Svc::conn", ValueId::NULL, ValueId(0xbeef), "Svc::Init", 12);

    assert_eq!(engine.scheduler().delay_count(), 1);
    assert_eq!(engine.scheduler().confirmed_count(), 0);
    let p = engine.scheduler().snapshot_probabilities()["Svc::Init|12"];
    assert!((p - 0.9).abs() < 1e-9);

    engine.shutdown().expect("shutdown should persist");
    drop(engine);

    // a fresh engine picks the decayed probability back up
    let engine = TorchEngine::start(dir.path()).expect("engine should restart");
    let p = engine.scheduler().snapshot_probabilities()["Svc::Init|12"];
    assert!((p - 0.9).abs() < 1e-9);
}

#[test]
fn test_engine_without_tables_never_delays() {
    let dir = TempDir::new().unwrap();

    let engine = TorchEngine::start(dir.path()).expect("engine should start");
    engine.before_field_write("a1@Svc::conn", ValueId::NULL, ValueId(0xbeef), "Svc::Init", 12);
    engine.after_field_write("a1@Svc::conn", ValueId(0xbeef), "Svc::Init", 12);
    engine.before_method_call(ValueId(0xbeef), "Conn::Send", "Svc::Run", 30);

    assert!(!engine.scheduler().has_plans());
    assert_eq!(engine.scheduler().delay_count(), 0);
}

#[test]
fn test_corrupt_candidate_table_starts_with_no_plans() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("Candidates.wfl"),
        b"#header\nSvc::conn\t7\t\xff\xfe\x80\n",
    )
    .unwrap();

    let engine = TorchEngine::start(dir.path()).expect("a mangled table must not abort startup");
    assert!(!engine.scheduler().has_plans());
}

#[test]
fn test_stats_line_reflects_delays() {
    let dir = TempDir::new().unwrap();
    write_candidates(&dir);

    let engine = TorchEngine::start(dir.path()).expect("engine should start");
    engine.before_field_write("a1@Svc::conn", ValueId::NULL, ValueId(0xbeef), "Svc::Init", 12);
    engine.shutdown().expect("shutdown should persist");

    let stats = std::fs::read_to_string(dir.path().join("Stats.wfl")).unwrap();
    assert!(stats.contains("delays=1"));
    assert!(stats.contains("total_delay_ms=98"));
}
