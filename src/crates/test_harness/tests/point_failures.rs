#![cfg(feature = "test-support")]

#[path = "harness_support.rs"]
mod support;

use std::time::{Duration, Instant};

use omroneip_harness::{
    ConnectionState, HarnessError, Point, PointType, PointValue, Session, SessionState, TagType,
};

use support::{fixture, simulator_with};

fn ready_session(records: &[(&str, &str)]) -> (Session, support::Fixture) {
    let fixture = fixture(records);
    let mut session = Session::new(fixture.config.clone());
    session
        .start_simulator(&simulator_with(&[("TestDINT", TagType::Dint)]))
        .expect("simulator should launch");
    session
        .start_controller()
        .expect("controller should start");
    (session, fixture)
}

#[test]
fn unknown_point_times_out_within_window() {
    let (mut session, _fixture) = ready_session(&[]);
    let missing = Point::new("DoesNotExist", PointType::Int32);

    let start = Instant::now();
    let err = session.read_point(&missing).unwrap_err();
    let elapsed = start.elapsed();

    assert!(
        matches!(err, HarnessError::PointUnavailable { ref name, .. } if name == "DoesNotExist"),
        "unexpected error {err:?}"
    );
    assert!(
        elapsed >= Duration::from_millis(900),
        "gave up too early: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(5),
        "took too long: {elapsed:?}"
    );
    assert_eq!(
        session.points().connection_state("DoesNotExist"),
        ConnectionState::Disconnected
    );

    let err = session
        .write_point(&missing, PointValue::Int32(1))
        .unwrap_err();
    assert!(matches!(err, HarnessError::PointUnavailable { .. }));

    // Still usable for teardown and further operations.
    assert_eq!(session.state(), SessionState::Ready);
    let report = session.finish();
    assert_eq!(report.failures.len(), 2, "{report}");
    assert!(report.teardown_errors.is_empty(), "{report}");
}

#[test]
fn point_operations_require_a_ready_session() {
    let fixture = fixture(&[("TestDINT:Read", "TestDINT")]);
    let mut session = Session::new(fixture.config.clone());
    let point = Point::new("TestDINT:Read", PointType::Int32);

    let start = Instant::now();
    let err = session.read_point(&point).unwrap_err();
    assert!(matches!(err, HarnessError::Precondition(_)));
    assert!(start.elapsed() < Duration::from_millis(500), "should fail fast");

    let report = session.finish();
    assert_eq!(report.failures.len(), 1);
}

#[cfg(unix)]
#[test]
fn dead_controller_fails_fast_instead_of_timing_out() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let (mut session, _fixture) = ready_session(&[("TestDINT:Read", "TestDINT")]);
    let point = Point::new("TestDINT:Read", PointType::Int32);
    assert_eq!(
        session.read_point(&point).expect("read while running"),
        PointValue::Int32(0)
    );

    let pid = session.controller_pid().expect("controller pid");
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).expect("kill controller");
    let deadline = Instant::now() + Duration::from_secs(2);
    while session.is_controller_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    let start = Instant::now();
    let err = session.read_point(&point).unwrap_err();
    assert!(matches!(err, HarnessError::Precondition(_)), "{err:?}");
    assert!(start.elapsed() < Duration::from_millis(500));

    let report = session.finish();
    assert!(report.teardown_errors.is_empty(), "{report}");
    let output = report.controller_output.expect("controller output");
    assert_eq!(output.exit_code, None, "controller died from a signal");
}

#[test]
fn width_mismatch_is_rejected_before_any_traffic() {
    let (mut session, _fixture) = ready_session(&[("TestDINT:Write", "TestDINT")]);
    let point = Point::new("TestDINT:Write", PointType::Int32);

    let err = session.write_point(&point, 1.5_f64).unwrap_err();
    assert!(matches!(err, HarnessError::Precondition(_)));
    assert_eq!(session.failures().len(), 1);
}
