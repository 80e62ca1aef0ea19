use super::common::*;
use super::create_test_config;
use rtsp_fanout::branch::push::{RTMP_SINK, RTSP_SINK};
use rtsp_fanout::branch::recording::FILE_SINK;
use rtsp_fanout::graph::ProbeVerdict;
use rtsp_fanout::pipeline::upstream::{FANOUT, SOURCE};
use rtsp_fanout::{BranchKind, BranchState};
use std::time::{Duration, Instant};

fn display_cycles(test: &TestSession) -> usize {
    test.session
        .board()
        .history_of(BranchKind::Display)
        .iter()
        .filter(|t| **t == (BranchState::Enabled, BranchState::Disabling))
        .count()
}

#[test]
fn test_rtmp_open_failure_stops_push_only() {
    let test = TestSession::with_source(create_test_config());
    test.start_display();
    assert!(test.session.push_stream(true, RTMP_URL));
    assert!(test.wait_for(BranchKind::PushRtmp, BranchState::Enabled));

    test.graph
        .emit_error(RTMP_SINK, "Could not open resource for writing.");
    assert!(test.wait_for(BranchKind::PushRtmp, BranchState::Disabled));
    test.graph.flush_events();

    assert_eq!(test.notifier.count_with_code('0'), 1);
    assert_eq!(test.notifier.count_with_code('4'), 0);
    assert_eq!(
        test.session.branch_state(BranchKind::Display),
        BranchState::Enabled
    );
    assert_eq!(test.session.refcount(), 1);
    assert_eq!(display_cycles(&test), 0);
}

#[test]
fn test_rtsp_sink_error_stops_push_only() {
    let test = TestSession::with_source(create_test_config());
    test.start_display();
    assert!(test.session.push_stream(true, RTSP_URL));
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Enabled));

    test.graph
        .emit_error(RTSP_SINK, "Could not read from resource.");
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Disabled));
    test.graph.flush_events();

    assert_eq!(test.notifier.count_with_code('1'), 1);
    assert_eq!(
        test.session.branch_state(BranchKind::Display),
        BranchState::Enabled
    );
    assert_eq!(display_cycles(&test), 0);
}

#[test]
fn test_source_error_restarts_graph() {
    let test = TestSession::with_source(create_test_config());
    test.start_display();
    assert!(test.session.push_stream(true, RTMP_URL));
    assert!(test.wait_for(BranchKind::PushRtmp, BranchState::Enabled));

    test.graph
        .emit_error(SOURCE, "Could not open resource for reading.");
    assert!(wait_until(Duration::from_secs(3), || display_cycles(&test) == 1));
    assert!(test.wait_settled());
    assert!(test.wait_for(BranchKind::Display, BranchState::Enabled));
    assert!(test.wait_for(BranchKind::PushRtmp, BranchState::Enabled));

    test.graph.flush_events();
    assert_eq!(test.notifier.count_with_code('4'), 1);
    assert_eq!(test.session.refcount(), 2);
}

#[test]
fn test_error_burst_is_coalesced() {
    let test = TestSession::with_source(create_test_config());
    test.start_display();

    for _ in 0..5 {
        test.graph
            .emit_error(SOURCE, "Could not open resource for reading.");
    }
    test.graph.flush_events();

    assert!(test.wait_settled());
    assert!(test.wait_for(BranchKind::Display, BranchState::Enabled));
    assert!(!test.session.is_restarting());

    assert_eq!(test.notifier.count_with_code('4'), 1);
    assert_eq!(display_cycles(&test), 1);
}

/// Raises one source error and returns how long the display took to come
/// back.
fn restart_once(test: &TestSession, cycle: usize) -> Duration {
    let started = Instant::now();
    test.graph
        .emit_error(SOURCE, "Could not open resource for reading.");
    assert!(wait_until(Duration::from_secs(3), || display_cycles(test) == cycle));
    assert!(test.wait_settled());
    assert!(test.wait_for(BranchKind::Display, BranchState::Enabled));
    started.elapsed()
}

#[test]
fn test_repeated_restarts_back_off() {
    let mut config = create_test_config();
    config.restart.window_ms = 2000;
    config.restart.backoff_ms = 500;
    let test = TestSession::with_source(config);
    test.start_display();

    // The first two restarts in a row come straight back.
    restart_once(&test, 1);
    restart_once(&test, 2);

    // The third is inside the streak window and waits out the backoff.
    let third = restart_once(&test, 3);
    assert!(third >= Duration::from_millis(500), "third restart took {:?}", third);

    test.graph.flush_events();
    assert_eq!(test.notifier.count_with_code('4'), 3);
}

#[test]
fn test_recording_sink_error_cycles_recording_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = create_test_config();
    config.recording.enabled = true;
    let test = TestSession::with_source(config);

    test.start_display();
    assert!(test.session.set_recording(true, dir.path()));
    assert!(test.wait_for(BranchKind::Recording, BranchState::Enabled));

    test.graph.emit_error(FILE_SINK, "Could not write to file.");
    assert!(wait_until(Duration::from_secs(3), || {
        test.session
            .board()
            .history_of(BranchKind::Recording)
            .contains(&(BranchState::Enabled, BranchState::Disabling))
    }));
    assert!(test.wait_settled());
    assert!(test.wait_for(BranchKind::Recording, BranchState::Enabled));

    test.graph.flush_events();
    assert_eq!(display_cycles(&test), 0);
    assert_eq!(test.notifier.count_with_code('4'), 0);
    assert_eq!(test.session.refcount(), 2);
}

#[test]
fn test_shutdown_during_restart_does_not_rebuild() {
    let test = TestSession::with_source(create_test_config());
    test.graph.set_eos_forwarding("rtspclientsink", false);

    test.start_display();
    assert!(test.session.push_stream(true, RTSP_URL));
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Enabled));

    // The reset parks the worker in the push drain wait.
    assert!(test.session.reset());
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Disabling));
    test.session.shutdown();

    let starts = |kind| {
        test.session
            .board()
            .history_of(kind)
            .iter()
            .filter(|t| **t == (BranchState::Disabled, BranchState::Enabling))
            .count()
    };
    assert_eq!(starts(BranchKind::Display), 1);
    assert_eq!(starts(BranchKind::PushRtsp), 1);
    assert_eq!(test.session.board().forced_detaches(), 1);
    assert_eq!(
        test.session.branch_state(BranchKind::Display),
        BranchState::Disabled
    );
    assert!(!test.session.is_upstream_present());
}

#[test]
fn test_teardown_noise_is_ignored() {
    let test = TestSession::with_source(create_test_config());
    test.graph.hold_idle(true);

    assert!(test.session.push_stream(true, RTSP_URL));
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Enabled));

    // The stop waits on the drain; the source complains meanwhile.
    assert!(test.session.push_stream(false, RTSP_URL));
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Disabling));
    test.graph.emit_error(SOURCE, "Unhandled error");
    test.graph.flush_events();

    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Disabled));
    assert_eq!(test.notifier.count_with_code('4'), 0);
    assert!(test.session.pending_resets().is_empty());
}

#[test]
fn test_upstream_eos_restarts_graph() {
    let test = TestSession::with_source(create_test_config());
    test.start_display();

    assert_eq!(test.graph.inject_eos(FANOUT), Some(ProbeVerdict::Drop));
    // Dropped at the fan-out, nothing downstream saw it.
    assert_eq!(test.graph.eos_received("disp0-queue"), 0);

    assert!(wait_until(Duration::from_secs(3), || display_cycles(&test) == 1));
    assert!(test.wait_settled());
    assert!(test.wait_for(BranchKind::Display, BranchState::Enabled));
    test.graph.flush_events();
    assert_eq!(test.notifier.count_with_code('3'), 1);
}

#[test]
fn test_manual_reset_cycles_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = create_test_config();
    config.recording.enabled = true;
    let test = TestSession::with_source(config);

    test.start_display();
    assert!(test.session.set_recording(true, dir.path()));
    assert!(test.wait_for(BranchKind::Recording, BranchState::Enabled));

    assert!(test.session.reset());
    assert!(wait_until(Duration::from_secs(3), || display_cycles(&test) == 1));
    assert!(test.wait_settled());
    assert!(test.wait_for(BranchKind::Display, BranchState::Enabled));
    assert!(test.wait_for(BranchKind::Recording, BranchState::Enabled));
    assert!(test
        .session
        .board()
        .history_of(BranchKind::Recording)
        .contains(&(BranchState::Enabled, BranchState::Disabling)));
}

#[test]
fn test_failed_branch_releases_upstream() {
    let test = TestSession::with_source(create_test_config());
    test.graph.fail_factory("rtmpsink");

    assert!(test.session.push_stream(true, RTMP_URL));
    assert!(wait_until(Duration::from_secs(3), || {
        test.session
            .board()
            .history_of(BranchKind::PushRtmp)
            .contains(&(BranchState::Enabling, BranchState::Disabled))
    }));
    assert_eq!(
        test.session.branch_state(BranchKind::PushRtmp),
        BranchState::Disabled
    );
    assert_eq!(test.session.refcount(), 0);
    assert!(!test.session.is_upstream_present());
    assert_eq!(test.graph.node_count(), 0);

    // Still wanted, so the next pass picks it up once the factory works.
    test.graph.restore_factory("rtmpsink");
    test.start_display();
    assert!(test.wait_for(BranchKind::PushRtmp, BranchState::Enabled));
    assert_eq!(test.session.refcount(), 2);
}

#[test]
fn test_missing_source_element_keeps_branches_down() {
    let test = TestSession::with_source(create_test_config());
    test.graph.fail_factory("rtspsrc");

    test.session.set_surface(Some(SURFACE));
    assert!(test.session.play());
    assert!(wait_until(Duration::from_secs(3), || {
        !test
            .session
            .board()
            .history_of(BranchKind::Display)
            .is_empty()
    }));
    assert!(test.wait_for(BranchKind::Display, BranchState::Disabled));
    assert!(!test.session.is_upstream_present());
    assert_eq!(test.graph.node_count(), 0);
}
