use super::common::*;
use super::create_test_config;
use rtsp_fanout::branch::display::VIDEO_SINK;
use rtsp_fanout::branch::push::{RTMP_SINK, RTSP_SINK};
use rtsp_fanout::branch::recording::FILE_SINK;
use rtsp_fanout::graph::{NodeState, PropValue, StreamAnnouncement};
use rtsp_fanout::pipeline::upstream::{DEPAY, FANOUT, SOURCE};
use rtsp_fanout::{BranchKind, BranchState, DisplayHandle};
use std::time::Duration;

#[test]
fn test_play_requires_source_and_surface() {
    let test = TestSession::new(create_test_config());

    assert!(!test.session.play());
    test.session.set_source_url(SOURCE_URL);
    assert!(!test.session.play());

    test.session.set_surface(Some(SURFACE));
    assert!(test.session.play());
    assert!(test.wait_for(BranchKind::Display, BranchState::Enabled));
}

#[test]
fn test_push_requires_source() {
    let test = TestSession::new(create_test_config());
    assert!(!test.session.push_stream(true, RTMP_URL));
    test.session.set_source_url(SOURCE_URL);
    assert!(!test.session.push_stream(true, "srt://10.0.0.9:9000"));
    assert!(test.session.push_stream(true, RTMP_URL));
    assert!(test.wait_for(BranchKind::PushRtmp, BranchState::Enabled));
}

#[test]
fn test_display_builds_upstream_once() {
    let test = TestSession::with_source(create_test_config());
    test.graph.set_geometry(1920, 1080);
    test.start_display();

    assert_eq!(test.session.refcount(), 1);
    assert!(test.session.is_upstream_present());
    assert!(test.graph.has_node(SOURCE));
    assert!(test.graph.has_node(FANOUT));
    assert_eq!(test.graph.graph_state(), NodeState::Playing);
    assert_eq!(test.graph.window_of(VIDEO_SINK), Some(SURFACE));
    assert_eq!(
        test.graph.property_of(SOURCE, "location"),
        Some(PropValue::from(SOURCE_URL))
    );

    test.graph.flush_events();
    assert_eq!(test.notifier.sizes(), vec![(1920, 1080)]);

    // The source exposes its H264 stream only once it is running.
    assert!(test.graph.announce_stream(
        SOURCE,
        StreamAnnouncement {
            stream: "recv_rtp_src_0_1_96".to_string(),
            encoding: Some("H264".to_string()),
        }
    ));
    assert_eq!(test.graph.stream_link_count(), 1);

    test.session.stop();
    assert!(test.wait_for(BranchKind::Display, BranchState::Disabled));
    assert_eq!(test.session.refcount(), 0);
    assert!(!test.session.is_upstream_present());
    assert_eq!(test.graph.node_count(), 0);
    assert_eq!(test.graph.port_count(), 0);
}

#[test]
fn test_non_h264_stream_is_ignored() {
    let test = TestSession::with_source(create_test_config());
    test.start_display();

    test.graph.announce_stream(
        SOURCE,
        StreamAnnouncement {
            stream: "recv_rtp_src_1_2_97".to_string(),
            encoding: Some("MPEG4-GENERIC".to_string()),
        },
    );
    assert_eq!(test.graph.stream_link_count(), 0);
    assert!(test.graph.has_node(DEPAY));
    assert_eq!(
        test.session.branch_state(BranchKind::Display),
        BranchState::Enabled
    );
}

#[test]
fn test_rtmp_push_joins_running_display() {
    let test = TestSession::with_source(create_test_config());
    test.start_display();

    assert!(test.session.push_stream(true, RTMP_URL));
    assert!(test.wait_for(BranchKind::PushRtmp, BranchState::Enabled));
    assert_eq!(test.session.refcount(), 2);
    assert!(test.graph.is_port_linked("rtmp0-queue"));
    assert_eq!(
        test.graph.property_of(RTMP_SINK, "location"),
        Some(PropValue::from(RTMP_URL))
    );
    assert_eq!(test.graph.node_state(RTMP_SINK), Some(NodeState::Playing));

    // Dropping the display leaves the push running on the same upstream.
    test.session.stop();
    assert!(test.wait_for(BranchKind::Display, BranchState::Disabled));
    assert_eq!(test.session.refcount(), 1);
    assert_eq!(
        test.session.branch_state(BranchKind::PushRtmp),
        BranchState::Enabled
    );
    assert_eq!(test.graph.graph_state(), NodeState::Playing);
    assert!(!test.graph.has_node(VIDEO_SINK));
    assert!(test.graph.has_node(SOURCE));
}

#[test]
fn test_rtsp_push_drains_before_teardown() {
    let test = TestSession::with_source(create_test_config());
    test.start_display();

    assert!(test.session.push_stream(true, RTSP_URL));
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Enabled));
    assert_eq!(
        test.graph.property_of(RTSP_SINK, "location"),
        Some(PropValue::from(RTSP_URL))
    );

    assert!(test.session.push_stream(false, RTSP_URL));
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Disabled));
    assert_eq!(test.session.board().forced_detaches(), 0);
    assert!(!test.graph.has_node(RTSP_SINK));
    assert_eq!(test.session.refcount(), 1);
    assert_eq!(
        test.session.branch_state(BranchKind::Display),
        BranchState::Enabled
    );
}

#[test]
fn test_rtsp_push_forced_after_drain_timeout() {
    let test = TestSession::with_source(create_test_config());
    test.graph.set_eos_forwarding("rtspclientsink", false);

    assert!(test.session.push_stream(true, RTSP_URL));
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Enabled));
    assert_eq!(test.session.refcount(), 1);

    assert!(test.session.push_stream(false, RTSP_URL));
    assert!(test.wait_for(BranchKind::PushRtsp, BranchState::Disabled));
    assert_eq!(test.session.board().forced_detaches(), 1);
    // It was the last branch, so the upstream went with it.
    assert!(!test.session.is_upstream_present());
    assert_eq!(test.graph.node_count(), 0);
}

#[test]
fn test_surface_rebind_and_swap() {
    let test = TestSession::with_source(create_test_config());
    test.start_display();
    let cycles = test.session.board().history_of(BranchKind::Display).len();

    // Same surface: expose only.
    test.session.set_surface(Some(SURFACE));
    assert_eq!(test.graph.expose_count(), 1);
    assert_eq!(
        test.session.board().history_of(BranchKind::Display).len(),
        cycles
    );

    // New surface: the display is rebuilt on it.
    let other = DisplayHandle(0x3b00);
    test.session.set_surface(Some(other));
    assert!(wait_until(Duration::from_secs(3), || {
        test.graph.window_of(VIDEO_SINK) == Some(other)
    }));
    assert!(test.wait_for(BranchKind::Display, BranchState::Enabled));

    // Surface withdrawn: the display stops and waits for a new one.
    test.session.set_surface(None);
    assert!(test.wait_for(BranchKind::Display, BranchState::Disabled));
    test.session.set_surface(Some(SURFACE));
    assert!(test.wait_for(BranchKind::Display, BranchState::Enabled));
    assert_eq!(test.graph.window_of(VIDEO_SINK), Some(SURFACE));
}

#[test]
fn test_recording_is_gated_by_config() {
    let dir = tempfile::tempdir().unwrap();
    let test = TestSession::with_source(create_test_config());
    assert!(!test.session.set_recording(true, dir.path()));
    assert_eq!(
        test.session.branch_state(BranchKind::Recording),
        BranchState::Disabled
    );
}

#[test]
fn test_recording_moves_between_directories() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    let mut config = create_test_config();
    config.recording.enabled = true;
    let test = TestSession::with_source(config);

    assert!(test.session.set_recording(true, first.path()));
    assert!(test.wait_for(BranchKind::Recording, BranchState::Enabled));
    let location = match test.graph.property_of(FILE_SINK, "location") {
        Some(PropValue::Str(location)) => location,
        other => panic!("unexpected location {:?}", other),
    };
    assert!(location.starts_with(first.path().to_str().unwrap()));
    assert!(location.contains("VideoRecording-"));
    assert!(location.ends_with("-utc.flv"));

    assert!(test.session.set_recording(true, second.path()));
    assert!(wait_until(Duration::from_secs(3), || {
        matches!(
            test.graph.property_of(FILE_SINK, "location"),
            Some(PropValue::Str(l)) if l.starts_with(second.path().to_str().unwrap())
        )
    }));
    // Moved in place, never stopped.
    assert!(!test
        .session
        .board()
        .history_of(BranchKind::Recording)
        .contains(&(BranchState::Enabled, BranchState::Disabling)));
    assert_eq!(test.session.refcount(), 1);

    assert!(test.session.set_recording(false, second.path()));
    assert!(test.wait_for(BranchKind::Recording, BranchState::Disabled));
    assert!(!test.session.is_upstream_present());
}

#[test]
fn test_all_branches_share_one_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = create_test_config();
    config.recording.enabled = true;
    let test = TestSession::with_source(config);

    test.start_display();
    assert!(test.session.push_stream(true, RTMP_URL));
    assert!(test.session.push_stream(true, RTSP_URL));
    assert!(test.session.set_recording(true, dir.path()));

    for kind in BranchKind::ALL {
        assert!(test.wait_for(kind, BranchState::Enabled), "{} not enabled", kind);
    }
    assert_eq!(test.session.refcount(), 4);
    assert_eq!(test.graph.port_count(), 4);

    test.session.shutdown();
    for kind in BranchKind::ALL {
        assert_eq!(test.session.branch_state(kind), BranchState::Disabled);
    }
    assert_eq!(test.session.refcount(), 0);
    assert_eq!(test.graph.node_count(), 0);
}
