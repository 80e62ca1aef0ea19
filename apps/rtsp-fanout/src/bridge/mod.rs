//! Framework events routed into the orchestrator.
//!
//! Nothing here takes the orchestration lock except the RTSP drain
//! notification, which the waiting worker has released.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::branch::push::{RTMP_SINK, RTSP_SINK};
use crate::branch::recording::FILE_SINK;
use crate::branch::{BranchState, StateBoard};
use crate::graph::{
    ElementMessage, ErrorEvent, EventSink, NodeId, NodeState, ProbeVerdict, StateChange,
    StateOrigin,
};
use crate::host::StatusMessage;
use crate::pipeline::upstream::SOURCE;
use crate::recovery::ResetReason;
use crate::session::Shared;
use crate::worker::Command;
use crate::FanoutError;

const RTMP_OPEN_FAILED: &str = "Could not open resource for writing.";

/// Source errors the RTSP client emits while its session is torn down on
/// purpose.
const TEARDOWN_NOISE: [&str; 2] = ["Unhandled error", "Could not write to resource."];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RTMP sink could not reach its endpoint; stop PushB only.
    PushRtmpTransport,
    /// Any RTSP push sink error; stop PushA only.
    PushRtspTransport,
    /// The recording file could not be written; cycle Recording only.
    RecordingSink,
    /// Expected while the last branch is being stopped.
    TeardownNoise,
    /// Everything else restarts the graph.
    Upstream,
}

pub fn classify(error: &ErrorEvent, board: &StateBoard) -> ErrorClass {
    if error.source == RTMP_SINK && error.message == RTMP_OPEN_FAILED {
        return ErrorClass::PushRtmpTransport;
    }
    if error.source == RTSP_SINK {
        return ErrorClass::PushRtspTransport;
    }
    if error.source == FILE_SINK {
        return ErrorClass::RecordingSink;
    }
    if error.source == SOURCE
        && board.refcount() == 1
        && board.any_in(BranchState::Disabling)
        && TEARDOWN_NOISE.contains(&error.message.as_str())
    {
        return ErrorClass::TeardownNoise;
    }
    ErrorClass::Upstream
}

pub struct SignalBridge {
    shared: Arc<Shared>,
}

impl SignalBridge {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn notify(&self, message: StatusMessage) {
        self.shared.notifier.on_message(&message.to_string());
    }
}

impl EventSink for SignalBridge {
    fn on_state_changed(&self, change: &StateChange) {
        if change.origin != StateOrigin::Graph {
            return;
        }
        debug!("Graph state {} -> {}", change.old, change.new);

        if change.old == NodeState::Paused && change.new == NodeState::Playing {
            match self.shared.graph.video_geometry() {
                Some(geometry) if geometry.width > 0 && geometry.height > 0 => {
                    info!("Media size {}x{}", geometry.width, geometry.height);
                    self.shared
                        .notifier
                        .on_media_size_changed(geometry.width, geometry.height);
                }
                _ => debug!("No negotiated video geometry yet"),
            }
        }
    }

    fn on_error(&self, error: &ErrorEvent) {
        warn!(
            "Error from {}: {} ({})",
            error.source,
            error.message,
            error.debug.as_deref().unwrap_or("no debug info")
        );

        match classify(error, &self.shared.board) {
            ErrorClass::PushRtmpTransport => {
                let err = FanoutError::TransportError {
                    sink: error.source.clone(),
                    message: error.message.clone(),
                };
                warn!("Shutting down push rtmp: {}", err);
                self.notify(StatusMessage::PushRtmpShutdown);
                self.shared.send(Command::StopPushRtmp);
            }
            ErrorClass::PushRtspTransport => {
                let err = FanoutError::TransportError {
                    sink: error.source.clone(),
                    message: error.message.clone(),
                };
                warn!("Shutting down push rtsp: {}", err);
                self.notify(StatusMessage::PushRtspShutdown);
                self.shared.send(Command::StopPushRtsp);
            }
            ErrorClass::RecordingSink => {
                if self.shared.supervisor.raise(ResetReason::Recording) {
                    warn!("Restarting recording: {}", error.message);
                }
            }
            ErrorClass::TeardownNoise => {
                info!("Ignoring {} error during teardown", error.source);
            }
            ErrorClass::Upstream => {
                let err = FanoutError::UpstreamError {
                    source_name: error.source.clone(),
                    message: error.message.clone(),
                };
                if self.shared.supervisor.raise(ResetReason::Graph) {
                    warn!("Restarting pipeline: {}", err);
                    self.notify(StatusMessage::SourceErrorRestart);
                } else {
                    debug!("Restart already requested: {}", err);
                }
            }
        }
    }

    fn on_element_message(&self, message: &ElementMessage) {
        match message {
            ElementMessage::ForwardedEos { origin } if origin == RTSP_SINK => {
                debug!("EOS drained through {}", origin);
                let mut ctx = self.shared.context.lock();
                ctx.rtsp_eos_seen = true;
                self.shared.eos_signal.notify_all();
            }
            ElementMessage::ForwardedEos { origin } => debug!("EOS from {}", origin),
            ElementMessage::Other { source, name } => debug!("Element message {} from {}", name, source),
        }
    }

    fn on_eos_probe(&self, node: NodeId) -> ProbeVerdict {
        info!("Upstream EOS reached fan-out ({}), restarting", node);
        if self.shared.supervisor.raise(ResetReason::Graph) {
            self.notify(StatusMessage::UpstreamEosRestart);
        }
        ProbeVerdict::Drop
    }
}
