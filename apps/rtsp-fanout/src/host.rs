//! Types shared with the host application embedding the relay.

use std::fmt;
use tracing::info;

/// Opaque handle to a platform display surface.
///
/// The platform owns the surface; the relay only hands the raw value to the
/// video sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayHandle(pub usize);

/// Outbound push protocol, selected from the destination URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushProtocol {
    /// Stateful RTSP announce/record push (PushA).
    Rtsp,
    /// RTMP push (PushB).
    Rtmp,
}

impl PushProtocol {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("rtmp") {
            Some(Self::Rtmp)
        } else if url.starts_with("rtsp") {
            Some(Self::Rtsp)
        } else {
            None
        }
    }
}

impl fmt::Display for PushProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushProtocol::Rtsp => write!(f, "rtsp"),
            PushProtocol::Rtmp => write!(f, "rtmp"),
        }
    }
}

/// Status notifications surfaced to the host as human readable text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMessage {
    PushRtmpShutdown,
    PushRtspShutdown,
    UpstreamEosRestart,
    SourceErrorRestart,
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusMessage::PushRtmpShutdown => write!(f, "0: push rtmp branch shutdown"),
            StatusMessage::PushRtspShutdown => write!(f, "1: push rtsp branch shutdown"),
            StatusMessage::UpstreamEosRestart => write!(f, "3: fetch eos, pipeline restart"),
            StatusMessage::SourceErrorRestart => write!(f, "4: rtsp src err, pipeline restart"),
        }
    }
}

/// Callbacks into the host. Invoked from the framework event thread.
pub trait HostNotifier: Send + Sync {
    fn on_message(&self, text: &str);
    fn on_media_size_changed(&self, width: u32, height: u32);
}

/// Notifier that only logs, used when no host is attached.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl HostNotifier for LogNotifier {
    fn on_message(&self, text: &str) {
        info!(target: "rtsp_fanout::host", "{}", text);
    }

    fn on_media_size_changed(&self, width: u32, height: u32) {
        info!(target: "rtsp_fanout::host", "Media size is {}x{}", width, height);
    }
}
