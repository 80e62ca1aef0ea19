//! Host-facing control surface.
//!
//! A [`Session`] owns the orchestration state, the signal bridge and the
//! worker thread. Control calls either update the context directly or queue
//! commands; they never start or stop branches themselves.

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::branch::{self, display, BranchKind, BranchState, StateBoard, Transition};
use crate::bridge::SignalBridge;
use crate::config::Config;
use crate::graph::{EventSink, MediaGraph, NodeState, StateTarget};
use crate::host::{DisplayHandle, HostNotifier, PushProtocol};
use crate::pipeline::PipelineContext;
use crate::recovery::{ResetMask, ResetReason, RestartSupervisor, RestartTarget};
use crate::worker::{Command, Worker};
use crate::{FanoutError, Result};

/// State shared by the session, the worker and the bridge.
pub(crate) struct Shared {
    pub(crate) graph: Arc<dyn MediaGraph>,
    pub(crate) context: Mutex<PipelineContext>,
    pub(crate) eos_signal: Condvar,
    pub(crate) board: Arc<StateBoard>,
    pub(crate) supervisor: RestartSupervisor,
    pub(crate) notifier: Arc<dyn HostNotifier>,
    commands: Sender<Command>,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn send(&self, command: Command) -> bool {
        debug!(%command, "Queueing command");
        match self.commands.send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!("Worker gone, dropping {}", e.into_inner());
                false
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stop_all(&self) {
        let mut ctx = self.context.lock();
        for kind in BranchKind::ALL {
            if ctx.state(kind) == BranchState::Enabled {
                if let Err(e) = branch::stop_kind(kind, self.graph.as_ref(), &mut ctx, &self.eos_signal) {
                    warn!(branch = %kind, "Stop during shutdown failed: {}", e);
                }
            }
        }
    }
}

impl RestartTarget for Shared {
    fn set_restarting(&self, restarting: bool) {
        self.context.lock().restarting = restarting;
    }

    fn stop_for(&self, mask: ResetMask) {
        let mut ctx = self.context.lock();
        for kind in BranchKind::ALL {
            if mask.covers(kind) && ctx.state(kind) == BranchState::Enabled {
                if let Err(e) = branch::stop_kind(kind, self.graph.as_ref(), &mut ctx, &self.eos_signal) {
                    warn!(branch = %kind, "Stop for reset failed: {}", e);
                }
            }
        }
    }

    fn is_running(&self) -> bool {
        Shared::is_running(self)
    }
}

pub struct Session {
    shared: Arc<Shared>,
    // Keeps the graph's weak event sink alive.
    _bridge: Arc<SignalBridge>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Wires a session onto `graph` and starts its worker.
    pub fn start(
        config: Config,
        graph: Arc<dyn MediaGraph>,
        notifier: Arc<dyn HostNotifier>,
    ) -> Result<Self> {
        config.validate()?;

        let (commands, receiver) = unbounded();
        let board = Arc::new(StateBoard::new());
        let shared = Arc::new(Shared {
            graph: graph.clone(),
            context: Mutex::new(PipelineContext::new(config, board.clone())),
            eos_signal: Condvar::new(),
            board,
            supervisor: RestartSupervisor::new(commands.clone()),
            notifier,
            commands,
            running: AtomicBool::new(true),
        });

        let bridge = Arc::new(SignalBridge::new(shared.clone()));
        let sink: Arc<dyn EventSink> = bridge.clone();
        let weak: Weak<dyn EventSink> = Arc::downgrade(&sink);
        graph.set_event_sink(weak);

        let handle = Worker::new(shared.clone(), receiver)
            .spawn()
            .map_err(|e| FanoutError::WorkerError(e.to_string()))?;

        info!("Session started");
        Ok(Self {
            shared,
            _bridge: bridge,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Requests the display branch. Needs a source url and a surface.
    pub fn play(&self) -> bool {
        {
            let ctx = self.shared.context.lock();
            if ctx.source_url.is_none() {
                warn!("play: no source url");
                return false;
            }
            if ctx.surface.is_none() {
                warn!("play: no display surface");
                return false;
            }
        }
        self.shared.send(Command::StartDisplay)
    }

    pub fn stop(&self) {
        self.shared.send(Command::StopDisplay);
    }

    pub fn set_source_url(&self, url: &str) {
        let mut ctx = self.shared.context.lock();
        if ctx.source_url.as_deref() == Some(url) {
            return;
        }
        info!("Source url set to {}", url);
        ctx.source_url = Some(url.to_string());
    }

    /// Records a push destination. The scheme picks the push branch.
    pub fn set_push_target(&self, url: &str) -> bool {
        let Some(protocol) = PushProtocol::from_url(url) else {
            warn!("Unsupported push url {}", url);
            return false;
        };

        let mut ctx = self.shared.context.lock();
        match protocol {
            PushProtocol::Rtsp => ctx.push_rtsp_url = Some(url.to_string()),
            PushProtocol::Rtmp => ctx.push_rtmp_url = Some(url.to_string()),
        }
        debug!("Push {} target set to {}", protocol, url);
        true
    }

    /// Turns the push branch selected by `url` on or off.
    pub fn push_stream(&self, enable: bool, url: &str) -> bool {
        if self.shared.context.lock().source_url.is_none() {
            warn!("push_stream: no source url");
            return false;
        }
        let Some(protocol) = PushProtocol::from_url(url) else {
            warn!("push_stream: unsupported url {}", url);
            return false;
        };

        if enable && !self.set_push_target(url) {
            return false;
        }

        let command = match (protocol, enable) {
            (PushProtocol::Rtsp, true) => Command::StartPushRtsp,
            (PushProtocol::Rtsp, false) => Command::StopPushRtsp,
            (PushProtocol::Rtmp, true) => Command::StartPushRtmp,
            (PushProtocol::Rtmp, false) => Command::StopPushRtmp,
        };
        self.shared.send(command)
    }

    /// Hands a new display surface over, or withdraws it with `None`.
    pub fn set_surface(&self, handle: Option<DisplayHandle>) {
        {
            let mut ctx = self.shared.context.lock();
            if let Some(handle) = handle {
                if display::rebind(self.shared.graph.as_ref(), &ctx, handle) {
                    return;
                }
            }
            info!("Display surface now {:?}", handle);
            ctx.surface = handle;
        }
        self.shared.send(Command::RefreshDisplay);
    }

    /// Starts or stops recording into `directory`. Rejected unless recording
    /// is enabled in the configuration.
    pub fn set_recording(&self, enable: bool, directory: &Path) -> bool {
        {
            let ctx = self.shared.context.lock();
            if !ctx.config.recording.enabled {
                error!("Recording is not supported by this configuration");
                return false;
            }
            if enable && ctx.source_url.is_none() {
                warn!("set_recording: no source url");
                return false;
            }
        }

        if enable {
            self.shared
                .send(Command::StartRecording(directory.to_path_buf()))
        } else {
            self.shared.send(Command::StopRecording)
        }
    }

    /// Requests a full graph restart.
    pub fn reset(&self) -> bool {
        self.shared.supervisor.raise(ResetReason::Graph)
    }

    /// Stops the worker, then every remaining branch. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down session");

        self.shared.send(Command::NoOp);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        self.shared.stop_all();
        let timeout = self.shared.context.lock().config.graph.state_timeout();
        if let Err(e) = self
            .shared
            .graph
            .set_state(StateTarget::Graph, NodeState::Null, timeout)
        {
            warn!("Failed to stop graph: {}", e);
        }
        info!("Session shut down");
    }

    pub fn branch_state(&self, kind: BranchKind) -> BranchState {
        self.shared.board.state(kind)
    }

    pub fn refcount(&self) -> usize {
        self.shared.board.refcount()
    }

    pub fn is_upstream_present(&self) -> bool {
        self.shared.board.upstream_present()
    }

    pub fn is_restarting(&self) -> bool {
        self.shared.context.lock().restarting
    }

    pub fn pending_resets(&self) -> ResetMask {
        self.shared.supervisor.pending()
    }

    pub fn recent_transitions(&self) -> Vec<Transition> {
        self.shared.board.history()
    }

    pub fn board(&self) -> &Arc<StateBoard> {
        &self.shared.board
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
