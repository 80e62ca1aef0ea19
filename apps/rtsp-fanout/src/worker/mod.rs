//! The command worker.
//!
//! One thread drains the command queue in order. Each command updates the
//! desired branch set (or runs a restart), then a reconciliation pass stops
//! and starts branches until the actual states match what is desired.

use crossbeam_channel::Receiver;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::branch::{self, display, recording, BranchError, BranchKind, BranchState};
use crate::recovery::RestartPacer;
use crate::session::Shared;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Wakes the worker. Used as the shutdown sentinel.
    NoOp,
    StartDisplay,
    StopDisplay,
    /// The surface changed; rebinding happens in the next pass.
    RefreshDisplay,
    StartPushRtsp,
    StopPushRtsp,
    StartPushRtmp,
    StopPushRtmp,
    StartRecording(PathBuf),
    StopRecording,
    ResetGraph,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::NoOp => write!(f, "no-op"),
            Command::StartDisplay => write!(f, "start-display"),
            Command::StopDisplay => write!(f, "stop-display"),
            Command::RefreshDisplay => write!(f, "refresh-display"),
            Command::StartPushRtsp => write!(f, "start-push-rtsp"),
            Command::StopPushRtsp => write!(f, "stop-push-rtsp"),
            Command::StartPushRtmp => write!(f, "start-push-rtmp"),
            Command::StopPushRtmp => write!(f, "stop-push-rtmp"),
            Command::StartRecording(dir) => write!(f, "start-recording({})", dir.display()),
            Command::StopRecording => write!(f, "stop-recording"),
            Command::ResetGraph => write!(f, "reset-graph"),
        }
    }
}

/// Branches the host wants running. Owned by the worker thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredFlags {
    pub display: bool,
    pub push_rtsp: bool,
    pub push_rtmp: bool,
    /// Recording directory, when recording is wanted.
    pub recording: Option<PathBuf>,
}

impl DesiredFlags {
    /// Folds `command` into the flags. Returns false for commands that do
    /// not touch them.
    pub fn apply(&mut self, command: &Command) -> bool {
        match command {
            Command::StartDisplay => self.display = true,
            Command::StopDisplay => self.display = false,
            Command::StartPushRtsp => self.push_rtsp = true,
            Command::StopPushRtsp => self.push_rtsp = false,
            Command::StartPushRtmp => self.push_rtmp = true,
            Command::StopPushRtmp => self.push_rtmp = false,
            Command::StartRecording(dir) => self.recording = Some(dir.clone()),
            Command::StopRecording => self.recording = None,
            Command::NoOp | Command::RefreshDisplay | Command::ResetGraph => return false,
        }
        true
    }

    pub fn wants(&self, kind: BranchKind) -> bool {
        match kind {
            BranchKind::Display => self.display,
            BranchKind::PushRtsp => self.push_rtsp,
            BranchKind::PushRtmp => self.push_rtmp,
            BranchKind::Recording => self.recording.is_some(),
        }
    }
}

pub struct Worker {
    shared: Arc<Shared>,
    commands: Receiver<Command>,
    desired: DesiredFlags,
    pacer: RestartPacer,
}

impl Worker {
    pub(crate) fn new(shared: Arc<Shared>, commands: Receiver<Command>) -> Self {
        let pacer = RestartPacer::from_config(&shared.context.lock().config.restart);
        Self {
            shared,
            commands,
            desired: DesiredFlags::default(),
            pacer,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("fanout-worker".to_string())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        info!("Command worker started");
        let mut carried: Option<Command> = None;

        loop {
            let command = match carried.take() {
                Some(command) => command,
                None => match self.commands.recv() {
                    Ok(command) => command,
                    Err(_) => {
                        warn!("Command queue closed");
                        break;
                    }
                },
            };

            if !self.shared.is_running() {
                debug!("Worker no longer running, dropping {}", command);
                break;
            }

            debug!(%command, "Handling command");
            carried = self.handle(command);
            if !self.shared.is_running() {
                debug!("Worker told to stop, skipping reconciliation");
                break;
            }
            self.reconcile();
        }

        info!("Command worker stopped");
    }

    fn handle(&mut self, command: Command) -> Option<Command> {
        match command {
            Command::ResetGraph => {
                let shared = self.shared.clone();
                shared
                    .supervisor
                    .service(shared.as_ref(), &mut self.pacer, &self.commands)
            }
            other => {
                self.desired.apply(&other);
                None
            }
        }
    }

    /// Stops every branch that should not run, then starts every branch that
    /// should.
    fn reconcile(&mut self) {
        let shared = self.shared.clone();
        let graph = shared.graph.as_ref();
        let mut ctx = shared.context.lock();
        ctx.recording_dir = self.desired.recording.clone();

        for kind in BranchKind::ALL {
            if ctx.state(kind) != BranchState::Enabled {
                continue;
            }
            let refresh = kind == BranchKind::Display && display::needs_refresh(&ctx);
            if !self.desired.wants(kind) || refresh {
                if let Err(e) = branch::stop_kind(kind, graph, &mut ctx, &shared.eos_signal) {
                    warn!(branch = %kind, "Stop refused: {}", e);
                }
            }
        }

        if let Some(dir) = self.desired.recording.clone() {
            if let Err(e) = recording::retarget(graph, &mut ctx, &dir) {
                warn!("Recording retarget failed, restarting branch: {}", e);
                if let Err(e) =
                    branch::stop_kind(BranchKind::Recording, graph, &mut ctx, &shared.eos_signal)
                {
                    warn!(branch = %BranchKind::Recording, "Stop refused: {}", e);
                }
            }
        }

        for kind in BranchKind::ALL {
            if !self.desired.wants(kind) || ctx.state(kind) != BranchState::Disabled {
                continue;
            }
            match branch::start_kind(kind, graph, &mut ctx) {
                Ok(()) => {}
                Err(e @ (BranchError::NoTarget(_) | BranchError::Restarting)) => {
                    debug!(branch = %kind, "Start deferred: {}", e)
                }
                Err(e) => warn!(branch = %kind, "Start failed: {}", e),
            }
        }
    }
}
