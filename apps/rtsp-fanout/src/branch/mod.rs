//! Output branches hanging off the shared fan-out.
//!
//! Every branch follows the same life cycle:
//!
//! ```text
//! Disabled --start--> Enabling --attached--> Enabled --stop--> Disabling --> Disabled
//!                         \--failed----------------------------------------> Disabled
//! ```
//!
//! Transitions are made only by [`start`] / [`stop`] while the orchestration
//! lock is held. The [`StateBoard`] mirrors them for lock-free readers.

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::graph::{GraphError, MediaGraph, NodeSpec, NodeState, PortId, StateTarget, Subgraph};
use crate::pipeline::{ContextGuard, PipelineContext};

pub mod display;
pub mod push;
pub mod recording;

pub use display::Display;
pub use push::{PushRtmp, PushRtsp};
pub use recording::Recording;

const HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchKind {
    Display,
    /// PushA: RTSP announce/record push.
    PushRtsp,
    /// PushB: RTMP push.
    PushRtmp,
    Recording,
}

impl BranchKind {
    /// Order used by reconciliation and teardown.
    pub const ALL: [BranchKind; 4] = [
        BranchKind::Display,
        BranchKind::PushRtmp,
        BranchKind::PushRtsp,
        BranchKind::Recording,
    ];

    pub fn index(self) -> usize {
        match self {
            BranchKind::Display => 0,
            BranchKind::PushRtmp => 1,
            BranchKind::PushRtsp => 2,
            BranchKind::Recording => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BranchKind::Display => "display",
            BranchKind::PushRtsp => "push-rtsp",
            BranchKind::PushRtmp => "push-rtmp",
            BranchKind::Recording => "recording",
        }
    }
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BranchState {
    #[default]
    Disabled = 0,
    Enabling = 1,
    Enabled = 2,
    Disabling = 3,
}

impl BranchState {
    pub fn can_transition(self, to: BranchState) -> bool {
        use BranchState::*;
        matches!(
            (self, to),
            (Disabled, Enabling)
                | (Enabling, Enabled)
                | (Enabling, Disabled)
                | (Enabled, Disabling)
                | (Disabling, Disabled)
        )
    }

    /// Whether the branch holds a reference on the shared upstream.
    pub fn holds_upstream(self) -> bool {
        matches!(self, BranchState::Enabling | BranchState::Enabled)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => BranchState::Enabling,
            2 => BranchState::Enabled,
            3 => BranchState::Disabling,
            _ => BranchState::Disabled,
        }
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BranchState::Disabled => "disabled",
            BranchState::Enabling => "enabling",
            BranchState::Enabled => "enabled",
            BranchState::Disabling => "disabling",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BranchError {
    #[error("{kind} is {state}, not disabled")]
    NotDisabled { kind: BranchKind, state: BranchState },
    #[error("{kind} is {state}, not enabled")]
    NotEnabled { kind: BranchKind, state: BranchState },
    #[error("{0} has no target configured")]
    NoTarget(BranchKind),
    #[error("pipeline restart in progress")]
    Restarting,
    #[error("no source url configured")]
    NoSource,
    #[error("graph operation failed: {0}")]
    Graph(#[from] GraphError),
}

/// One recorded branch transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub branch: BranchKind,
    pub from: BranchState,
    pub to: BranchState,
    /// Upstream reference count right after the transition.
    pub refcount: usize,
    pub at: DateTime<Utc>,
}

/// Lock-free mirror of branch states and the upstream reference count.
#[derive(Debug, Default)]
pub struct StateBoard {
    states: [AtomicU8; 4],
    refcount: AtomicUsize,
    upstream: AtomicBool,
    forced_detaches: AtomicUsize,
    history: Mutex<VecDeque<Transition>>,
}

impl StateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, kind: BranchKind) -> BranchState {
        BranchState::from_u8(self.states[kind.index()].load(Ordering::SeqCst))
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn upstream_present(&self) -> bool {
        self.upstream.load(Ordering::SeqCst)
    }

    /// Push rtsp stops that gave up waiting for the sink to drain.
    pub fn forced_detaches(&self) -> usize {
        self.forced_detaches.load(Ordering::SeqCst)
    }

    pub(crate) fn note_forced_detach(&self) {
        self.forced_detaches.fetch_add(1, Ordering::SeqCst);
    }

    pub fn any_in(&self, state: BranchState) -> bool {
        BranchKind::ALL.iter().any(|kind| self.state(*kind) == state)
    }

    pub fn history(&self) -> Vec<Transition> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn history_of(&self, kind: BranchKind) -> Vec<(BranchState, BranchState)> {
        self.history
            .lock()
            .iter()
            .filter(|t| t.branch == kind)
            .map(|t| (t.from, t.to))
            .collect()
    }

    pub(crate) fn publish_refcount(&self, refcount: usize, upstream: bool) {
        self.refcount.store(refcount, Ordering::SeqCst);
        self.upstream.store(upstream, Ordering::SeqCst);
    }

    pub(crate) fn record(&self, kind: BranchKind, from: BranchState, to: BranchState) {
        self.states[kind.index()].store(to as u8, Ordering::SeqCst);

        let mut history = self.history.lock();
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(Transition {
            branch: kind,
            from,
            to,
            refcount: self.refcount(),
            at: Utc::now(),
        });
    }
}

/// Per-kind behaviour plugged into the generic [`start`] / [`stop`].
pub trait OutputBranch {
    const KIND: BranchKind;

    /// Destination the branch needs before it can start.
    type Target: Clone + fmt::Debug;

    fn target(ctx: &PipelineContext) -> Option<Self::Target>;

    fn recipe(config: &Config, target: &Self::Target) -> Vec<NodeSpec>;

    /// Brings a freshly linked subgraph to playing. `first` is set when no
    /// other branch was running, so the whole graph still sits in `Null`.
    fn bring_up(
        graph: &dyn MediaGraph,
        ctx: &PipelineContext,
        subgraph: &Subgraph,
        first: bool,
        _target: &Self::Target,
    ) -> Result<(), GraphError> {
        let timeout = ctx.config.graph.state_timeout();
        if first {
            graph.set_state(StateTarget::Graph, NodeState::Playing, timeout)
        } else {
            subgraph.set_state(graph, NodeState::Ready, timeout)?;
            subgraph.sync_with_parent(graph)
        }
    }

    /// Records what the running branch is bound to.
    fn attached(_ctx: &mut PipelineContext, _target: &Self::Target) {}

    fn detached(_ctx: &mut PipelineContext) {}

    /// Unlinks the subgraph from its fan-out port and stops it.
    fn detach(
        graph: &dyn MediaGraph,
        ctx: &mut ContextGuard<'_>,
        _eos: &Condvar,
        subgraph: &Subgraph,
        port: PortId,
    ) {
        detach_now(graph, ctx, subgraph, port);
    }
}

/// Stops the subgraph synchronously and unlinks it.
pub(crate) fn detach_now(
    graph: &dyn MediaGraph,
    ctx: &PipelineContext,
    subgraph: &Subgraph,
    port: PortId,
) {
    let timeout = ctx.config.graph.state_timeout();
    if ctx.refcount() == 1 {
        if let Err(e) = graph.set_state(StateTarget::Graph, NodeState::Null, timeout)
        {
            warn!("Failed to stop graph: {}", e);
        }
    } else {
        subgraph.set_locked(graph, true);
        if let Err(e) = subgraph.set_state(graph, NodeState::Null, timeout) {
            warn!("Failed to stop subgraph: {}", e);
        }
    }

    if let Some(head) = subgraph.head() {
        graph.unlink_port(port, head);
    }
}

/// Starts branch `B`. Refused unless it is disabled, has a target and no
/// restart is running.
pub fn start<B: OutputBranch>(
    graph: &dyn MediaGraph,
    ctx: &mut PipelineContext,
) -> Result<(), BranchError> {
    let kind = B::KIND;
    let state = ctx.state(kind);
    if state != BranchState::Disabled {
        return Err(BranchError::NotDisabled { kind, state });
    }
    if ctx.restarting {
        return Err(BranchError::Restarting);
    }
    let target = B::target(ctx).ok_or(BranchError::NoTarget(kind))?;

    info!(branch = %kind, ?target, "Starting branch");
    ctx.transition(kind, BranchState::Enabling);

    let first = ctx.refcount() == 0;
    if let Err(e) = ctx.acquire_upstream(graph) {
        error!(branch = %kind, "Unable to set up upstream: {}", e);
        ctx.transition(kind, BranchState::Disabled);
        return Err(e);
    }

    match attach::<B>(graph, ctx, first, &target) {
        Ok(subgraph) => {
            ctx.slot_mut(kind).subgraph = Some(subgraph);
            B::attached(ctx, &target);
            ctx.transition(kind, BranchState::Enabled);
            info!(branch = %kind, refcount = ctx.refcount(), "Branch enabled");
            Ok(())
        }
        Err(e) => {
            error!(branch = %kind, "Branch setup failed: {}", e);
            ctx.release_upstream(graph);
            ctx.transition(kind, BranchState::Disabled);
            Err(BranchError::Graph(e))
        }
    }
}

fn attach<B: OutputBranch>(
    graph: &dyn MediaGraph,
    ctx: &PipelineContext,
    first: bool,
    target: &B::Target,
) -> Result<Subgraph, GraphError> {
    let port = ctx
        .port(B::KIND)
        .ok_or_else(|| GraphError::PortRequest(B::KIND.to_string()))?;

    let mut subgraph = Subgraph::build_chain(graph, &B::recipe(&ctx.config, target))?;
    let head = match subgraph.head() {
        Some(head) => head,
        None => return Err(GraphError::Unsupported("empty branch recipe".to_string())),
    };

    if let Err(e) = graph.link_port(port, head) {
        subgraph.teardown(graph);
        return Err(e);
    }
    subgraph.set_locked(graph, false);

    if let Err(e) = B::bring_up(graph, ctx, &subgraph, first, target) {
        graph.unlink_port(port, head);
        subgraph.set_locked(graph, true);
        if let Err(stop) = subgraph.set_state(graph, NodeState::Null, ctx.config.graph.state_timeout()) {
            warn!(branch = %B::KIND, "Failed to stop subgraph after bring-up error: {}", stop);
        }
        subgraph.teardown(graph);
        return Err(e);
    }

    Ok(subgraph)
}

/// Stops branch `B`. Refused unless it is enabled.
pub fn stop<B: OutputBranch>(
    graph: &dyn MediaGraph,
    ctx: &mut ContextGuard<'_>,
    eos: &Condvar,
) -> Result<(), BranchError> {
    let kind = B::KIND;
    let state = ctx.state(kind);
    if state != BranchState::Enabled {
        return Err(BranchError::NotEnabled { kind, state });
    }

    info!(branch = %kind, "Stopping branch");
    ctx.transition(kind, BranchState::Disabling);

    let subgraph = ctx.slot_mut(kind).subgraph.take();
    let port = ctx.port(kind);
    if let (Some(mut subgraph), Some(port)) = (subgraph, port) {
        B::detach(graph, ctx, eos, &subgraph, port);
        subgraph.teardown(graph);
    } else {
        warn!(branch = %kind, "Enabled branch without a subgraph");
    }

    B::detached(ctx);
    ctx.release_upstream(graph);
    ctx.transition(kind, BranchState::Disabled);
    debug!(branch = %kind, refcount = ctx.refcount(), "Branch disabled");
    Ok(())
}

/// Dispatches [`start`] on a runtime kind.
pub fn start_kind(
    kind: BranchKind,
    graph: &dyn MediaGraph,
    ctx: &mut PipelineContext,
) -> Result<(), BranchError> {
    match kind {
        BranchKind::Display => start::<Display>(graph, ctx),
        BranchKind::PushRtsp => start::<PushRtsp>(graph, ctx),
        BranchKind::PushRtmp => start::<PushRtmp>(graph, ctx),
        BranchKind::Recording => start::<Recording>(graph, ctx),
    }
}

/// Dispatches [`stop`] on a runtime kind.
pub fn stop_kind(
    kind: BranchKind,
    graph: &dyn MediaGraph,
    ctx: &mut ContextGuard<'_>,
    eos: &Condvar,
) -> Result<(), BranchError> {
    match kind {
        BranchKind::Display => stop::<Display>(graph, ctx, eos),
        BranchKind::PushRtsp => stop::<PushRtsp>(graph, ctx, eos),
        BranchKind::PushRtmp => stop::<PushRtmp>(graph, ctx, eos),
        BranchKind::Recording => stop::<Recording>(graph, ctx, eos),
    }
}
