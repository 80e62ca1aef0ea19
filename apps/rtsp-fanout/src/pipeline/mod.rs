//! Session state shared by the worker, the branch controllers and the host
//! boundary.

use parking_lot::MutexGuard;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::branch::{BranchError, BranchKind, BranchState, StateBoard};
use crate::config::Config;
use crate::graph::{MediaGraph, NodeState, PortId, StateTarget, Subgraph};
use crate::host::DisplayHandle;

pub mod upstream;

pub use upstream::{LinkOutcome, SharedUpstream, StreamLinker};

/// Guard over the orchestration lock.
pub type ContextGuard<'a> = MutexGuard<'a, PipelineContext>;

#[derive(Debug, Default)]
pub(crate) struct BranchSlot {
    state: BranchState,
    pub(crate) subgraph: Option<Subgraph>,
}

/// Everything the orchestration lock protects.
#[derive(Debug)]
pub struct PipelineContext {
    pub config: Config,
    pub source_url: Option<String>,
    pub surface: Option<DisplayHandle>,
    pub push_rtsp_url: Option<String>,
    pub push_rtmp_url: Option<String>,
    pub recording_dir: Option<PathBuf>,
    /// Set while the restart supervisor is tearing branches down.
    pub restarting: bool,
    /// Set by the bridge once the RTSP push sink has drained.
    pub rtsp_eos_seen: bool,
    pub(crate) bound_surface: Option<DisplayHandle>,
    pub(crate) recording_target: Option<PathBuf>,
    pub(crate) recording_file: Option<PathBuf>,
    upstream: Option<SharedUpstream>,
    refcount: usize,
    slots: [BranchSlot; 4],
    board: Arc<StateBoard>,
}

impl PipelineContext {
    pub fn new(config: Config, board: Arc<StateBoard>) -> Self {
        Self {
            config,
            source_url: None,
            surface: None,
            push_rtsp_url: None,
            push_rtmp_url: None,
            recording_dir: None,
            restarting: false,
            rtsp_eos_seen: false,
            bound_surface: None,
            recording_target: None,
            recording_file: None,
            upstream: None,
            refcount: 0,
            slots: Default::default(),
            board,
        }
    }

    pub fn state(&self, kind: BranchKind) -> BranchState {
        self.slots[kind.index()].state
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn upstream(&self) -> Option<&SharedUpstream> {
        self.upstream.as_ref()
    }

    pub fn board(&self) -> &Arc<StateBoard> {
        &self.board
    }

    /// Fan-out port dedicated to `kind`, while the upstream exists.
    pub fn port(&self, kind: BranchKind) -> Option<PortId> {
        self.upstream.as_ref().map(|u| u.port(kind))
    }

    pub(crate) fn slot_mut(&mut self, kind: BranchKind) -> &mut BranchSlot {
        &mut self.slots[kind.index()]
    }

    pub(crate) fn subgraph(&self, kind: BranchKind) -> Option<&Subgraph> {
        self.slots[kind.index()].subgraph.as_ref()
    }

    /// Moves `kind` to `to` if the life cycle allows it.
    pub(crate) fn transition(&mut self, kind: BranchKind, to: BranchState) -> bool {
        let from = self.slots[kind.index()].state;
        if !from.can_transition(to) {
            warn!(branch = %kind, "Refusing transition {} -> {}", from, to);
            return false;
        }

        self.slots[kind.index()].state = to;
        self.board.record(kind, from, to);
        debug!(branch = %kind, "{} -> {}", from, to);
        true
    }

    /// Takes a reference on the shared upstream, building it for the first
    /// holder.
    pub(crate) fn acquire_upstream(&mut self, graph: &dyn MediaGraph) -> Result<(), BranchError> {
        if self.upstream.is_none() {
            let url = self.source_url.clone().ok_or(BranchError::NoSource)?;
            let upstream = SharedUpstream::build(graph, &self.config, &url)?;
            info!("Shared upstream ready for {}", url);
            self.upstream = Some(upstream);
        }

        self.refcount += 1;
        self.publish();
        Ok(())
    }

    /// Drops one reference. The last one tears the upstream down.
    pub(crate) fn release_upstream(&mut self, graph: &dyn MediaGraph) {
        match self.refcount.checked_sub(1) {
            Some(refcount) => self.refcount = refcount,
            None => warn!("Upstream released with no reference held"),
        }

        if self.refcount == 0 {
            if let Some(upstream) = self.upstream.take() {
                let timeout = self.config.graph.state_timeout();
                if let Err(e) = graph.set_state(StateTarget::Graph, NodeState::Null, timeout) {
                    warn!("Failed to stop graph before upstream teardown: {}", e);
                }
                upstream.teardown(graph);
                info!("Shared upstream released");
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.board
            .publish_refcount(self.refcount, self.upstream.is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;

    fn context() -> PipelineContext {
        let mut ctx = PipelineContext::new(Config::default(), Arc::new(StateBoard::new()));
        ctx.source_url = Some("rtsp://camera.local/stream".to_string());
        ctx
    }

    #[test]
    fn test_refcount_builds_and_releases_upstream() {
        let graph = MemoryGraph::new();
        let mut ctx = context();

        ctx.acquire_upstream(&graph).unwrap();
        let nodes = graph.node_count();
        assert!(ctx.has_upstream());
        assert!(ctx.board().upstream_present());

        ctx.acquire_upstream(&graph).unwrap();
        assert_eq!(ctx.refcount(), 2);
        assert_eq!(graph.node_count(), nodes);

        ctx.release_upstream(&graph);
        assert!(ctx.has_upstream());
        ctx.release_upstream(&graph);
        assert!(!ctx.has_upstream());
        assert_eq!(ctx.board().refcount(), 0);
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.port_count(), 0);
    }

    #[test]
    fn test_acquire_without_source() {
        let graph = MemoryGraph::new();
        let mut ctx = PipelineContext::new(Config::default(), Arc::new(StateBoard::new()));

        let err = ctx.acquire_upstream(&graph).unwrap_err();
        assert!(matches!(err, BranchError::NoSource));
        assert_eq!(ctx.refcount(), 0);
    }

    #[test]
    fn test_release_never_goes_negative() {
        let graph = MemoryGraph::new();
        let mut ctx = context();
        ctx.release_upstream(&graph);
        assert_eq!(ctx.refcount(), 0);
    }

    #[test]
    fn test_invalid_transition_refused() {
        let mut ctx = context();
        assert!(!ctx.transition(BranchKind::Display, BranchState::Enabled));
        assert_eq!(ctx.state(BranchKind::Display), BranchState::Disabled);
        assert!(ctx.transition(BranchKind::Display, BranchState::Enabling));
        assert_eq!(ctx.board().state(BranchKind::Display), BranchState::Enabling);
    }
}
