use tracing::debug;

use super::{BranchKind, BranchState, OutputBranch};
use crate::config::Config;
use crate::graph::{GraphError, MediaGraph, NodeSpec, NodeState, StateTarget, Subgraph};
use crate::host::DisplayHandle;
use crate::pipeline::PipelineContext;

pub const VIDEO_SINK: &str = "disp4-videosink";

/// Local preview rendered into a host-owned surface.
pub struct Display;

impl OutputBranch for Display {
    const KIND: BranchKind = BranchKind::Display;
    type Target = DisplayHandle;

    fn target(ctx: &PipelineContext) -> Option<DisplayHandle> {
        ctx.surface
    }

    fn recipe(config: &Config, _target: &DisplayHandle) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("queue", "disp0-queue"),
            NodeSpec::new("h264parse", "disp1-h264parse"),
            NodeSpec::new(&config.display.decoder, "disp2-decoder"),
            NodeSpec::new("queue", "disp3-queue"),
            NodeSpec::new(&config.display.sink, VIDEO_SINK)
                .property("sync", config.display.sync)
                .property("async-handling", true),
        ]
    }

    // The window handle has to be bound while the sink is in READY.
    fn bring_up(
        graph: &dyn MediaGraph,
        ctx: &PipelineContext,
        subgraph: &Subgraph,
        first: bool,
        target: &DisplayHandle,
    ) -> Result<(), GraphError> {
        let timeout = ctx.config.graph.state_timeout();
        let sink = subgraph
            .tail()
            .ok_or_else(|| GraphError::Unsupported("display without sink".to_string()))?;

        if first {
            graph.set_state(StateTarget::Graph, NodeState::Ready, timeout)?;
        } else {
            subgraph.set_state(graph, NodeState::Ready, timeout)?;
        }

        graph.bind_window(sink, *target)?;

        if first {
            graph.set_state(StateTarget::Graph, NodeState::Playing, timeout)
        } else {
            subgraph.sync_with_parent(graph)
        }
    }

    fn attached(ctx: &mut PipelineContext, target: &DisplayHandle) {
        ctx.bound_surface = Some(*target);
    }

    fn detached(ctx: &mut PipelineContext) {
        ctx.bound_surface = None;
    }
}

/// Re-exposes the running display when it is already bound to `handle`.
/// Returns false when a stop/start cycle is needed instead.
pub fn rebind(graph: &dyn MediaGraph, ctx: &PipelineContext, handle: DisplayHandle) -> bool {
    if ctx.state(BranchKind::Display) != BranchState::Enabled
        || ctx.bound_surface != Some(handle)
    {
        return false;
    }

    match ctx.subgraph(BranchKind::Display).and_then(Subgraph::tail) {
        Some(sink) => {
            debug!("Re-exposing display on {:?}", handle);
            graph.expose(sink);
            true
        }
        None => false,
    }
}

/// Whether the running display is bound to a surface other than the current
/// one.
pub fn needs_refresh(ctx: &PipelineContext) -> bool {
    ctx.state(BranchKind::Display) == BranchState::Enabled && ctx.bound_surface != ctx.surface
}
