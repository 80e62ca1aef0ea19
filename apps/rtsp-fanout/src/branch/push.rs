use parking_lot::Condvar;
use std::time::Instant;
use tracing::{info, warn};

use super::{detach_now, BranchKind, OutputBranch};
use crate::config::Config;
use crate::graph::{MediaGraph, NodeId, NodeSpec, NodeState, PortId, StateTarget, Subgraph};
use crate::pipeline::{ContextGuard, PipelineContext};

pub const RTMP_SINK: &str = "rtmp2-rtmpsink";
pub const RTSP_SINK: &str = "rtsp1-rtspclientsink";

/// PushB: FLV over RTMP.
pub struct PushRtmp;

impl OutputBranch for PushRtmp {
    const KIND: BranchKind = BranchKind::PushRtmp;
    type Target = String;

    fn target(ctx: &PipelineContext) -> Option<String> {
        ctx.push_rtmp_url.clone()
    }

    fn recipe(config: &Config, target: &String) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("queue", "rtmp0-queue")
                .property("max-size-buffers", 0u32)
                .property("max-size-bytes", 0u32)
                .property("flush-on-eos", true),
            NodeSpec::new("flvmux", "rtmp1-flvmux").property("streamable", true),
            NodeSpec::new("rtmpsink", RTMP_SINK)
                .property("sync", config.push_rtmp.sync)
                .property("location", target.as_str()),
        ]
    }
}

/// PushA: RTSP announce/record through a stateful client sink.
///
/// The remote end only closes cleanly after an end-of-stream, so stopping
/// drains the branch before tearing it down.
pub struct PushRtsp;

impl OutputBranch for PushRtsp {
    const KIND: BranchKind = BranchKind::PushRtsp;
    type Target = String;

    fn target(ctx: &PipelineContext) -> Option<String> {
        ctx.push_rtsp_url.clone()
    }

    fn recipe(config: &Config, target: &String) -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("queue", "rtsp0-queue")
                .property("max-size-buffers", 0u32)
                .property("max-size-bytes", 0u32)
                .property("max-size-time", 0u64)
                .property("flush-on-eos", true),
            NodeSpec::new("rtspclientsink", RTSP_SINK)
                .property("protocols", config.push_rtsp.protocols.as_str())
                .property("latency", config.push_rtsp.latency_ms)
                .property("location", target.as_str()),
        ]
    }

    fn detach(
        graph: &dyn MediaGraph,
        ctx: &mut ContextGuard<'_>,
        eos: &Condvar,
        subgraph: &Subgraph,
        port: PortId,
    ) {
        let Some(head) = subgraph.head() else {
            detach_now(graph, ctx, subgraph, port);
            return;
        };

        ctx.rtsp_eos_seen = false;
        let nodes: Vec<NodeId> = subgraph.nodes().collect();
        let drain = Box::new(move |graph: &dyn MediaGraph| {
            graph.unlink_port(port, head);
            for node in &nodes {
                graph.set_locked(*node, true);
            }
            if let Err(e) = graph.send_eos(head) {
                warn!("Failed to send EOS into push rtsp branch: {}", e);
            }
        });

        if let Err(e) = graph.detach_when_idle(port, drain) {
            warn!("Idle detach unavailable ({}), stopping push rtsp directly", e);
            detach_now(graph, ctx, subgraph, port);
            return;
        }

        let deadline = Instant::now() + ctx.config.push_rtsp.eos_timeout();
        while !ctx.rtsp_eos_seen {
            if eos.wait_until(ctx, deadline).timed_out() {
                break;
            }
        }

        if ctx.rtsp_eos_seen {
            info!("push rtsp branch drained");
        } else {
            warn!(
                "push rtsp branch did not drain within {:?}, forcing unlink",
                ctx.config.push_rtsp.eos_timeout()
            );
            graph.unlink_port(port, head);
            subgraph.set_locked(graph, true);
            ctx.board().note_forced_detach();
        }

        let timeout = ctx.config.graph.state_timeout();
        let stopped = if ctx.refcount() == 1 {
            graph.set_state(StateTarget::Graph, NodeState::Null, timeout)
        } else {
            subgraph.set_state(graph, NodeState::Null, timeout)
        };
        if let Err(e) = stopped {
            warn!("Failed to stop push rtsp branch: {}", e);
        }
        ctx.rtsp_eos_seen = false;
    }
}
