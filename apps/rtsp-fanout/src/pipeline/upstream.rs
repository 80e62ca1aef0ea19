use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::branch::BranchKind;
use crate::config::Config;
use crate::graph::{
    GraphError, MediaGraph, NodeId, NodeSpec, PortId, PropValue, StreamAnnouncement, Subgraph,
};
use crate::FanoutError;

pub const SOURCE: &str = "up0-rtspsrc";
pub const DEPAY: &str = "up1-rtph264depay";
pub const PARSE: &str = "up2-h264parse";
pub const FANOUT: &str = "up3-tee";

/// Only H.264 is linked into the decode chain.
const SUPPORTED_ENCODING: &str = "H264";

/// What happened to one stream announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Linked,
    AlreadyLinked,
    Unsupported(Option<String>),
    Failed(String),
}

/// Links the first supported stream of the source into the depayloader.
#[derive(Debug)]
pub struct StreamLinker {
    source: NodeId,
    depay: NodeId,
    linked: AtomicBool,
}

impl StreamLinker {
    pub fn new(source: NodeId, depay: NodeId) -> Self {
        Self {
            source,
            depay,
            linked: AtomicBool::new(false),
        }
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    /// Runs on the framework's streaming thread.
    pub fn on_stream(&self, graph: &dyn MediaGraph, announcement: &StreamAnnouncement) -> LinkOutcome {
        let encoding = announcement.encoding.as_deref();
        if encoding != Some(SUPPORTED_ENCODING) {
            let err = FanoutError::UnsupportedStream(encoding.unwrap_or("unknown").to_string());
            warn!("Stream {} left unlinked: {}", announcement.stream, err);
            return LinkOutcome::Unsupported(announcement.encoding.clone());
        }

        if self
            .linked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Stream {} ignored, source already linked", announcement.stream);
            return LinkOutcome::AlreadyLinked;
        }

        match graph.link_stream(self.source, &announcement.stream, self.depay) {
            Ok(()) => {
                info!("Linked source stream {}", announcement.stream);
                LinkOutcome::Linked
            }
            Err(e) => {
                self.linked.store(false, Ordering::SeqCst);
                error!("Failed to link source stream {}: {}", announcement.stream, e);
                LinkOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Network source, fixed decode chain and fan-out, shared by every branch.
///
/// ```text
/// rtspsrc ~> rtph264depay -> h264parse -> tee -> queue -> flvmux -> fakesink
///                                          |-> [display]
///                                          |-> [push rtmp]
///                                          |-> [push rtsp]
///                                          '-> [recording]
/// ```
///
/// The keep-alive tail behind the tee keeps data flowing with no branch
/// linked.
#[derive(Debug)]
pub struct SharedUpstream {
    source: NodeId,
    chain: Subgraph,
    ports: [PortId; 4],
    linker: Arc<StreamLinker>,
}

impl SharedUpstream {
    fn chain_recipe() -> Vec<NodeSpec> {
        vec![
            NodeSpec::new("rtph264depay", DEPAY),
            NodeSpec::new("h264parse", PARSE).property("config-interval", -1i64),
            NodeSpec::new("tee", FANOUT),
            NodeSpec::new("queue", "up4-queue"),
            NodeSpec::new("flvmux", "up5-flvmux").property("streamable", true),
            NodeSpec::new("fakesink", "up6-fakesink"),
        ]
    }

    fn source_properties(config: &Config, url: &str) -> Vec<(&'static str, PropValue)> {
        vec![
            ("location", url.into()),
            ("latency", config.source.latency_ms.into()),
            ("udp-reconnect", config.source.udp_reconnect.into()),
            ("timeout", config.source.timeout_us.into()),
            ("do-retransmission", config.source.do_retransmission.into()),
        ]
    }

    pub fn build(graph: &dyn MediaGraph, config: &Config, url: &str) -> Result<Self, GraphError> {
        debug!("Building shared upstream for {}", url);

        let source = graph.create_node("rtspsrc", SOURCE)?;
        for (key, value) in Self::source_properties(config, url) {
            if let Err(e) = graph.set_property(source, key, &value) {
                graph.destroy_node(source);
                return Err(e);
            }
        }

        let mut chain = match Subgraph::build_chain(graph, &Self::chain_recipe()) {
            Ok(chain) => chain,
            Err(e) => {
                graph.destroy_node(source);
                return Err(e);
            }
        };
        chain.set_locked(graph, false);

        match Self::wire(graph, source, &chain) {
            Ok((ports, linker)) => Ok(Self {
                source,
                chain,
                ports,
                linker,
            }),
            Err(e) => {
                error!("Unable to wire shared upstream: {}", e);
                chain.teardown(graph);
                graph.destroy_node(source);
                Err(e)
            }
        }
    }

    fn wire(
        graph: &dyn MediaGraph,
        source: NodeId,
        chain: &Subgraph,
    ) -> Result<([PortId; 4], Arc<StreamLinker>), GraphError> {
        let missing = |name: &str| GraphError::Unsupported(format!("{} missing from chain", name));
        let depay = chain.find(DEPAY).ok_or_else(|| missing(DEPAY))?;
        let fanout = chain.find(FANOUT).ok_or_else(|| missing(FANOUT))?;

        let mut requested = Vec::with_capacity(BranchKind::ALL.len());
        for _ in BranchKind::ALL {
            match graph.request_port(fanout) {
                Ok(port) => requested.push(port),
                Err(e) => {
                    for port in requested {
                        graph.release_port(port);
                    }
                    return Err(e);
                }
            }
        }
        let ports = [requested[0], requested[1], requested[2], requested[3]];

        if let Err(e) = graph.intercept_eos(fanout) {
            for port in ports {
                graph.release_port(port);
            }
            return Err(e);
        }

        let linker = Arc::new(StreamLinker::new(source, depay));
        let handler_linker = linker.clone();
        graph.watch_streams(
            source,
            Arc::new(move |graph, announcement| {
                handler_linker.on_stream(graph, announcement);
            }),
        );

        Ok((ports, linker))
    }

    pub fn port(&self, kind: BranchKind) -> PortId {
        self.ports[kind.index()]
    }

    #[cfg(test)]
    fn linker(&self) -> &Arc<StreamLinker> {
        &self.linker
    }

    /// Releases every port and node in reverse construction order. The graph
    /// must already be stopped.
    pub fn teardown(mut self, graph: &dyn MediaGraph) {
        if self.linker.is_linked() {
            if let Some(depay) = self.chain.head() {
                graph.unlink_streams(self.source, depay);
            }
        }
        for port in self.ports.iter().rev() {
            graph.release_port(*port);
        }
        self.chain.teardown(graph);
        graph.destroy_node(self.source);
        debug!("Shared upstream torn down");
    }
}
