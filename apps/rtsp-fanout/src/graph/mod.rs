//! Capability surface of the media framework.
//!
//! The orchestrator never touches framework objects directly: nodes and
//! fan-out ports are addressed through [`NodeId`] / [`PortId`] handles and
//! every operation goes through [`MediaGraph`]. Asynchronous framework events
//! come back through a single [`EventSink`].

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

use crate::host::DisplayHandle;

#[cfg(feature = "gst")]
pub mod gst;
pub mod memory;
pub mod subgraph;

pub use memory::MemoryGraph;
pub use subgraph::{NodeSpec, Subgraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Null => "NULL",
            NodeState::Ready => "READY",
            NodeState::Paused => "PAUSED",
            NodeState::Playing => "PLAYING",
        };
        f.write_str(name)
    }
}

/// What a state change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTarget {
    Graph,
    Node(NodeId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(v) => write!(f, "{}", v),
            PropValue::Int(v) => write!(f, "{}", v),
            PropValue::UInt(v) => write!(f, "{}", v),
            PropValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<u64> for PropValue {
    fn from(v: u64) -> Self {
        PropValue::UInt(v)
    }
}

impl From<u32> for PropValue {
    fn from(v: u32) -> Self {
        PropValue::UInt(v as u64)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("Failed to create element {name} ({factory})")]
    NodeCreation { factory: String, name: String },
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
    #[error("Unknown port {0}")]
    UnknownPort(PortId),
    #[error("Node {node} has no property {key}")]
    UnknownProperty { node: String, key: String },
    #[error("Failed to link {from} -> {to}")]
    Link { from: String, to: String },
    #[error("Failed to get request pad from {0}")]
    PortRequest(String),
    #[error("State change of {target} to {state} failed")]
    StateChange { target: String, state: NodeState },
    #[error("Probe installation failed on {0}")]
    Probe(String),
    #[error("Operation not supported: {0}")]
    Unsupported(String),
}

/// A new output stream announced by a dynamic source node.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamAnnouncement {
    /// Framework name of the new output (pad name).
    pub stream: String,
    /// `encoding-name` from the stream caps, if the caps carry one.
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
}

/// Origin of a bus-level state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOrigin {
    Graph,
    Node(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub origin: StateOrigin,
    pub old: NodeState,
    pub new: NodeState,
    pub pending: Option<NodeState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Name of the node that posted the error.
    pub source: String,
    pub message: String,
    pub debug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementMessage {
    /// End-of-stream posted by `origin` and forwarded by its parent bin.
    ForwardedEos { origin: String },
    Other { source: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Pass,
    Drop,
}

/// Receiver of asynchronous framework events.
///
/// `on_state_changed`, `on_error` and `on_element_message` run on the
/// framework event thread. `on_eos_probe` runs on a streaming thread and must
/// not block on the orchestration lock.
pub trait EventSink: Send + Sync {
    fn on_state_changed(&self, change: &StateChange);
    fn on_error(&self, error: &ErrorEvent);
    fn on_element_message(&self, message: &ElementMessage);
    fn on_eos_probe(&self, node: NodeId) -> ProbeVerdict;
}

/// Called for every stream a dynamic source announces.
pub type StreamHandler = Arc<dyn Fn(&dyn MediaGraph, &StreamAnnouncement) + Send + Sync>;

/// Deferred work run once a fan-out port is idle.
pub type IdleAction = Box<dyn FnOnce(&dyn MediaGraph) + Send>;

pub trait MediaGraph: Send + Sync {
    /// Creates a node and adds it to the graph.
    fn create_node(&self, factory: &str, name: &str) -> Result<NodeId, GraphError>;
    /// Removes a node from the graph and drops it.
    fn destroy_node(&self, node: NodeId);
    fn set_property(&self, node: NodeId, key: &str, value: &PropValue) -> Result<(), GraphError>;

    fn link(&self, upstream: NodeId, downstream: NodeId) -> Result<(), GraphError>;
    fn unlink(&self, upstream: NodeId, downstream: NodeId);
    /// Links a named dynamic output of `source` to `downstream`.
    fn link_stream(&self, source: NodeId, stream: &str, downstream: NodeId)
        -> Result<(), GraphError>;
    fn unlink_streams(&self, source: NodeId, downstream: NodeId);

    fn request_port(&self, fanout: NodeId) -> Result<PortId, GraphError>;
    fn release_port(&self, port: PortId);
    fn link_port(&self, port: PortId, downstream: NodeId) -> Result<(), GraphError>;
    fn unlink_port(&self, port: PortId, downstream: NodeId);

    /// Locked nodes ignore state changes of their parent.
    fn set_locked(&self, node: NodeId, locked: bool);
    /// Changes state and waits up to `timeout` for completion.
    fn set_state(&self, target: StateTarget, state: NodeState, timeout: Duration)
        -> Result<(), GraphError>;
    fn sync_with_parent(&self, node: NodeId) -> Result<(), GraphError>;

    fn watch_streams(&self, source: NodeId, handler: StreamHandler);
    /// Routes end-of-stream events reaching the input of `node` to
    /// [`EventSink::on_eos_probe`].
    fn intercept_eos(&self, node: NodeId) -> Result<(), GraphError>;
    /// Runs `action` once `port` is not in the middle of pushing data.
    fn detach_when_idle(&self, port: PortId, action: IdleAction) -> Result<(), GraphError>;
    /// Sends a synthetic end-of-stream into the input of `node`.
    fn send_eos(&self, node: NodeId) -> Result<(), GraphError>;

    fn bind_window(&self, node: NodeId, handle: DisplayHandle) -> Result<(), GraphError>;
    fn expose(&self, node: NodeId);
    /// Negotiated geometry at the display sink, if one is present.
    fn video_geometry(&self) -> Option<VideoGeometry>;

    fn set_event_sink(&self, sink: Weak<dyn EventSink>);
}
