//! In-process implementation of [`MediaGraph`].
//!
//! Nodes, links and fan-out ports live in an arena; no media flows. Bus
//! events are delivered to the event sink from a dedicated dispatch thread,
//! the same way the framework's event loop would, while probes and stream
//! announcements run on the calling thread like streaming-thread callbacks.
//! The knobs (`fail_factory`, `inject_eos`, `emit_error`, ...) let a caller
//! script framework behaviour.

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{
    ElementMessage, ErrorEvent, EventSink, GraphError, IdleAction, MediaGraph, NodeId, NodeState,
    PortId, ProbeVerdict, PropValue, StateChange, StateOrigin, StateTarget, StreamAnnouncement,
    StreamHandler, VideoGeometry,
};
use crate::host::DisplayHandle;

const DEFAULT_GEOMETRY: VideoGeometry = VideoGeometry {
    width: 1280,
    height: 720,
};

#[derive(Debug)]
struct MemNode {
    factory: String,
    name: String,
    properties: HashMap<String, PropValue>,
    state: NodeState,
    locked: bool,
    window: Option<DisplayHandle>,
    eos_received: u32,
}

#[derive(Debug)]
struct MemPort {
    fanout: NodeId,
    peer: Option<NodeId>,
}

struct Arena {
    next_id: u64,
    nodes: BTreeMap<NodeId, MemNode>,
    links: Vec<(NodeId, NodeId)>,
    stream_links: Vec<(NodeId, String, NodeId)>,
    ports: BTreeMap<PortId, MemPort>,
    graph_state: NodeState,
    stream_handlers: HashMap<NodeId, StreamHandler>,
    eos_intercepts: HashSet<NodeId>,
    failing_factories: HashSet<String>,
    failing_states: HashSet<String>,
    eos_forwarders: HashSet<String>,
    geometry: VideoGeometry,
    hold_idle: bool,
    held_idle: Vec<(PortId, IdleAction)>,
    exposes: u32,
    announce_on_play: Option<StreamAnnouncement>,
}

impl Arena {
    fn new() -> Self {
        Self {
            next_id: 1,
            nodes: BTreeMap::new(),
            links: Vec::new(),
            stream_links: Vec::new(),
            ports: BTreeMap::new(),
            graph_state: NodeState::Null,
            stream_handlers: HashMap::new(),
            eos_intercepts: HashSet::new(),
            failing_factories: HashSet::new(),
            failing_states: HashSet::new(),
            eos_forwarders: ["rtspclientsink".to_string()].into_iter().collect(),
            geometry: DEFAULT_GEOMETRY,
            hold_idle: false,
            held_idle: Vec::new(),
            exposes: 0,
            announce_on_play: None,
        }
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn node(&self, id: NodeId) -> Result<&MemNode, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut MemNode, GraphError> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }

    fn name_of(&self, id: NodeId) -> String {
        self.nodes
            .get(&id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| *id)
    }

    /// Every node reachable downstream of `from`, `from` included.
    fn downstream_of(&self, from: NodeId) -> Vec<NodeId> {
        let mut seen = vec![from];
        let mut cursor = 0;
        while cursor < seen.len() {
            let current = seen[cursor];
            for (up, down) in &self.links {
                if *up == current && !seen.contains(down) {
                    seen.push(*down);
                }
            }
            for port in self.ports.values() {
                if port.fanout == current {
                    if let Some(peer) = port.peer {
                        if !seen.contains(&peer) {
                            seen.push(peer);
                        }
                    }
                }
            }
            cursor += 1;
        }
        seen
    }
}

enum BusEvent {
    State(StateChange),
    Error(ErrorEvent),
    Element(ElementMessage),
    Barrier(Sender<()>),
    Shutdown,
}

type SinkSlot = Arc<RwLock<Option<Weak<dyn EventSink>>>>;

pub struct MemoryGraph {
    arena: Mutex<Arena>,
    sink: SinkSlot,
    events: Sender<BusEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    dispatcher_id: Option<ThreadId>,
}

impl std::fmt::Debug for MemoryGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena.lock();
        f.debug_struct("MemoryGraph")
            .field("nodes", &arena.nodes.len())
            .field("links", &arena.links.len())
            .field("ports", &arena.ports.len())
            .field("graph_state", &arena.graph_state)
            .finish()
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        let (events, receiver) = unbounded::<BusEvent>();
        let sink: SinkSlot = Arc::new(RwLock::new(None));
        let thread_sink = sink.clone();

        let handle = thread::Builder::new()
            .name("graph-events".to_string())
            .spawn(move || {
                for event in receiver.iter() {
                    let target = thread_sink.read().as_ref().and_then(Weak::upgrade);
                    match event {
                        BusEvent::Shutdown => break,
                        BusEvent::Barrier(ack) => {
                            let _ = ack.send(());
                        }
                        BusEvent::State(change) => {
                            if let Some(sink) = target {
                                sink.on_state_changed(&change);
                            }
                        }
                        BusEvent::Error(error) => {
                            if let Some(sink) = target {
                                sink.on_error(&error);
                            }
                        }
                        BusEvent::Element(message) => {
                            if let Some(sink) = target {
                                sink.on_element_message(&message);
                            }
                        }
                    }
                }
                trace!("graph event thread exiting");
            });

        let (dispatcher, dispatcher_id) = match handle {
            Ok(handle) => {
                let id = handle.thread().id();
                (Some(handle), Some(id))
            }
            Err(e) => {
                warn!("Failed to spawn graph event thread: {}", e);
                (None, None)
            }
        };

        Self {
            arena: Mutex::new(Arena::new()),
            sink,
            events,
            dispatcher: Mutex::new(dispatcher),
            dispatcher_id,
        }
    }

    fn post(&self, event: BusEvent) {
        let _ = self.events.send(event);
    }

    fn sink(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.read().as_ref().and_then(Weak::upgrade)
    }

    /// Nodes created from `factory` fail to construct.
    pub fn fail_factory(&self, factory: &str) {
        self.arena.lock().failing_factories.insert(factory.to_string());
    }

    pub fn restore_factory(&self, factory: &str) {
        self.arena.lock().failing_factories.remove(factory);
    }

    /// State changes that involve the node called `name` fail.
    pub fn fail_state_change(&self, name: &str) {
        self.arena.lock().failing_states.insert(name.to_string());
    }

    /// Whether nodes built from `factory` post a forwarded end-of-stream when
    /// one reaches them.
    pub fn set_eos_forwarding(&self, factory: &str, enabled: bool) {
        let mut arena = self.arena.lock();
        if enabled {
            arena.eos_forwarders.insert(factory.to_string());
        } else {
            arena.eos_forwarders.remove(factory);
        }
    }

    pub fn set_geometry(&self, width: u32, height: u32) {
        self.arena.lock().geometry = VideoGeometry { width, height };
    }

    /// Every watched source announces `announcement` when the graph
    /// reaches playing, the way a network source exposes its streams.
    pub fn announce_on_play(&self, announcement: StreamAnnouncement) {
        self.arena.lock().announce_on_play = Some(announcement);
    }

    /// Defers idle-port actions until [`MemoryGraph::release_idle`].
    pub fn hold_idle(&self, hold: bool) {
        self.arena.lock().hold_idle = hold;
    }

    pub fn release_idle(&self) {
        let held = std::mem::take(&mut self.arena.lock().held_idle);
        for (port, action) in held {
            debug!("running deferred idle action on {}", port);
            action(self);
        }
    }

    /// Announces a new output stream on the node called `source`.
    pub fn announce_stream(&self, source: &str, announcement: StreamAnnouncement) -> bool {
        let handler = {
            let arena = self.arena.lock();
            arena
                .find(source)
                .and_then(|id| arena.stream_handlers.get(&id).cloned())
        };
        match handler {
            Some(handler) => {
                handler(self, &announcement);
                true
            }
            None => false,
        }
    }

    /// Pushes an end-of-stream into the input of the node called `name`, as
    /// if it arrived from upstream. Returns the probe verdict, if a probe is
    /// installed there.
    pub fn inject_eos(&self, name: &str) -> Option<ProbeVerdict> {
        let (node, intercepted) = {
            let arena = self.arena.lock();
            let node = arena.find(name)?;
            (node, arena.eos_intercepts.contains(&node))
        };

        let verdict = if intercepted {
            self.sink().map(|sink| sink.on_eos_probe(node))
        } else {
            None
        };

        if verdict != Some(ProbeVerdict::Drop) {
            let _ = self.send_eos(node);
        }
        verdict
    }

    pub fn emit_error(&self, source: &str, message: &str) {
        self.post(BusEvent::Error(ErrorEvent {
            source: source.to_string(),
            message: message.to_string(),
            debug: None,
        }));
    }

    pub fn emit_element_message(&self, message: ElementMessage) {
        self.post(BusEvent::Element(message));
    }

    /// Blocks until every event posted so far has been dispatched.
    pub fn flush_events(&self) {
        let (ack, done) = crossbeam_channel::bounded(1);
        self.post(BusEvent::Barrier(ack));
        let _ = done.recv_timeout(Duration::from_secs(5));
    }

    pub fn node_count(&self) -> usize {
        self.arena.lock().nodes.len()
    }

    pub fn link_count(&self) -> usize {
        let arena = self.arena.lock();
        arena.links.len()
            + arena.stream_links.len()
            + arena.ports.values().filter(|p| p.peer.is_some()).count()
    }

    pub fn port_count(&self) -> usize {
        self.arena.lock().ports.len()
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.arena.lock().find(name)
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.find_node(name).is_some()
    }

    pub fn is_linked(&self, upstream: NodeId, downstream: NodeId) -> bool {
        let arena = self.arena.lock();
        arena.links.contains(&(upstream, downstream))
            || arena
                .ports
                .values()
                .any(|p| p.fanout == upstream && p.peer == Some(downstream))
    }

    /// Whether any fan-out port currently feeds the node called `name`.
    pub fn is_port_linked(&self, name: &str) -> bool {
        let arena = self.arena.lock();
        match arena.find(name) {
            Some(id) => arena.ports.values().any(|p| p.peer == Some(id)),
            None => false,
        }
    }

    pub fn stream_link_count(&self) -> usize {
        self.arena.lock().stream_links.len()
    }

    pub fn is_locked(&self, node: NodeId) -> bool {
        self.arena
            .lock()
            .nodes
            .get(&node)
            .map(|n| n.locked)
            .unwrap_or(false)
    }

    pub fn property(&self, node: NodeId, key: &str) -> Option<PropValue> {
        self.arena
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.properties.get(key).cloned())
    }

    pub fn property_of(&self, name: &str, key: &str) -> Option<PropValue> {
        let arena = self.arena.lock();
        let id = arena.find(name)?;
        arena.nodes.get(&id)?.properties.get(key).cloned()
    }

    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        let arena = self.arena.lock();
        let id = arena.find(name)?;
        arena.nodes.get(&id).map(|n| n.state)
    }

    pub fn graph_state(&self) -> NodeState {
        self.arena.lock().graph_state
    }

    pub fn window_of(&self, name: &str) -> Option<DisplayHandle> {
        let arena = self.arena.lock();
        let id = arena.find(name)?;
        arena.nodes.get(&id)?.window
    }

    pub fn expose_count(&self) -> u32 {
        self.arena.lock().exposes
    }

    pub fn eos_received(&self, name: &str) -> u32 {
        let arena = self.arena.lock();
        arena
            .find(name)
            .and_then(|id| arena.nodes.get(&id))
            .map(|n| n.eos_received)
            .unwrap_or(0)
    }

    fn state_path(from: NodeState, to: NodeState) -> Vec<(NodeState, NodeState)> {
        const ORDER: [NodeState; 4] = [
            NodeState::Null,
            NodeState::Ready,
            NodeState::Paused,
            NodeState::Playing,
        ];
        let from_idx = ORDER.iter().position(|s| *s == from).unwrap_or(0);
        let to_idx = ORDER.iter().position(|s| *s == to).unwrap_or(0);

        let mut steps = Vec::new();
        if from_idx < to_idx {
            for i in from_idx..to_idx {
                steps.push((ORDER[i], ORDER[i + 1]));
            }
        } else {
            for i in (to_idx..from_idx).rev() {
                steps.push((ORDER[i + 1], ORDER[i]));
            }
        }
        steps
    }
}

impl MediaGraph for MemoryGraph {
    fn create_node(&self, factory: &str, name: &str) -> Result<NodeId, GraphError> {
        let mut arena = self.arena.lock();
        if arena.failing_factories.contains(factory) || arena.find(name).is_some() {
            return Err(GraphError::NodeCreation {
                factory: factory.to_string(),
                name: name.to_string(),
            });
        }

        let id = NodeId(arena.allocate());
        arena.nodes.insert(
            id,
            MemNode {
                factory: factory.to_string(),
                name: name.to_string(),
                properties: HashMap::new(),
                state: NodeState::Null,
                locked: false,
                window: None,
                eos_received: 0,
            },
        );
        trace!("created {} ({}) as {}", name, factory, id);
        Ok(id)
    }

    fn destroy_node(&self, node: NodeId) {
        let mut arena = self.arena.lock();
        if arena.nodes.remove(&node).is_none() {
            warn!("destroy of unknown {}", node);
            return;
        }
        arena.links.retain(|(a, b)| *a != node && *b != node);
        arena.stream_links.retain(|(a, _, b)| *a != node && *b != node);
        for port in arena.ports.values_mut() {
            if port.peer == Some(node) {
                port.peer = None;
            }
        }
        arena.ports.retain(|_, p| p.fanout != node);
        arena.stream_handlers.remove(&node);
        arena.eos_intercepts.remove(&node);
    }

    fn set_property(&self, node: NodeId, key: &str, value: &PropValue) -> Result<(), GraphError> {
        let mut arena = self.arena.lock();
        let node = arena.node_mut(node)?;
        node.properties.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn link(&self, upstream: NodeId, downstream: NodeId) -> Result<(), GraphError> {
        let mut arena = self.arena.lock();
        arena.node(upstream)?;
        arena.node(downstream)?;
        if arena.links.contains(&(upstream, downstream)) {
            return Err(GraphError::Link {
                from: arena.name_of(upstream),
                to: arena.name_of(downstream),
            });
        }
        arena.links.push((upstream, downstream));
        Ok(())
    }

    fn unlink(&self, upstream: NodeId, downstream: NodeId) {
        self.arena
            .lock()
            .links
            .retain(|link| *link != (upstream, downstream));
    }

    fn link_stream(
        &self,
        source: NodeId,
        stream: &str,
        downstream: NodeId,
    ) -> Result<(), GraphError> {
        let mut arena = self.arena.lock();
        arena.node(source)?;
        arena.node(downstream)?;
        if arena
            .stream_links
            .iter()
            .any(|(_, _, d)| *d == downstream)
        {
            return Err(GraphError::Link {
                from: format!("{}:{}", arena.name_of(source), stream),
                to: arena.name_of(downstream),
            });
        }
        arena
            .stream_links
            .push((source, stream.to_string(), downstream));
        arena.links.push((source, downstream));
        Ok(())
    }

    fn unlink_streams(&self, source: NodeId, downstream: NodeId) {
        let mut arena = self.arena.lock();
        arena
            .stream_links
            .retain(|(s, _, d)| !(*s == source && *d == downstream));
        arena.links.retain(|link| *link != (source, downstream));
    }

    fn request_port(&self, fanout: NodeId) -> Result<PortId, GraphError> {
        let mut arena = self.arena.lock();
        let node = arena.node(fanout)?;
        if node.factory != "tee" {
            return Err(GraphError::PortRequest(node.name.clone()));
        }
        let id = PortId(arena.allocate());
        arena.ports.insert(id, MemPort { fanout, peer: None });
        Ok(id)
    }

    fn release_port(&self, port: PortId) {
        self.arena.lock().ports.remove(&port);
    }

    fn link_port(&self, port: PortId, downstream: NodeId) -> Result<(), GraphError> {
        let mut arena = self.arena.lock();
        arena.node(downstream)?;
        let name = arena.name_of(downstream);
        let entry = arena.ports.get_mut(&port).ok_or(GraphError::UnknownPort(port))?;
        if entry.peer.is_some() {
            return Err(GraphError::Link {
                from: port.to_string(),
                to: name,
            });
        }
        entry.peer = Some(downstream);
        Ok(())
    }

    fn unlink_port(&self, port: PortId, downstream: NodeId) {
        let mut arena = self.arena.lock();
        if let Some(entry) = arena.ports.get_mut(&port) {
            if entry.peer == Some(downstream) {
                entry.peer = None;
            }
        }
    }

    fn set_locked(&self, node: NodeId, locked: bool) {
        if let Some(node) = self.arena.lock().nodes.get_mut(&node) {
            node.locked = locked;
        }
    }

    fn set_state(
        &self,
        target: StateTarget,
        state: NodeState,
        _timeout: Duration,
    ) -> Result<(), GraphError> {
        let mut arena = self.arena.lock();
        match target {
            StateTarget::Node(id) => {
                let failing = arena.failing_states.contains(&arena.name_of(id));
                let node = arena.node_mut(id)?;
                if failing && state > NodeState::Null {
                    return Err(GraphError::StateChange {
                        target: node.name.clone(),
                        state,
                    });
                }
                node.state = state;
                Ok(())
            }
            StateTarget::Graph => {
                let failing = arena
                    .nodes
                    .values()
                    .any(|n| !n.locked && arena.failing_states.contains(&n.name));
                if failing && state > NodeState::Null {
                    return Err(GraphError::StateChange {
                        target: "graph".to_string(),
                        state,
                    });
                }

                let old = arena.graph_state;
                arena.graph_state = state;
                for node in arena.nodes.values_mut().filter(|n| !n.locked) {
                    node.state = state;
                }
                let announcements: Vec<(StreamHandler, StreamAnnouncement)> =
                    match &arena.announce_on_play {
                        Some(announcement) if state == NodeState::Playing && old != state => arena
                            .stream_handlers
                            .values()
                            .map(|handler| (handler.clone(), announcement.clone()))
                            .collect(),
                        _ => Vec::new(),
                    };
                drop(arena);

                for (from, to) in Self::state_path(old, state) {
                    self.post(BusEvent::State(StateChange {
                        origin: StateOrigin::Graph,
                        old: from,
                        new: to,
                        pending: None,
                    }));
                }
                for (handler, announcement) in announcements {
                    handler(self, &announcement);
                }
                Ok(())
            }
        }
    }

    fn sync_with_parent(&self, node: NodeId) -> Result<(), GraphError> {
        let mut arena = self.arena.lock();
        let parent = arena.graph_state;
        let failing = arena.failing_states.contains(&arena.name_of(node));
        let entry = arena.node_mut(node)?;
        if failing && parent > NodeState::Null {
            return Err(GraphError::StateChange {
                target: entry.name.clone(),
                state: parent,
            });
        }
        entry.state = parent;
        Ok(())
    }

    fn watch_streams(&self, source: NodeId, handler: StreamHandler) {
        self.arena.lock().stream_handlers.insert(source, handler);
    }

    fn intercept_eos(&self, node: NodeId) -> Result<(), GraphError> {
        let mut arena = self.arena.lock();
        arena.node(node)?;
        arena.eos_intercepts.insert(node);
        Ok(())
    }

    fn detach_when_idle(&self, port: PortId, action: IdleAction) -> Result<(), GraphError> {
        let mut arena = self.arena.lock();
        if !arena.ports.contains_key(&port) {
            return Err(GraphError::UnknownPort(port));
        }
        if arena.hold_idle {
            arena.held_idle.push((port, action));
            return Ok(());
        }
        drop(arena);

        action(self);
        Ok(())
    }

    fn send_eos(&self, node: NodeId) -> Result<(), GraphError> {
        let mut forwarded = Vec::new();
        {
            let mut arena = self.arena.lock();
            arena.node(node)?;
            let reached = arena.downstream_of(node);
            let forwarders = arena.eos_forwarders.clone();
            for id in reached {
                if let Some(entry) = arena.nodes.get_mut(&id) {
                    entry.eos_received += 1;
                    if forwarders.contains(&entry.factory) {
                        forwarded.push(entry.name.clone());
                    }
                }
            }
        }

        for origin in forwarded {
            self.post(BusEvent::Element(ElementMessage::ForwardedEos { origin }));
        }
        Ok(())
    }

    fn bind_window(&self, node: NodeId, handle: DisplayHandle) -> Result<(), GraphError> {
        let mut arena = self.arena.lock();
        arena.node_mut(node)?.window = Some(handle);
        Ok(())
    }

    fn expose(&self, _node: NodeId) {
        self.arena.lock().exposes += 1;
    }

    fn video_geometry(&self) -> Option<VideoGeometry> {
        let arena = self.arena.lock();
        arena
            .nodes
            .values()
            .any(|n| n.window.is_some() && n.state >= NodeState::Paused)
            .then_some(arena.geometry)
    }

    fn set_event_sink(&self, sink: Weak<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }
}

impl Drop for MemoryGraph {
    fn drop(&mut self) {
        self.post(BusEvent::Shutdown);
        if let Some(handle) = self.dispatcher.lock().take() {
            // The last reference can be released from inside a callback.
            if Some(thread::current().id()) != self.dispatcher_id {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        states: AtomicUsize,
        errors: AtomicUsize,
        forwarded: AtomicUsize,
        probes: AtomicUsize,
    }

    impl EventSink for CountingSink {
        fn on_state_changed(&self, _change: &StateChange) {
            self.states.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _error: &ErrorEvent) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_element_message(&self, message: &ElementMessage) {
            if matches!(message, ElementMessage::ForwardedEos { .. }) {
                self.forwarded.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_eos_probe(&self, _node: NodeId) -> ProbeVerdict {
            self.probes.fetch_add(1, Ordering::SeqCst);
            ProbeVerdict::Drop
        }
    }

    fn with_sink() -> (MemoryGraph, Arc<CountingSink>) {
        let graph = MemoryGraph::new();
        let sink = Arc::new(CountingSink::default());
        let weak: Weak<dyn EventSink> = Arc::downgrade(&sink) as Weak<dyn EventSink>;
        graph.set_event_sink(weak);
        (graph, sink)
    }

    #[test]
    fn test_graph_state_walks_every_step() {
        let (graph, sink) = with_sink();
        graph.create_node("fakesink", "sink").unwrap();

        graph
            .set_state(StateTarget::Graph, NodeState::Playing, Duration::ZERO)
            .unwrap();
        graph.flush_events();
        assert_eq!(sink.states.load(Ordering::SeqCst), 3);
        assert_eq!(graph.node_state("sink"), Some(NodeState::Playing));

        graph
            .set_state(StateTarget::Graph, NodeState::Null, Duration::ZERO)
            .unwrap();
        graph.flush_events();
        assert_eq!(sink.states.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_locked_nodes_keep_their_state() {
        let graph = MemoryGraph::new();
        let node = graph.create_node("queue", "q").unwrap();
        graph.set_locked(node, true);

        graph
            .set_state(StateTarget::Graph, NodeState::Playing, Duration::ZERO)
            .unwrap();
        assert_eq!(graph.node_state("q"), Some(NodeState::Null));

        graph.sync_with_parent(node).unwrap();
        assert_eq!(graph.node_state("q"), Some(NodeState::Playing));
    }

    #[test]
    fn test_ports_only_on_fanout() {
        let graph = MemoryGraph::new();
        let tee = graph.create_node("tee", "tee").unwrap();
        let queue = graph.create_node("queue", "q").unwrap();

        assert!(graph.request_port(queue).is_err());
        let port = graph.request_port(tee).unwrap();
        graph.link_port(port, queue).unwrap();
        assert!(graph.is_linked(tee, queue));
        assert!(graph.link_port(port, queue).is_err());

        graph.unlink_port(port, queue);
        assert!(!graph.is_linked(tee, queue));
    }

    #[test]
    fn test_eos_probe_and_forwarding() {
        let (graph, sink) = with_sink();
        let tee = graph.create_node("tee", "tee").unwrap();
        let queue = graph.create_node("queue", "q").unwrap();
        let remote = graph.create_node("rtspclientsink", "remote").unwrap();
        graph.link(queue, remote).unwrap();
        let port = graph.request_port(tee).unwrap();
        graph.link_port(port, queue).unwrap();
        graph.intercept_eos(tee).unwrap();

        assert_eq!(graph.inject_eos("tee"), Some(ProbeVerdict::Drop));
        assert_eq!(sink.probes.load(Ordering::SeqCst), 1);
        assert_eq!(graph.eos_received("remote"), 0);

        graph.send_eos(queue).unwrap();
        graph.flush_events();
        assert_eq!(sink.forwarded.load(Ordering::SeqCst), 1);
        assert_eq!(graph.eos_received("remote"), 1);
    }

    #[test]
    fn test_held_idle_actions() {
        let graph = MemoryGraph::new();
        let tee = graph.create_node("tee", "tee").unwrap();
        let port = graph.request_port(tee).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        graph.hold_idle(true);
        let counter = ran.clone();
        graph
            .detach_when_idle(
                port,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        graph.release_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
