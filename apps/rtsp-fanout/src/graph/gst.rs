//! [`MediaGraph`] on a real GStreamer pipeline.
//!
//! Nodes are elements added straight to one `gst::Pipeline`, ports are tee
//! request pads. Bus messages are drained by a dedicated thread and handed
//! to the registered [`EventSink`].

use gst::prelude::*;
use gst::MessageView;
use gst_video::prelude::*;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::{
    ElementMessage, ErrorEvent, EventSink, GraphError, IdleAction, MediaGraph, NodeId, NodeState,
    PortId, ProbeVerdict, PropValue, StateChange, StateOrigin, StateTarget, StreamAnnouncement,
    StreamHandler, VideoGeometry,
};
use crate::host::DisplayHandle;

const BUS_POLL: Duration = Duration::from_millis(100);

impl From<gst::State> for NodeState {
    fn from(state: gst::State) -> Self {
        match state {
            gst::State::Null | gst::State::VoidPending => NodeState::Null,
            gst::State::Ready => NodeState::Ready,
            gst::State::Paused => NodeState::Paused,
            gst::State::Playing => NodeState::Playing,
        }
    }
}

impl From<NodeState> for gst::State {
    fn from(state: NodeState) -> Self {
        match state {
            NodeState::Null => gst::State::Null,
            NodeState::Ready => gst::State::Ready,
            NodeState::Paused => gst::State::Paused,
            NodeState::Playing => gst::State::Playing,
        }
    }
}

#[derive(Default)]
struct Registry {
    next: u64,
    nodes: HashMap<NodeId, gst::Element>,
    ports: HashMap<PortId, gst::Pad>,
    windows: HashSet<NodeId>,
}

impl Registry {
    fn allocate(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

pub struct GstGraph {
    pipeline: gst::Pipeline,
    registry: Mutex<Registry>,
    sink: RwLock<Option<Weak<dyn EventSink>>>,
    running: AtomicBool,
    bus_thread: Mutex<Option<JoinHandle<()>>>,
    this: Weak<GstGraph>,
}

impl GstGraph {
    /// Builds an empty pipeline called `name` and starts its bus thread.
    /// GStreamer must already be initialized.
    pub fn new(name: &str) -> Result<Arc<Self>, GraphError> {
        let pipeline = gst::Pipeline::with_name(name);
        // Lets EOS posted by sinks inside a running pipeline reach the bus.
        pipeline.set_property("message-forward", true);

        let bus = pipeline
            .bus()
            .ok_or_else(|| GraphError::Unsupported("pipeline without a bus".to_string()))?;

        let graph = Arc::new_cyclic(|this| Self {
            pipeline,
            registry: Mutex::new(Registry::default()),
            sink: RwLock::new(None),
            running: AtomicBool::new(true),
            bus_thread: Mutex::new(None),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&graph);
        let handle = thread::Builder::new()
            .name("gst-bus".to_string())
            .spawn(move || {
                loop {
                    let Some(graph) = weak.upgrade() else { break };
                    if !graph.running.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Some(message) = bus.timed_pop(gst::ClockTime::from_mseconds(
                        BUS_POLL.as_millis() as u64,
                    )) {
                        graph.dispatch(&message);
                    }
                }
                trace!("bus thread exiting");
            })
            .map_err(|e| GraphError::Unsupported(format!("bus thread: {}", e)))?;
        *graph.bus_thread.lock() = Some(handle);

        info!("Created pipeline {}", name);
        Ok(graph)
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }

    fn event_sink(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.read().as_ref().and_then(Weak::upgrade)
    }

    fn element(&self, node: NodeId) -> Result<gst::Element, GraphError> {
        self.registry
            .lock()
            .nodes
            .get(&node)
            .cloned()
            .ok_or(GraphError::UnknownNode(node))
    }

    fn pad(&self, port: PortId) -> Result<gst::Pad, GraphError> {
        self.registry
            .lock()
            .ports
            .get(&port)
            .cloned()
            .ok_or(GraphError::UnknownPort(port))
    }

    fn overlay(element: &gst::Element) -> Option<gst_video::VideoOverlay> {
        if let Some(overlay) = element.dynamic_cast_ref::<gst_video::VideoOverlay>() {
            return Some(overlay.clone());
        }
        element
            .downcast_ref::<gst::Bin>()
            .and_then(|bin| bin.by_interface(gst_video::VideoOverlay::static_type()))
            .and_then(|child| child.dynamic_cast::<gst_video::VideoOverlay>().ok())
    }

    fn dispatch(&self, message: &gst::Message) {
        let Some(sink) = self.event_sink() else {
            return;
        };
        let source = message
            .src()
            .map(|s| s.name().to_string())
            .unwrap_or_default();

        match message.view() {
            MessageView::Error(err) => {
                sink.on_error(&ErrorEvent {
                    source,
                    message: err.error().message().to_string(),
                    debug: err.debug().map(|d| d.to_string()),
                });
            }
            MessageView::StateChanged(changed) => {
                let from_pipeline = message
                    .src()
                    .map(|s| s == self.pipeline.upcast_ref::<gst::Object>())
                    .unwrap_or(false);
                let origin = if from_pipeline {
                    StateOrigin::Graph
                } else {
                    StateOrigin::Node(source)
                };
                let pending = match changed.pending() {
                    gst::State::VoidPending => None,
                    other => Some(other.into()),
                };
                sink.on_state_changed(&StateChange {
                    origin,
                    old: changed.old().into(),
                    new: changed.current().into(),
                    pending,
                });
            }
            MessageView::Element(element) => {
                let Some(structure) = element.structure() else {
                    return;
                };
                if structure.has_name("GstBinForwarded") {
                    if let Ok(forwarded) = structure.get::<gst::Message>("message") {
                        if let MessageView::Eos(_) = forwarded.view() {
                            let origin = forwarded
                                .src()
                                .map(|s| s.name().to_string())
                                .unwrap_or_default();
                            sink.on_element_message(&ElementMessage::ForwardedEos { origin });
                        }
                    }
                } else {
                    sink.on_element_message(&ElementMessage::Other {
                        source,
                        name: structure.name().to_string(),
                    });
                }
            }
            MessageView::Warning(warning) => {
                warn!("Warning from {}: {}", source, warning.error());
            }
            _ => {}
        }
    }

    fn property_value(pspec: &gst::glib::ParamSpec, value: &PropValue) -> Option<gst::glib::Value> {
        let ty = pspec.value_type();
        match value {
            PropValue::Str(s) if ty == gst::glib::Type::STRING => Some(s.to_value()),
            other => gst::glib::Value::deserialize(&other.to_string(), ty).ok(),
        }
    }
}

impl MediaGraph for GstGraph {
    fn create_node(&self, factory: &str, name: &str) -> Result<NodeId, GraphError> {
        let creation_failed = || GraphError::NodeCreation {
            factory: factory.to_string(),
            name: name.to_string(),
        };
        let element = gst::ElementFactory::make(factory)
            .name(name)
            .build()
            .map_err(|e| {
                error!("Failed to create {} ({}): {}", name, factory, e);
                creation_failed()
            })?;
        self.pipeline.add(&element).map_err(|_| creation_failed())?;

        let mut registry = self.registry.lock();
        let id = NodeId(registry.allocate());
        registry.nodes.insert(id, element);
        trace!("created {} ({}) as {}", name, factory, id);
        Ok(id)
    }

    fn destroy_node(&self, node: NodeId) {
        let element = {
            let mut registry = self.registry.lock();
            registry.windows.remove(&node);
            registry.nodes.remove(&node)
        };
        if let Some(element) = element {
            if let Err(e) = element.set_state(gst::State::Null) {
                warn!("Failed to stop {}: {}", element.name(), e);
            }
            if let Err(e) = self.pipeline.remove(&element) {
                warn!("Failed to remove {}: {}", element.name(), e);
            }
        }
    }

    fn set_property(&self, node: NodeId, key: &str, value: &PropValue) -> Result<(), GraphError> {
        let element = self.element(node)?;
        let unknown = || GraphError::UnknownProperty {
            node: element.name().to_string(),
            key: key.to_string(),
        };
        let pspec = element.find_property(key).ok_or_else(unknown)?;
        let converted = Self::property_value(&pspec, value).ok_or_else(unknown)?;
        element.set_property_from_value(key, &converted);
        Ok(())
    }

    fn link(&self, upstream: NodeId, downstream: NodeId) -> Result<(), GraphError> {
        let up = self.element(upstream)?;
        let down = self.element(downstream)?;
        up.link(&down).map_err(|_| GraphError::Link {
            from: up.name().to_string(),
            to: down.name().to_string(),
        })
    }

    fn unlink(&self, upstream: NodeId, downstream: NodeId) {
        if let (Ok(up), Ok(down)) = (self.element(upstream), self.element(downstream)) {
            up.unlink(&down);
        }
    }

    fn link_stream(&self, source: NodeId, stream: &str, downstream: NodeId) -> Result<(), GraphError> {
        let src = self.element(source)?;
        let down = self.element(downstream)?;
        let failed = || GraphError::Link {
            from: format!("{}:{}", src.name(), stream),
            to: down.name().to_string(),
        };
        let src_pad = src.static_pad(stream).ok_or_else(failed)?;
        let sink_pad = down.static_pad("sink").ok_or_else(failed)?;
        src_pad.link(&sink_pad).map_err(|_| failed())?;
        Ok(())
    }

    fn unlink_streams(&self, source: NodeId, downstream: NodeId) {
        let (Ok(src), Ok(down)) = (self.element(source), self.element(downstream)) else {
            return;
        };
        for pad in src.src_pads() {
            if let Some(peer) = pad.peer() {
                if peer.parent_element().as_ref() == Some(&down) {
                    if let Err(e) = pad.unlink(&peer) {
                        debug!("Unlink {} failed: {}", pad.name(), e);
                    }
                }
            }
        }
    }

    fn request_port(&self, fanout: NodeId) -> Result<PortId, GraphError> {
        let tee = self.element(fanout)?;
        let pad = tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| GraphError::PortRequest(tee.name().to_string()))?;

        let mut registry = self.registry.lock();
        let id = PortId(registry.allocate());
        debug!("Requested {} from {} as {}", pad.name(), tee.name(), id);
        registry.ports.insert(id, pad);
        Ok(id)
    }

    fn release_port(&self, port: PortId) {
        let Some(pad) = self.registry.lock().ports.remove(&port) else {
            return;
        };
        if let Some(parent) = pad.parent_element() {
            parent.release_request_pad(&pad);
        }
    }

    fn link_port(&self, port: PortId, downstream: NodeId) -> Result<(), GraphError> {
        let pad = self.pad(port)?;
        let down = self.element(downstream)?;
        let failed = || GraphError::Link {
            from: pad.name().to_string(),
            to: down.name().to_string(),
        };
        let sink_pad = down.static_pad("sink").ok_or_else(failed)?;
        pad.link(&sink_pad).map_err(|_| failed())?;
        Ok(())
    }

    fn unlink_port(&self, port: PortId, downstream: NodeId) {
        let (Ok(pad), Ok(down)) = (self.pad(port), self.element(downstream)) else {
            return;
        };
        if let Some(sink_pad) = down.static_pad("sink") {
            if let Err(e) = pad.unlink(&sink_pad) {
                debug!("Unlink {} failed: {}", pad.name(), e);
            }
        }
    }

    fn set_locked(&self, node: NodeId, locked: bool) {
        if let Ok(element) = self.element(node) {
            element.set_locked_state(locked);
        }
    }

    fn set_state(&self, target: StateTarget, state: NodeState, timeout: Duration) -> Result<(), GraphError> {
        let element = match target {
            StateTarget::Graph => self.pipeline.clone().upcast::<gst::Element>(),
            StateTarget::Node(node) => self.element(node)?,
        };
        let failed = || GraphError::StateChange {
            target: element.name().to_string(),
            state,
        };

        match element.set_state(state.into()) {
            Err(_) => Err(failed()),
            Ok(gst::StateChangeSuccess::Async) => {
                let wait = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
                match element.state(wait) {
                    (Err(_), _, _) => Err(failed()),
                    (Ok(gst::StateChangeSuccess::Async), current, _) => {
                        debug!(
                            "{} still changing to {} after {:?} (at {:?})",
                            element.name(),
                            state,
                            timeout,
                            current
                        );
                        Ok(())
                    }
                    (Ok(_), _, _) => Ok(()),
                }
            }
            Ok(_) => Ok(()),
        }
    }

    fn sync_with_parent(&self, node: NodeId) -> Result<(), GraphError> {
        let element = self.element(node)?;
        element.sync_state_with_parent().map_err(|_| GraphError::StateChange {
            target: element.name().to_string(),
            state: self.pipeline.current_state().into(),
        })
    }

    fn watch_streams(&self, source: NodeId, handler: StreamHandler) {
        let Ok(element) = self.element(source) else {
            return;
        };
        let this = self.this.clone();
        element.connect_pad_added(move |_, pad| {
            let Some(graph) = this.upgrade() else {
                return;
            };
            let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
            let encoding = caps
                .structure(0)
                .and_then(|s| s.get::<String>("encoding-name").ok());
            let announcement = StreamAnnouncement {
                stream: pad.name().to_string(),
                encoding,
            };
            handler(graph.as_ref(), &announcement);
        });
    }

    fn intercept_eos(&self, node: NodeId) -> Result<(), GraphError> {
        let element = self.element(node)?;
        let pad = element
            .static_pad("sink")
            .ok_or_else(|| GraphError::Probe(element.name().to_string()))?;
        let this = self.this.clone();
        pad.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |_, info| {
            let is_eos = matches!(
                info.data,
                Some(gst::PadProbeData::Event(ref event)) if event.type_() == gst::EventType::Eos
            );
            if !is_eos {
                return gst::PadProbeReturn::Ok;
            }
            let verdict = this
                .upgrade()
                .and_then(|graph| graph.event_sink())
                .map(|sink| sink.on_eos_probe(node))
                .unwrap_or(ProbeVerdict::Pass);
            match verdict {
                ProbeVerdict::Drop => gst::PadProbeReturn::Drop,
                ProbeVerdict::Pass => gst::PadProbeReturn::Ok,
            }
        })
        .ok_or_else(|| GraphError::Probe(element.name().to_string()))?;
        Ok(())
    }

    fn detach_when_idle(&self, port: PortId, action: IdleAction) -> Result<(), GraphError> {
        let pad = self.pad(port)?;
        let this = self.this.clone();
        let action = Mutex::new(Some(action));
        // An idle pad runs the probe right here and returns no id.
        let _ = pad.add_probe(gst::PadProbeType::IDLE, move |_, _| {
            if let Some(action) = action.lock().take() {
                if let Some(graph) = this.upgrade() {
                    action(graph.as_ref());
                }
            }
            gst::PadProbeReturn::Remove
        });
        Ok(())
    }

    fn send_eos(&self, node: NodeId) -> Result<(), GraphError> {
        let element = self.element(node)?;
        let pad = element
            .static_pad("sink")
            .ok_or_else(|| GraphError::Unsupported(format!("{} has no sink pad", element.name())))?;
        if !pad.send_event(gst::event::Eos::new()) {
            debug!("EOS into {} was not handled", element.name());
        }
        Ok(())
    }

    fn bind_window(&self, node: NodeId, handle: DisplayHandle) -> Result<(), GraphError> {
        let element = self.element(node)?;
        let overlay = Self::overlay(&element).ok_or_else(|| {
            GraphError::Unsupported(format!("{} has no video overlay", element.name()))
        })?;
        // SAFETY: the host keeps the surface alive while it is bound.
        unsafe { overlay.set_window_handle(handle.0) };
        self.registry.lock().windows.insert(node);
        debug!("Bound {} to window {:#x}", element.name(), handle.0);
        Ok(())
    }

    fn expose(&self, node: NodeId) {
        if let Some(overlay) = self.element(node).ok().as_ref().and_then(Self::overlay) {
            overlay.expose();
        }
    }

    fn video_geometry(&self) -> Option<VideoGeometry> {
        let elements: Vec<gst::Element> = {
            let registry = self.registry.lock();
            registry
                .windows
                .iter()
                .filter_map(|id| registry.nodes.get(id).cloned())
                .collect()
        };

        elements.iter().find_map(|element| {
            let caps = element.static_pad("sink")?.current_caps()?;
            let info = gst_video::VideoInfo::from_caps(&caps).ok()?;
            let par = info.par();
            let width = if par.denom() > 0 {
                (info.width() as u64 * par.numer().max(1) as u64 / par.denom() as u64) as u32
            } else {
                info.width()
            };
            Some(VideoGeometry {
                width,
                height: info.height(),
            })
        })
    }

    fn set_event_sink(&self, sink: Weak<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }
}

impl Drop for GstGraph {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.bus_thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Bus thread panicked");
            }
        }
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline on release: {}", e);
        }
        debug!("Pipeline {} released", self.pipeline.name());
    }
}
