use std::time::Duration;
use tracing::{debug, error};

use super::{GraphError, MediaGraph, NodeId, NodeState, PropValue, StateTarget};

/// Recipe for one node of a linear chain.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub factory: String,
    pub name: String,
    pub properties: Vec<(String, PropValue)>,
}

impl NodeSpec {
    pub fn new(factory: &str, name: &str) -> Self {
        Self {
            factory: factory.to_string(),
            name: name.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        self.properties.push((key.to_string(), value.into()));
        self
    }
}

/// Nodes owned by one unit of the graph, in construction order, plus the
/// links made between them.
///
/// Teardown walks both lists in reverse.
#[derive(Debug, Default)]
pub struct Subgraph {
    nodes: Vec<(NodeId, String)>,
    edges: Vec<(NodeId, NodeId)>,
}

impl Subgraph {
    /// Builds a linked chain. Nodes start locked so a running parent does
    /// not pull them into its state before they are wired.
    ///
    /// On failure everything created so far is torn down.
    pub fn build_chain(graph: &dyn MediaGraph, specs: &[NodeSpec]) -> Result<Self, GraphError> {
        let mut subgraph = Subgraph::default();

        for spec in specs {
            if let Err(e) = subgraph.push(graph, spec) {
                error!("Unable to create {}: {}", spec.name, e);
                subgraph.teardown(graph);
                return Err(e);
            }
        }

        Ok(subgraph)
    }

    fn push(&mut self, graph: &dyn MediaGraph, spec: &NodeSpec) -> Result<(), GraphError> {
        let node = graph.create_node(&spec.factory, &spec.name)?;
        self.nodes.push((node, spec.name.clone()));
        graph.set_locked(node, true);
        debug!("setup element create {}", spec.name);

        for (key, value) in &spec.properties {
            graph.set_property(node, key, value)?;
        }

        if let Some(&(previous, _)) = self.nodes.iter().rev().nth(1) {
            graph.link(previous, node)?;
            self.edges.push((previous, node));
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// First node of the chain, where the fan-out port attaches.
    pub fn head(&self) -> Option<NodeId> {
        self.nodes.first().map(|(id, _)| *id)
    }

    /// Last node of the chain, normally the terminal sink.
    pub fn tail(&self) -> Option<NodeId> {
        self.nodes.last().map(|(id, _)| *id)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| *id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|(id, _)| *id)
    }

    pub fn set_locked(&self, graph: &dyn MediaGraph, locked: bool) {
        for (node, _) in &self.nodes {
            graph.set_locked(*node, locked);
        }
    }

    /// Moves every node to `state`, waiting up to `timeout` per node.
    pub fn set_state(
        &self,
        graph: &dyn MediaGraph,
        state: NodeState,
        timeout: Duration,
    ) -> Result<(), GraphError> {
        let mut result = Ok(());
        for (node, name) in &self.nodes {
            if let Err(e) = graph.set_state(StateTarget::Node(*node), state, timeout) {
                error!("Failed to set {} to {}: {}", name, state, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn sync_with_parent(&self, graph: &dyn MediaGraph) -> Result<(), GraphError> {
        for (node, _) in &self.nodes {
            graph.sync_with_parent(*node)?;
        }
        Ok(())
    }

    /// Unlinks and destroys every node in reverse construction order.
    pub fn teardown(&mut self, graph: &dyn MediaGraph) {
        for (upstream, downstream) in self.edges.drain(..).rev() {
            graph.unlink(upstream, downstream);
        }
        while let Some((node, name)) = self.nodes.pop() {
            debug!("cleanup element {}", name);
            graph.set_locked(node, false);
            graph.destroy_node(node);
        }
    }
}
