use std::ops::{Deref, DerefMut};

use itertools::Itertools;
use petgraph::{stable_graph::StableGraph, visit::EdgeRef, Direction};
use rustc_hash::FxHashMap;

pub use petgraph::stable_graph::NodeIndex;

/// A node attribute. Only the variants the fusion passes consume are modeled.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Int(i64),
    Ints(Vec<i64>),
    Float(f32),
}

/// A single operator in the graph. Inputs and outputs are tensor names,
/// wiring is by name like the serialized model format this IR mirrors.
#[derive(Debug, Clone)]
pub struct Node {
    pub op_type: String,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: FxHashMap<String, Attribute>,
}

impl Node {
    pub fn new<S: Into<String>>(
        op_type: impl Into<String>,
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = S>,
        outputs: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            op_type: op_type.into(),
            name: name.into(),
            inputs: inputs.into_iter().map(|i| i.into()).collect(),
            outputs: outputs.into_iter().map(|i| i.into()).collect(),
            attributes: FxHashMap::default(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: Attribute) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn attribute_int(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Attribute::Int(i)) => Some(*i),
            _ => None,
        }
    }
}

/// A named constant tensor living outside the node list.
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl Initializer {
    pub fn new(name: impl Into<String>, dims: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            dims,
            data,
        }
    }

    pub fn zeros(name: impl Into<String>, dim: usize) -> Self {
        Self::new(name, vec![dim], vec![0.0; dim])
    }
}

/// A tensor travelling along an edge. Slots index into the producer's output
/// list and the consumer's input list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub output_slot: usize,
    pub input_slot: usize,
}

pub type MainGraph = StableGraph<Node, Connection>;

/// Mutable in-memory model graph. Tensor names are the source of truth for
/// wiring; the petgraph edges and the producer/consumer indices are kept in
/// sync on every insertion and removal.
#[derive(Debug, Default)]
pub struct Graph {
    pub graph: MainGraph,
    /// Tensor name -> (producing node, output slot)
    producers: FxHashMap<String, (NodeIndex, usize)>,
    /// Tensor name -> consuming (node, input slot) pairs, in insertion order
    consumers: FxHashMap<String, Vec<(NodeIndex, usize)>>,
    pub initializers: FxHashMap<String, Initializer>,
    /// Graph-level input tensor names
    pub inputs: Vec<String>,
    /// Graph-level output tensor names
    pub outputs: Vec<String>,
    name_counters: FxHashMap<String, usize>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: impl Into<String>) {
        self.inputs.push(name.into());
    }

    pub fn add_output(&mut self, name: impl Into<String>) {
        self.outputs.push(name.into());
    }

    pub fn add_node(&mut self, node: Node) -> NodeIndex {
        let id = self.graph.add_node(node);
        let (inputs, outputs) = {
            let n = &self.graph[id];
            (n.inputs.clone(), n.outputs.clone())
        };
        for (output_slot, name) in outputs.into_iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            // Wire up consumers that were added before their producer
            if let Some(waiting) = self.consumers.get(&name) {
                for (consumer, input_slot) in waiting.clone() {
                    self.graph.add_edge(
                        id,
                        consumer,
                        Connection {
                            output_slot,
                            input_slot,
                        },
                    );
                }
            }
            self.producers.insert(name, (id, output_slot));
        }
        for (input_slot, name) in inputs.into_iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            if let Some(&(producer, output_slot)) = self.producers.get(&name) {
                self.graph.add_edge(
                    producer,
                    id,
                    Connection {
                        output_slot,
                        input_slot,
                    },
                );
            }
            self.consumers.entry(name).or_default().push((id, input_slot));
        }
        id
    }

    pub fn remove_node(&mut self, id: NodeIndex) {
        let Some(node) = self.graph.remove_node(id) else {
            return;
        };
        for name in &node.outputs {
            if self.producers.get(name).map(|(n, _)| *n) == Some(id) {
                self.producers.remove(name);
            }
        }
        for name in &node.inputs {
            if let Some(list) = self.consumers.get_mut(name) {
                list.retain(|(n, _)| *n != id);
                if list.is_empty() {
                    self.consumers.remove(name);
                }
            }
        }
    }

    pub fn remove_nodes(&mut self, ids: &[NodeIndex]) {
        for id in ids {
            self.remove_node(*id);
        }
    }

    pub fn node(&self, id: NodeIndex) -> &Node {
        self.graph.node_weight(id).expect("Node not found in graph!")
    }

    /// The node producing the given tensor, if any. Graph inputs and
    /// initializers have no producer.
    pub fn producer(&self, tensor: &str) -> Option<NodeIndex> {
        self.producers.get(tensor).map(|(n, _)| *n)
    }

    /// Nodes consuming the given tensor, in insertion order.
    pub fn consumers_of(&self, tensor: &str) -> Vec<NodeIndex> {
        self.consumers
            .get(tensor)
            .map(|l| l.iter().map(|(n, _)| *n).unique().collect())
            .unwrap_or_default()
    }

    pub fn get_children(&self, id: NodeIndex) -> Vec<NodeIndex> {
        self.node(id)
            .outputs
            .iter()
            .flat_map(|o| self.consumers_of(o))
            .unique()
            .collect()
    }

    /// All nodes of the given op type
    pub fn op_nodes(&self, op_type: &str) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|n| self.graph[*n].op_type == op_type)
            .collect()
    }

    pub fn count_op(&self, op_type: &str) -> usize {
        self.graph
            .node_weights()
            .filter(|n| n.op_type == op_type)
            .count()
    }

    /// Match a single parent of `id` by op type. With `Some(i)` only the
    /// producer of input slot `i` is considered; with `None` the inputs are
    /// scanned in order and the first producer of the right type wins.
    pub fn match_parent(
        &self,
        id: NodeIndex,
        op_type: &str,
        input_index: Option<usize>,
    ) -> Option<NodeIndex> {
        let node = self.node(id);
        match input_index {
            Some(i) => {
                let parent = self.producer(node.inputs.get(i)?)?;
                (self.node(parent).op_type == op_type).then_some(parent)
            }
            None => node
                .inputs
                .iter()
                .filter_map(|input| self.producer(input))
                .find(|p| self.node(*p).op_type == op_type),
        }
    }

    /// Walk backward from `id` along the expected op types, one hop per
    /// entry. Returns the matched parents nearest-first, or None as soon as
    /// a hop fails.
    pub fn match_parent_path(
        &self,
        id: NodeIndex,
        op_types: &[&str],
        input_indices: &[Option<usize>],
    ) -> Option<Vec<NodeIndex>> {
        debug_assert_eq!(op_types.len(), input_indices.len());
        let mut matched = Vec::with_capacity(op_types.len());
        let mut current = id;
        for (op_type, input_index) in op_types.iter().zip(input_indices) {
            let parent = self.match_parent(current, op_type, *input_index)?;
            matched.push(parent);
            current = parent;
        }
        Some(matched)
    }

    pub fn add_initializer(&mut self, initializer: Initializer) {
        self.initializers.insert(initializer.name.clone(), initializer);
    }

    pub fn get_initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.get(name)
    }

    /// Constant data for a tensor name, if it is backed by an initializer.
    pub fn get_constant_value(&self, name: &str) -> Option<&[f32]> {
        self.initializers.get(name).map(|i| i.data.as_slice())
    }

    /// Generate a node name unique within the graph for the given prefix.
    pub fn create_node_name(&mut self, prefix: &str) -> String {
        let count = self.name_counters.entry(prefix.to_string()).or_insert(0);
        loop {
            let name = format!("{prefix}_{count}");
            *count += 1;
            if !self.graph.node_weights().any(|n| n.name == name) {
                return name;
            }
        }
    }

    /// Remove node if it has at most `dests` outgoing edges
    pub fn safe_remove_node(&mut self, node: NodeIndex, dests: usize) {
        if self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .count()
            <= dests
        {
            self.remove_node(node);
        }
    }

    /// Drop nodes that feed nothing, transitively, keeping graph outputs.
    pub fn prune(&mut self) {
        loop {
            let dead = self
                .graph
                .node_indices()
                .filter(|n| {
                    self.graph
                        .edges_directed(*n, Direction::Outgoing)
                        .next()
                        .is_none()
                        && self.graph[*n]
                            .outputs
                            .iter()
                            .all(|o| !self.outputs.contains(o))
                })
                .collect_vec();
            if dead.is_empty() {
                break;
            }
            for n in dead {
                self.remove_node(n);
            }
        }
    }

    /// Sources of a node, ordered by input slot
    pub fn get_sources(&self, id: NodeIndex) -> Vec<(NodeIndex, Connection)> {
        self.graph
            .edges_directed(id, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
            .sorted_by_key(|(_, c)| c.input_slot)
            .collect()
    }
}

impl Deref for Graph {
    type Target = MainGraph;
    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

impl DerefMut for Graph {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_graph() -> (Graph, NodeIndex) {
        let mut g = Graph::new();
        g.add_input("x");
        g.add_node(Node::new("MatMul", "mm", ["x", "w"], ["mm_out"]));
        g.add_node(Node::new("Add", "add", ["bias", "mm_out"], ["add_out"]));
        let relu = g.add_node(Node::new("Relu", "relu", ["add_out"], ["y"]));
        g.add_output("y");
        g.add_initializer(Initializer::new("w", vec![2, 2], vec![1.0; 4]));
        g.add_initializer(Initializer::new("bias", vec![2], vec![0.0; 2]));
        (g, relu)
    }

    #[test]
    fn test_match_parent_path() {
        let (g, relu) = chain_graph();
        let path = g
            .match_parent_path(relu, &["Add", "MatMul"], &[Some(0), Some(1)])
            .unwrap();
        assert_eq!(g.node(path[0]).name, "add");
        assert_eq!(g.node(path[1]).name, "mm");

        // Wrong input index fails
        assert!(g
            .match_parent_path(relu, &["Add", "MatMul"], &[Some(0), Some(0)])
            .is_none());
        // Wrong op type fails
        assert!(g
            .match_parent_path(relu, &["Mul", "MatMul"], &[Some(0), Some(1)])
            .is_none());
    }

    #[test]
    fn test_match_parent_wildcard() {
        let (g, relu) = chain_graph();
        let add = g.match_parent(relu, "Add", Some(0)).unwrap();
        // None scans all inputs; the MatMul sits at slot 1 of the Add
        assert!(g.match_parent(add, "MatMul", None).is_some());
        assert!(g.match_parent(add, "Softmax", None).is_none());
    }

    #[test]
    fn test_consumer_added_before_producer() {
        let mut g = Graph::new();
        let relu = g.add_node(Node::new("Relu", "relu", ["t"], ["y"]));
        let mm = g.add_node(Node::new("MatMul", "mm", ["x", "w"], ["t"]));
        assert_eq!(g.producer("t"), Some(mm));
        assert_eq!(g.match_parent(relu, "MatMul", Some(0)), Some(mm));
    }

    #[test]
    fn test_prune_keeps_outputs() {
        let (mut g, relu) = chain_graph();
        g.add_node(Node::new("Shape", "shp", ["add_out"], ["dead"]));
        g.prune();
        // The Shape node feeds nothing and goes away, the rest stays
        assert_eq!(g.count_op("Shape"), 0);
        assert_eq!(g.node(relu).name, "relu");
        assert_eq!(g.node_count(), 3);
    }

    #[test]
    fn test_prune_is_transitive() {
        let mut g = Graph::new();
        g.add_node(Node::new("Shape", "shp", ["x"], ["s"]));
        g.add_node(Node::new("Gather", "gather", ["s", "idx"], ["g"]));
        g.add_node(Node::new("Unsqueeze", "unsq", ["g"], ["u"]));
        g.prune();
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn test_create_node_name() {
        let (mut g, _) = chain_graph();
        assert_eq!(g.create_node_name("Attention"), "Attention_0");
        assert_eq!(g.create_node_name("Attention"), "Attention_1");
        g.add_node(Node::new("Attention", "Attention_2", ["a"], ["b"]));
        assert_eq!(g.create_node_name("Attention"), "Attention_3");
    }

    #[test]
    fn test_remove_node_rewires_indices() {
        let (mut g, relu) = chain_graph();
        let add = g.match_parent(relu, "Add", Some(0)).unwrap();
        g.remove_node(add);
        assert_eq!(g.producer("add_out"), None);
        assert!(g.match_parent(relu, "Add", Some(0)).is_none());
        assert!(g.consumers_of("mm_out").is_empty());
    }
}
