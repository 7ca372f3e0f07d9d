//! Graph Engine
//!
//! A graph is a tree of stages rooted at one entry node. Each node wraps a
//! [`NodeProcessor`] and owns the [`Next`] fan-out it pushes results into:
//!
//! ```text
//!               ┌──► [2 persistence]
//! [1 entry] ────┤
//!               └──► [3 remote] ──► [4 persistence]
//! ```
//!
//! Execution is depth-first and inline on the caller's task. Nodes that need
//! their own task (local workers) enqueue and return, and resume the graph
//! from their own coordinates later.
//!
//! Graphs are assembled with a [`GraphBuilder`], frozen by
//! [`GraphBuilder::build`] and registered once in a [`GraphRegistry`]. After
//! that they are read-only and shared through `Arc`.
//!
//! ```ignore
//! let mut builder = GraphBuilder::new(SERVICE_METRIC_GRAPH);
//! builder
//!     .add_entry_node(aggregate)?
//!     .add_next(remote)?
//!     .add_next(persist)?;
//! registry.register(builder.build()?)?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracehouse_core::Record;

use crate::error::{GraphError, Result};

pub type GraphId = u32;
pub type NodeId = u32;

/// One stage of a graph
#[async_trait]
pub trait NodeProcessor: Send + Sync {
    /// Unique within a graph
    fn id(&self) -> NodeId;

    /// Handle `input`, pushing any output into `next`.
    async fn process(&self, input: Record, next: &Next) -> Result<()>;
}

/// A frozen node: its processor plus its downstream fan-out
pub struct Node {
    processor: Arc<dyn NodeProcessor>,
    next: Next,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.processor.id()
    }

    pub async fn execute(&self, input: Record) -> Result<()> {
        self.processor.process(input, &self.next).await
    }
}

/// Ordered downstream nodes of one node
#[derive(Clone, Default)]
pub struct Next {
    nodes: Vec<Arc<Node>>,
}

impl Next {
    /// Push `record` into every downstream node, cloning for all but the last.
    pub async fn execute(&self, record: Record) -> Result<()> {
        if let Some((last, rest)) = self.nodes.split_last() {
            for node in rest {
                node.execute(record.clone()).await?;
            }
            last.execute(record).await?;
        }
        Ok(())
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next").field("nodes", &self.ids()).finish()
    }
}

pub struct Graph {
    id: GraphId,
    entry: Arc<Node>,
    nodes: HashMap<NodeId, Arc<Node>>,
}

impl Graph {
    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn entry_id(&self) -> NodeId {
        self.entry.id()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Run the entry node against `input`.
    pub async fn start(&self, input: Record) -> Result<()> {
        self.entry.execute(input).await
    }

    /// The fan-out of `node_id`, for resuming mid-graph.
    pub fn find_next(&self, node_id: NodeId) -> std::result::Result<Next, GraphError> {
        self.nodes
            .get(&node_id)
            .map(|node| node.next.clone())
            .ok_or(GraphError::NodeNotFound {
                graph_id: self.id,
                node_id,
            })
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("entry", &self.entry_id())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

/// Mutable graph under construction
pub struct GraphBuilder {
    id: GraphId,
    entry: Option<NodeId>,
    processors: HashMap<NodeId, Arc<dyn NodeProcessor>>,
    children: HashMap<NodeId, Vec<NodeId>>,
}

impl GraphBuilder {
    pub fn new(id: GraphId) -> Self {
        Self {
            id,
            entry: None,
            processors: HashMap::new(),
            children: HashMap::new(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn add_entry_node(
        &mut self,
        processor: Arc<dyn NodeProcessor>,
    ) -> std::result::Result<NodeBuilder<'_>, GraphError> {
        if self.entry.is_some() {
            return Err(GraphError::EntryAlreadySet(self.id));
        }
        let id = self.insert(processor)?;
        self.entry = Some(id);
        Ok(NodeBuilder { graph: self, id })
    }

    /// Re-open an existing node to attach another branch.
    pub fn node(&mut self, id: NodeId) -> std::result::Result<NodeBuilder<'_>, GraphError> {
        if !self.processors.contains_key(&id) {
            return Err(GraphError::NodeNotFound {
                graph_id: self.id,
                node_id: id,
            });
        }
        Ok(NodeBuilder { graph: self, id })
    }

    fn insert(&mut self, processor: Arc<dyn NodeProcessor>) -> std::result::Result<NodeId, GraphError> {
        let id = processor.id();
        if self.processors.contains_key(&id) {
            return Err(GraphError::DuplicateNode {
                graph_id: self.id,
                node_id: id,
            });
        }
        self.processors.insert(id, processor);
        Ok(id)
    }

    /// Freeze into an immutable graph.
    pub fn build(self) -> std::result::Result<Graph, GraphError> {
        let entry_id = self.entry.ok_or(GraphError::MissingEntry(self.id))?;

        let mut nodes = HashMap::with_capacity(self.processors.len());
        let entry = self.freeze(entry_id, &mut nodes)?;

        Ok(Graph {
            id: self.id,
            entry,
            nodes,
        })
    }

    // Every node is created by add_next under exactly one parent, so this
    // walk visits each node once.
    fn freeze(
        &self,
        id: NodeId,
        nodes: &mut HashMap<NodeId, Arc<Node>>,
    ) -> std::result::Result<Arc<Node>, GraphError> {
        let processor = self
            .processors
            .get(&id)
            .cloned()
            .ok_or(GraphError::NodeNotFound {
                graph_id: self.id,
                node_id: id,
            })?;

        let mut next = Next::default();
        for child in self.children.get(&id).into_iter().flatten() {
            next.nodes.push(self.freeze(*child, nodes)?);
        }

        let node = Arc::new(Node { processor, next });
        nodes.insert(id, Arc::clone(&node));
        Ok(node)
    }
}

/// Cursor on one node of a [`GraphBuilder`]
pub struct NodeBuilder<'g> {
    graph: &'g mut GraphBuilder,
    id: NodeId,
}

impl<'g> NodeBuilder<'g> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Add a downstream stage and move the cursor onto it.
    pub fn add_next(
        self,
        processor: Arc<dyn NodeProcessor>,
    ) -> std::result::Result<NodeBuilder<'g>, GraphError> {
        let child = self.graph.insert(processor)?;
        self.graph.children.entry(self.id).or_default().push(child);
        Ok(NodeBuilder {
            graph: self.graph,
            id: child,
        })
    }
}

/// All graphs of the process, keyed by id
#[derive(Debug, Default)]
pub struct GraphRegistry {
    graphs: HashMap<GraphId, Arc<Graph>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a graph with a fresh id.
    pub fn create_graph(&self, id: GraphId) -> std::result::Result<GraphBuilder, GraphError> {
        if self.graphs.contains_key(&id) {
            return Err(GraphError::DuplicateGraph(id));
        }
        Ok(GraphBuilder::new(id))
    }

    pub fn register(&mut self, graph: Graph) -> std::result::Result<Arc<Graph>, GraphError> {
        if self.graphs.contains_key(&graph.id) {
            return Err(GraphError::DuplicateGraph(graph.id));
        }
        let graph = Arc::new(graph);
        self.graphs.insert(graph.id, Arc::clone(&graph));
        Ok(graph)
    }

    pub fn find(&self, graph_id: GraphId) -> std::result::Result<Arc<Graph>, GraphError> {
        self.graphs
            .get(&graph_id)
            .cloned()
            .ok_or(GraphError::GraphNotFound(graph_id))
    }

    pub fn find_next(
        &self,
        graph_id: GraphId,
        node_id: NodeId,
    ) -> std::result::Result<Next, GraphError> {
        self.find(graph_id)?.find_next(node_id)
    }

    pub fn graph_ids(&self) -> Vec<GraphId> {
        let mut ids: Vec<GraphId> = self.graphs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;
    use tracehouse_core::Value;

    /// Adds `delta` to the first LONG field
    struct AddNode {
        id: NodeId,
        delta: i64,
    }

    #[async_trait]
    impl NodeProcessor for AddNode {
        fn id(&self) -> NodeId {
            self.id
        }

        async fn process(&self, mut input: Record, next: &Next) -> Result<()> {
            if let Some(Value::Long(v)) = input.values.first_mut() {
                *v += self.delta;
            }
            next.execute(input).await
        }
    }

    struct Collect {
        id: NodeId,
        seen: Mutex<Vec<(NodeId, i64)>>,
    }

    #[async_trait]
    impl NodeProcessor for Collect {
        fn id(&self) -> NodeId {
            self.id
        }

        async fn process(&self, input: Record, _next: &Next) -> Result<()> {
            let v = input.values[0].as_long().unwrap_or_default();
            self.seen.lock().await.push((self.id, v));
            Ok(())
        }
    }

    fn add(id: NodeId, delta: i64) -> Arc<dyn NodeProcessor> {
        Arc::new(AddNode { id, delta })
    }

    fn record(v: i64) -> Record {
        Record::new(1, "svc", 0, vec![Value::Long(v)])
    }

    #[tokio::test]
    async fn test_chain_and_branches() {
        let left = Arc::new(Collect { id: 10, seen: Mutex::new(vec![]) });
        let right = Arc::new(Collect { id: 11, seen: Mutex::new(vec![]) });

        let mut builder = GraphBuilder::new(1);
        builder
            .add_entry_node(add(1, 1))
            .unwrap()
            .add_next(add(2, 10))
            .unwrap()
            .add_next(left.clone())
            .unwrap();
        builder.node(1).unwrap().add_next(right.clone()).unwrap();

        let graph = builder.build().unwrap();
        assert_eq!(graph.entry_id(), 1);
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.find_next(1).unwrap().ids(), vec![2, 11]);

        graph.start(record(0)).await.unwrap();
        assert_eq!(*left.seen.lock().await, vec![(10, 11)]);
        assert_eq!(*right.seen.lock().await, vec![(11, 1)]);
    }

    #[test]
    fn test_duplicate_node() {
        let mut builder = GraphBuilder::new(7);
        let err = builder
            .add_entry_node(add(1, 0))
            .unwrap()
            .add_next(add(1, 0))
            .err()
            .unwrap();
        assert_eq!(err, GraphError::DuplicateNode { graph_id: 7, node_id: 1 });
    }

    #[test]
    fn test_second_entry_and_missing_entry() {
        let mut builder = GraphBuilder::new(3);
        builder.add_entry_node(add(1, 0)).unwrap();
        assert_eq!(
            builder.add_entry_node(add(2, 0)).err(),
            Some(GraphError::EntryAlreadySet(3))
        );

        assert_eq!(
            GraphBuilder::new(4).build().err(),
            Some(GraphError::MissingEntry(4))
        );
    }

    #[test]
    fn test_registry_lookup_errors() {
        let mut registry = GraphRegistry::new();
        let mut builder = registry.create_graph(1).unwrap();
        builder.add_entry_node(add(5, 0)).unwrap();
        registry.register(builder.build().unwrap()).unwrap();

        assert_eq!(registry.create_graph(1).err(), Some(GraphError::DuplicateGraph(1)));
        assert_eq!(registry.find(2).err(), Some(GraphError::GraphNotFound(2)));
        assert_eq!(
            registry.find_next(1, 99).err(),
            Some(GraphError::NodeNotFound { graph_id: 1, node_id: 99 })
        );
        assert!(registry.find_next(1, 5).unwrap().is_empty());
    }
}
