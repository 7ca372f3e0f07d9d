//! Dispatcher
//!
//! Routes an incoming record to the graph registered for its schema and runs
//! that graph's entry node. Records of unknown schemas, or records that do
//! not fit their schema, are rejected here instead of being misrouted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracehouse_core::{Record, SchemaId, SchemaRegistry};
use tracehouse_storage::{RecordSink, SinkError};

use crate::error::{Result, StreamError};
use crate::graph::{GraphId, GraphRegistry};

pub struct Dispatcher {
    graphs: Arc<GraphRegistry>,
    schemas: Arc<SchemaRegistry>,
    routes: HashMap<SchemaId, GraphId>,
}

impl Dispatcher {
    pub fn new(graphs: Arc<GraphRegistry>, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            graphs,
            schemas,
            routes: HashMap::new(),
        }
    }

    /// Send records of `schema_id` into `graph_id`.
    pub fn route(mut self, schema_id: SchemaId, graph_id: GraphId) -> Result<Self> {
        self.schemas.get(schema_id)?;
        self.graphs.find(graph_id)?;
        if let Some(existing) = self.routes.insert(schema_id, graph_id) {
            return Err(StreamError::InvalidConfig(format!(
                "schema {schema_id} already routed to graph {existing}"
            )));
        }
        Ok(self)
    }

    pub fn graph_for(&self, schema_id: SchemaId) -> Option<GraphId> {
        self.routes.get(&schema_id).copied()
    }

    pub async fn dispatch(&self, record: Record) -> Result<()> {
        let graph_id = self
            .graph_for(record.schema_id)
            .ok_or(StreamError::NoRoute(record.schema_id))?;
        self.schemas.get(record.schema_id)?.validate(&record)?;

        let graph = self.graphs.find(graph_id)?;
        graph.start(record).await
    }
}

#[async_trait]
impl RecordSink for Dispatcher {
    async fn accept(&self, record: Record) -> std::result::Result<(), SinkError> {
        self.dispatch(record).await.map_err(|e| Box::new(e) as SinkError)
    }
}
