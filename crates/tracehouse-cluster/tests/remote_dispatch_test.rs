//! Two members in one process, splitting a graph by consistent hash

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracehouse_cluster::{
    ClusterMembership, DispatchHandler, Endpoint, RemoteAddress, RemoteServer, RemoteWorker,
    Router, RoutingStrategy, TcpRemoteSender,
};
use tracehouse_core::{Record, Value};
use tracehouse_stream::{GraphBuilder, GraphRegistry, Next, NodeId, NodeProcessor};

const GRAPH: u32 = 1;
const ROLE: &str = "persistence";

#[derive(Default)]
struct Collect {
    ids: Mutex<Vec<String>>,
}

#[async_trait]
impl NodeProcessor for Collect {
    fn id(&self) -> NodeId {
        2
    }

    async fn process(&self, input: Record, _next: &Next) -> tracehouse_stream::Result<()> {
        self.ids.lock().unwrap().push(input.id);
        Ok(())
    }
}

struct Member {
    router: Arc<Router>,
    graphs: Arc<GraphRegistry>,
    collected: Arc<Collect>,
}

fn member(self_address: RemoteAddress, all: &[RemoteAddress]) -> Member {
    let membership = Arc::new(ClusterMembership::new(self_address, 100));
    for addr in all {
        membership.join(ROLE, addr.clone());
    }
    let router = Arc::new(Router::new(membership, RoutingStrategy::ConsistentHash));
    let sender = Arc::new(TcpRemoteSender::new(Duration::from_secs(2)));
    let collected = Arc::new(Collect::default());

    let mut registry = GraphRegistry::new();
    let mut builder = registry.create_graph(GRAPH).unwrap();
    builder
        .add_entry_node(Arc::new(RemoteWorker::new(1, GRAPH, ROLE, router.clone(), sender)))
        .unwrap()
        .add_next(collected.clone())
        .unwrap();
    registry.register(builder.build().unwrap()).unwrap();

    Member {
        router,
        graphs: Arc::new(registry),
        collected,
    }
}

#[tokio::test]
async fn test_records_land_on_their_owner() {
    // Bind first so both members know the real ports
    let placeholder = Arc::new(DispatchHandler::new(Arc::new(GraphRegistry::new())));
    let probe_a = RemoteServer::bind("127.0.0.1:0", placeholder.clone()).await.unwrap();
    let probe_b = RemoteServer::bind("127.0.0.1:0", placeholder).await.unwrap();
    let addr_a = RemoteAddress::new("127.0.0.1", probe_a.local_addr().unwrap().port());
    let addr_b = RemoteAddress::new("127.0.0.1", probe_b.local_addr().unwrap().port());
    drop(probe_a);
    drop(probe_b);

    let all = [addr_a.clone(), addr_b.clone()];
    let a = member(addr_a.clone(), &all);
    let b = member(addr_b.clone(), &all);

    let server_b = RemoteServer::bind(
        &addr_b.to_string(),
        Arc::new(DispatchHandler::new(b.graphs.clone())),
    )
    .await
    .unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = server_b.start(shutdown_rx);

    let graph = a.graphs.find(GRAPH).unwrap();
    let mut expect_local = Vec::new();
    let mut expect_remote = Vec::new();
    for i in 0..60 {
        let record = Record::new(1, format!("service-{i}"), 0, vec![Value::Long(i)]);
        match a.router.select_worker(ROLE, &record).unwrap() {
            Endpoint::Local => expect_local.push(record.id.clone()),
            Endpoint::Remote(addr) => {
                assert_eq!(addr, addr_b);
                expect_remote.push(record.id.clone());
            }
        }
        graph.start(record).await.unwrap();
    }

    // Both members agree on ownership
    for id in &expect_remote {
        let record = Record::new(1, id.clone(), 0, vec![Value::Long(0)]);
        assert_eq!(b.router.select_worker(ROLE, &record).unwrap(), Endpoint::Local);
    }

    assert!(!expect_local.is_empty());
    assert!(!expect_remote.is_empty());
    assert_eq!(*a.collected.ids.lock().unwrap(), expect_local);
    // Sends wait for the ack, which follows the remote graph run
    assert_eq!(*b.collected.ids.lock().unwrap(), expect_remote);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}
