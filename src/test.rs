//! In-crate mock implementations of the external collaborators, used by the unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bson::{doc, Bson, Document};
use futures_core::future::BoxFuture;
use futures_util::FutureExt;

use crate::{
    channel::{Channel, Command, Connection},
    context::OperationContext,
    error::{Error, Result},
    selection_criteria::SelectionCriteria,
    session::{ServerSessionPool, SessionHandle},
    topology::{
        Cluster, ClusterDescription, Server, ServerAddress, ServerDescription, ServerType,
        TopologyType,
    },
    SessionOptions,
};

pub(crate) const TEST_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A scripted connection: commands sent through it are recorded, and responses are served
/// from a queue.
pub(crate) struct MockConnection {
    address: ServerAddress,
    responses: Mutex<VecDeque<Result<Document>>>,
    sent: Mutex<Vec<Command>>,
    expired: AtomicBool,
    hanging: AtomicBool,
    closes: AtomicUsize,
}

impl MockConnection {
    pub(crate) fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: ServerAddress::parse(address),
            responses: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            expired: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        })
    }

    /// Makes every subsequent command hang until its context gives up on it.
    pub(crate) fn hang(&self) {
        self.hanging.store(true, Ordering::SeqCst);
    }

    pub(crate) fn push_response(&self, response: Document) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub(crate) fn push_error(&self, error: Error) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub(crate) fn sent_commands(&self) -> Vec<Command> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub(crate) fn set_expired(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Connection for Arc<MockConnection> {
    fn address(&self) -> ServerAddress {
        self.address.clone()
    }

    fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn command<'a>(
        &'a self,
        _ctx: &'a OperationContext,
        command: Command,
    ) -> BoxFuture<'a, Result<Document>> {
        async move {
            self.sent.lock().unwrap().push(command);
            if self.hanging.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(Error::internal("mock connection has no scripted response"))
                })
        }
        .boxed()
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A server whose checkouts all share one scripted connection.
pub(crate) struct MockServer {
    description: ServerDescription,
    pub(crate) connection: Arc<MockConnection>,
    checkout_errors: Mutex<VecDeque<Error>>,
}

impl MockServer {
    pub(crate) fn new(address: &str, server_type: ServerType) -> Arc<Self> {
        let mut description =
            ServerDescription::new(ServerAddress::parse(address), server_type);
        description.logical_session_timeout = Some(TEST_SESSION_TIMEOUT);
        description.max_wire_version = Some(13);
        Arc::new(Self {
            description,
            connection: MockConnection::new(address),
            checkout_errors: Mutex::new(VecDeque::new()),
        })
    }

    /// A server that reports no logical session timeout (and therefore neither session nor
    /// retryable write support).
    pub(crate) fn without_session_support(address: &str, server_type: ServerType) -> Arc<Self> {
        let mut description =
            ServerDescription::new(ServerAddress::parse(address), server_type);
        description.max_wire_version = Some(13);
        Arc::new(Self {
            description,
            connection: MockConnection::new(address),
            checkout_errors: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn push_checkout_error(&self, error: Error) {
        self.checkout_errors.lock().unwrap().push_back(error);
    }
}

impl Server for MockServer {
    fn description(&self) -> ServerDescription {
        self.description.clone()
    }

    fn checkout<'a>(&'a self, _ctx: &'a OperationContext) -> BoxFuture<'a, Result<Channel>> {
        async move {
            if let Some(error) = self.checkout_errors.lock().unwrap().pop_front() {
                return Err(error);
            }
            Ok(Channel::new(
                Box::new(self.connection.clone()),
                self.description.clone(),
            ))
        }
        .boxed()
    }
}

/// A cluster that selects the first listed server matching the criteria, honoring the
/// deprioritized list when an alternative exists.
pub(crate) struct MockCluster {
    topology_type: TopologyType,
    pub(crate) servers: Vec<Arc<MockServer>>,
}

impl MockCluster {
    pub(crate) fn new(
        topology_type: TopologyType,
        servers: Vec<Arc<MockServer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            topology_type,
            servers,
        })
    }

    pub(crate) fn replica_set(servers: Vec<Arc<MockServer>>) -> Arc<Self> {
        Self::new(TopologyType::ReplicaSet, servers)
    }
}

impl Cluster for MockCluster {
    fn description(&self) -> ClusterDescription {
        ClusterDescription {
            topology_type: self.topology_type,
            servers: self.servers.iter().map(|s| s.description()).collect(),
        }
    }

    fn select_server<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
        deprioritized: &'a [ServerAddress],
        _ctx: &'a OperationContext,
    ) -> BoxFuture<'a, Result<Arc<dyn Server>>> {
        async move {
            let suitable: Vec<&Arc<MockServer>> = self
                .servers
                .iter()
                .filter(|server| criteria.matches(&server.description()))
                .collect();
            let preferred = suitable
                .iter()
                .find(|server| !deprioritized.contains(&server.description().address));
            match preferred.or(suitable.first()) {
                Some(server) => Ok(Arc::clone(*server) as Arc<dyn Server>),
                None => Err(Error::server_selection_timeout(
                    "no suitable server found before the deadline",
                    None,
                )),
            }
        }
        .boxed()
    }
}

/// A session over a fresh pool with the standard test timeout.
pub(crate) fn explicit_session() -> (Arc<ServerSessionPool>, SessionHandle) {
    session(false)
}

/// A driver-created session, as operations without a user session would get.
pub(crate) fn implicit_session() -> (Arc<ServerSessionPool>, SessionHandle) {
    session(true)
}

fn session(is_implicit: bool) -> (Arc<ServerSessionPool>, SessionHandle) {
    let pool = Arc::new(ServerSessionPool::new());
    let session = SessionHandle::acquire(
        pool.clone(),
        Some(TEST_SESSION_TIMEOUT),
        SessionOptions::default(),
        is_implicit,
    );
    (pool, session)
}

pub(crate) fn ok_response() -> Document {
    doc! { "ok": 1 }
}

pub(crate) fn cursor_response(ns: &str, id: i64, batch: Vec<Document>) -> Document {
    let batch: Vec<Bson> = batch.into_iter().map(Bson::Document).collect();
    doc! {
        "ok": 1,
        "cursor": {
            "id": id,
            "ns": ns,
            "nextBatch": batch,
        },
    }
}

/// The shape of a cursor-opening (`find`-style) reply.
pub(crate) fn find_response(ns: &str, id: i64, batch: Vec<Document>) -> Document {
    let batch: Vec<Bson> = batch.into_iter().map(Bson::Document).collect();
    doc! {
        "ok": 1,
        "cursor": {
            "id": id,
            "ns": ns,
            "firstBatch": batch,
        },
    }
}

pub(crate) fn kill_cursors_response(id: i64) -> Document {
    doc! {
        "ok": 1,
        "cursorsKilled": [id],
        "cursorsNotFound": [],
        "cursorsAlive": [],
    }
}

pub(crate) fn command_error_response(code: i32, code_name: &str) -> Document {
    doc! {
        "ok": 0,
        "code": code,
        "codeName": code_name,
        "errmsg": format!("simulated {} failure", code_name),
    }
}

pub(crate) fn network_error() -> Error {
    Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
}
