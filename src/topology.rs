//! Read-only topology facts and the cluster collaborator interface.
//!
//! Server discovery and monitoring live outside this crate; this core only consumes an
//! eventually-consistent snapshot of the deployment ([`ClusterDescription`]) and asks the
//! [`Cluster`] for a concrete [`Server`] matching a selector.

use std::{fmt, sync::Arc, time::Duration};

use futures_core::future::BoxFuture;

use crate::{
    channel::Channel,
    context::OperationContext,
    error::Result,
    selection_criteria::{SelectionCriteria, TagSet},
};

/// An address of a server in the deployment.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address.
        host: String,

        /// The port. The default is 27017.
        port: Option<u16>,
    },
}

impl ServerAddress {
    /// Constructs an address from a `host` or `host:port` string.
    pub fn parse(address: impl AsRef<str>) -> Self {
        let address = address.as_ref();
        match address.rsplit_once(':') {
            Some((host, port)) => Self::Tcp {
                host: host.to_lowercase(),
                port: port.parse().ok(),
            },
            None => Self::Tcp {
                host: address.to_lowercase(),
                port: None,
            },
        }
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host,
        }
    }

    /// The port of this address.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(27017))
            }
        }
    }
}

/// The type of a server in the deployment as reported by its most recent heartbeat.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ServerType {
    /// A single standalone server.
    Standalone,

    /// A router to a sharded deployment.
    ShardRouter,

    /// The primary of a replica set.
    RsPrimary,

    /// A secondary of a replica set.
    RsSecondary,

    /// A non-data-bearing replica set member.
    RsArbiter,

    /// A replica set member in some other state (e.g. recovering).
    RsOther,

    /// A load balancer fronting the deployment.
    LoadBalancer,

    /// A server whose state is not yet known.
    #[default]
    Unknown,
}

impl ServerType {
    /// Whether this server can hold data and answer queries.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::ShardRouter
                | ServerType::LoadBalancer
        )
    }

    /// Whether this server can accept writes.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::ShardRouter
                | ServerType::LoadBalancer
        )
    }

    /// Whether enough is known about this server to route operations to it.
    pub fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// The type of the deployment as a whole.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single server.
    Single,

    /// A replica set.
    ReplicaSet,

    /// A sharded deployment.
    Sharded,

    /// A deployment fronted by one or more load balancers.
    LoadBalanced,

    /// A deployment whose type is not yet known.
    #[default]
    Unknown,
}

/// A description of the most up-to-date information known about a server.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ServerDescription {
    /// The address of this server.
    pub address: ServerAddress,

    /// The type of this server.
    pub server_type: ServerType,

    /// The logical session timeout this server reports, if it supports sessions.
    pub logical_session_timeout: Option<Duration>,

    /// The maximum wire protocol version this server supports.
    pub max_wire_version: Option<i32>,

    /// The replica set tags configured on this server.
    pub tags: TagSet,

    /// The most recent moving average of this server's heartbeat round trip time.
    pub average_round_trip_time: Option<Duration>,
}

impl ServerDescription {
    /// Creates a description of a server of the given type with no further facts known.
    pub fn new(address: ServerAddress, server_type: ServerType) -> Self {
        Self {
            address,
            server_type,
            logical_session_timeout: None,
            max_wire_version: None,
            tags: TagSet::new(),
            average_round_trip_time: None,
        }
    }

    /// Whether operations against this server may carry a session id.
    pub fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some() || self.server_type == ServerType::LoadBalancer
    }

    /// Whether this server advertises support for retryable writes: it must either report a
    /// logical session timeout or be a load balancer.
    pub fn supports_retryable_writes(&self) -> bool {
        self.supports_sessions()
    }
}

/// A description of the deployment as a whole.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct ClusterDescription {
    /// The type of the deployment.
    pub topology_type: TopologyType,

    /// The servers comprising the deployment.
    pub servers: Vec<ServerDescription>,
}

impl ClusterDescription {
    /// The logical session timeout for the deployment: the minimum timeout across data
    /// bearing servers, or `None` if any data bearing server does not support sessions.
    pub fn logical_session_timeout(&self) -> Option<Duration> {
        let mut timeout: Option<Duration> = None;
        for server in self
            .servers
            .iter()
            .filter(|s| s.server_type.is_data_bearing())
        {
            match server.logical_session_timeout {
                None => return None,
                Some(t) => {
                    timeout = Some(match timeout {
                        Some(existing) => existing.min(t),
                        None => t,
                    })
                }
            }
        }
        timeout
    }
}

/// The topology collaborator: selects servers and reports the deployment snapshot.
///
/// Implementations own monitoring, latency windows, and selection timeouts; this core only
/// requires that selection respects the passed criteria, skips `deprioritized` addresses
/// when another suitable server exists, and fails with a server selection error rather than
/// blocking past the context's deadline.
pub trait Cluster: Send + Sync + 'static {
    /// The current snapshot of the deployment.
    fn description(&self) -> ClusterDescription;

    /// Selects a server matching `criteria`, preferring servers not in `deprioritized`.
    fn select_server<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
        deprioritized: &'a [ServerAddress],
        ctx: &'a OperationContext,
    ) -> BoxFuture<'a, Result<Arc<dyn Server>>>;
}

/// A selected server capable of producing channels.
pub trait Server: Send + Sync + 'static {
    /// The most recent description of this server.
    fn description(&self) -> ServerDescription;

    /// Checks out an open channel to this server.
    fn checkout<'a>(&'a self, ctx: &'a OperationContext) -> BoxFuture<'a, Result<Channel>>;
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub(crate) fn server_description(address: &str, server_type: ServerType) -> ServerDescription {
        ServerDescription {
            address: ServerAddress::parse(address),
            server_type,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            max_wire_version: Some(13),
            tags: TagSet::new(),
            average_round_trip_time: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cluster_session_timeout_is_min_across_data_bearing_servers() {
        let mut fast = test_util::server_description("a:27017", ServerType::RsPrimary);
        fast.logical_session_timeout = Some(Duration::from_secs(600));
        let slow = test_util::server_description("b:27017", ServerType::RsSecondary);
        let arbiter = ServerDescription::new(
            ServerAddress::parse("c:27017"),
            ServerType::RsArbiter,
        );

        let description = ClusterDescription {
            topology_type: TopologyType::ReplicaSet,
            servers: vec![fast, slow, arbiter],
        };
        assert_eq!(
            description.logical_session_timeout(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn missing_timeout_on_any_data_bearing_server_disables_sessions() {
        let primary = test_util::server_description("a:27017", ServerType::RsPrimary);
        let legacy = ServerDescription::new(
            ServerAddress::parse("b:27017"),
            ServerType::RsSecondary,
        );

        let description = ClusterDescription {
            topology_type: TopologyType::ReplicaSet,
            servers: vec![primary, legacy],
        };
        assert_eq!(description.logical_session_timeout(), None);
    }

    #[test]
    fn address_display_uses_default_port() {
        assert_eq!(ServerAddress::parse("Db0.Example.com").to_string(), "db0.example.com:27017");
        assert_eq!(ServerAddress::parse("db0:27018").to_string(), "db0:27018");
    }
}
