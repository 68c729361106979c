use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};

/// Struct modeling a cluster time reported by the server.
///
/// Cluster times only ever move forward; see [`advance_cluster_time`](crate::session::SessionHandle::advance_cluster_time).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    pub(crate) signature: Document,
}

impl ClusterTime {
    /// The server-reported timestamp component of this cluster time.
    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }
}

// The key signature is opaque to ordering and equality; two cluster times compare by
// timestamp alone.
impl PartialEq for ClusterTime {
    fn eq(&self, other: &Self) -> bool {
        self.cluster_time == other.cluster_time
    }
}

impl Eq for ClusterTime {}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        self.cluster_time.cmp(&other.cluster_time)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
