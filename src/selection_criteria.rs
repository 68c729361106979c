use std::{collections::HashMap, sync::Arc};

use derive_where::derive_where;
use typed_builder::TypedBuilder;

use crate::topology::{ServerAddress, ServerDescription, ServerType};

/// Describes which servers are suitable for a given operation.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type and
    /// server tags.
    #[display("ReadPreference {}", _0)]
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    #[display("Custom predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    /// Criteria matching only the server at the given address.
    pub fn from_address(address: ServerAddress) -> Self {
        Self::Predicate(Arc::new(move |server| server.address == address))
    }

    /// Criteria matching any server that can accept writes.
    pub fn writable() -> Self {
        Self::Predicate(Arc::new(|server| server.server_type.is_writable()))
    }

    /// Coarse suitability filter for `Cluster` implementations: whether `server` satisfies
    /// these criteria based on its type and tags alone. Latency windows and staleness are
    /// the selecting cluster's concern.
    pub fn matches(&self, server: &ServerDescription) -> bool {
        match self {
            Self::ReadPreference(read_pref) => read_pref.matches(server),
            Self::Predicate(predicate) => predicate(server),
        }
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerDescription) -> bool>;

/// Specifies how a read operation should be routed to the members of a deployment.
///
/// If applicable, `tag_sets` can be used to target specific nodes of a replica set.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary { options: ReadPreferenceOptions },

    /// Route this operation to the primary if it's available, but fall back to the
    /// secondaries if not.
    PrimaryPreferred { options: ReadPreferenceOptions },

    /// Route this operation to a secondary if one is available, but fall back to the
    /// primary if not.
    SecondaryPreferred { options: ReadPreferenceOptions },

    /// Route this operation to the node with the least network latency regardless of
    /// whether it's the primary or a secondary.
    Nearest { options: ReadPreferenceOptions },
}

impl std::fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ Mode: {}", self.mode())?;
        if let Some(options) = self.options() {
            if let Some(ref tag_sets) = options.tag_sets {
                write!(f, ", Tag Sets: {:?}", tag_sets)?;
            }
        }
        write!(f, " }}")
    }
}

/// Specifies read preference options for non-primary read preferences.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag
    /// set will be checked in order until one or more servers is found with each tag in the
    /// set.
    pub tag_sets: Option<Vec<TagSet>>,
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => Some(options),
        }
    }

    fn matches(&self, server: &ServerDescription) -> bool {
        // Single-server and load balanced deployments ignore read preference modes.
        if matches!(
            server.server_type,
            ServerType::Standalone | ServerType::ShardRouter | ServerType::LoadBalancer
        ) {
            return true;
        }

        let type_matches = match self {
            Self::Primary => server.server_type == ServerType::RsPrimary,
            Self::Secondary { .. } => server.server_type == ServerType::RsSecondary,
            Self::PrimaryPreferred { .. } | Self::SecondaryPreferred { .. } | Self::Nearest { .. } => {
                matches!(
                    server.server_type,
                    ServerType::RsPrimary | ServerType::RsSecondary
                )
            }
        };

        type_matches && self.tags_match(server)
    }

    fn tags_match(&self, server: &ServerDescription) -> bool {
        let tag_sets = match self.options().and_then(|o| o.tag_sets.as_ref()) {
            Some(tag_sets) if !tag_sets.is_empty() => tag_sets,
            _ => return true,
        };
        tag_sets.iter().any(|tag_set| {
            tag_set
                .iter()
                .all(|(key, value)| server.tags.get(key) == Some(value))
        })
    }
}

/// A read preference tag set: replica set members carrying every tag in one of the
/// requested sets are eligible for the read.
pub type TagSet = HashMap<String, String>;
