//! Contains the write concern type this core consults when deciding whether a write may be
//! acknowledged (and therefore retried).

use std::time::Duration;

use bson::{doc, Bson, Document};
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Specifies the level of acknowledgement requested from the server for a write operation.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct WriteConcern {
    /// Requests acknowledgement that the operation has propagated to a specific number or
    /// variety of servers.
    pub w: Option<Acknowledgment>,

    /// Specifies a time limit for the write concern to be satisfied.
    pub w_timeout: Option<Duration>,

    /// Requests acknowledgement that the operation has propagated to the on-disk journal.
    pub journal: Option<bool>,
}

/// The level of acknowledgment requested from the server for a write operation.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Requires acknowledgement that the write has reached the specified number of nodes.
    ///
    /// A value of zero requests no acknowledgment at all ("fire and forget").
    Nodes(u32),

    /// Requires acknowledgement that the write has reached the majority of nodes.
    Majority,

    /// Requires acknowledgement according to a custom write concern defined on the
    /// deployment.
    Custom(String),
}

impl From<u32> for Acknowledgment {
    fn from(i: u32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            Acknowledgment::Custom(s)
        }
    }
}

impl From<&Acknowledgment> for Bson {
    fn from(ack: &Acknowledgment) -> Self {
        match ack {
            Acknowledgment::Nodes(i) => Bson::Int32(*i as i32),
            Acknowledgment::Majority => Bson::String("majority".to_string()),
            Acknowledgment::Custom(s) => Bson::String(s.clone()),
        }
    }
}

impl WriteConcern {
    /// A write concern requesting majority acknowledgment.
    pub fn majority() -> Self {
        Self::builder().w(Acknowledgment::Majority).build()
    }

    /// A write concern requesting no acknowledgment at all.
    pub fn unacknowledged() -> Self {
        Self::builder().w(Acknowledgment::Nodes(0)).build()
    }

    /// Whether the server will acknowledge this write. Unacknowledged writes cannot report
    /// failure and are never eligible for retry.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// Validates that the write concern is self-consistent.
    pub fn validate(&self) -> Result<()> {
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(Error::invalid_argument(
                "write concern cannot have w=0 and journal=true",
            ));
        }
        Ok(())
    }

    /// The `writeConcern` sub-document carried in commands.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! {};
        if let Some(ref w) = self.w {
            doc.insert("w", Bson::from(w));
        }
        if let Some(w_timeout) = self.w_timeout {
            doc.insert("wtimeout", w_timeout.as_millis() as i64);
        }
        if let Some(journal) = self.journal {
            doc.insert("j", journal);
        }
        doc
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn w_zero_is_unacknowledged() {
        assert!(!WriteConcern::unacknowledged().is_acknowledged());
        assert!(WriteConcern::majority().is_acknowledged());
        assert!(WriteConcern::default().is_acknowledged());
        assert!(WriteConcern::builder()
            .w(Acknowledgment::Nodes(0))
            .journal(true)
            .build()
            .is_acknowledged());
    }

    #[test]
    fn w_zero_with_journal_is_invalid() {
        let wc = WriteConcern::builder()
            .w(Acknowledgment::Nodes(0))
            .journal(true)
            .build();
        assert!(wc.validate().unwrap_err().is_invalid_argument());
        assert!(WriteConcern::majority().validate().is_ok());
    }

    #[test]
    fn document_shape() {
        let wc = WriteConcern::builder()
            .w(Acknowledgment::Majority)
            .w_timeout(Duration::from_secs(5))
            .build();
        assert_eq!(
            wc.to_document(),
            doc! { "w": "majority", "wtimeout": 5000i64 }
        );
    }
}
