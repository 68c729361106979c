use std::time::Duration;

use bson::{doc, Document};

use crate::{
    channel::Command,
    concern::WriteConcern,
    error::Result,
    operation::{Operation, Retryability},
    selection_criteria::{ReadPreference, SelectionCriteria},
    topology::ServerDescription,
};

const ADMIN_DB: &str = "admin";
const COMMIT_RETRY_W_TIMEOUT: Duration = Duration::from_secs(10);

/// Commits the transaction currently active on a session.
#[derive(Debug)]
pub struct CommitTransaction {
    write_concern: Option<WriteConcern>,
    max_commit_time: Option<Duration>,
    selection_criteria: SelectionCriteria,
}

impl CommitTransaction {
    /// Creates a commit for a transaction started with the given options.
    pub fn new(write_concern: Option<WriteConcern>, max_commit_time: Option<Duration>) -> Self {
        Self {
            write_concern,
            max_commit_time,
            selection_criteria: SelectionCriteria::ReadPreference(ReadPreference::Primary),
        }
    }
}

impl Operation for CommitTransaction {
    type O = ();

    fn name(&self) -> &str {
        "commitTransaction"
    }

    fn build(&mut self, _description: &ServerDescription) -> Result<Command> {
        let mut body = doc! { "commitTransaction": 1 };
        if let Some(ref wc) = self.write_concern {
            body.insert("writeConcern", wc.to_document());
        }
        if let Some(max_commit_time) = self.max_commit_time {
            body.insert(
                "maxTimeMS",
                i32::try_from(max_commit_time.as_millis()).unwrap_or(i32::MAX),
            );
        }
        Ok(Command::new(self.name(), ADMIN_DB, body))
    }

    fn handle_response(&self, _response: Document) -> Result<Self::O> {
        Ok(())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }

    /// A retried commit must use a majority write concern with a bounded `wtimeout` so the
    /// server does not wait indefinitely for a write concern the first attempt may already
    /// have satisfied.
    fn update_for_retry(&mut self) {
        let mut wc = self.write_concern.take().unwrap_or_default();
        wc.w = Some(crate::concern::Acknowledgment::Majority);
        if wc.w_timeout.is_none() {
            wc.w_timeout = Some(COMMIT_RETRY_W_TIMEOUT);
        }
        self.write_concern = Some(wc);
    }
}

/// Aborts the transaction currently active on a session.
#[derive(Debug)]
pub struct AbortTransaction {
    write_concern: Option<WriteConcern>,
    selection_criteria: SelectionCriteria,
}

impl AbortTransaction {
    /// Creates an abort for a transaction started with the given write concern.
    pub fn new(write_concern: Option<WriteConcern>) -> Self {
        Self {
            write_concern,
            selection_criteria: SelectionCriteria::ReadPreference(ReadPreference::Primary),
        }
    }
}

impl Operation for AbortTransaction {
    type O = ();

    fn name(&self) -> &str {
        "abortTransaction"
    }

    fn build(&mut self, _description: &ServerDescription) -> Result<Command> {
        let mut body = doc! { "abortTransaction": 1 };
        if let Some(ref wc) = self.write_concern {
            body.insert("writeConcern", wc.to_document());
        }
        Ok(Command::new(self.name(), ADMIN_DB, body))
    }

    fn handle_response(&self, _response: Document) -> Result<Self::O> {
        Ok(())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        concern::Acknowledgment,
        topology::{test_util::server_description, ServerType},
    };

    #[test]
    fn commit_retry_upgrades_write_concern() {
        let mut op = CommitTransaction::new(None, None);
        op.update_for_retry();

        let description = server_description("db0:27017", ServerType::RsPrimary);
        let cmd = op.build(&description).unwrap();
        assert_eq!(cmd.target_db, "admin");
        assert_eq!(
            cmd.body.get_document("writeConcern").unwrap(),
            &doc! { "w": "majority", "wtimeout": 10_000i64 }
        );
    }

    #[test]
    fn abort_carries_transaction_write_concern() {
        let wc = WriteConcern::builder().w(Acknowledgment::Majority).build();
        let mut op = AbortTransaction::new(Some(wc));
        let description = server_description("db0:27017", ServerType::RsPrimary);
        let cmd = op.build(&description).unwrap();
        assert_eq!(cmd.body.get_i32("abortTransaction").unwrap(), 1);
        assert_eq!(
            cmd.body.get_document("writeConcern").unwrap(),
            &doc! { "w": "majority" }
        );
    }
}
