//! Contains the options structs consumed by sessions and transactions.

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::concern::WriteConcern;

/// Contains the options that can be used to create a new session.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct SessionOptions {
    /// If true, all read operations performed using this session will share the underlying
    /// causal consistency guarantees. Defaults to true for explicitly created sessions.
    pub causal_consistency: Option<bool>,

    /// The default options to use for transactions started on this session.
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Contains the options that can be used for a transaction.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct TransactionOptions {
    /// The write concern to use when committing or aborting a transaction.
    pub write_concern: Option<WriteConcern>,

    /// The maximum amount of time to allow a single commit command to run.
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    /// Fill unset fields from `defaults`.
    pub(crate) fn merge(&mut self, defaults: &TransactionOptions) {
        if self.write_concern.is_none() {
            self.write_concern = defaults.write_concern.clone();
        }
        if self.max_commit_time.is_none() {
            self.max_commit_time = defaults.max_commit_time;
        }
    }
}
