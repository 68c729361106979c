//! The retryable read and write operation executors.
//!
//! An executor drives "try, and on a qualifying transient failure, try exactly once more on
//! a different server". Transient retries are invisible to the caller except as added
//! latency: an operation either returns its result or surfaces a single error reflecting
//! the last attempt.


use bson::{Bson, Document};

use crate::{
    binding::Binding,
    channel::{Channel, ChannelSource},
    context::OperationContext,
    error::{Error, ErrorKind, Result, WriteConcernError},
    operation::{Operation, Retryability},
    session::{ClusterTime, SessionHandle, TransactionState},
};

/// Executes a read operation through the given binding, retrying it at most once.
///
/// A failed first attempt is retried only when the caller requested retry, the session is
/// not inside a transaction, the error is classified retryable, and the context still has
/// deadline budget. The retry selects a new server, excluding the one that just failed
/// where the topology allows; if the retry also fails, its own error is surfaced.
pub async fn execute_read<Op: Operation>(
    op: &mut Op,
    binding: &Binding,
    retry_requested: bool,
    ctx: &OperationContext,
) -> Result<Op::O> {
    let (out, source) = execute_read_with_source(op, binding, retry_requested, ctx).await?;
    source.dispose();
    Ok(out)
}

/// As [`execute_read`], additionally returning the channel source that served the
/// successful attempt.
///
/// This is the entry point for cursor-opening reads: the returned source targets the
/// server holding the cursor, owns its own fork of the session, and is exclusively the
/// caller's (typically a [`Cursor`](crate::cursor::Cursor)'s) to dispose.
pub async fn execute_cursor_read<Op: Operation>(
    op: &mut Op,
    binding: &Binding,
    retry_requested: bool,
    ctx: &OperationContext,
) -> Result<(Op::O, ChannelSource)> {
    execute_read_with_source(op, binding, retry_requested, ctx).await
}

async fn execute_read_with_source<Op: Operation>(
    op: &mut Op,
    binding: &Binding,
    retry_requested: bool,
    ctx: &OperationContext,
) -> Result<(Op::O, ChannelSource)> {
    let source = binding.read_channel_source(ctx).await?;
    let first_address = match source.server_description() {
        Ok(description) => description.address,
        Err(error) => {
            source.dispose();
            return Err(error);
        }
    };

    let first_error = match attempt(op, &source, ctx, None).await {
        Ok(out) => return Ok((out, source)),
        Err(error) => {
            source.dispose();
            error
        }
    };

    let in_transaction = binding.session()?.in_transaction()?;
    if !retry_requested
        || in_transaction
        || op.retryability() != Retryability::Read
        || !Retryability::Read.can_retry_error(&first_error)
        || ctx.is_timed_out()
    {
        return Err(first_error);
    }

    tracing::debug!(
        error = %first_error,
        "read failed with a retryable error; retrying on a newly selected server"
    );
    let retry_source = binding
        .read_channel_source_deprioritizing(ctx, std::slice::from_ref(&first_address))
        .await?;
    match attempt(op, &retry_source, ctx, None).await {
        Ok(out) => Ok((out, retry_source)),
        Err(error) => {
            retry_source.dispose();
            Err(error)
        }
    }
}

/// Executes a write operation through the given binding, retrying it at most once.
///
/// On top of the read retry gate, a write is only retried when the server selected for the
/// *first* attempt advertises retryable-write support and the write concern is
/// acknowledged. The retry re-sends the same command document, including the transaction
/// number assigned on the first attempt, so the server can deduplicate.
pub async fn execute_write<Op: Operation>(
    op: &mut Op,
    binding: &Binding,
    retry_requested: bool,
    ctx: &OperationContext,
) -> Result<Op::O> {
    let source = binding.write_channel_source(ctx).await?;
    let first_description = match source.server_description() {
        Ok(description) => description,
        Err(error) => {
            source.dispose();
            return Err(error);
        }
    };

    let acknowledged = op.write_concern().map_or(true, |wc| wc.is_acknowledged());
    let session = binding.session()?;
    let transaction_state = session.transaction_state()?;
    // Retry support is captured once, from the first attempt's server description; it is
    // deliberately not re-checked against the retry's server.
    let retry_eligible = retry_requested
        && acknowledged
        && op.retryability() == Retryability::Write
        && transaction_state == TransactionState::None
        && first_description.supports_retryable_writes();

    // The transaction number that lets the server recognize a re-sent write. Allocated
    // before the first attempt and reused verbatim by the retry.
    let txn_number = if retry_eligible {
        Some(session.next_txn_number()?)
    } else {
        None
    };

    let first_result = attempt(op, &source, ctx, txn_number).await;
    source.dispose();
    let first_error = match first_result {
        Ok(out) => return Ok(out),
        Err(error) => error,
    };

    if !retry_eligible
        || !Retryability::Write.can_retry_error(&first_error)
        || ctx.is_timed_out()
    {
        return Err(first_error);
    }

    tracing::debug!(
        error = %first_error,
        "write failed with a retryable error; retrying on a newly selected server"
    );
    op.update_for_retry();
    let retry_source = binding
        .write_channel_source_deprioritizing(ctx, std::slice::from_ref(&first_description.address))
        .await?;
    let retry_result = attempt(op, &retry_source, ctx, txn_number).await;
    retry_source.dispose();
    retry_result
}

/// Runs one attempt of `op` through a channel from `source`.
async fn attempt<Op: Operation>(
    op: &mut Op,
    source: &ChannelSource,
    ctx: &OperationContext,
    txn_number: Option<i64>,
) -> Result<Op::O> {
    let channel = source.channel(ctx).await?;
    let result = execute_on_channel(op, &channel, source.session()?, ctx, txn_number).await;
    channel.dispose();
    result
}

/// Builds, sends, and interprets one command over an already-acquired channel.
///
/// This is where the session's observable state rides along: `lsid`, `$clusterTime`,
/// transaction fields, and causal consistency are attached here rather than by the wire
/// encoder, and the session's clocks advance from every response.
pub(crate) async fn execute_on_channel<Op: Operation>(
    op: &mut Op,
    channel: &Channel,
    session: &SessionHandle,
    ctx: &OperationContext,
    txn_number: Option<i64>,
) -> Result<Op::O> {
    let description = channel.description()?;

    // An explicitly created session must not be silently downgraded, whether because the
    // server cannot track it or because an unacknowledged write could never report the
    // session's outcome.
    let acknowledged = op.write_concern().map_or(true, |wc| wc.is_acknowledged());
    if op.supports_sessions() && !session.is_implicit()? {
        if !description.supports_sessions() {
            return Err(ErrorKind::SessionsNotSupported.into());
        }
        if !acknowledged {
            return Err(Error::invalid_argument(
                "cannot use an explicit session with an unacknowledged write concern",
            ));
        }
    }

    // A transaction that has finished and is not being re-committed or re-aborted no longer
    // applies to commands sent with this session.
    let mut transaction_state = session.transaction_state()?;
    match transaction_state {
        TransactionState::Committed { .. } if op.name() != "commitTransaction" => {
            session.reset_transaction()?;
            transaction_state = TransactionState::None;
        }
        TransactionState::Aborted if op.name() != "abortTransaction" => {
            session.reset_transaction()?;
            transaction_state = TransactionState::None;
        }
        _ => {}
    }

    let mut cmd = op.build(&description)?;

    if cmd.supports_sessions()
        && op.supports_sessions()
        && description.supports_sessions()
        && acknowledged
    {
        cmd.set_session_id(session.id()?);
        if let Some(ref cluster_time) = session.cluster_time()? {
            cmd.set_cluster_time(cluster_time);
        }

        match transaction_state {
            TransactionState::Starting => {
                cmd.set_start_transaction();
                cmd.set_autocommit();
                cmd.set_txn_number(session.txn_number()?);
                cmd.set_statement_id(session.next_statement_id()?);
                if session.is_causally_consistent()? {
                    if let Some(operation_time) = session.operation_time()? {
                        cmd.set_after_cluster_time(operation_time);
                    }
                }
                session.transaction_started();
            }
            TransactionState::InProgress => {
                cmd.set_autocommit();
                cmd.set_txn_number(session.txn_number()?);
                cmd.set_statement_id(session.next_statement_id()?);
            }
            TransactionState::Committed { .. } | TransactionState::Aborted => {
                // A commitTransaction or abortTransaction for the transaction that was just
                // ended; it still runs under the transaction's own number.
                cmd.set_autocommit();
                cmd.set_txn_number(session.txn_number()?);
            }
            TransactionState::None => {
                if session.is_causally_consistent()? {
                    if let Some(operation_time) = session.operation_time()? {
                        cmd.set_after_cluster_time(operation_time);
                    }
                }
                if let Some(txn_number) = txn_number {
                    cmd.set_txn_number(txn_number);
                }
            }
        }
        session.update_last_use();
    }

    let response = match channel.command(ctx, cmd).await {
        Ok(response) => response,
        Err(error) => {
            if error.is_network_error() {
                session.mark_dirty();
            }
            return Err(error);
        }
    };

    let body = handle_response(session, response)?;
    op.handle_response(body)
}

/// Validates a raw response document, advancing the session's clocks, and converts
/// server-reported failures into errors.
fn handle_response(session: &SessionHandle, response: Document) -> Result<Document> {
    let ok = match response.get("ok").and_then(get_int) {
        Some(ok) => ok,
        None => {
            return Err(Error::invalid_response(
                "missing 'ok' value in server response",
            ))
        }
    };

    if let Ok(cluster_time_doc) = response.get_document("$clusterTime") {
        if let Ok(cluster_time) = bson::from_document::<ClusterTime>(cluster_time_doc.clone()) {
            session.advance_cluster_time(&cluster_time)?;
        }
    }
    if let Some(Bson::Timestamp(operation_time)) = response.get("operationTime") {
        session.advance_operation_time(*operation_time)?;
    }

    let labels = response.get_array("errorLabels").ok().map(|values| {
        values
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect::<Vec<_>>()
    });

    if ok != 1 {
        let error = match bson::from_document::<crate::error::CommandErrorBody>(response) {
            Ok(body) => body.into(),
            Err(e) => Error::invalid_response(format!(
                "error deserializing command error: {}",
                e
            )),
        };
        return Err(error);
    }

    if let Ok(wc_error_doc) = response.get_document("writeConcernError") {
        let wc_error: WriteConcernError = bson::from_document(wc_error_doc.clone())?;
        return Err(Error::new(ErrorKind::WriteConcern(wc_error), labels));
    }

    Ok(response)
}

fn get_int(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(i) => Some(i64::from(*i)),
        Bson::Int64(i) => Some(*i),
        Bson::Double(d) if (d - d.floor()).abs() <= f64::EPSILON => Some(*d as i64),
        _ => None,
    }
}
