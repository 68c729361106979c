use std::future::Future;

/// Spawn a task in the background to run a future.
///
/// Must be called from a task running on a tokio runtime; used for best-effort cleanup
/// work that outlives the value that scheduled it (e.g. a dropped cursor's `killCursors`).
pub(crate) fn spawn<F, O>(fut: F)
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(fut);
    } else {
        tracing::debug!("no active runtime; background cleanup task dropped");
    }
}
