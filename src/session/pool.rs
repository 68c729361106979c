use std::{
    collections::VecDeque,
    sync::Mutex,
    time::Duration,
};

use super::ServerSession;
#[cfg(test)]
use bson::Document;

/// A pool of server sessions, ordered from most to least recently checked in.
///
/// The pool is self-pruning: both checkout and checkin discard sessions that are about to
/// expire, so no background sweep is needed.
#[derive(Debug, Default)]
pub struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks out a server session from the pool, discarding any about-to-expire sessions
    /// encountered along the way. If no usable session remains, a fresh one is created.
    pub(crate) fn check_out(&self, logical_session_timeout: Option<Duration>) -> ServerSession {
        let mut pool = self.pool.lock().unwrap();
        while let Some(session) = pool.pop_front() {
            // Sessions about to expire within the safety margin are discarded rather than
            // handed out.
            if session.is_about_to_expire(logical_session_timeout) {
                tracing::debug!("discarding server session that is about to expire");
                continue;
            }
            return session;
        }
        ServerSession::new()
    }

    /// Checks a server session back in to the pool. Dirty and about-to-expire sessions are
    /// discarded instead of pooled.
    ///
    /// Before checking in, about-to-expire sessions are evicted from the stale end of the
    /// pool.
    pub(crate) fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().unwrap();
        while let Some(pooled_session) = pool.pop_back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                tracing::debug!("evicting expired server session from the pool");
                continue;
            }
            pool.push_back(pooled_session);
            break;
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &Document) -> bool {
        self.pool.lock().unwrap().iter().any(|s| &s.id == id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}
