use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::session::SessionInfo;
use super::SessionState;
use crate::error_handling::types::SessionError;

struct Entry {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// Tracks every live session and owns the handle to terminate it.
///
/// The registry enforces the concurrent-session cap at admission and
/// serves operational queries; the proxies themselves keep it updated as
/// they move through their lifecycle.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Entry>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admits a session and hands back its cancellation token. Fails when
    /// the concurrency cap is reached.
    pub fn register(&self, info: SessionInfo) -> Result<CancellationToken, SessionError> {
        let mut sessions = self.lock();
        if sessions.len() >= self.max_sessions {
            warn!(
                "[{}] Session limit of {} reached, refusing connection from {}",
                info.id, self.max_sessions, info.peer_addr
            );
            return Err(SessionError::SessionLimitReached);
        }
        let cancel = CancellationToken::new();
        let id = info.id;
        sessions.insert(
            id,
            Entry {
                info,
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    pub fn remove(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    pub fn update_state(&self, id: Uuid, state: SessionState) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.info.state = state;
        }
    }

    pub fn set_username(&self, id: Uuid, username: &str) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.info.username = Some(username.to_string());
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Snapshot of every live session, for operational queries.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.lock().values().map(|e| e.info.clone()).collect()
    }

    pub fn get(&self, id: Uuid) -> Option<SessionInfo> {
        self.lock().get(&id).map(|e| e.info.clone())
    }

    /// Cancels one session. The proxy observes the token and tears down
    /// through its normal closing path.
    pub fn force_terminate(&self, id: Uuid) -> Result<(), SessionError> {
        let sessions = self.lock();
        let entry = sessions.get(&id).ok_or(SessionError::NotFound)?;
        info!("[{}] Termination requested", id);
        entry.cancel.cancel();
        Ok(())
    }

    /// Cancels every live session, for shutdown drains.
    pub fn terminate_all(&self) {
        let sessions = self.lock();
        if !sessions.is_empty() {
            info!("Terminating {} live sessions", sessions.len());
        }
        for entry in sessions.values() {
            entry.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn info(id: Uuid) -> SessionInfo {
        let peer: SocketAddr = "203.0.113.9:40022".parse().unwrap();
        SessionInfo::new(id, peer)
    }

    #[test]
    fn register_enforces_the_cap() {
        let registry = SessionRegistry::new(2);
        registry.register(info(Uuid::new_v4())).unwrap();
        let second = Uuid::new_v4();
        registry.register(info(second)).unwrap();
        assert!(matches!(
            registry.register(info(Uuid::new_v4())),
            Err(SessionError::SessionLimitReached)
        ));
        // Removal frees a slot.
        registry.remove(second);
        assert!(registry.register(info(Uuid::new_v4())).is_ok());
    }

    #[test]
    fn state_and_username_updates_are_visible_in_snapshots() {
        let registry = SessionRegistry::new(8);
        let id = Uuid::new_v4();
        registry.register(info(id)).unwrap();
        registry.update_state(id, SessionState::Relaying);
        registry.set_username(id, "root");

        let snapshot = registry.get(id).unwrap();
        assert_eq!(snapshot.state, SessionState::Relaying);
        assert_eq!(snapshot.username.as_deref(), Some("root"));
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn force_terminate_cancels_the_session_token() {
        let registry = SessionRegistry::new(8);
        let id = Uuid::new_v4();
        let cancel = registry.register(info(id)).unwrap();
        assert!(!cancel.is_cancelled());

        registry.force_terminate(id).unwrap();
        cancel.cancelled().await;

        assert!(matches!(
            registry.force_terminate(Uuid::new_v4()),
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn a_thousand_concurrent_sessions_register_and_drain() {
        let registry = Arc::new(SessionRegistry::new(1000));
        let mut workers = Vec::new();
        for _ in 0..1000 {
            let registry = Arc::clone(&registry);
            workers.push(tokio::spawn(async move {
                let id = Uuid::new_v4();
                let _cancel = registry.register(info(id)).unwrap();
                registry.update_state(id, SessionState::Relaying);
                tokio::task::yield_now().await;
                registry.remove(id);
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }
        assert_eq!(registry.count(), 0);
    }
}
