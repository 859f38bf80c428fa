//! Session registry for reverse tunnel routing
//!
//! Tracks the live multiplexed sessions registered under each agent
//! identity and hands out tunnel streams for proxied requests. Agents may
//! disconnect silently (crash, network partition) without a clean close, so
//! liveness is inferred the only reliable way: a failed stream-open. Dead
//! sessions are evicted lazily at that point and the acquire retries
//! against the remaining ones.

use burrow_transport::TunnelConnection;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no session registered for '{identity}'")]
    NoSessionAvailable { identity: String },
}

/// Registry of live tunnel sessions, keyed by agent identity.
///
/// Multiple sessions may share one identity (several agent processes
/// advertising the same logical backend); selection among them is uniformly
/// random with no affinity. All map access goes through one registry-wide
/// mutex; the critical sections are cheap map operations only, and the
/// blocking stream-open runs outside the lock so a dead session on one
/// identity cannot stall dispatch for another.
#[derive(Debug)]
pub struct SessionRegistry<C: TunnelConnection> {
    sessions: Mutex<HashMap<String, Vec<Arc<C>>>>,
}

impl<C: TunnelConnection> SessionRegistry<C> {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session under `identity`.
    ///
    /// Appends to the identity's session list; never fails. The session is
    /// assumed usable until an operation on it fails.
    pub fn register(&self, identity: &str, session: Arc<C>) {
        let mut sessions = self.sessions.lock().unwrap();
        let list = sessions.entry(identity.to_string()).or_default();
        list.push(session.clone());

        tracing::info!(
            identity = %identity,
            connection_id = %session.connection_id(),
            session_count = list.len(),
            "Registered tunnel session"
        );
    }

    /// Acquire a usable stream from some live session registered under
    /// `identity`.
    ///
    /// Picks a session uniformly at random and tries to open a stream on
    /// it. If the open fails (typically because the underlying connection
    /// died), the session is closed, removed, and the pick retries against
    /// the shortened list, terminating with
    /// [`RegistryError::NoSessionAvailable`] once the list empties.
    pub async fn acquire(&self, identity: &str) -> Result<C::Stream, RegistryError> {
        loop {
            let session = self
                .pick(identity)
                .ok_or_else(|| RegistryError::NoSessionAvailable {
                    identity: identity.to_string(),
                })?;

            match session.open_stream().await {
                Ok(stream) => {
                    tracing::debug!(
                        identity = %identity,
                        connection_id = %session.connection_id(),
                        "Acquired tunnel stream"
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::warn!(
                        identity = %identity,
                        connection_id = %session.connection_id(),
                        error = %e,
                        "Evicting session after failed stream open"
                    );
                    session.close("stream open failed").await;
                    self.evict(identity, &session);
                }
            }
        }
    }

    /// Number of sessions currently registered for `identity`
    pub fn session_count(&self, identity: &str) -> usize {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(identity).map(Vec::len).unwrap_or(0)
    }

    /// Pick one session for `identity` uniformly at random
    fn pick(&self, identity: &str) -> Option<Arc<C>> {
        let sessions = self.sessions.lock().unwrap();
        let list = sessions.get(identity)?;
        if list.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..list.len());
        Some(list[idx].clone())
    }

    /// Remove one specific session, pruning the identity entry if it ends
    /// up empty (an identity with zero sessions is equivalent to an absent
    /// key).
    fn evict(&self, identity: &str, session: &Arc<C>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(list) = sessions.get_mut(identity) {
            list.retain(|candidate| !Arc::ptr_eq(candidate, session));
            if list.is_empty() {
                sessions.remove(identity);
            }
        }
    }
}

impl<C: TunnelConnection> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use burrow_transport::{TransportError, TransportResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::DuplexStream;

    /// Tunnel connection whose streams are in-memory pipes; can be killed
    /// to make stream opens fail the way a dead WebSocket does.
    #[derive(Debug)]
    struct FakeConnection {
        id: String,
        alive: AtomicBool,
        opens: AtomicUsize,
    }

    impl FakeConnection {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                alive: AtomicBool::new(true),
                opens: AtomicUsize::new(0),
            })
        }

        fn dead(id: &str) -> Arc<Self> {
            let conn = Self::new(id);
            conn.alive.store(false, Ordering::SeqCst);
            conn
        }

        fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TunnelConnection for FakeConnection {
        type Stream = DuplexStream;

        async fn open_stream(&self) -> TransportResult<DuplexStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if !self.alive.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionClosed);
            }
            let (local, _remote) = tokio::io::duplex(64);
            Ok(local)
        }

        async fn accept_stream(&self) -> TransportResult<Option<DuplexStream>> {
            Ok(None)
        }

        async fn close(&self, _reason: &str) {
            self.alive.store(false, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            !self.alive.load(Ordering::SeqCst)
        }

        fn connection_id(&self) -> String {
            self.id.clone()
        }
    }

    #[tokio::test]
    async fn acquire_unknown_identity_fails_fast() {
        let registry: SessionRegistry<FakeConnection> = SessionRegistry::new();

        let err = registry.acquire("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::NoSessionAvailable { ref identity } if identity == "ghost"
        ));
    }

    #[tokio::test]
    async fn register_then_acquire_succeeds() {
        let registry = SessionRegistry::new();
        let conn = FakeConnection::new("conn-1");

        registry.register("myid", conn.clone());
        assert_eq!(registry.session_count("myid"), 1);

        registry.acquire("myid").await.unwrap();
        assert_eq!(conn.open_count(), 1);
        // Session survives a successful acquire
        assert_eq!(registry.session_count("myid"), 1);
    }

    #[tokio::test]
    async fn dead_session_is_evicted_exactly_once() {
        let registry = SessionRegistry::new();
        let conn = FakeConnection::dead("conn-dead");

        registry.register("myid", conn.clone());
        assert_eq!(registry.session_count("myid"), 1);

        // One dead session: the open fails, the session is evicted, and the
        // now-empty list means NoSessionAvailable -- within this one call.
        let err = registry.acquire("myid").await.unwrap_err();
        assert!(matches!(err, RegistryError::NoSessionAvailable { .. }));
        assert_eq!(registry.session_count("myid"), 0);
        assert_eq!(conn.open_count(), 1);
    }

    #[tokio::test]
    async fn acquire_retries_past_dead_sessions() {
        let registry = SessionRegistry::new();
        let dead = FakeConnection::dead("conn-dead");
        let live = FakeConnection::new("conn-live");

        registry.register("myid", dead.clone());
        registry.register("myid", live.clone());

        // Every acquire succeeds; the dead session is gone after it is
        // first selected, and never selected again.
        for _ in 0..20 {
            registry.acquire("myid").await.unwrap();
        }
        assert_eq!(registry.session_count("myid"), 1);
        assert!(dead.open_count() <= 1);
        assert!(live.open_count() >= 20);
    }

    #[tokio::test]
    async fn selection_is_roughly_uniform() {
        let registry = SessionRegistry::new();
        let conns: Vec<_> = (0..3)
            .map(|i| {
                let conn = FakeConnection::new(&format!("conn-{}", i));
                registry.register("myid", conn.clone());
                conn
            })
            .collect();

        for _ in 0..300 {
            registry.acquire("myid").await.unwrap();
        }

        // Expect ~100 picks each; generous bounds to keep the test stable
        for conn in &conns {
            let picks = conn.open_count();
            assert!(
                (50..=170).contains(&picks),
                "session {} picked {} times",
                conn.connection_id(),
                picks
            );
        }
    }

    #[tokio::test]
    async fn reregistration_restores_service() {
        let registry = SessionRegistry::new();
        registry.register("myid", FakeConnection::dead("conn-old"));

        let err = registry.acquire("myid").await.unwrap_err();
        assert!(matches!(err, RegistryError::NoSessionAvailable { .. }));

        registry.register("myid", FakeConnection::new("conn-new"));
        registry.acquire("myid").await.unwrap();
    }

    #[tokio::test]
    async fn identities_are_independent() {
        let registry = SessionRegistry::new();
        registry.register("alpha", FakeConnection::dead("conn-a"));
        registry.register("beta", FakeConnection::new("conn-b"));

        assert!(registry.acquire("alpha").await.is_err());
        assert!(registry.acquire("beta").await.is_ok());
    }
}
