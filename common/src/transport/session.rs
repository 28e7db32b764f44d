// Session registry
// One authenticated session per (host, port), owned explicitly rather than global

use super::{Connection, Connector, CredentialProvider};
use crate::errors::DeployError;
use crate::models::{Credential, RemoteTarget, SessionKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Session pairs a live connection with the credential that opened it
#[derive(Clone)]
pub struct Session {
    key: SessionKey,
    connection: Arc<dyn Connection>,
    credential: Credential,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

/// SessionLease is a session borrowed for one operation
///
/// Cached sessions stay open when the lease is released; ephemeral ones
/// (per-call mode) are closed.
pub struct SessionLease {
    session: Session,
    ephemeral: bool,
}

impl SessionLease {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn release(self) {
        if self.ephemeral {
            debug!(session = %self.session.key, "Closing per-call session");
            self.session.connection.close().await;
        }
    }
}

/// SessionRegistry caches authenticated sessions and credentials per (host, port)
///
/// The registry is the only shared mutable state of the transport layer. Its
/// owner must call [`SessionRegistry::shutdown`] on every exit path.
pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    sessions: Mutex<HashMap<SessionKey, Session>>,
    secrets: Mutex<HashMap<SessionKey, Credential>>,
    reuse_sessions: bool,
    handshakes: AtomicUsize,
}

impl SessionRegistry {
    /// Create a registry that reuses one session per (host, port)
    pub fn new(connector: Arc<dyn Connector>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            connector,
            credentials,
            sessions: Mutex::new(HashMap::new()),
            secrets: Mutex::new(HashMap::new()),
            reuse_sessions: true,
            handshakes: AtomicUsize::new(0),
        }
    }

    /// Switch command/transfer leases to a fresh connection per call
    pub fn with_session_reuse(mut self, reuse_sessions: bool) -> Self {
        self.reuse_sessions = reuse_sessions;
        self
    }

    /// Return the cached session for `target`, connecting on first use
    ///
    /// The credential is requested at most once per (host, port) while a
    /// session is cached. A failed connection is not retried here and its
    /// credential is forgotten so the next call prompts again.
    #[instrument(skip(self, target), fields(target = %target))]
    pub async fn session(&self, target: &RemoteTarget) -> Result<Session, DeployError> {
        let key = target.session_key();
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&key) {
            debug!(session = %key, "Reusing cached session");
            return Ok(existing.clone());
        }

        let session = self.open(target, &key).await?;
        sessions.insert(key.clone(), session.clone());
        info!(session = %key, "Session established and cached");
        Ok(session)
    }

    /// Borrow a session for one operation, honouring the reuse policy
    pub async fn lease(&self, target: &RemoteTarget) -> Result<SessionLease, DeployError> {
        if self.reuse_sessions {
            return Ok(SessionLease {
                session: self.session(target).await?,
                ephemeral: false,
            });
        }

        let key = target.session_key();
        let session = self.open(target, &key).await?;
        Ok(SessionLease {
            session,
            ephemeral: true,
        })
    }

    async fn open(&self, target: &RemoteTarget, key: &SessionKey) -> Result<Session, DeployError> {
        let credential = self.credential(target).await?;

        self.handshakes.fetch_add(1, Ordering::SeqCst);
        match self.connector.connect(target, &credential).await {
            Ok(connection) => Ok(Session {
                key: key.clone(),
                connection,
                credential,
            }),
            Err(e) => {
                warn!(session = %key, error = %e, "Connection attempt failed");
                if matches!(e, DeployError::Auth { .. }) {
                    self.secrets.lock().await.remove(key);
                }
                Err(e)
            }
        }
    }

    /// Credential for `target`, prompting the provider at most once per (host, port)
    pub async fn credential(&self, target: &RemoteTarget) -> Result<Credential, DeployError> {
        let key = target.session_key();
        let mut secrets = self.secrets.lock().await;
        if let Some(credential) = secrets.get(&key) {
            return Ok(credential.clone());
        }

        let credential = self.credentials.credential(target).await?;
        secrets.insert(key, credential.clone());
        Ok(credential)
    }

    /// Return a lease once its operation finished
    ///
    /// A cached session that failed with a connection error is dropped from
    /// the cache and closed, so the next call reconnects with the cached
    /// credential instead of reusing a dead transport (e.g. after a reboot).
    pub async fn release_after<T>(&self, lease: SessionLease, outcome: &Result<T, DeployError>) {
        let broken = matches!(outcome, Err(DeployError::Connection { .. }));
        if !broken || lease.ephemeral {
            lease.release().await;
            return;
        }

        let evicted = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&lease.session.key) {
                Some(cached) if Arc::ptr_eq(&cached.connection, &lease.session.connection) => {
                    sessions.remove(&lease.session.key)
                }
                _ => None,
            }
        };
        if let Some(session) = evicted {
            warn!(session = %session.key, "Evicting broken session");
            session.connection.close().await;
        }
    }

    /// Number of connection handshakes attempted so far
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Number of sessions currently cached
    pub async fn open_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Close every cached session and forget all credentials
    ///
    /// Close errors are swallowed; calling this twice is harmless.
    pub async fn shutdown(&self) {
        let drained: Vec<Session> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();

        for session in &drained {
            debug!(session = %session.key, "Closing cached session");
            session.connection.close().await;
        }
        self.secrets.lock().await.clear();

        if !drained.is_empty() {
            info!(closed = drained.len(), "All cached sessions closed");
        }
    }
}
