//! Conversation Store: durable, per-identity message history.
//!
//! Every operation on one identity is mutually exclusive with every other
//! operation on that identity; different identities never wait on each other
//! beyond the few microseconds a single SQL statement holds the connection.
//!
//! A whole conversation turn can hold an identity's lock by taking a
//! [`ConversationHandle`] from [`ConversationStore::lock`]. The handle is the
//! only way to read or write that identity while it is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

use super::database::HistoryDatabase;
use super::errors::AgentError;
use super::tokens::TokenBudgeter;
use super::types::StoredMessage;
use crate::inference::types::Role;

/// Lock-map size above which idle identity locks are pruned.
const LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Keyed, durable conversation history.
pub struct ConversationStore {
    db: Mutex<HistoryDatabase>,
    budgeter: TokenBudgeter,
    locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl ConversationStore {
    /// Open the backing database at `path` (`":memory:"` for tests).
    pub fn open(path: &str, budgeter: TokenBudgeter) -> Result<Self, AgentError> {
        let db = HistoryDatabase::open(path)?;
        Ok(Self::new(db, budgeter))
    }

    pub fn new(db: HistoryDatabase, budgeter: TokenBudgeter) -> Self {
        Self {
            db: Mutex::new(db),
            budgeter,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn identity_lock(&self, identity: &str) -> Result<Arc<TokioMutex<()>>, AgentError> {
        let mut locks = self.locks.lock().map_err(|e| AgentError::PersistenceError {
            reason: format!("lock map poisoned: {e}"),
        })?;
        if locks.len() > LOCK_PRUNE_THRESHOLD {
            // Only the map holds an idle lock's Arc.
            locks.retain(|key, lock| key == identity || Arc::strong_count(lock) > 1);
        }
        Ok(Arc::clone(
            locks
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(()))),
        ))
    }

    /// Take exclusive access to one identity's history.
    ///
    /// Waits while another holder (a running turn, a clear) has it.
    pub async fn lock(&self, identity: &str) -> Result<ConversationHandle<'_>, AgentError> {
        let lock = self.identity_lock(identity)?;
        let guard = lock.lock_owned().await;
        Ok(ConversationHandle {
            store: self,
            identity: identity.to_string(),
            _guard: guard,
        })
    }

    /// Append one message, persisted before this returns.
    pub async fn append(
        &self,
        identity: &str,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage, AgentError> {
        self.lock(identity).await?.append(role, content)
    }

    /// Append with a role given as text. Fails with `InvalidRole` for
    /// anything but system/user/assistant/tool.
    pub async fn append_raw(
        &self,
        identity: &str,
        role: &str,
        content: &str,
    ) -> Result<StoredMessage, AgentError> {
        let role = Role::parse(role).ok_or_else(|| AgentError::InvalidRole {
            role: role.to_string(),
        })?;
        self.append(identity, role, content).await
    }

    /// Snapshot of the history, or of its last `limit` messages.
    pub async fn read(
        &self,
        identity: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, AgentError> {
        self.lock(identity).await?.read(limit)
    }

    /// Empty the history for `identity`.
    pub async fn clear(&self, identity: &str) -> Result<usize, AgentError> {
        self.lock(identity).await?.clear()
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&HistoryDatabase) -> Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        let db = self.db.lock().map_err(|e| AgentError::PersistenceError {
            reason: format!("database mutex poisoned: {e}"),
        })?;
        f(&db)
    }
}

// ─── ConversationHandle ─────────────────────────────────────────────────────

/// Exclusive access to one identity's history; released on drop.
pub struct ConversationHandle<'a> {
    store: &'a ConversationStore,
    identity: String,
    _guard: OwnedMutexGuard<()>,
}

impl ConversationHandle<'_> {
    pub fn append(&self, role: Role, content: &str) -> Result<StoredMessage, AgentError> {
        let tokens = self.store.budgeter.count(content);
        let stored = self
            .store
            .with_db(|db| db.insert_message(&self.identity, role, content, tokens))?;
        tracing::debug!(
            identity = %self.identity,
            role = %role,
            chars = content.chars().count(),
            tokens,
            "message appended"
        );
        Ok(stored)
    }

    pub fn read(&self, limit: Option<usize>) -> Result<Vec<StoredMessage>, AgentError> {
        self.store.with_db(|db| match limit {
            Some(n) => db.get_recent_messages(&self.identity, n),
            None => db.get_messages(&self.identity),
        })
    }

    pub fn clear(&self) -> Result<usize, AgentError> {
        let removed = self
            .store
            .with_db(|db| db.clear_conversation(&self.identity))?;
        tracing::info!(identity = %self.identity, removed, "conversation cleared");
        Ok(removed)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
