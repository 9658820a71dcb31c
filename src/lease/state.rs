//! In-memory snapshot of one merge group's queue.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lease::request::{Request, Status};
use crate::storage::{StateObject, StorageError};

/// The queue state of a single merge group.
///
/// `acquired` is stored as the head SHA of the winning request rather than an
/// aliased copy of the record: the live record stays in `known` and is looked
/// up on demand, so rehydration cannot produce two diverging copies of the
/// same request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderState {
    pub(crate) id: String,
    pub(crate) last_updated_at: DateTime<Utc>,
    pub(crate) acquired_sha: Option<String>,
    pub(crate) known: HashMap<String, Request>,
    /// Number of acquire evaluations the current election has been delayed
    /// by. Deliberately not persisted; a restart restarts the countdown.
    pub(crate) delay_counter: u32,
}

impl ProviderState {
    pub fn new(id: impl Into<String>, last_updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            last_updated_at,
            acquired_sha: None,
            known: HashMap::new(),
            delay_counter: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn last_updated_at(&self) -> DateTime<Utc> {
        self.last_updated_at
    }

    /// The request currently holding the lease, if any.
    ///
    /// Returns `None` when nothing is acquired, and also while the acquired
    /// SHA references a request already dropped from `known` (the window
    /// after a failed holder was released but siblings remain).
    pub fn acquired_request(&self) -> Option<&Request> {
        self.acquired_sha.as_ref().and_then(|sha| self.known.get(sha))
    }
}

/// Persisted form of a request. Unlike the wire format this keeps
/// `last_seen_at` (the TTL bookkeeping must survive restarts) and always
/// writes `status`, even when null.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRequest {
    head_sha: String,
    head_ref: String,
    priority: i64,
    status: Option<Status>,
    last_seen_at: Option<DateTime<Utc>>,
}

/// Persisted form of a provider state: one JSON blob per group, keyed by the
/// group id in storage.
#[derive(Debug, Serialize, Deserialize)]
struct StoredProviderState {
    id: String,
    last_updated_at: DateTime<Utc>,
    acquired_sha: Option<String>,
    known: HashMap<String, StoredRequest>,
}

impl StateObject for ProviderState {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn marshal(&self) -> Result<Vec<u8>, StorageError> {
        let known = self
            .known
            .iter()
            .map(|(sha, request)| {
                (
                    sha.clone(),
                    StoredRequest {
                        head_sha: request.head_sha.clone(),
                        head_ref: request.head_ref.clone(),
                        priority: request.priority,
                        status: request.status,
                        last_seen_at: request.last_seen_at,
                    },
                )
            })
            .collect();

        let payload = StoredProviderState {
            id: self.id.clone(),
            last_updated_at: self.last_updated_at,
            acquired_sha: self.acquired_sha.clone(),
            known,
        };
        serde_json::to_vec(&payload).map_err(|err| StorageError::Encode(err.to_string()))
    }

    fn unmarshal(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let payload: StoredProviderState =
            serde_json::from_slice(bytes).map_err(|err| StorageError::Corrupt(err.to_string()))?;

        self.id = payload.id;
        self.last_updated_at = payload.last_updated_at;
        self.known = payload
            .known
            .into_iter()
            .map(|(sha, stored)| {
                (
                    sha,
                    Request {
                        head_sha: stored.head_sha,
                        head_ref: stored.head_ref,
                        priority: stored.priority,
                        status: stored.status,
                        last_seen_at: stored.last_seen_at,
                    },
                )
            })
            .collect();
        // The acquired reference is rebuilt against the hydrated map; a SHA
        // that no longer resolves is dropped.
        self.acquired_sha = payload
            .acquired_sha
            .filter(|sha| self.known.contains_key(sha));
        Ok(())
    }
}
