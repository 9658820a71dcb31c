use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a lease request.
///
/// Clients may only assert `pending` (implicitly, by omission) on acquire and
/// `success`/`failure` on release; the remaining states are assigned by the
/// provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Acquired,
    Success,
    Failure,
    Completed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Acquired => "acquired",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Completed => "completed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate commit in a merge group.
///
/// `head_sha` is the identity; priority, head ref and status are mutable and
/// only ever touched by the owning provider under its mutex. `last_seen_at`
/// is bookkeeping for TTL eviction and never appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub head_sha: String,
    pub head_ref: String,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Request {
    pub fn new(head_sha: impl Into<String>, head_ref: impl Into<String>, priority: i64) -> Self {
        Self {
            head_sha: head_sha.into(),
            head_ref: head_ref.into(),
            priority,
            status: None,
            last_seen_at: None,
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Effective status, treating an unset status as the given default.
    pub fn status_or(&self, default: Status) -> Status {
        self.status.unwrap_or(default)
    }
}

/// A pull request subsumed by a winner, extracted from its queue ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackedPullRequest {
    pub number: u64,
}

/// A request plus the derived data the client needs to act on it.
///
/// `stacked_pull_requests` is only populated while the request holds the
/// lease: it lists the PR numbers at priority up to and including the
/// winner's, in ascending priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request: Request,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stacked_pull_requests: Vec<StackedPullRequest>,
}
