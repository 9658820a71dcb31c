//! Per-group lease state machine.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::lease::refname::{self, RefFormatError};
use crate::lease::request::{Request, RequestContext, StackedPullRequest, Status};
use crate::lease::state::ProviderState;
use crate::metrics::LeaseMetrics;
use crate::storage::{Storage, StorageError};

/// Typed errors surfaced by the lease state machine. A rejected call leaves
/// the provider state untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseError {
    /// A new head SHA tried to join while a winner holds the lease.
    AlreadyAcquired,
    /// A previously unknown request asserted a status other than pending.
    InvalidNewStatus { head_sha: String, status: Status },
    /// Acquire carried a status assertion other than pending; outcomes may
    /// only be reported through release.
    InvalidAcquireStatus { head_sha: String, status: Status },
    /// A status transition outside the allowlist was asserted.
    StatusConflict { head_sha: String, got: Status },
    /// Release was called while no lease is acquired.
    NoLeaseAcquired,
    /// Release was called by a request that does not hold the lease.
    NotLeaseHolder { head_sha: String },
    /// Release was called without a success/failure assertion.
    UnexpectedReleaseStatus { head_sha: String, status: Status },
    /// A winner's head ref does not follow the merge-queue grammar.
    RefFormat(RefFormatError),
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseError::AlreadyAcquired => write!(f, "lease already acquired"),
            LeaseError::InvalidNewStatus { head_sha, status } => write!(
                f,
                "invalid status {} for new lease request with head sha {}",
                status, head_sha
            ),
            LeaseError::InvalidAcquireStatus { head_sha, status } => write!(
                f,
                "invalid status `{}` asserted on acquire for commit {}; expected: `pending`",
                status, head_sha
            ),
            LeaseError::StatusConflict { head_sha, got } => write!(
                f,
                "status mismatch for commit {}; expected: `success|failure`, got: `{}`",
                head_sha, got
            ),
            LeaseError::NoLeaseAcquired => write!(f, "no lease acquired"),
            LeaseError::NotLeaseHolder { head_sha } => {
                write!(f, "commit {} does not hold the lease", head_sha)
            }
            LeaseError::UnexpectedReleaseStatus { head_sha, status } => write!(
                f,
                "unexpected release status `{}` for commit {}",
                status, head_sha
            ),
            LeaseError::RefFormat(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for LeaseError {}

/// Static configuration of one provider.
#[derive(Debug, Clone)]
pub struct ProviderOpts {
    /// Group key, `owner:repo:baseRef`.
    pub id: String,
    /// How long the queue must be quiet before electing on incomplete quorum.
    pub stabilize_duration: Duration,
    /// Maximum idle time of a non-winner request before eviction.
    pub ttl: Duration,
    /// Number of distinct candidates that short-circuits the stabilize wait.
    pub expected_request_count: usize,
    /// Extra acquire evaluations the elected candidate must survive before
    /// the lease transfers. Zero assigns immediately.
    pub delay_assignment_count: u32,
}

/// Serializable view of a provider's queue, as returned by the listing and
/// details endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderView {
    pub last_updated_at: DateTime<Utc>,
    pub acquired: Option<RequestContext>,
    pub known: Vec<RequestContext>,
    pub config: ProviderConfigView,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderConfigView {
    pub stabilize_duration: i64,
    pub ttl: i64,
    pub expected_request_count: usize,
    pub delay_assignment_count: u32,
}

/// State machine for one merge group.
///
/// All reads and writes of the group's state go through the single internal
/// mutex, making acquire/release/clear linearizable per group. The state is
/// saved to storage at the end of every mutating call, still under the
/// mutex, so later saves cannot commit before earlier ones.
pub struct LeaseProvider {
    opts: ProviderOpts,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn Storage<ProviderState>>,
    metrics: Option<LeaseMetrics>,
    state: Mutex<ProviderState>,
}

impl fmt::Debug for LeaseProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseProvider")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl LeaseProvider {
    pub fn new(
        opts: ProviderOpts,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn Storage<ProviderState>>,
        metrics: Option<LeaseMetrics>,
    ) -> Self {
        let state = ProviderState::new(opts.id.clone(), clock.now());
        Self {
            opts,
            clock,
            storage,
            metrics,
            state: Mutex::new(state),
        }
    }

    pub fn opts(&self) -> &ProviderOpts {
        &self.opts
    }

    /// Replaces the in-memory state with the stored one, if any.
    pub async fn hydrate_from_state(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        self.storage.hydrate(&mut *state).await?;
        self.update_metrics(&state);
        Ok(())
    }

    /// Registers (or refreshes) a candidacy and evaluates the selection
    /// policy. Returns the caller's record with its current status.
    pub async fn acquire(&self, request: Request) -> Result<Request, LeaseError> {
        // Acquire may only assert pending. Without this guard an outcome
        // assertion against the current holder would take the release
        // transition inside `insert` while skipping release's cleanup,
        // leaving a failed record dangling inside `known`.
        if let Some(status) = request.status {
            if status != Status::Pending {
                return Err(LeaseError::InvalidAcquireStatus {
                    head_sha: request.head_sha,
                    status,
                });
            }
        }

        let mut state = self.state.lock().await;
        let head_sha = request.head_sha.clone();
        let req = self.insert(&mut state, request)?;
        debug!(
            provider_id = %self.opts.id,
            head_sha = %req.head_sha,
            priority = req.priority,
            "lease request ingested"
        );

        // A completed holder means the protected work is done for the whole
        // group: tell the caller to exit and forget its record.
        if state
            .acquired_request()
            .is_some_and(|r| r.status == Some(Status::Completed))
        {
            state.known.remove(&head_sha);
            self.cleanup(&mut state);
            let mut req = req;
            req.status = Some(Status::Completed);
            info!(
                provider_id = %self.opts.id,
                head_sha = %head_sha,
                "lock holder succeeded, lease request completed"
            );
            self.update_metrics(&state);
            self.save_state(&state).await;
            return Ok(req);
        }

        let evaluated = self.evaluate(&mut state, req);
        self.update_metrics(&state);
        self.save_state(&state).await;
        Ok(evaluated)
    }

    /// Reports the outcome of the protected work. Only the holder may call
    /// this, and only with a success or failure assertion.
    pub async fn release(&self, request: Request) -> Result<Request, LeaseError> {
        let mut state = self.state.lock().await;

        match state.acquired_sha.as_deref() {
            None => return Err(LeaseError::NoLeaseAcquired),
            Some(sha) if sha != request.head_sha => {
                return Err(LeaseError::NotLeaseHolder {
                    head_sha: request.head_sha,
                })
            }
            Some(_) => {}
        }

        let mut req = self.insert(&mut state, request)?;

        match req.status_or(Status::Acquired) {
            Status::Success => {
                // Completed drains the remaining requests on their next poll.
                if let Some(stored) = state.known.get_mut(&req.head_sha) {
                    stored.status = Some(Status::Completed);
                }
                req.status = Some(Status::Completed);

                if let Some(metrics) = &self.metrics {
                    let merged_batch_size = 1 + state
                        .known
                        .values()
                        .filter(|r| r.priority < req.priority)
                        .count();
                    metrics.observe_merged_batch_size(&self.opts.id, merged_batch_size as f64);
                }
                info!(
                    provider_id = %self.opts.id,
                    head_sha = %req.head_sha,
                    "lease released successfully"
                );
                self.update_metrics(&state);
                self.save_state(&state).await;
                Ok(req)
            }
            Status::Failure => {
                // Drop the failed holder so the next candidate can be
                // elected. The acquired reference is only cleared when the
                // queue emptied with it.
                state.known.remove(&req.head_sha);
                if state.known.is_empty() {
                    state.acquired_sha = None;
                }
                info!(
                    provider_id = %self.opts.id,
                    head_sha = %req.head_sha,
                    "lease released with failure"
                );
                self.update_metrics(&state);
                self.save_state(&state).await;
                Ok(req)
            }
            status => Err(LeaseError::UnexpectedReleaseStatus {
                head_sha: req.head_sha.clone(),
                status,
            }),
        }
    }

    /// Builds the derived context for a request: the record itself plus, for
    /// the current winner, the stacked pull request numbers it subsumes.
    pub async fn request_context(&self, request: &Request) -> Result<RequestContext, LeaseError> {
        let state = self.state.lock().await;
        let context = self.build_context(&state, request);
        if let Err(err) = &context {
            error!(
                provider_id = %self.opts.id,
                head_sha = %request.head_sha,
                error = %err,
                "failed to build request context"
            );
        }
        context
    }

    /// Serializable snapshot of the queue, known requests sorted by priority
    /// ascending.
    pub async fn view(&self) -> Result<ProviderView, LeaseError> {
        let state = self.state.lock().await;

        let mut known = Vec::with_capacity(state.known.len());
        for request in state.known.values() {
            known.push(self.build_context(&state, request)?);
        }
        known.sort_by(|a, b| {
            a.request
                .priority
                .cmp(&b.request.priority)
                .then_with(|| a.request.head_sha.cmp(&b.request.head_sha))
        });

        let acquired = match state.acquired_request() {
            Some(request) => Some(self.build_context(&state, request)?),
            None => None,
        };

        Ok(ProviderView {
            last_updated_at: state.last_updated_at,
            acquired,
            known,
            config: ProviderConfigView {
                stabilize_duration: self.opts.stabilize_duration.num_seconds(),
                ttl: self.opts.ttl.num_seconds(),
                expected_request_count: self.opts.expected_request_count,
                delay_assignment_count: self.opts.delay_assignment_count,
            },
        })
    }

    /// Operator escape hatch: replaces the state with an empty one.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        *state = ProviderState::new(self.opts.id.clone(), self.clock.now());
        info!(provider_id = %self.opts.id, "provider state cleared");
        self.update_metrics(&state);
        self.save_state(&state).await;
    }

    /// Whether the acquired reference points at a request that still counts
    /// as a winner. A holder released with failure (dropped from `known`, or
    /// still carrying the failure status) does not.
    fn has_active_winner(&self, state: &ProviderState) -> bool {
        match &state.acquired_sha {
            Some(sha) => state
                .known
                .get(sha)
                .is_some_and(|r| r.status != Some(Status::Failure)),
            None => false,
        }
    }

    /// Inserts a new candidacy or merges an update into the existing record,
    /// enforcing the status-transition allowlist, then evicts stale entries.
    fn insert(&self, state: &mut ProviderState, request: Request) -> Result<Request, LeaseError> {
        self.cleanup(state);

        let now = self.clock.now();
        let mut updated = false;

        let merged = if let Some(existing) = state.known.get_mut(&request.head_sha) {
            let existing_status = existing.status.unwrap_or(Status::Pending);
            let incoming_status = request.status.unwrap_or(Status::Pending);
            let mismatch = existing_status != incoming_status;
            let allowed = existing_status == Status::Acquired
                && matches!(incoming_status, Status::Success | Status::Failure);
            if mismatch && !allowed {
                return Err(LeaseError::StatusConflict {
                    head_sha: request.head_sha,
                    got: incoming_status,
                });
            }

            if existing.priority != request.priority {
                debug!(
                    provider_id = %self.opts.id,
                    head_sha = %request.head_sha,
                    previous_priority = existing.priority,
                    new_priority = request.priority,
                    "lease request priority has changed"
                );
                existing.priority = request.priority;
                updated = true;
            }
            if existing.head_ref != request.head_ref {
                debug!(
                    provider_id = %self.opts.id,
                    head_sha = %request.head_sha,
                    previous_head_ref = %existing.head_ref,
                    new_head_ref = %request.head_ref,
                    "lease request head ref has changed"
                );
                existing.head_ref = request.head_ref.clone();
                updated = true;
            }
            if mismatch {
                debug!(
                    provider_id = %self.opts.id,
                    head_sha = %request.head_sha,
                    previous_status = %existing_status,
                    new_status = %incoming_status,
                    "lease request status has changed"
                );
                existing.status = Some(incoming_status);
                updated = true;
            }
            existing.last_seen_at = Some(now);
            existing.clone()
        } else {
            if self.has_active_winner(state) {
                return Err(LeaseError::AlreadyAcquired);
            }
            if let Some(status) = request.status {
                if status != Status::Pending {
                    return Err(LeaseError::InvalidNewStatus {
                        head_sha: request.head_sha,
                        status,
                    });
                }
            }
            debug!(
                provider_id = %self.opts.id,
                head_sha = %request.head_sha,
                priority = request.priority,
                "lease request is new"
            );
            let mut request = request;
            request.status = Some(Status::Pending);
            request.last_seen_at = Some(now);
            state.known.insert(request.head_sha.clone(), request.clone());
            updated = true;
            request
        };

        if updated {
            state.last_updated_at = now;
            debug!(
                provider_id = %self.opts.id,
                last_updated_at = %now,
                "provider last updated time bumped"
            );
        }

        self.evict_ttl(state);

        // The merged record was seen just now, so eviction cannot have
        // touched it.
        Ok(merged)
    }

    /// Drops the completed holder once it is the only record left, freeing
    /// the queue for the next batch.
    fn cleanup(&self, state: &mut ProviderState) {
        let completed = state
            .acquired_request()
            .is_some_and(|r| r.status == Some(Status::Completed));
        if completed && state.known.len() == 1 {
            if let Some(sha) = state.acquired_sha.take() {
                debug!(provider_id = %self.opts.id, head_sha = %sha, "cleanup completed request");
                state.known.remove(&sha);
            }
        }
    }

    /// Removes every evictable request not seen within the TTL. Acquired and
    /// success records are never evicted.
    fn evict_ttl(&self, state: &mut ProviderState) {
        let opts = &self.opts;
        let clock = &self.clock;
        state.known.retain(|sha, request| {
            let status = request.status.unwrap_or(Status::Pending);
            if matches!(status, Status::Acquired | Status::Success) {
                return true;
            }
            let stale = request
                .last_seen_at
                .is_some_and(|seen| clock.since(seen) > opts.ttl);
            if stale {
                debug!(
                    provider_id = %opts.id,
                    head_sha = %sha,
                    status = %status,
                    "request evicted (ttl)"
                );
            }
            !stale
        });
    }

    /// Runs the selection policy for the caller's record and returns it with
    /// its up-to-date status.
    fn evaluate(&self, state: &mut ProviderState, mut req: Request) -> Request {
        if self.has_active_winner(state) {
            debug!(
                provider_id = %self.opts.id,
                head_sha = %req.head_sha,
                "lock already acquired"
            );
            return req;
        }

        let stabilized = self.clock.since(state.last_updated_at) >= self.opts.stabilize_duration;
        let quorum = state.known.len() >= self.opts.expected_request_count;
        debug!(
            provider_id = %self.opts.id,
            head_sha = %req.head_sha,
            stabilized,
            quorum,
            request_count = state.known.len(),
            expected_request_count = self.opts.expected_request_count,
            "selection preconditions"
        );

        if !stabilized && !quorum {
            debug!(
                provider_id = %self.opts.id,
                head_sha = %req.head_sha,
                "waiting for stabilization or quorum"
            );
            return req;
        }

        let max_priority = state.known.values().map(|r| r.priority).max().unwrap_or(0);
        if req.priority == max_priority {
            if state.delay_counter < self.opts.delay_assignment_count {
                state.delay_counter += 1;
                debug!(
                    provider_id = %self.opts.id,
                    head_sha = %req.head_sha,
                    delay_counter = state.delay_counter,
                    delay_assignment_count = self.opts.delay_assignment_count,
                    "lease assignment delayed"
                );
                return req;
            }

            req.status = Some(Status::Acquired);
            if let Some(stored) = state.known.get_mut(&req.head_sha) {
                stored.status = Some(Status::Acquired);
            }
            state.acquired_sha = Some(req.head_sha.clone());
            state.delay_counter = 0;
            info!(
                provider_id = %self.opts.id,
                head_sha = %req.head_sha,
                priority = req.priority,
                "lock acquired"
            );
        }
        req
    }

    fn build_context(
        &self,
        state: &ProviderState,
        request: &Request,
    ) -> Result<RequestContext, LeaseError> {
        let mut context = RequestContext {
            request: request.clone(),
            stacked_pull_requests: Vec::new(),
        };
        if request.status == Some(Status::Acquired) {
            context.stacked_pull_requests = self.compute_stacked_pull_requests(state, request)?;
        }
        Ok(context)
    }

    /// The PR numbers at priority up to and including the winner's, ascending.
    fn compute_stacked_pull_requests(
        &self,
        state: &ProviderState,
        request: &Request,
    ) -> Result<Vec<StackedPullRequest>, LeaseError> {
        let mut stacked: Vec<&Request> = state
            .known
            .values()
            .filter(|r| r.priority <= request.priority)
            .collect();
        stacked.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.head_sha.cmp(&b.head_sha))
        });

        stacked
            .into_iter()
            .map(|r| {
                refname::parse_pr_number(&r.head_ref)
                    .map(|number| StackedPullRequest { number })
                    .map_err(LeaseError::RefFormat)
            })
            .collect()
    }

    fn update_metrics(&self, state: &ProviderState) {
        if let Some(metrics) = &self.metrics {
            let queue_size = state
                .known
                .values()
                .filter(|r| r.status.is_some_and(|s| s != Status::Completed))
                .count();
            metrics.set_queue_size(&self.opts.id, queue_size as f64);
        }
    }

    /// Best-effort persistence: failures are logged, the lease call already
    /// succeeded against the in-memory state.
    async fn save_state(&self, state: &ProviderState) {
        if let Err(err) = self.storage.save(state).await {
            error!(
                provider_id = %self.opts.id,
                error = %err,
                "failed to save provider state"
            );
        }
    }
}
