//! Lease decision engine.
//!
//! One [`LeaseProvider`] per merge group runs the selection state machine:
//! candidates register through `acquire`, a single winner is elected by
//! priority once the group has stabilized or reached quorum, and the winner
//! reports the outcome through `release`. The [`Orchestrator`] routes calls
//! to the provider owning a given `(owner, repo, baseRef)` group.

pub mod orchestrator;
pub mod provider;
pub mod refname;
pub mod request;
pub mod state;

pub use orchestrator::{Orchestrator, ProviderNotFound};
pub use provider::{LeaseError, LeaseProvider, ProviderOpts, ProviderView};
pub use refname::{parse_pr_number, valid_gh_temp_ref, RefFormatError};
pub use request::{Request, RequestContext, StackedPullRequest, Status};
pub use state::ProviderState;
