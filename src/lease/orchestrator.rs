//! Registry of lease providers, one per configured merge group.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Duration;

use crate::clock::Clock;
use crate::config::GithubRepositoryConfig;
use crate::lease::provider::{LeaseProvider, ProviderOpts};
use crate::lease::state::ProviderState;
use crate::metrics::LeaseMetrics;
use crate::storage::{Storage, StorageError};

/// The requested `(owner, repo, baseRef)` group is not configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderNotFound {
    pub key: String,
}

impl fmt::Display for ProviderNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown provider {}", self.key)
    }
}

impl std::error::Error for ProviderNotFound {}

/// Routes lease calls to the provider owning a merge group.
///
/// The registry is populated once from configuration and never mutated
/// afterwards; a group is known iff it was configured. Groups are fully
/// independent: no state crosses providers.
pub struct Orchestrator {
    providers: HashMap<String, Arc<LeaseProvider>>,
}

impl Orchestrator {
    pub fn new(
        repositories: &[GithubRepositoryConfig],
        clock: Arc<dyn Clock>,
        storage: Arc<dyn Storage<ProviderState>>,
        metrics: Option<LeaseMetrics>,
    ) -> Self {
        let providers = repositories
            .iter()
            .map(|repository| {
                let key = provider_key(&repository.owner, &repository.name, &repository.base_ref);
                let provider = LeaseProvider::new(
                    ProviderOpts {
                        id: key.clone(),
                        stabilize_duration: Duration::seconds(
                            repository.stabilize_duration_seconds as i64,
                        ),
                        ttl: Duration::seconds(repository.ttl_seconds as i64),
                        expected_request_count: repository.expected_request_count,
                        delay_assignment_count: repository.delay_lease_assignment_by,
                    },
                    clock.clone(),
                    storage.clone(),
                    metrics.clone(),
                );
                (key, Arc::new(provider))
            })
            .collect();

        Self { providers }
    }

    /// Returns the provider for a merge group.
    pub fn get(
        &self,
        owner: &str,
        repo: &str,
        base_ref: &str,
    ) -> Result<&Arc<LeaseProvider>, ProviderNotFound> {
        let key = provider_key(owner, repo, base_ref);
        self.providers
            .get(&key)
            .ok_or(ProviderNotFound { key })
    }

    /// All managed providers, keyed by group id.
    pub fn get_all(&self) -> &HashMap<String, Arc<LeaseProvider>> {
        &self.providers
    }

    /// Hydrates every provider from storage, failing fast on the first error.
    pub async fn hydrate_from_state(&self) -> Result<(), StorageError> {
        for provider in self.providers.values() {
            provider.hydrate_from_state().await?;
        }
        Ok(())
    }
}

/// Group key: `owner:repo:baseRef`.
fn provider_key(owner: &str, repo: &str, base_ref: &str) -> String {
    format!("{}:{}:{}", owner, repo, base_ref)
}
