//! Coalescing of concurrent identical misses.
//!
//! The first caller to miss on a fingerprint becomes the leader and owns
//! the provider call; everyone else subscribes to a broadcast channel
//! and awaits the leader's result. The slot is released after the
//! response has been stored (or the build failed), which is what keeps
//! "at most one in-flight provider call per fingerprint" true.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use maestro_types::{CallOutcome, ProviderError};

use crate::fingerprint::Fingerprint;

/// Result shared with followers. Errors cross the channel as an `Arc`
/// because [`ProviderError`] is not `Clone`.
pub(crate) type SharedResult = Result<CallOutcome, SharedProviderError>;

/// Clonable wrapper around a leader's provider error.
#[derive(Debug, Clone)]
pub(crate) struct SharedProviderError(pub Arc<ProviderError>);

impl std::fmt::Display for SharedProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self.0.as_ref(), f)
    }
}

impl std::error::Error for SharedProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

impl SharedProviderError {
    /// Rewrap for a follower: the original error stays reachable via
    /// `source()`.
    pub fn into_provider_error(self) -> ProviderError {
        ProviderError::Other(Box::new(self))
    }
}

/// Outcome of asking to build a fingerprint.
pub(crate) enum BuildRole {
    /// This caller runs the provider call and must call
    /// [`InFlight::complete`] exactly once.
    Leader,
    /// Another caller is building; await the receiver.
    Follower(broadcast::Receiver<SharedResult>),
}

/// The in-flight build table.
pub(crate) struct InFlight {
    builds: Mutex<HashMap<Fingerprint, broadcast::Sender<SharedResult>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self {
            builds: Mutex::new(HashMap::new()),
        }
    }

    /// Join the build for a fingerprint, electing a leader if none.
    pub fn join(&self, fingerprint: Fingerprint) -> BuildRole {
        let mut builds = self.builds.lock();
        if let Some(sender) = builds.get(&fingerprint) {
            BuildRole::Follower(sender.subscribe())
        } else {
            // Capacity 1 suffices: each channel carries exactly one
            // terminal result.
            let (sender, _) = broadcast::channel(1);
            builds.insert(fingerprint, sender);
            BuildRole::Leader
        }
    }

    /// Leader hand-off: broadcast the result and release the slot.
    ///
    /// Called after the response has been stored in the cache, so a
    /// follower that re-misses after release still finds the entry.
    pub fn complete(&self, fingerprint: &Fingerprint, result: SharedResult) {
        let sender = self.builds.lock().remove(fingerprint);
        if let Some(sender) = sender {
            // No receivers is fine: every follower already has its own
            // subscription from join().
            let _ = sender.send(result);
        }
    }

    /// Release a slot without broadcasting. Dropping the sender wakes
    /// every follower with a receive error, and they fall back to
    /// direct calls. Used when a leader future is dropped mid-build.
    pub fn abandon(&self, fingerprint: &Fingerprint) {
        self.builds.lock().remove(fingerprint);
    }

    /// Number of fingerprints currently being built.
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.builds.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::{CacheInfo, CompletionResponse, TokenUsage};

    fn outcome(text: &str) -> CallOutcome {
        CallOutcome {
            response: CompletionResponse {
                text: text.into(),
                model: "m".into(),
                usage: TokenUsage::new(1, 1),
            },
            provider: "p".into(),
            model_id: "m".into(),
            cost_micros: 40,
            duration: std::time::Duration::from_millis(5),
            fallback_chain: vec!["m".into()],
            cache: CacheInfo::miss(),
        }
    }

    fn fp(prompt: &str) -> Fingerprint {
        use maestro_types::{CompletionRequest, Tier};
        Fingerprint::compute(&CompletionRequest::new("m", prompt), Tier::Cheap)
    }

    #[tokio::test]
    async fn second_joiner_becomes_follower() {
        let inflight = InFlight::new();
        let fingerprint = fp("a");
        assert!(matches!(inflight.join(fingerprint), BuildRole::Leader));
        let BuildRole::Follower(mut rx) = inflight.join(fingerprint) else {
            panic!("expected follower");
        };

        inflight.complete(&fingerprint, Ok(outcome("R")));
        let shared = rx.recv().await.unwrap();
        assert_eq!(shared.unwrap().response.text, "R");
        assert_eq!(inflight.in_flight(), 0);
    }

    #[tokio::test]
    async fn slot_is_reusable_after_completion() {
        let inflight = InFlight::new();
        let fingerprint = fp("a");
        assert!(matches!(inflight.join(fingerprint), BuildRole::Leader));
        inflight.complete(&fingerprint, Ok(outcome("R")));
        assert!(matches!(inflight.join(fingerprint), BuildRole::Leader));
    }

    #[tokio::test]
    async fn leader_error_reaches_followers() {
        let inflight = InFlight::new();
        let fingerprint = fp("a");
        assert!(matches!(inflight.join(fingerprint), BuildRole::Leader));
        let BuildRole::Follower(mut rx) = inflight.join(fingerprint) else {
            panic!("expected follower");
        };

        let error = SharedProviderError(Arc::new(ProviderError::ServiceUnavailable("down".into())));
        inflight.complete(&fingerprint, Err(error));
        let shared = rx.recv().await.unwrap();
        let provider_error = shared.unwrap_err().into_provider_error();
        assert!(provider_error.to_string().contains("down"));
    }

    #[tokio::test]
    async fn distinct_fingerprints_build_independently() {
        let inflight = InFlight::new();
        assert!(matches!(inflight.join(fp("a")), BuildRole::Leader));
        assert!(matches!(inflight.join(fp("b")), BuildRole::Leader));
        assert_eq!(inflight.in_flight(), 2);
    }
}
