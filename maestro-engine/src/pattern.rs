//! Pattern sinks: the engine's seam for cross-session learning.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use maestro_types::{PatternError, PatternObservation, PatternSink};

/// Default capacity of the in-process ring.
const DEFAULT_CAPACITY: usize = 256;

/// Bounded in-process sink: keeps the most recent observations in a
/// ring buffer. Useful for tests and for wiring a real pattern library
/// later without touching the engine.
pub struct MemoryPatternSink {
    capacity: usize,
    observations: Mutex<VecDeque<PatternObservation>>,
}

impl MemoryPatternSink {
    /// A sink holding up to 256 observations.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A sink with an explicit capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            observations: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of the recorded observations, oldest first.
    #[must_use]
    pub fn observations(&self) -> Vec<PatternObservation> {
        self.observations
            .lock()
            .expect("pattern sink lock")
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for MemoryPatternSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PatternSink for MemoryPatternSink {
    async fn on_stage_complete(
        &self,
        observation: &PatternObservation,
    ) -> Result<(), PatternError> {
        let mut observations = self.observations.lock().expect("pattern sink lock");
        if observations.len() == self.capacity {
            observations.pop_front();
        }
        observations.push_back(observation.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::{CacheInfo, Tier};

    fn observation(stage: &str) -> PatternObservation {
        PatternObservation {
            workflow: "w".into(),
            stage: stage.into(),
            tier_used: Tier::Cheap,
            escalated_from: None,
            cache: CacheInfo::miss(),
            cost_micros: 10,
            duration_ms: 5,
            confidence: None,
        }
    }

    #[tokio::test]
    async fn records_in_order() {
        let sink = MemoryPatternSink::new();
        sink.on_stage_complete(&observation("a")).await.unwrap();
        sink.on_stage_complete(&observation("b")).await.unwrap();
        let seen = sink.observations();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].stage, "a");
        assert_eq!(seen[1].stage, "b");
    }

    #[tokio::test]
    async fn ring_drops_oldest_at_capacity() {
        let sink = MemoryPatternSink::with_capacity(2);
        for stage in ["a", "b", "c"] {
            sink.on_stage_complete(&observation(stage)).await.unwrap();
        }
        let seen = sink.observations();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].stage, "b");
        assert_eq!(seen[1].stage, "c");
    }
}
