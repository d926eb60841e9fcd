//! Resource id generation.

use crate::config::IdStrategy;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Hands out ids for resources whose template does not produce one.
///
/// One generator serves one conversion, so sequential ids restart for every message.
#[derive(Debug, Default)]
pub struct IdGenerator {
    strategy: IdStrategy,
    counters: Mutex<HashMap<String, u64>>,
}

impl IdGenerator {
    pub fn new(strategy: IdStrategy) -> Self {
        Self {
            strategy,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh id for a resource of `resource_type`.
    pub fn next(&self, resource_type: &str) -> String {
        match self.strategy {
            IdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            IdStrategy::Sequential => {
                let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
                let counter = counters.entry(resource_type.to_owned()).or_insert(0);
                *counter += 1;
                format!("{resource_type}-{counter}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_ids_count_per_type() {
        let ids = IdGenerator::new(IdStrategy::Sequential);
        assert_eq!(ids.next("Observation"), "Observation-1");
        assert_eq!(ids.next("Patient"), "Patient-1");
        assert_eq!(ids.next("Observation"), "Observation-2");
    }

    #[test]
    fn uuid_ids_are_unique() {
        let ids = IdGenerator::new(IdStrategy::Uuid);
        let first = ids.next("Patient");
        assert_eq!(first.len(), 36);
        assert_ne!(first, ids.next("Patient"));
    }
}
