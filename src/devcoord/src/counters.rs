// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

pub const DEVICES_PUBLISHED: &str = "devices.published";
pub const DEVICES_REMOVED: &str = "devices.removed";
pub const BIND_REQUESTS: &str = "bind.requests";
pub const BIND_FAILURES: &str = "bind.failures";
pub const DEVHOSTS_LAUNCHED: &str = "devhosts.launched";
pub const DEVHOSTS_EXITED: &str = "devhosts.exited";
pub const SUSPEND_RPCS: &str = "suspend.rpcs";
pub const SUSPEND_FAILURES: &str = "suspend.failures";

const NAMESPACE_DEVCOORD: &str = "devcoord";
const EVENTS_METRIC: &str = "events_total";
const COUNTER_LABEL: &str = "counter";

/// Named counters readable from outside the dispatch loop.
///
/// Every counter is one label of a single prometheus counter family kept in
/// a private registry. Cloning shares the registry.
#[derive(Clone)]
pub struct Counters {
    registry: Registry,
    events: IntCounterVec,
}

impl Counters {
    pub fn new() -> Result<Self> {
        let events = IntCounterVec::new(
            Opts::new(EVENTS_METRIC, "Coordinator events by kind").namespace(NAMESPACE_DEVCOORD),
            &[COUNTER_LABEL],
        )?;
        let registry = Registry::new();
        registry.register(Box::new(events.clone()))?;
        Ok(Counters { registry, events })
    }

    /// Add `delta`, creating the counter at zero if needed. Returns the new value.
    pub fn add(&self, name: &str, delta: u64) -> u64 {
        let counter = self.events.with_label_values(&[name]);
        counter.inc_by(delta);
        counter.get()
    }

    pub fn incr(&self, name: &str) -> u64 {
        self.add(name, 1)
    }

    pub fn get(&self, name: &str) -> Result<u64> {
        self.snapshot(name)
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
            .ok_or_else(|| Error::NotFound(format!("counter {}", name)))
    }

    /// Counters whose names start with `prefix`, in name order.
    pub fn snapshot(&self, prefix: &str) -> Vec<(String, u64)> {
        let mut values: Vec<(String, u64)> = self
            .registry
            .gather()
            .iter()
            .flat_map(|family| family.get_metric().iter())
            .filter_map(|metric| {
                let name = metric
                    .get_label()
                    .iter()
                    .find(|l| l.get_name() == COUNTER_LABEL)?
                    .get_value();
                if !name.starts_with(prefix) {
                    return None;
                }
                Some((name.to_string(), metric.get_counter().get_value() as u64))
            })
            .collect();
        values.sort();
        values
    }

    /// Text exposition of every counter.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = Counters::new().unwrap();
        assert!(matches!(counters.get(BIND_REQUESTS), Err(Error::NotFound(_))));

        counters.incr(BIND_REQUESTS);
        counters.add(BIND_REQUESTS, 2);
        counters.add(BIND_FAILURES, 0);
        counters.incr(SUSPEND_RPCS);
        assert_eq!(counters.get(BIND_REQUESTS).unwrap(), 3);

        let shared = counters.clone();
        assert_eq!(shared.incr(BIND_REQUESTS), 4);
        assert_eq!(
            counters.snapshot("bind."),
            vec![
                (BIND_FAILURES.to_string(), 0),
                (BIND_REQUESTS.to_string(), 4)
            ]
        );
        assert_eq!(counters.snapshot("").len(), 3);
    }

    #[test]
    fn test_encode() {
        let counters = Counters::new().unwrap();
        counters.incr(DEVHOSTS_LAUNCHED);
        let text = counters.encode().unwrap();
        assert!(text.contains("devcoord_events_total{counter=\"devhosts.launched\"} 1"));
    }

    #[test]
    fn test_counters_across_threads() {
        let counters = Counters::new().unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = counters.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        c.incr(SUSPEND_RPCS);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counters.get(SUSPEND_RPCS).unwrap(), 400);
    }
}
