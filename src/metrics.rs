//! Metrics registry backing the `/1.0/metrics` listener.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    namespace: String,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, u64>,
}

impl MetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counters: BTreeMap::new(),
            gauges: BTreeMap::new(),
        }
    }

    pub fn inc_counter(&mut self, name: &str, delta: u64) -> u64 {
        let key = self.qualify(name);
        let counter = self.counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(delta);
        *counter
    }

    pub fn set_gauge(&mut self, name: &str, value: u64) {
        let key = self.qualify(name);
        self.gauges.insert(key, value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(&self.qualify(name)).copied().unwrap_or(0)
    }

    /// Renders the exposition text served on the metrics endpoint.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        for (name, value) in &self.gauges {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        }
        out
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}_{}", self.namespace, name.replace('.', "_"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_under_namespace() {
        let mut registry = MetricsRegistry::new("burrow");
        registry.inc_counter("api.requests", 1);
        registry.inc_counter("api.requests", 2);
        assert_eq!(registry.counter("api.requests"), 3);
        let text = registry.render_text();
        assert!(text.contains("burrow_api_requests 3"));
    }

    #[test]
    fn gauges_overwrite() {
        let mut registry = MetricsRegistry::new("burrow");
        registry.set_gauge("cluster.members_online", 3);
        registry.set_gauge("cluster.members_online", 2);
        assert!(registry
            .render_text()
            .contains("burrow_cluster_members_online 2"));
    }
}
