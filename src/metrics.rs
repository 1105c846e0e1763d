//! Prometheus Metrics
//!
//! Exposes set statistics as gauges in a private registry. Each call to
//! [`StatsExporter::observe`] replaces the previous snapshot, so sets that
//! disappeared stop being reported.

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{RaCacheService, SetStats};
use crate::error::{Error, Result};
use crate::serializer::Serializer;

const LABELS: [&str; 4] = ["cache", "set", "tag", "kind"];

/// Renders set statistics in the Prometheus text format
pub struct StatsExporter {
    registry: Registry,
    counts: GaugeVec,
    bytes: GaugeVec,
    requests: GaugeVec,
    hit_ratio: GaugeVec,
}

impl StatsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let counts = gauge(
            &registry,
            "racache_set_entries",
            "Entries of a cache set by kind (index, file, resident_keys, resident_objects)",
        )?;
        let bytes = gauge(
            &registry,
            "racache_set_bytes",
            "Bytes of a cache set by kind (file, resident_keys, resident_objects)",
        )?;
        let requests = gauge(
            &registry,
            "racache_set_requests",
            "Lookup outcomes of a cache set by kind",
        )?;
        let hit_ratio = gauge(
            &registry,
            "racache_set_hit_ratio",
            "Hits over attempts for a cache set",
        )?;

        Ok(Self {
            registry,
            counts,
            bytes,
            requests,
            hit_ratio,
        })
    }

    /// Replace the exported values with `stats`
    pub fn observe(&self, stats: &[SetStats]) {
        for vec in [&self.counts, &self.bytes, &self.requests, &self.hit_ratio] {
            vec.reset();
        }

        for s in stats {
            let tag = s.tag_name.as_deref().unwrap_or("");
            let set = |vec: &GaugeVec, kind: &str, value: u64| {
                vec.with_label_values(&[s.cache_name.as_str(), s.set_name.as_str(), tag, kind])
                    .set(value as f64);
            };

            set(&self.counts, "index", s.entries);
            set(&self.counts, "file", s.file_entries);
            set(&self.counts, "resident_keys", s.resident_keys);
            set(&self.counts, "resident_objects", s.resident_objects);

            set(&self.bytes, "file", s.file_bytes);
            set(&self.bytes, "resident_keys", s.resident_key_bytes);
            set(&self.bytes, "resident_objects", s.resident_object_bytes);

            set(&self.requests, "attempts", s.attempts);
            set(&self.requests, "hits_from_memory", s.hits_from_memory);
            set(&self.requests, "hits_from_disk", s.hits_from_disk);
            set(&self.requests, "misses", s.misses);
            set(&self.requests, "keys_lost", s.keys_lost);
            set(&self.requests, "objects_lost", s.objects_lost);
            set(&self.requests, "collisions", s.collisions);

            self.hit_ratio
                .with_label_values(&[s.cache_name.as_str(), s.set_name.as_str(), tag, "all"])
                .set(s.hit_ratio());
        }
    }

    /// Observe every set of every cache type in `service`
    pub fn observe_service<K, V, S>(&self, service: &RaCacheService<K, V, S>)
    where
        K: Serialize + DeserializeOwned + PartialEq + Clone + Send + Sync,
        V: Serialize + DeserializeOwned + Clone + Send + Sync,
        S: Serializer,
    {
        let stats: Vec<SetStats> = service.caches().iter().flat_map(|c| c.stats()).collect();
        self.observe(&stats);
    }

    /// Text exposition of the current values
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec> {
    let vec = GaugeVec::new(Opts::new(name, help), &LABELS)
        .map_err(|e| Error::Internal(format!("Invalid metric {}: {}", name, e)))?;
    registry
        .register(Box::new(vec.clone()))
        .map_err(|e| Error::Internal(format!("Failed to register {}: {}", name, e)))?;
    Ok(vec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SetStats {
        SetStats {
            cache_name: "mag".into(),
            set_name: "coils".into(),
            tag_name: Some("v2".into()),
            entries: 3,
            file_bytes: 512,
            attempts: 4,
            hits_from_memory: 1,
            hits_from_disk: 1,
            ..SetStats::default()
        }
    }

    #[test]
    fn test_render_contains_labelled_values() {
        let exporter = StatsExporter::new().unwrap();
        exporter.observe(&[sample()]);
        let text = exporter.render().unwrap();

        assert!(text.contains("racache_set_entries{cache=\"mag\",kind=\"index\",set=\"coils\",tag=\"v2\"} 3"));
        assert!(text.contains("racache_set_bytes{cache=\"mag\",kind=\"file\",set=\"coils\",tag=\"v2\"} 512"));
        assert!(text.contains("racache_set_hit_ratio{cache=\"mag\",kind=\"all\",set=\"coils\",tag=\"v2\"} 0.5"));
    }

    #[test]
    fn test_observe_replaces_previous_snapshot() {
        let exporter = StatsExporter::new().unwrap();
        exporter.observe(&[sample()]);
        exporter.observe(&[]);
        let text = exporter.render().unwrap();
        assert!(!text.contains("coils"));
    }

    #[test]
    fn test_untagged_set_has_empty_tag_label() {
        let exporter = StatsExporter::new().unwrap();
        let stats = SetStats {
            tag_name: None,
            ..sample()
        };
        exporter.observe(&[stats]);
        assert!(exporter.render().unwrap().contains("tag=\"\""));
    }
}
