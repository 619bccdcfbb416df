//! Metrics collection
//!
//! Buffered metric points flushed to `<state_root>/metrics.jsonl` (one
//! event per line) with in-memory aggregates for quick stats. Disk
//! failures are swallowed; metrics must never take down a command.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Single metric data point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: f64,
    pub metric_name: String,
    pub value: f64,
    pub tags: HashMap<String, String>,
}

/// Per-model aggregate slice
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelAggregate {
    pub commands: u64,
    pub tokens: u64,
    pub cost: f64,
    pub latency_sum: f64,
}

/// Snapshot of current aggregates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsStats {
    pub total_commands: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub by_model: HashMap<String, ModelAggregate>,
}

#[derive(Default)]
struct Aggregates {
    stats: MetricsStats,
    latency_sum: f64,
}

/// Buffered metrics sink
pub struct MetricsCollector {
    path: PathBuf,
    flush_interval: usize,
    buffer: Mutex<Vec<MetricPoint>>,
    aggregates: Mutex<Aggregates>,
}

impl MetricsCollector {
    pub fn new(state_root: &Path) -> Self {
        Self {
            path: state_root.join("metrics.jsonl"),
            flush_interval: 10,
            buffer: Mutex::new(Vec::new()),
            aggregates: Mutex::new(Aggregates::default()),
        }
    }

    /// Record one metric point; the buffer flushes every N points.
    pub fn record(&self, metric_name: &str, value: f64, tags: HashMap<String, String>) {
        let point = MetricPoint {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            metric_name: metric_name.to_string(),
            value,
            tags,
        };

        self.update_aggregates(&point);

        let should_flush = {
            let mut buffer = self.buffer.lock().expect("metrics buffer poisoned");
            buffer.push(point);
            buffer.len() >= self.flush_interval
        };
        if should_flush {
            self.flush();
        }
    }

    /// Convenience for one command's full set of metrics.
    #[allow(clippy::too_many_arguments)]
    pub fn record_command(
        &self,
        latency_ms: f64,
        model: &str,
        tool: &str,
        tokens: u64,
        cost: f64,
        cache_hit: bool,
        success: bool,
    ) {
        let tags: HashMap<String, String> = [
            ("model".to_string(), model.to_string()),
            ("tool".to_string(), tool.to_string()),
        ]
        .into();

        self.record("command_latency_ms", latency_ms, tags.clone());
        if tokens > 0 {
            self.record("tokens_used", tokens as f64, tags.clone());
        }
        if cost > 0.0 {
            self.record("cost_estimate", cost, tags.clone());
        }
        self.record("cache_hit", if cache_hit { 1.0 } else { 0.0 }, tags.clone());
        self.record("success", if success { 1.0 } else { 0.0 }, tags);
    }

    fn update_aggregates(&self, point: &MetricPoint) {
        let mut agg = self.aggregates.lock().expect("metrics aggregates poisoned");
        let model = point
            .tags
            .get("model")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        match point.metric_name.as_str() {
            "command_latency_ms" => {
                agg.stats.total_commands += 1;
                agg.latency_sum += point.value;
                let per_model = agg.stats.by_model.entry(model).or_default();
                per_model.commands += 1;
                per_model.latency_sum += point.value;
                let total = agg.stats.total_commands;
                agg.stats.avg_latency_ms = agg.latency_sum / total as f64;
            }
            "tokens_used" => {
                agg.stats.total_tokens += point.value as u64;
                agg.stats.by_model.entry(model).or_default().tokens += point.value as u64;
            }
            "cost_estimate" => {
                agg.stats.total_cost += point.value;
                agg.stats.by_model.entry(model).or_default().cost += point.value;
            }
            "cache_hit" => {
                if point.value > 0.0 {
                    agg.stats.cache_hits += 1;
                } else {
                    agg.stats.cache_misses += 1;
                }
            }
            "success" => {
                if point.value > 0.0 {
                    agg.stats.successes += 1;
                } else {
                    agg.stats.failures += 1;
                }
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> MetricsStats {
        self.aggregates
            .lock()
            .expect("metrics aggregates poisoned")
            .stats
            .clone()
    }

    /// Flush the buffer to disk, best effort.
    pub fn flush(&self) {
        let points: Vec<MetricPoint> = {
            let mut buffer = self.buffer.lock().expect("metrics buffer poisoned");
            std::mem::take(&mut *buffer)
        };
        if points.is_empty() {
            return;
        }

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        else {
            return;
        };
        for point in points {
            if let Ok(line) = serde_json::to_string(&point) {
                let _ = writeln!(file, "{}", line);
            }
        }
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.flush();
    }
}
