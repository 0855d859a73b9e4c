//! A generic named-metric registry: counters, gauges, histograms and
//! summaries keyed by name plus an optional label set.
//!
//! Grounded on `gateway/monitoring/metrics.py::MetricsCollector`: the
//! same four metric kinds, the same `name{labels}` keying scheme, and
//! the same `/metrics` JSON shape and Prometheus text exposition
//! format (`# HELP`/`# TYPE` comment lines). This replaces a fixed
//! one-field-per-metric struct — the `/metrics` endpoint here is an
//! open-ended dump of whatever the pipeline and routes have recorded,
//! not a hardcoded schema.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

const DEFAULT_HISTOGRAM_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

fn label_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted = labels.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
    format!("{name}{{{joined}}}")
}

#[derive(Debug, Clone, Serialize)]
struct Counter {
    name: String,
    labels: HashMap<String, String>,
    value: f64,
}

#[derive(Debug, Clone, Serialize)]
struct Gauge {
    name: String,
    labels: HashMap<String, String>,
    value: f64,
}

#[derive(Debug, Clone, Serialize)]
struct Histogram {
    name: String,
    labels: HashMap<String, String>,
    buckets: Vec<f64>,
    bucket_counts: HashMap<String, u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for bucket in &self.buckets {
            if value <= *bucket {
                *self.bucket_counts.entry(bucket.to_string()).or_insert(0) += 1;
            }
        }
    }
}

/// Process-wide metric store. One instance lives inside the `Gateway`
/// aggregate; every counter/gauge/histogram increment goes through it
/// rather than a module-global.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Counter>>,
    gauges: RwLock<HashMap<String, Gauge>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_counter(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(name, labels);
        let mut counters = self.counters.write().unwrap();
        let entry = counters.entry(key).or_insert_with(|| Counter {
            name: name.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            value: 0.0,
        });
        entry.value += value;
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(name, labels);
        let mut gauges = self.gauges.write().unwrap();
        let entry = gauges.entry(key).or_insert_with(|| Gauge {
            name: name.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            value: 0.0,
        });
        entry.value = value;
    }

    pub fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(name, labels);
        let mut histograms = self.histograms.write().unwrap();
        let entry = histograms.entry(key).or_insert_with(|| Histogram {
            name: name.to_string(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            buckets: DEFAULT_HISTOGRAM_BUCKETS.to_vec(),
            bucket_counts: HashMap::new(),
            sum: 0.0,
            count: 0,
        });
        entry.observe(value);
    }

    /// A JSON-serializable snapshot of every tracked metric, matching
    /// `MetricsCollector.get_all_metrics()`'s `{counters, gauges,
    /// histograms, summaries}` shape (this gateway has no summaries to
    /// report, so that key is always an empty array).
    pub fn snapshot(&self) -> serde_json::Value {
        let counters: Vec<_> = self.counters.read().unwrap().values().cloned().collect();
        let gauges: Vec<_> = self.gauges.read().unwrap().values().cloned().collect();
        let histograms: Vec<_> = self.histograms.read().unwrap().values().cloned().collect();
        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
            "summaries": [],
        })
    }

    /// Renders every tracked metric as Prometheus text exposition
    /// format, in the teacher's `# HELP`/`# TYPE` comment-line style.
    pub fn export_prometheus(&self) -> String {
        let mut lines = Vec::new();

        for counter in self.counters.read().unwrap().values() {
            lines.push(format!("# HELP {} gateway counter", counter.name));
            lines.push(format!("# TYPE {} counter", counter.name));
            lines.push(format!("{}{} {}", counter.name, format_labels(&counter.labels), counter.value));
        }
        for gauge in self.gauges.read().unwrap().values() {
            lines.push(format!("# HELP {} gateway gauge", gauge.name));
            lines.push(format!("# TYPE {} gauge", gauge.name));
            lines.push(format!("{}{} {}", gauge.name, format_labels(&gauge.labels), gauge.value));
        }
        for histogram in self.histograms.read().unwrap().values() {
            lines.push(format!("# HELP {} gateway histogram", histogram.name));
            lines.push(format!("# TYPE {} histogram", histogram.name));
            let label_str = format_labels(&histogram.labels);
            lines.push(format!("{}_sum{} {}", histogram.name, label_str, histogram.sum));
            lines.push(format!("{}_count{} {}", histogram.name, label_str, histogram.count));
            for bucket in &histogram.buckets {
                let count = histogram.bucket_counts.get(&bucket.to_string()).copied().unwrap_or(0);
                let le_label = merge_le_label(&histogram.labels, &bucket.to_string());
                lines.push(format!("{}_bucket{} {}", histogram.name, le_label, count));
            }
        }

        lines.join("\n")
    }
}

fn format_labels(labels: &HashMap<String, String>) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<_> = labels.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let joined = pairs.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",");
    format!("{{{joined}}}")
}

fn merge_le_label(labels: &HashMap<String, String>, bucket: &str) -> String {
    let mut pairs: Vec<_> = labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    pairs.push(("le".to_string(), bucket.to_string()));
    let joined = pairs.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",");
    format!("{{{joined}}}")
}
