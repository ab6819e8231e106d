//! Process-wide metrics collection.
//!
//! The collector is a process-lifecycle object: construct one at start-up,
//! share it by `Arc`, and render it from the gateway's `/metrics` endpoint.
//! Counters increase monotonically, gauges are last-write-wins, and
//! histograms are tracked as current/count/sum so rolling averages fall out
//! of `sum / count`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A metric identity: name plus a sorted label set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        MetricKey {
            name: name.to_string(),
            labels,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HistogramState {
    current: f64,
    count: u64,
    sum: f64,
}

#[derive(Default)]
struct Inner {
    counters: BTreeMap<MetricKey, f64>,
    gauges: BTreeMap<MetricKey, f64>,
    histograms: BTreeMap<MetricKey, HistogramState>,
    help: BTreeMap<String, String>,
}

/// Thread-safe metrics collector.
pub struct MetricsCollector {
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        MetricsCollector {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Attach help text to a metric family, shown as `# HELP` on exposition.
    pub fn describe(&self, name: &str, help: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.help.insert(name.to_string(), help.to_string());
    }

    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(MetricKey::new(name, labels)).or_insert(0.0) += delta;
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.gauges.insert(MetricKey::new(name, labels), value);
    }

    pub fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.gauges.entry(MetricKey::new(name, labels)).or_insert(0.0) += delta;
    }

    /// Record one histogram observation.
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .histograms
            .entry(MetricKey::new(name, labels))
            .or_default();
        state.current = value;
        state.count += 1;
        state.sum += value;
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner
            .counters
            .get(&MetricKey::new(name, labels))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let inner = self.inner.lock().unwrap();
        inner
            .gauges
            .get(&MetricKey::new(name, labels))
            .copied()
            .unwrap_or(0.0)
    }

    /// Rolling average of a histogram (`sum / count`), 0.0 when empty.
    pub fn average(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let inner = self.inner.lock().unwrap();
        match inner.histograms.get(&MetricKey::new(name, labels)) {
            Some(state) if state.count > 0 => state.sum / state.count as f64,
            _ => 0.0,
        }
    }

    /// Render the Prometheus 0.0.4 text exposition.
    ///
    /// Per family: `# HELP`, `# TYPE`, then one sample per label set as
    /// `name{k="v",...} value timestamp_ms`. Histogram families emit
    /// `name_current`, `name_count`, and `name_sum` series.
    pub fn render(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut out = String::new();

        render_family(
            &mut out,
            &inner.counters,
            &inner.help,
            "counter",
            timestamp_ms,
            |v| *v,
        );
        render_family(
            &mut out,
            &inner.gauges,
            &inner.help,
            "gauge",
            timestamp_ms,
            |v| *v,
        );

        let mut last_family = None;
        for (key, state) in &inner.histograms {
            if last_family != Some(&key.name) {
                write_preamble(&mut out, &key.name, &inner.help, "histogram");
                last_family = Some(&key.name);
            }
            let labels = format_labels(&key.labels);
            let _ = writeln!(
                out,
                "{}_current{} {} {}",
                key.name, labels, state.current, timestamp_ms
            );
            let _ = writeln!(
                out,
                "{}_count{} {} {}",
                key.name, labels, state.count, timestamp_ms
            );
            let _ = writeln!(out, "{}_sum{} {} {}", key.name, labels, state.sum, timestamp_ms);
        }
        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        MetricsCollector::new()
    }
}

fn render_family<V>(
    out: &mut String,
    series: &BTreeMap<MetricKey, V>,
    help: &BTreeMap<String, String>,
    metric_type: &str,
    timestamp_ms: u128,
    value: impl Fn(&V) -> f64,
) {
    let mut last_family = None;
    for (key, v) in series {
        if last_family != Some(&key.name) {
            write_preamble(out, &key.name, help, metric_type);
            last_family = Some(&key.name);
        }
        let _ = writeln!(
            out,
            "{}{} {} {}",
            key.name,
            format_labels(&key.labels),
            value(v),
            timestamp_ms
        );
    }
}

fn write_preamble(
    out: &mut String,
    name: &str,
    help: &BTreeMap<String, String>,
    metric_type: &str,
) {
    if let Some(help) = help.get(name) {
        let _ = writeln!(out, "# HELP {name} {help}");
    }
    let _ = writeln!(out, "# TYPE {name} {metric_type}");
}

fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
