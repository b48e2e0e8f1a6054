//! In-process metrics: counters, gauges and windowed histograms keyed by name
//! plus a label set. Nothing is persisted; `snapshot` is the export surface.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram; older ones are discarded first.
pub const HISTOGRAM_WINDOW: usize = 4096;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// One metric read by [`MetricsRecorder::snapshot`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub metric_type: MetricType,
    /// Counter total, gauge level, or histogram median.
    pub value: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let sorted: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Self {
            name: name.to_owned(),
            labels: sorted.into_iter().collect(),
        }
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

#[derive(Default)]
struct Counter(AtomicU64);

/// f64 stored as raw bits.
#[derive(Default)]
struct Gauge(AtomicU64);

impl Gauge {
    fn read(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn write(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }
}

#[derive(Default)]
struct Histogram(Mutex<VecDeque<f64>>);

impl Histogram {
    fn observe(&self, value: f64) {
        let mut window = self.0.lock();
        if window.len() == HISTOGRAM_WINDOW {
            window.pop_front();
        }
        window.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.0.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(f64::total_cmp);
        let rank = |q: f64| sorted[((sorted.len() as f64 * q) as usize).min(sorted.len() - 1)];
        HistogramSummary {
            count: sorted.len() as u64,
            sum: sorted.iter().sum(),
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

/// All series of one metric kind.
struct Family<M> {
    series: RwLock<HashMap<SeriesKey, M>>,
}

impl<M> Default for Family<M> {
    fn default() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }
}

impl<M: Default> Family<M> {
    /// Run `f` on the series, creating it on first use.
    fn with(&self, key: SeriesKey, f: impl FnOnce(&M)) {
        {
            let series = self.series.read();
            if let Some(metric) = series.get(&key) {
                f(metric);
                return;
            }
        }
        f(self.series.write().entry(key).or_default());
    }

    fn get<T>(&self, key: &SeriesKey, f: impl FnOnce(&M) -> T) -> Option<T> {
        self.series.read().get(key).map(f)
    }

    fn collect(
        &self,
        timestamp: &str,
        metric_type: MetricType,
        value: impl Fn(&M) -> f64,
    ) -> Vec<MetricsSnapshot> {
        self.series
            .read()
            .iter()
            .map(|(key, metric)| MetricsSnapshot {
                timestamp: timestamp.to_owned(),
                name: key.name.clone(),
                labels: key.label_map(),
                metric_type,
                value: value(metric),
            })
            .collect()
    }
}

/// Thread-safe metrics recorder shared by every actor of an instance.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: Family<Counter>,
    gauges: Family<Gauge>,
    histograms: Family<Histogram>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.with(SeriesKey::new(name, labels), |c| {
            c.0.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .with(SeriesKey::new(name, labels), |g| g.write(value));
    }

    /// Move a gauge by `delta`, which may be negative.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.gauges
            .with(SeriesKey::new(name, labels), |g| g.add(delta));
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .with(SeriesKey::new(name, labels), |h| h.observe(value));
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&SeriesKey::new(name, labels), |c| c.0.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .get(&SeriesKey::new(name, labels), Gauge::read)
            .unwrap_or(0.0)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .get(&SeriesKey::new(name, labels), Histogram::summary)
            .unwrap_or_default()
    }

    /// Every series, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let now = Utc::now().to_rfc3339();
        let mut all = self.counters.collect(&now, MetricType::Counter, |c| {
            c.0.load(Ordering::Relaxed) as f64
        });
        all.extend(self.gauges.collect(&now, MetricType::Gauge, Gauge::read));
        all.extend(
            self.histograms
                .collect(&now, MetricType::Histogram, |h| h.summary().p50),
        );
        all.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        all
    }
}
