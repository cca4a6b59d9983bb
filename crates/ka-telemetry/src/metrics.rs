use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};

use ahash::AHashMap;

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs distinguishing series of one metric family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    /// `{k="v",...}`, or the empty string when there are no labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Default duration buckets in seconds. Login batches with backoff can run
/// for minutes, so the tail is long.
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

#[derive(Debug)]
struct Histogram {
    counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            counts: DURATION_BUCKETS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if value <= *bound {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counters, gauges and duration histograms keyed by name + labels.
///
/// Values are atomics; the maps are only write-locked to register a new
/// series. A poisoned lock is recovered rather than propagated since every
/// stored value is a plain atomic.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(c) = map.get(&key) {
                c.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        self.gauges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a duration in seconds.
    pub fn record_duration(&self, name: &str, seconds: f64) {
        {
            let map = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(h) = map.get(name) {
                h.observe(seconds);
                return;
            }
        }
        let mut map = self.histograms.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(Histogram::new)
            .observe(seconds);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        self.histograms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|h| h.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Prometheus text exposition format, families sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            let mut series: Vec<(&String, &Labels, u64)> = map
                .iter()
                .map(|((name, labels), v)| (name, labels, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
            let mut last: Option<&str> = None;
            for (name, labels, value) in series {
                if last != Some(name.as_str()) {
                    let _ = writeln!(out, "# TYPE {name} counter");
                    last = Some(name.as_str());
                }
                let _ = writeln!(out, "{name}{} {value}", labels.prometheus_str());
            }
        }

        {
            let map = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let _ = writeln!(out, "# TYPE {name} gauge");
                let _ = writeln!(out, "{name} {}", map[name].load(Ordering::Relaxed));
            }
        }

        {
            let map = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                let total = h.count.load(Ordering::Relaxed);
                let _ = writeln!(out, "# TYPE {name} histogram");
                for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "{name}_bucket{{le=\"{bound}\"}} {}",
                        h.counts[i].load(Ordering::Relaxed)
                    );
                }
                let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {total}");
                let _ = writeln!(out, "{name}_sum {}", h.sum());
                let _ = writeln!(out, "{name}_count {total}");
            }
        }

        out
    }
}

/// The process-wide collector.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}
