// Copyright 2025 evalpool Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Script-defined metrics.
//!
//! Scripts create metrics at runtime through the sandbox `metrics.*` bindings.
//! The registry is process-wide within one engine and shared by every
//! interpreter in the pool, so registration must be atomic: the first caller
//! to use a name decides its kind, later callers get that same collector.

use crate::snapshot::{CustomMetricSnapshot, CustomSeries, SeriesValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Prefix applied to every script-defined metric name.
pub const CUSTOM_METRIC_PREFIX: &str = "script_";

/// Histogram bucket upper bounds, in the unit the script observes.
pub const DEFAULT_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Label names to label values, ordered so equal sets compare equal.
pub type LabelSet = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CustomMetricError {
    #[error("metric name must not be empty")]
    EmptyName,

    #[error("metric `{name}` is a {existing}, cannot use it as a {requested}")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("metric value must be finite (got {0})")]
    NonFinite(f64),

    #[error("counter `{0}` cannot be decreased")]
    NegativeIncrement(String),
}

#[derive(Debug, Clone)]
struct Distribution {
    count: u64,
    sum: f64,
    /// Non-cumulative hits per bucket of `DEFAULT_BUCKETS`
    buckets: [u64; DEFAULT_BUCKETS.len()],
}

impl Distribution {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            buckets: [0; DEFAULT_BUCKETS.len()],
        }
    }

    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if let Some(slot) = DEFAULT_BUCKETS.iter().position(|bound| value <= *bound) {
            self.buckets[slot] += 1;
        }
    }

    fn to_value(&self) -> SeriesValue {
        let mut cumulative = 0;
        let buckets = DEFAULT_BUCKETS
            .iter()
            .zip(self.buckets.iter())
            .map(|(bound, hits)| {
                cumulative += hits;
                (*bound, cumulative)
            })
            .collect();

        SeriesValue::Distribution {
            count: self.count,
            sum: self.sum,
            buckets,
        }
    }
}

#[derive(Debug, Clone)]
enum Series {
    Scalar(f64),
    Distribution(Distribution),
}

/// One named metric with all of its label series.
///
/// Each metric guards its own series map, so updates to different metrics
/// never contend and read-modify-write updates of one series are never lost.
#[derive(Debug)]
pub struct CustomMetric {
    name: String,
    kind: MetricKind,
    series: Mutex<BTreeMap<LabelSet, Series>>,
}

impl CustomMetric {
    fn new(name: String, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            series: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fully qualified name, including [`CUSTOM_METRIC_PREFIX`].
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    fn with_series<R>(&self, labels: &LabelSet, f: impl FnOnce(&mut Series) -> R) -> R {
        let mut series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        let kind = self.kind;
        let entry = series.entry(labels.clone()).or_insert_with(|| match kind {
            MetricKind::Histogram => Series::Distribution(Distribution::new()),
            MetricKind::Counter | MetricKind::Gauge => Series::Scalar(0.0),
        });
        f(entry)
    }

    fn add(&self, labels: &LabelSet, delta: f64) {
        self.with_series(labels, |series| {
            if let Series::Scalar(value) = series {
                *value += delta;
            }
        });
    }

    fn set(&self, labels: &LabelSet, value: f64) {
        self.with_series(labels, |series| {
            if let Series::Scalar(current) = series {
                *current = value;
            }
        });
    }

    fn observe(&self, labels: &LabelSet, value: f64) {
        self.with_series(labels, |series| {
            if let Series::Distribution(distribution) = series {
                distribution.observe(value);
            }
        });
    }

    /// Current value of a counter or gauge series.
    pub fn value(&self, labels: &LabelSet) -> Option<f64> {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        match series.get(labels)? {
            Series::Scalar(value) => Some(*value),
            Series::Distribution(_) => None,
        }
    }

    /// Number of observations of a histogram series.
    pub fn observations(&self, labels: &LabelSet) -> Option<u64> {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        match series.get(labels)? {
            Series::Distribution(distribution) => Some(distribution.count),
            Series::Scalar(_) => None,
        }
    }

    pub fn snapshot(&self) -> CustomMetricSnapshot {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        CustomMetricSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            series: series
                .iter()
                .map(|(labels, series)| CustomSeries {
                    labels: labels.clone(),
                    value: match series {
                        Series::Scalar(value) => SeriesValue::Scalar { value: *value },
                        Series::Distribution(distribution) => distribution.to_value(),
                    },
                })
                .collect(),
        }
    }
}

/// Registry of script-defined metrics.
///
/// Constructed by whoever wires the engine together and injected into it, so
/// independent engines (and tests) never share metric state by accident.
///
/// # Example
///
/// ```
/// use evalpool_metrics::{CustomMetricsRegistry, LabelSet};
///
/// let registry = CustomMetricsRegistry::new();
/// let labels = LabelSet::from([("route".to_string(), "/a".to_string())]);
///
/// registry.increment("hits", &labels).unwrap();
/// registry.add("hits", 2.0, &labels).unwrap();
///
/// let hits = registry.lookup("hits").unwrap();
/// assert_eq!(hits.name(), "script_hits");
/// assert_eq!(hits.value(&labels), Some(3.0));
/// ```
#[derive(Debug)]
pub struct CustomMetricsRegistry {
    prefix: String,
    metrics: RwLock<HashMap<String, Arc<CustomMetric>>>,
}

impl CustomMetricsRegistry {
    pub fn new() -> Self {
        Self::with_prefix(CUSTOM_METRIC_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            metrics: RwLock::new(HashMap::new()),
        }
    }

    fn qualified(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Returns the metric registered under `name`, registering it as `kind`
    /// if this is the first use of the name.
    ///
    /// # Errors
    ///
    /// - `EmptyName` for an empty name
    /// - `KindMismatch` when the name is already registered with another kind
    pub fn get_or_register(
        &self,
        name: &str,
        kind: MetricKind,
    ) -> Result<Arc<CustomMetric>, CustomMetricError> {
        if name.is_empty() {
            return Err(CustomMetricError::EmptyName);
        }
        let qualified = self.qualified(name);

        let existing = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&qualified)
            .cloned();

        let metric = match existing {
            Some(metric) => metric,
            None => {
                let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
                metrics
                    .entry(qualified.clone())
                    .or_insert_with(|| {
                        tracing::debug!("Registered script {} {}", kind, qualified);
                        Arc::new(CustomMetric::new(qualified.clone(), kind))
                    })
                    .clone()
            }
        };

        if metric.kind != kind {
            return Err(CustomMetricError::KindMismatch {
                name: qualified,
                existing: metric.kind,
                requested: kind,
            });
        }
        Ok(metric)
    }

    /// Looks up a metric by its unprefixed name.
    pub fn lookup(&self, name: &str) -> Option<Arc<CustomMetric>> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.qualified(name))
            .cloned()
    }

    fn existing_kind(&self, name: &str) -> Option<MetricKind> {
        self.lookup(name).map(|metric| metric.kind)
    }

    /// Adds one to a counter.
    pub fn increment(&self, name: &str, labels: &LabelSet) -> Result<(), CustomMetricError> {
        self.add(name, 1.0, labels)
    }

    /// Adds `delta` to a counter or gauge. Unknown names become counters.
    ///
    /// # Errors
    ///
    /// Counters reject negative deltas; histograms reject `add` entirely.
    pub fn add(&self, name: &str, delta: f64, labels: &LabelSet) -> Result<(), CustomMetricError> {
        ensure_finite(delta)?;
        let kind = match self.existing_kind(name) {
            Some(MetricKind::Gauge) => MetricKind::Gauge,
            _ => MetricKind::Counter,
        };
        let metric = self.get_or_register(name, kind)?;
        if kind == MetricKind::Counter && delta < 0.0 {
            return Err(CustomMetricError::NegativeIncrement(metric.name.clone()));
        }
        metric.add(labels, delta);
        Ok(())
    }

    /// Sets a gauge to `value`.
    pub fn set(&self, name: &str, value: f64, labels: &LabelSet) -> Result<(), CustomMetricError> {
        ensure_finite(value)?;
        self.get_or_register(name, MetricKind::Gauge)?.set(labels, value);
        Ok(())
    }

    /// Records one histogram observation.
    pub fn observe(&self, name: &str, value: f64, labels: &LabelSet) -> Result<(), CustomMetricError> {
        ensure_finite(value)?;
        self.get_or_register(name, MetricKind::Histogram)?
            .observe(labels, value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every metric, sorted by name.
    pub fn snapshot(&self) -> Vec<CustomMetricSnapshot> {
        let metrics: Vec<Arc<CustomMetric>> = self
            .metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut snapshots: Vec<_> = metrics.iter().map(|metric| metric.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl Default for CustomMetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_finite(value: f64) -> Result<(), CustomMetricError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CustomMetricError::NonFinite(value))
    }
}

/// Builds a label set from a script-supplied value.
///
/// Objects map keys to values; arrays are positional and get keys `"0"`,
/// `"1"`, ... Strings are used verbatim, other values in their JSON form.
/// Anything else yields no labels.
pub fn labels_from_json(value: &Value) -> LabelSet {
    fn label_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| (key.clone(), label_value(value)))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, value)| (index.to_string(), label_value(value)))
            .collect(),
        _ => LabelSet::new(),
    }
}
