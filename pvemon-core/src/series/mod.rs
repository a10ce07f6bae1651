//! Metric families and the dynamic series registry.
//!
//! A [`MetricFamily`] holds the samples of one metric name for the current
//! collection pass. Families whose names are only known at runtime (one per
//! interface counter, say) are handed out by the [`SeriesRegistry`], which
//! creates each of them at most once no matter how many workers ask.

use crate::error::{PvemonError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FamilyKind {
    Gauge,
    Info,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValue {
    Gauge(f64),
    /// String attributes, exported as labels of a constant `1` series.
    Info(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub label_values: Vec<String>,
    pub value: SeriesValue,
}

pub struct MetricFamily {
    name: String,
    help: String,
    kind: FamilyKind,
    label_names: Vec<String>,
    samples: Mutex<Vec<Sample>>,
}

impl fmt::Debug for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricFamily")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("label_names", &self.label_names)
            .field("samples", &self.len())
            .finish()
    }
}

impl MetricFamily {
    pub fn new<I, S>(name: impl Into<String>, help: impl Into<String>, kind: FamilyKind, label_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            label_names: label_names.into_iter().map(Into::into).collect(),
            samples: Mutex::new(Vec::new()),
        }
    }

    pub fn gauge<I, S>(name: impl Into<String>, help: impl Into<String>, label_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, help, FamilyKind::Gauge, label_names)
    }

    pub fn info<I, S>(name: impl Into<String>, help: impl Into<String>, label_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, help, FamilyKind::Info, label_names)
    }

    /// Record one sample. Safe to call from several workers at once.
    pub fn add_metric<I, S>(&self, label_values: I, value: SeriesValue) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let label_values: Vec<String> = label_values.into_iter().map(Into::into).collect();
        if label_values.len() != self.label_names.len() {
            return Err(PvemonError::LabelMismatch {
                family: self.name.clone(),
                expected: self.label_names.len(),
                actual: label_values.len(),
            });
        }
        let matches_kind = matches!(
            (self.kind, &value),
            (FamilyKind::Gauge, SeriesValue::Gauge(_)) | (FamilyKind::Info, SeriesValue::Info(_))
        );
        if !matches_kind {
            return Err(PvemonError::Internal(format!("wrong value kind for {:?} family {}", self.kind, self.name)));
        }
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).push(Sample { label_values, value });
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn kind(&self) -> FamilyKind {
        self.kind
    }

    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Detached copy with the current samples.
    pub fn snapshot(&self) -> MetricFamily {
        MetricFamily {
            name: self.name.clone(),
            help: self.help.clone(),
            kind: self.kind,
            label_names: self.label_names.clone(),
            samples: Mutex::new(self.samples()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SeriesKey {
    Gauge(String),
    Info(String, Vec<String>),
}

#[derive(Default)]
struct RegistryInner {
    by_key: HashMap<SeriesKey, Arc<MetricFamily>>,
    gauges: Vec<Arc<MetricFamily>>,
    infos: Vec<Arc<MetricFamily>>,
}

/// Get-or-create registry for runtime-named families.
///
/// Gauges are keyed by name, info families by name and label names. The
/// check and the insert happen under one lock, so racing callers always get
/// the same handle.
#[derive(Default)]
pub struct SeriesRegistry {
    inner: Mutex<RegistryInner>,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge(&self, name: &str, label_names: &[&str]) -> Arc<MetricFamily> {
        let key = SeriesKey::Gauge(name.to_string());
        self.get_or_create(key, || {
            MetricFamily::gauge(name, format!("{} for KVM process", strip_prefix_hint(name)), label_names.iter().copied())
        })
    }

    pub fn info(&self, name: &str, label_names: &[&str]) -> Arc<MetricFamily> {
        let labels: Vec<String> = label_names.iter().map(|l| l.to_string()).collect();
        let help = format!("{} for {:?}", strip_prefix_hint(name), labels);
        let key = SeriesKey::Info(name.to_string(), labels);
        self.get_or_create(key, || MetricFamily::info(name, help, label_names.iter().copied()))
    }

    fn get_or_create(&self, key: SeriesKey, create: impl FnOnce() -> MetricFamily) -> Arc<MetricFamily> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = inner.by_key.get(&key) {
            return existing.clone();
        }
        let family = Arc::new(create());
        match key {
            SeriesKey::Gauge(_) => inner.gauges.push(family.clone()),
            SeriesKey::Info(..) => inner.infos.push(family.clone()),
        }
        inner.by_key.insert(key, family.clone());
        family
    }

    /// Number of distinct families created so far.
    pub fn created(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).by_key.len()
    }

    /// Info families in creation order.
    pub fn infos(&self) -> Vec<Arc<MetricFamily>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).infos.clone()
    }

    /// Gauge families in creation order.
    pub fn gauges(&self) -> Vec<Arc<MetricFamily>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).gauges.clone()
    }

    /// Drop the samples of every family, keeping the handles.
    pub fn clear_samples(&self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for family in inner.by_key.values() {
            family.clear();
        }
    }
}

/// Help strings name the unprefixed family (`kvm_nic_rx_bytes`).
fn strip_prefix_hint(name: &str) -> &str {
    name.find("kvm_").map_or(name, |i| &name[i..])
}
