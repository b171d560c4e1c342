//! Counter and histogram families keyed by label values.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::RwLock;

use crate::encode::{write_header, write_label_set};

/// Labeled monotonic counter family.
#[derive(Debug)]
pub struct CounterFamily {
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
    samples: RwLock<BTreeMap<Vec<String>, u64>>,
}

impl CounterFamily {
    /// Creates an empty family.
    #[must_use]
    pub fn new(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Self {
        Self {
            name,
            help,
            labels,
            samples: RwLock::new(BTreeMap::new()),
        }
    }

    /// Increments the counter for the supplied label values.
    ///
    /// # Panics
    ///
    /// Panics if the label value count does not match the family definition
    /// or the sample lock has been poisoned.
    pub fn inc(&self, label_values: &[&str]) {
        assert_eq!(label_values.len(), self.labels.len(), "label arity mismatch");
        let key: Vec<String> = label_values.iter().map(|v| (*v).to_owned()).collect();
        let mut samples = self.samples.write().expect("counter samples poisoned");
        *samples.entry(key).or_insert(0) += 1;
    }

    /// Returns the current value for the supplied label values.
    ///
    /// # Panics
    ///
    /// Panics if the sample lock has been poisoned.
    #[must_use]
    pub fn value(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|v| (*v).to_owned()).collect();
        let samples = self.samples.read().expect("counter samples poisoned");
        samples.get(&key).copied().unwrap_or(0)
    }

    pub(crate) fn render(&self, out: &mut String) {
        write_header(out, self.name, "counter", self.help);
        let samples = self.samples.read().expect("counter samples poisoned");
        for (values, count) in samples.iter() {
            out.push_str(self.name);
            write_label_set(out, self.labels, values);
            let _ = writeln!(out, " {count}");
        }
    }
}

#[derive(Clone, Debug, Default)]
struct HistogramData {
    bucket_counts: Vec<u64>,
    overflow: u64,
    sum: f64,
    count: u64,
}

/// Labeled histogram family with fixed upper bounds.
#[derive(Debug)]
pub struct HistogramFamily {
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
    buckets: Vec<f64>,
    samples: RwLock<BTreeMap<Vec<String>, HistogramData>>,
}

impl HistogramFamily {
    /// Creates an empty family over the supplied upper bounds.
    ///
    /// Bounds must already be validated (finite, strictly increasing).
    #[must_use]
    pub fn new(
        name: &'static str,
        help: &'static str,
        labels: &'static [&'static str],
        buckets: Vec<f64>,
    ) -> Self {
        Self {
            name,
            help,
            labels,
            buckets,
            samples: RwLock::new(BTreeMap::new()),
        }
    }

    /// Records one observation for the supplied label values.
    ///
    /// # Panics
    ///
    /// Panics if the label value count does not match the family definition
    /// or the sample lock has been poisoned.
    pub fn observe(&self, label_values: &[&str], value: f64) {
        assert_eq!(label_values.len(), self.labels.len(), "label arity mismatch");
        let key: Vec<String> = label_values.iter().map(|v| (*v).to_owned()).collect();
        let mut samples = self.samples.write().expect("histogram samples poisoned");
        let data = samples.entry(key).or_insert_with(|| HistogramData {
            bucket_counts: vec![0; self.buckets.len()],
            ..HistogramData::default()
        });

        match self.buckets.iter().position(|le| value <= *le) {
            Some(idx) => data.bucket_counts[idx] += 1,
            None => data.overflow += 1,
        }
        data.sum += value;
        data.count += 1;
    }

    /// Returns the total observation count for the supplied label values.
    ///
    /// # Panics
    ///
    /// Panics if the sample lock has been poisoned.
    #[must_use]
    pub fn count(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|v| (*v).to_owned()).collect();
        let samples = self.samples.read().expect("histogram samples poisoned");
        samples.get(&key).map_or(0, |data| data.count)
    }

    pub(crate) fn render(&self, out: &mut String) {
        write_header(out, self.name, "histogram", self.help);
        let samples = self.samples.read().expect("histogram samples poisoned");
        for (values, data) in samples.iter() {
            let mut cumulative = 0;
            for (le, bucket_count) in self.buckets.iter().zip(&data.bucket_counts) {
                cumulative += bucket_count;
                let _ = write!(out, "{}_bucket", self.name);
                write_bucket_labels(out, self.labels, values, &le.to_string());
                let _ = writeln!(out, " {cumulative}");
            }
            let _ = write!(out, "{}_bucket", self.name);
            write_bucket_labels(out, self.labels, values, "+Inf");
            let _ = writeln!(out, " {}", data.count);

            out.push_str(self.name);
            out.push_str("_sum");
            write_label_set(out, self.labels, values);
            let _ = writeln!(out, " {}", data.sum);

            out.push_str(self.name);
            out.push_str("_count");
            write_label_set(out, self.labels, values);
            let _ = writeln!(out, " {}", data.count);
        }
    }
}

fn write_bucket_labels(out: &mut String, names: &[&str], values: &[String], le: &str) {
    out.push('{');
    for (name, value) in names.iter().zip(values) {
        let _ = write!(
            out,
            "{name}=\"{}\",",
            crate::encode::escape_label_value(value)
        );
    }
    let _ = write!(out, "le=\"{le}\"");
    out.push('}');
}
