//! Prometheus text rendering of collected families.
//!
//! Every scrape publishes its families into a fresh recorder, so series that
//! disappeared since the last pass do not linger.

use crate::series::{FamilyKind, MetricFamily, SeriesValue};
use crate::storage::sanitize_key;
use metrics::{describe_gauge, gauge, Label};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::BTreeMap;

pub fn render_families(families: &[MetricFamily]) -> String {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::with_local_recorder(&recorder, || {
        for family in families {
            publish(family);
        }
    });
    handle.render()
}

fn publish(family: &MetricFamily) {
    let name = match family.kind() {
        FamilyKind::Gauge => family.name().to_string(),
        FamilyKind::Info => format!("{}_info", family.name()),
    };
    describe_gauge!(name.clone(), family.help().to_string());

    for sample in family.samples() {
        let labels = family.label_names().iter().cloned().zip(sample.label_values);
        match sample.value {
            SeriesValue::Gauge(value) => {
                let labels: Vec<Label> = labels.map(|(k, v)| Label::new(k, v)).collect();
                gauge!(name.clone(), labels).set(value);
            }
            SeriesValue::Info(attrs) => {
                // Family labels override attributes that sanitize to the same key
                let mut merged: BTreeMap<String, String> =
                    attrs.into_iter().map(|(k, v)| (sanitize_key(&k), v)).collect();
                merged.extend(labels);
                let labels: Vec<Label> = merged.into_iter().map(|(k, v)| Label::new(k, v)).collect();
                gauge!(name.clone(), labels).set(1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_for<'a>(text: &'a str, name: &str, needle: &str) -> Option<&'a str> {
        text.lines().find(|l| l.starts_with(name) && l.contains(needle))
    }

    #[test]
    fn test_gauge_and_info_rendering() {
        let vcores = MetricFamily::gauge("pve_kvm_vcores", "vCores allocated to the VM", ["id"]);
        vcores.add_metric(["100"], SeriesValue::Gauge(4.0)).unwrap();
        vcores.add_metric(["101"], SeriesValue::Gauge(2.0)).unwrap();

        let disk = MetricFamily::info("pve_kvm_disk", "kvm_disk for [\"id\", \"disk_name\"]", ["id", "disk_name"]);
        let attrs = BTreeMap::from([
            ("disk_type".to_string(), "qcow2".to_string()),
            ("cache-mode-writeback".to_string(), "true".to_string()),
            ("id".to_string(), "spoofed".to_string()),
        ]);
        disk.add_metric(["100", "virtio0"], SeriesValue::Info(attrs)).unwrap();

        let text = render_families(&[vcores, disk]);
        assert!(text.contains("# HELP pve_kvm_vcores vCores allocated to the VM"));
        assert!(line_for(&text, "pve_kvm_vcores{", "id=\"100\"").unwrap().ends_with(" 4"));
        assert!(line_for(&text, "pve_kvm_vcores{", "id=\"101\"").unwrap().ends_with(" 2"));

        let info = line_for(&text, "pve_kvm_disk_info{", "disk_name=\"virtio0\"").unwrap();
        assert!(info.contains("id=\"100\""));
        assert!(!info.contains("spoofed"));
        assert!(info.contains("cache_mode_writeback=\"true\""));
        assert!(info.contains("disk_type=\"qcow2\""));
        assert!(info.ends_with(" 1"));
    }

    #[test]
    fn test_empty_families_render_nothing() {
        let empty = MetricFamily::gauge("pve_kvm_threads", "Threads used by the KVM process", ["id"]);
        let text = render_families(&[empty]);
        assert!(!text.contains("pve_kvm_threads{"));
    }
}
