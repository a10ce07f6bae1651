//! `info network` parser.
//!
//! Each NIC shows up as a host-side netdev line followed by a ` \ ` line for
//! the guest device. Multiqueue taps repeat the netdev once per queue:
//!
//! ```text
//! net0: index=0,type=tap,ifname=tap100i0,script=/var/lib/qemu-server/pve-bridge
//!  \ net0: index=0,type=nic,model=virtio-net-pci,macaddr=bc:24:11:2a:3f:10
//! ```

use crate::error::{PvemonError, Result};
use crate::monitor::{MonitorCommand, MonitorContext, VmId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use tracing::{instrument, warn};

/// A netdev name starts a line or follows the ` \ ` guest marker. Hub peers
/// such as `hub0port1: #net125:` mention netdevs mid-line and are skipped.
static NETDEV_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)(?:^[ \t]*|\\[ \t]*)(net\d+):[ \t]*([^\r\n\\]*)").expect("Invalid netdev line regex")
});

const REQUIRED_KEYS: [&str; 5] = ["type", "model", "macaddr", "ifname", "index"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicRecord {
    pub netdev: String,
    pub queue_count: u32,
    pub nic_type: String,
    pub model: String,
    pub macaddr: String,
    pub ifname: String,
}

impl NicRecord {
    /// Attribute map for the `kvm_nic` info series.
    pub fn to_info_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("netdev".to_string(), self.netdev.clone()),
            ("type".to_string(), self.nic_type.clone()),
            ("model".to_string(), self.model.clone()),
            ("macaddr".to_string(), self.macaddr.clone()),
            ("ifname".to_string(), self.ifname.clone()),
        ])
    }
}

/// Parse `info network` output. NICs missing a required key are logged and
/// left out.
pub fn parse_network_info(raw: &str) -> Vec<NicRecord> {
    // netdev -> merged key/value pairs, plus the highest queue index seen
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, (HashMap<String, String>, Option<u32>)> = HashMap::new();

    for caps in NETDEV_LINE.captures_iter(raw) {
        let netdev = caps[1].to_string();
        let entry = merged.entry(netdev.clone()).or_insert_with(|| {
            order.push(netdev);
            (HashMap::new(), None)
        });

        for pair in caps[2].trim().split(',').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else { continue };
            if key == "index" {
                if let Ok(index) = value.parse::<u32>() {
                    entry.1 = Some(entry.1.map_or(index, |max| max.max(index)));
                }
            }
            entry.0.insert(key.to_string(), value.to_string());
        }
    }

    order
        .into_iter()
        .filter_map(|netdev| {
            let (fields, max_index) = merged.remove(&netdev)?;
            match build_record(&netdev, fields, max_index) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "skipping NIC");
                    None
                }
            }
        })
        .collect()
}

fn build_record(
    netdev: &str,
    mut fields: HashMap<String, String>,
    max_index: Option<u32>,
) -> Result<NicRecord> {
    let missing: Vec<&'static str> = REQUIRED_KEYS
        .into_iter()
        .filter(|key| match *key {
            "index" => max_index.is_none(),
            key => !fields.contains_key(key),
        })
        .collect();
    let Some(max_index) = max_index.filter(|_| missing.is_empty()) else {
        return Err(PvemonError::UnrecognizedNicLine { netdev: netdev.to_string(), missing });
    };

    let mut take = |key: &str| fields.remove(key).unwrap_or_default();
    Ok(NicRecord {
        netdev: netdev.to_string(),
        queue_count: max_index + 1,
        nic_type: take("type"),
        model: take("model"),
        macaddr: take("macaddr"),
        ifname: take("ifname"),
    })
}

#[instrument(skip(ctx), fields(vm_id = %vmid))]
pub async fn extract_nic_info(ctx: &MonitorContext, vmid: &VmId) -> Result<Vec<NicRecord>> {
    let output = ctx.query(vmid, MonitorCommand::InfoNetwork).await?;
    Ok(parse_network_info(&output.raw_text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line_nic() {
        let nics =
            parse_network_info("net0: type=tap,model=virtio,macaddr=AA:BB:CC:DD:EE:FF,ifname=tap100i0,index=0");
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].queue_count, 1);
        assert_eq!(nics[0].ifname, "tap100i0");
        assert_eq!(nics[0].nic_type, "tap");
    }

    #[test]
    fn test_host_and_guest_lines_are_merged() {
        let raw = "info network\r\n\
net0: index=0,type=tap,ifname=tap100i0,script=/var/lib/qemu-server/pve-bridge,downscript=/var/lib/qemu-server/pve-bridgedown\r\n \
\\ net0: index=0,type=nic,model=virtio-net-pci,macaddr=bc:24:11:2a:3f:10\r\n\
net1: index=0,type=tap,ifname=tap100i1,script=/var/lib/qemu-server/pve-bridge\r\n\
net1: index=1,type=tap,ifname=tap100i1,script=/var/lib/qemu-server/pve-bridge\r\n \
\\ net1: index=0,type=nic,model=virtio-net-pci,macaddr=bc:24:11:2a:3f:11\r\n";

        let nics = parse_network_info(raw);
        assert_eq!(nics.len(), 2);

        let net0 = &nics[0];
        assert_eq!(net0.netdev, "net0");
        assert_eq!(net0.nic_type, "nic");
        assert_eq!(net0.model, "virtio-net-pci");
        assert_eq!(net0.ifname, "tap100i0");
        assert_eq!(net0.queue_count, 1);

        let net1 = &nics[1];
        assert_eq!(net1.queue_count, 2);
        assert_eq!(net1.macaddr, "bc:24:11:2a:3f:11");
        assert_eq!(net1.to_info_map()["ifname"], "tap100i1");
    }

    #[test]
    fn test_incomplete_nic_is_omitted() {
        let raw = "net0: index=0,type=user,ifname=none,model=e1000,macaddr=aa\nnet1: index=0,type=tap,ifname=tap100i1\n";
        let nics = parse_network_info(raw);
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].netdev, "net0");

        let err = build_record("net1", HashMap::new(), None).unwrap_err();
        match err {
            PvemonError::UnrecognizedNicLine { missing, .. } => {
                assert_eq!(missing, vec!["type", "model", "macaddr", "ifname", "index"])
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_hub_peer_reference_is_not_a_nic() {
        let raw = "hub 0\r\n \\ hub0port1: #net125: index=0,type=user,net=10.0.2.0,restrict=off\r\n \
\\ hub0port0: e1000.0: index=0,type=nic,model=e1000,macaddr=52:54:00:12:34:56\r\n\
net0: index=0,type=tap,ifname=tap100i0,script=/var/lib/qemu-server/pve-bridge \\ net0: index=0,type=nic,model=virtio-net-pci,macaddr=bc:24:11:2a:3f:10\r\n";

        assert!(NETDEV_LINE.captures_iter(raw).all(|caps| &caps[1] == "net0"));

        let nics = parse_network_info(raw);
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].netdev, "net0");
        assert_eq!(nics[0].ifname, "tap100i0");
        assert_eq!(nics[0].model, "virtio-net-pci");
    }

    #[test]
    fn test_no_nics() {
        assert!(parse_network_info("hub 0\r\n \\ hub0port0: user.0: index=0,type=user\r\n").is_empty());
    }
}
