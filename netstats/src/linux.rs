//! Counters and routes from procfs
//!
//! `/proc/net/dev` carries cumulative per-interface counters. Linux keeps no
//! per-owner accounting outside of eBPF programs this daemon does not load,
//! so the per-owner and tethering tables are reported as unsupported and the
//! service records interface-level history only.

use std::{net::Ipv4Addr, path::Path};

use netstats_core::{
    platform::{CounterSource, InterfaceSummary, SourceError},
    stats::{CounterSet, Counters, Entry, NetworkStats, TAG_NONE, UID_ALL, Uid},
};
use tracing::{debug, warn};

use crate::platform::{AlertProbe, InterfaceProbe, SoftwareAlert};

const LOOPBACK: &str = "lo";

/// Host counter source reading `/proc/net`.
#[derive(Debug, Default)]
pub struct ProcNetDev {
    alert: SoftwareAlert,
}

impl ProcNetDev {
    /// Create a new source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn read_devices() -> Result<Vec<(String, Counters)>, SourceError> {
    let devices = procfs::net::dev_status().map_err(|err| SourceError::Failed(err.to_string()))?;
    let mut rows: Vec<(String, Counters)> = devices
        .into_values()
        .map(|device| {
            let counters = Counters::new(
                device.recv_bytes,
                device.recv_packets,
                device.sent_bytes,
                device.sent_packets,
                0,
            );
            (device.name, counters)
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(rows)
}

fn current_total() -> Result<u64, SourceError> {
    Ok(interface_table(read_devices()?).total_bytes())
}

/// Interface rows as the service expects them: loopback dropped, every row
/// owned by [`UID_ALL`] in [`CounterSet::All`] without a tag.
fn interface_table(rows: Vec<(String, Counters)>) -> NetworkStats {
    let mut stats = NetworkStats::new(0);
    for (iface, counters) in rows {
        if iface == LOOPBACK {
            continue;
        }
        stats.combine_values(
            Entry::new(Some(&iface), UID_ALL, CounterSet::All, TAG_NONE).with_counters(counters),
        );
    }
    stats
}

impl CounterSource for ProcNetDev {
    fn is_bandwidth_control_enabled(&self) -> bool {
        Path::new("/proc/net/dev").exists()
    }

    fn counters_by_owner(&self, _owner: Option<Uid>) -> Result<NetworkStats, SourceError> {
        Err(SourceError::Unsupported)
    }

    fn interface_summary(&self, summary: InterfaceSummary) -> Result<NetworkStats, SourceError> {
        debug!(?summary, "reading /proc/net/dev");
        Ok(interface_table(read_devices()?))
    }

    fn tethering_counters(&self) -> Result<NetworkStats, SourceError> {
        Err(SourceError::Unsupported)
    }

    fn set_global_alert(&self, bytes: u64) -> Result<(), SourceError> {
        let total = current_total()?;
        self.alert.arm(total, bytes);
        debug!(bytes, baseline = total, "armed global alert");
        Ok(())
    }

    fn set_owner_counter_set(&self, _owner: Uid, _set: CounterSet) -> Result<(), SourceError> {
        Err(SourceError::Unsupported)
    }

    fn reset_owner_counters(&self, _owner: Uid) -> Result<(), SourceError> {
        Err(SourceError::Unsupported)
    }
}

impl InterfaceProbe for ProcNetDev {
    fn interfaces(&self) -> Vec<String> {
        match read_devices() {
            Ok(rows) => rows
                .into_iter()
                .map(|(iface, _)| iface)
                .filter(|iface| iface != LOOPBACK)
                .collect(),
            Err(err) => {
                warn!(%err, "unable to list interfaces");
                Vec::new()
            }
        }
    }

    fn default_route(&self) -> Option<String> {
        match procfs::net::route() {
            Ok(routes) => routes
                .into_iter()
                .find(|route| {
                    route.destination == Ipv4Addr::UNSPECIFIED && route.mask == Ipv4Addr::UNSPECIFIED
                })
                .map(|route| route.iface),
            Err(err) => {
                warn!(%err, "unable to read routes");
                None
            }
        }
    }
}

impl AlertProbe for ProcNetDev {
    fn take_alert(&self) -> bool {
        match current_total() {
            Ok(total) => self.alert.check(total),
            Err(err) => {
                warn!(%err, "unable to check global alert");
                false
            }
        }
    }
}
