//! Mesh topology estimation.
//!
//! Tracks the best-known hop distance to every remote device and the
//! set of advertised gateways. Hop estimates only improve while an
//! entry exists; gateway entries go stale 120 s after their last
//! advertisement and are swept after every mutation.
//!
//! The local device is excluded from both tables so the node never
//! lists itself as a remote peer or gateway.

use std::collections::HashMap;

use pigeon_protocol::GatewayStatus;
use pigeon_types::{DeviceId, Timestamp};

// ---------------------------------------------------------------------------
// GatewayEntry
// ---------------------------------------------------------------------------

/// One advertised gateway.
#[derive(Clone, Debug)]
pub struct GatewayEntry {
    /// The gateway's display name at advertisement time.
    pub device_name: String,
    /// Best-known hop distance to the gateway.
    pub hops: u32,
    /// When the most recent advertisement arrived.
    pub last_seen: Timestamp,
    /// Messages the gateway reports having uploaded.
    pub synced_count: u64,
}

// ---------------------------------------------------------------------------
// TopologyTracker
// ---------------------------------------------------------------------------

/// Hop-distance and gateway tables built from observed traffic.
pub struct TopologyTracker {
    local_id: DeviceId,
    stale_secs: u64,
    known_devices: HashMap<DeviceId, u32>,
    known_gateways: HashMap<DeviceId, GatewayEntry>,
}

impl TopologyTracker {
    /// Creates an empty tracker for the given local device.
    pub fn new(local_id: DeviceId, stale_secs: u64) -> Self {
        Self {
            local_id,
            stale_secs,
            known_devices: HashMap::new(),
            known_gateways: HashMap::new(),
        }
    }

    /// Records a hop-distance observation for a device.
    ///
    /// Keeps the minimum of the current estimate and the observation;
    /// a worse route never replaces a better one. Returns `true` when
    /// the estimate changed (new device or shorter route).
    pub fn observe(&mut self, device_id: DeviceId, hops: u32) -> bool {
        if device_id == self.local_id {
            return false;
        }

        match self.known_devices.get_mut(&device_id) {
            Some(current) => {
                if hops < *current {
                    *current = hops;
                    true
                } else {
                    false
                }
            }
            None => {
                self.known_devices.insert(device_id, hops);
                true
            }
        }
    }

    /// Applies a gateway advertisement.
    ///
    /// `isGateway: true` upserts the entry (minimum hops, refreshed
    /// `last_seen`, updated synced count); `isGateway: false` removes
    /// it. Either way, stale entries are swept afterwards. Returns the
    /// ids whose reachability changed (inserted or removed), for event
    /// emission.
    pub fn observe_gateway(
        &mut self,
        status: &GatewayStatus,
        hops: u32,
        now: &Timestamp,
    ) -> Vec<(DeviceId, bool)> {
        let mut changed = Vec::new();
        let gateway_id = status.gateway_device_id;

        if gateway_id != self.local_id {
            if status.is_gateway {
                match self.known_gateways.get_mut(&gateway_id) {
                    Some(entry) => {
                        entry.hops = entry.hops.min(hops);
                        entry.last_seen = now.clone();
                        entry.synced_count = status.synced_count.unwrap_or(entry.synced_count);
                        entry.device_name = status.gateway_device_name.clone();
                    }
                    None => {
                        self.known_gateways.insert(
                            gateway_id,
                            GatewayEntry {
                                device_name: status.gateway_device_name.clone(),
                                hops,
                                last_seen: now.clone(),
                                synced_count: status.synced_count.unwrap_or(0),
                            },
                        );
                        changed.push((gateway_id, true));
                    }
                }
            } else if self.known_gateways.remove(&gateway_id).is_some() {
                changed.push((gateway_id, false));
            }
        }

        for id in self.sweep(now) {
            changed.push((id, false));
        }
        changed
    }

    /// Removes gateway entries older than the staleness window and
    /// returns their ids.
    pub fn sweep(&mut self, now: &Timestamp) -> Vec<DeviceId> {
        let stale_secs = self.stale_secs;
        let stale: Vec<DeviceId> = self
            .known_gateways
            .iter()
            .filter(|(_, entry)| entry.last_seen.seconds_until(now) > stale_secs)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.known_gateways.remove(id);
        }
        stale
    }

    /// The non-stale gateway with the fewest hops, if any.
    pub fn nearest_gateway(&self, now: &Timestamp) -> Option<(DeviceId, &GatewayEntry)> {
        self.known_gateways
            .iter()
            .filter(|(_, entry)| entry.last_seen.seconds_until(now) <= self.stale_secs)
            .min_by_key(|(_, entry)| entry.hops)
            .map(|(id, entry)| (*id, entry))
    }

    /// Whether any non-stale gateway is known.
    pub fn has_reachable_gateway(&self, now: &Timestamp) -> bool {
        self.nearest_gateway(now).is_some()
    }

    /// Snapshot of the device hop-distance table.
    pub fn known_devices(&self) -> &HashMap<DeviceId, u32> {
        &self.known_devices
    }

    /// Snapshot of the gateway table, including possibly-stale entries
    /// that have not been swept yet.
    pub fn known_gateways(&self) -> &HashMap<DeviceId, GatewayEntry> {
        &self.known_gateways
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn device(b: u8) -> DeviceId {
        DeviceId::new([b; 16])
    }

    fn at(iso: &str) -> Timestamp {
        Timestamp::from_str(iso).unwrap()
    }

    fn advert(b: u8, is_gateway: bool, synced: u64) -> GatewayStatus {
        GatewayStatus {
            is_gateway,
            gateway_device_id: device(b),
            gateway_device_name: format!("Pigeon-{b:02}"),
            synced_count: Some(synced),
        }
    }

    #[test]
    fn observe_keeps_minimum() {
        let mut topo = TopologyTracker::new(device(0), 120);

        assert!(topo.observe(device(1), 4));
        assert!(!topo.observe(device(1), 7));
        assert_eq!(topo.known_devices()[&device(1)], 4);

        assert!(topo.observe(device(1), 2));
        assert_eq!(topo.known_devices()[&device(1)], 2);
    }

    #[test]
    fn observe_excludes_self() {
        let mut topo = TopologyTracker::new(device(0), 120);
        assert!(!topo.observe(device(0), 1));
        assert!(topo.known_devices().is_empty());
    }

    #[test]
    fn gateway_upsert_refresh_remove() {
        let mut topo = TopologyTracker::new(device(0), 120);
        let t0 = at("2026-03-01T10:00:00Z");
        let t1 = at("2026-03-01T10:00:30Z");

        let changed = topo.observe_gateway(&advert(1, true, 0), 3, &t0);
        assert_eq!(changed, vec![(device(1), true)]);

        // Refresh with a worse route keeps the better hops.
        let changed = topo.observe_gateway(&advert(1, true, 5), 6, &t1);
        assert!(changed.is_empty());
        let entry = &topo.known_gateways()[&device(1)];
        assert_eq!(entry.hops, 3);
        assert_eq!(entry.synced_count, 5);
        assert_eq!(entry.last_seen, t1);

        let changed = topo.observe_gateway(&advert(1, false, 5), 6, &t1);
        assert_eq!(changed, vec![(device(1), false)]);
        assert!(!topo.has_reachable_gateway(&t1));
    }

    #[test]
    fn stale_gateway_swept_after_window() {
        let mut topo = TopologyTracker::new(device(0), 120);
        let t0 = at("2026-03-01T10:00:00Z");
        topo.observe_gateway(&advert(1, true, 0), 2, &t0);

        // 120 s later: still within the window.
        let t_edge = at("2026-03-01T10:02:00Z");
        assert!(topo.has_reachable_gateway(&t_edge));

        // 121 s later: stale.
        let t_late = at("2026-03-01T10:02:01Z");
        assert!(!topo.has_reachable_gateway(&t_late));
        let swept = topo.sweep(&t_late);
        assert_eq!(swept, vec![device(1)]);
        assert!(topo.known_gateways().is_empty());
    }

    #[test]
    fn nearest_gateway_picks_fewest_hops() {
        let mut topo = TopologyTracker::new(device(0), 120);
        let t0 = at("2026-03-01T10:00:00Z");
        topo.observe_gateway(&advert(1, true, 0), 4, &t0);
        topo.observe_gateway(&advert(2, true, 0), 2, &t0);

        let (id, entry) = topo.nearest_gateway(&t0).unwrap();
        assert_eq!(id, device(2));
        assert_eq!(entry.hops, 2);
    }

    #[test]
    fn own_advertisement_ignored() {
        let mut topo = TopologyTracker::new(device(7), 120);
        let t0 = at("2026-03-01T10:00:00Z");
        let changed = topo.observe_gateway(&advert(7, true, 0), 1, &t0);
        assert!(changed.is_empty());
        assert!(!topo.has_reachable_gateway(&t0));
    }
}
