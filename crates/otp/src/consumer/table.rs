// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovered-producer table.
//!
//! Tracks every producer heard on the wire, keyed by CID (a producer seen
//! over both address families is one entry). Each record carries the
//! advertised metadata, a last-seen lease, per-system transform timestamps
//! for replay protection, and the per-(address, priority) observations the
//! merge draws from.

use crate::core::{Address, Cid};
use crate::protocol::advertisement::AdvertisementLayer;
use crate::protocol::module::{Module, ModuleIdentifier};
use crate::protocol::transform::TransformLayer;
use crate::transport::Family;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Signed-difference comparison; transform timestamps wrap mod 2^64.
pub fn timestamp_newer(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) > 0
}

/// Public snapshot of one discovered producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredProducer {
    pub cid: Cid,
    pub name: String,
    pub seen_v4: bool,
    pub seen_v6: bool,
    /// Systems from the latest system advertisement.
    pub systems: Vec<u8>,
    /// Module identifiers from the latest module advertisement.
    pub modules: Vec<ModuleIdentifier>,
    /// Point names from the latest name advertisement.
    pub point_names: Vec<(Address, String)>,
}

/// Latest module map a producer reported for one (address, priority).
pub struct Observation {
    pub modules: HashMap<ModuleIdentifier, Module>,
    pub timestamp: u64,
    pub sampled: Instant,
}

struct ProducerRecord {
    name: String,
    seen_v4: bool,
    seen_v6: bool,
    systems: Vec<u8>,
    modules: Vec<ModuleIdentifier>,
    point_names: Vec<(Address, String)>,
    last_seen: Instant,
    /// Latest committed transform timestamp per system.
    last_transform: HashMap<u8, u64>,
    observations: HashMap<(Address, u8), Observation>,
}

impl ProducerRecord {
    fn snapshot(&self, cid: Cid) -> DiscoveredProducer {
        DiscoveredProducer {
            cid,
            name: self.name.clone(),
            seen_v4: self.seen_v4,
            seen_v6: self.seen_v6,
            systems: self.systems.clone(),
            modules: self.modules.clone(),
            point_names: self.point_names.clone(),
        }
    }
}

/// How a packet changed the discovery table.
#[derive(Debug, PartialEq, Eq)]
pub enum DiscoveryChange {
    /// First valid packet from this CID.
    Discovered,
    /// Known producer whose metadata (name) changed.
    Updated,
    /// Known producer, lease refreshed only.
    Unchanged,
}

/// Result of offering a transform message to the table.
#[derive(Debug)]
pub enum TransformCommit {
    /// Applied; these addresses changed and need a re-merge.
    Applied(Vec<Address>),
    /// Out-of-order or equal timestamp from this producer: dropped.
    Stale,
    /// No record for this CID (packet never announced): dropped.
    UnknownProducer,
}

/// All producers a consumer currently knows, with lease management.
pub struct ProducerTable {
    records: HashMap<Cid, ProducerRecord>,
    timeout: Duration,
}

impl ProducerTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, cid: Cid) -> bool {
        self.records.contains_key(&cid)
    }

    pub fn snapshot(&self, cid: Cid) -> Option<DiscoveredProducer> {
        self.records.get(&cid).map(|record| record.snapshot(cid))
    }

    /// Register a valid packet from `cid`: refresh the lease, record the
    /// family, and pick up a changed component name.
    pub fn note_packet(
        &mut self,
        cid: Cid,
        name: &str,
        family: Family,
        now: Instant,
    ) -> DiscoveryChange {
        match self.records.get_mut(&cid) {
            Some(record) => {
                record.last_seen = now;
                match family {
                    Family::V4 => record.seen_v4 = true,
                    Family::V6 => record.seen_v6 = true,
                }
                if record.name != name {
                    record.name = name.to_owned();
                    DiscoveryChange::Updated
                } else {
                    DiscoveryChange::Unchanged
                }
            }
            None => {
                log::debug!("[CONSUMER] discovered producer cid={} name={:?}", cid, name);
                self.records.insert(
                    cid,
                    ProducerRecord {
                        name: name.to_owned(),
                        seen_v4: matches!(family, Family::V4),
                        seen_v6: matches!(family, Family::V6),
                        systems: Vec::new(),
                        modules: Vec::new(),
                        point_names: Vec::new(),
                        last_seen: now,
                        last_transform: HashMap::new(),
                        observations: HashMap::new(),
                    },
                );
                DiscoveryChange::Discovered
            }
        }
    }

    /// Offer a committed (reassembled) transform message.
    ///
    /// Timestamps from one producer must be strictly increasing per system;
    /// anything else is replay/out-of-order and is dropped. A full point
    /// set replaces every observation of the system.
    pub fn commit_transform(
        &mut self,
        cid: Cid,
        layer: &TransformLayer,
        now: Instant,
    ) -> TransformCommit {
        let Some(record) = self.records.get_mut(&cid) else {
            return TransformCommit::UnknownProducer;
        };

        if let Some(&last) = record.last_transform.get(&layer.system) {
            if !timestamp_newer(layer.timestamp, last) {
                log::debug!(
                    "[CONSUMER] dropped transform from {} system {}: timestamp {} not after {}",
                    cid,
                    layer.system,
                    layer.timestamp,
                    last
                );
                return TransformCommit::Stale;
            }
        }
        record.last_transform.insert(layer.system, layer.timestamp);

        let mut affected = BTreeSet::new();

        if layer.full_point_set {
            // The list is exhaustive: anything else in this system vanishes.
            let listed: BTreeSet<(Address, u8)> = layer
                .points
                .iter()
                .map(|point| (point.address(layer.system), point.priority))
                .collect();
            record.observations.retain(|(address, priority), _| {
                let keep =
                    address.system != layer.system || listed.contains(&(*address, *priority));
                if !keep {
                    affected.insert(*address);
                }
                keep
            });
        }

        for point in &layer.points {
            let address = point.address(layer.system);
            let modules = point
                .modules
                .iter()
                .map(|module| (module.identifier(), module.clone()))
                .collect();
            record.observations.insert(
                (address, point.priority),
                Observation {
                    modules,
                    timestamp: point.timestamp,
                    sampled: now,
                },
            );
            affected.insert(address);
        }

        TransformCommit::Applied(affected.into_iter().collect())
    }

    /// Fold a committed advertisement into the record. Returns true when
    /// the advertised metadata changed.
    pub fn note_advertisement(&mut self, cid: Cid, layer: &AdvertisementLayer) -> bool {
        let Some(record) = self.records.get_mut(&cid) else {
            return false;
        };
        match layer {
            AdvertisementLayer::Module {
                request: false,
                modules,
            } => {
                if record.modules != *modules {
                    record.modules = modules.clone();
                    return true;
                }
                false
            }
            // A request carries the sender's wanted list, not its supported
            // list; it does not update discovery metadata.
            AdvertisementLayer::Module { request: true, .. } => false,
            AdvertisementLayer::Name { points } => {
                let names: Vec<(Address, String)> = points
                    .iter()
                    .map(|entry| (entry.address, entry.name.clone()))
                    .collect();
                if record.point_names != names {
                    record.point_names = names;
                    return true;
                }
                false
            }
            AdvertisementLayer::System { systems } => {
                if record.systems != *systems {
                    record.systems = systems.clone();
                    return true;
                }
                false
            }
        }
    }

    /// Remove producers whose lease expired. Returns each lost CID with the
    /// addresses it was observing (which need a re-merge).
    pub fn sweep(&mut self, now: Instant) -> Vec<(Cid, Vec<Address>)> {
        let timeout = self.timeout;
        let expired: Vec<Cid> = self
            .records
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_seen) > timeout)
            .map(|(cid, _)| *cid)
            .collect();

        expired
            .into_iter()
            .map(|cid| {
                let record = self.records.remove(&cid).expect("cid from iteration");
                let addresses: BTreeSet<Address> = record
                    .observations
                    .keys()
                    .map(|(address, _)| *address)
                    .collect();
                log::info!(
                    "[CONSUMER] producer lost cid={} after {:?} silence",
                    cid,
                    now.duration_since(record.last_seen)
                );
                (cid, addresses.into_iter().collect())
            })
            .collect()
    }

    /// All current observations of `address` across producers, as merge
    /// candidates: (cid, priority, module map, point timestamp).
    pub fn candidates(&self, address: Address) -> Vec<(Cid, u8, &HashMap<ModuleIdentifier, Module>, u64)> {
        let mut out = Vec::new();
        for (cid, record) in &self.records {
            for ((observed, priority), observation) in &record.observations {
                if *observed == address {
                    out.push((*cid, *priority, &observation.modules, observation.timestamp));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::transform::PointLayer;

    fn cid(n: u8) -> Cid {
        let mut bytes = [0u8; 16];
        bytes[15] = n;
        Cid::from_bytes(bytes)
    }

    fn addr(point: u32) -> Address {
        Address::new(1, 1, point).expect("valid address")
    }

    fn layer(timestamp: u64, points: Vec<u32>, full: bool) -> TransformLayer {
        TransformLayer {
            system: 1,
            timestamp,
            full_point_set: full,
            points: points
                .into_iter()
                .map(|point| PointLayer {
                    priority: 100,
                    group: 1,
                    point,
                    timestamp,
                    modules: vec![Module::rotation(point, 0, 0)],
                })
                .collect(),
        }
    }

    #[test]
    fn test_note_packet_discovery_lifecycle() {
        let mut table = ProducerTable::new(Duration::from_millis(7_500));
        let now = Instant::now();

        assert_eq!(
            table.note_packet(cid(1), "p1", Family::V4, now),
            DiscoveryChange::Discovered
        );
        assert_eq!(
            table.note_packet(cid(1), "p1", Family::V4, now),
            DiscoveryChange::Unchanged
        );
        assert_eq!(
            table.note_packet(cid(1), "renamed", Family::V6, now),
            DiscoveryChange::Updated
        );

        let snapshot = table.snapshot(cid(1)).expect("snapshot");
        assert!(snapshot.seen_v4 && snapshot.seen_v6);
        assert_eq!(snapshot.name, "renamed");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_commit_requires_discovery() {
        let mut table = ProducerTable::new(Duration::from_millis(7_500));
        let commit = table.commit_transform(cid(1), &layer(10, vec![1], false), Instant::now());
        assert!(matches!(commit, TransformCommit::UnknownProducer));
    }

    #[test]
    fn test_replay_and_equal_timestamps_dropped() {
        let mut table = ProducerTable::new(Duration::from_millis(7_500));
        let now = Instant::now();
        table.note_packet(cid(1), "p1", Family::V4, now);

        assert!(matches!(
            table.commit_transform(cid(1), &layer(1_000, vec![1], false), now),
            TransformCommit::Applied(_)
        ));
        // One microsecond earlier: replay.
        assert!(matches!(
            table.commit_transform(cid(1), &layer(999, vec![1], false), now),
            TransformCommit::Stale
        ));
        // Equal timestamp: dropped too.
        assert!(matches!(
            table.commit_transform(cid(1), &layer(1_000, vec![1], false), now),
            TransformCommit::Stale
        ));
        // Strictly newer: applied.
        assert!(matches!(
            table.commit_transform(cid(1), &layer(1_001, vec![1], false), now),
            TransformCommit::Applied(_)
        ));
    }

    #[test]
    fn test_timestamp_wrap_uses_signed_difference() {
        assert!(timestamp_newer(1, u64::MAX));
        assert!(!timestamp_newer(u64::MAX, 1));

        let mut table = ProducerTable::new(Duration::from_millis(7_500));
        let now = Instant::now();
        table.note_packet(cid(1), "p1", Family::V4, now);
        assert!(matches!(
            table.commit_transform(cid(1), &layer(u64::MAX, vec![1], false), now),
            TransformCommit::Applied(_)
        ));
        // Wrapped past zero: still newer.
        assert!(matches!(
            table.commit_transform(cid(1), &layer(3, vec![1], false), now),
            TransformCommit::Applied(_)
        ));
    }

    #[test]
    fn test_full_point_set_replaces_system() {
        let mut table = ProducerTable::new(Duration::from_millis(7_500));
        let now = Instant::now();
        table.note_packet(cid(1), "p1", Family::V4, now);

        table.commit_transform(cid(1), &layer(10, vec![1, 2], false), now);
        assert_eq!(table.candidates(addr(1)).len(), 1);
        assert_eq!(table.candidates(addr(2)).len(), 1);

        // Full set listing only point 2: point 1 vanishes and is reported
        // as affected.
        let commit = table.commit_transform(cid(1), &layer(20, vec![2], true), now);
        match commit {
            TransformCommit::Applied(affected) => {
                assert!(affected.contains(&addr(1)));
                assert!(affected.contains(&addr(2)));
            }
            other => panic!("unexpected commit {:?}", other),
        }
        assert!(table.candidates(addr(1)).is_empty());
        assert_eq!(table.candidates(addr(2)).len(), 1);
    }

    #[test]
    fn test_sweep_removes_silent_producers() {
        let mut table = ProducerTable::new(Duration::from_millis(50));
        let t0 = Instant::now();
        table.note_packet(cid(1), "p1", Family::V4, t0);
        table.note_packet(cid(2), "p2", Family::V4, t0);
        table.commit_transform(cid(2), &layer(10, vec![7], false), t0);

        // p1 stays fresh; p2 goes silent.
        let t1 = t0 + Duration::from_millis(60);
        table.note_packet(cid(1), "p1", Family::V4, t1);

        let lost = table.sweep(t1);
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].0, cid(2));
        assert_eq!(lost[0].1, vec![addr(7)]);
        assert_eq!(table.len(), 1);
        assert!(table.candidates(addr(7)).is_empty());
    }

    #[test]
    fn test_advertisements_update_metadata_once() {
        let mut table = ProducerTable::new(Duration::from_millis(7_500));
        let now = Instant::now();
        table.note_packet(cid(1), "p1", Family::V4, now);

        let systems = AdvertisementLayer::System {
            systems: vec![1, 2],
        };
        assert!(table.note_advertisement(cid(1), &systems));
        assert!(!table.note_advertisement(cid(1), &systems));

        // A module request from a peer consumer is not producer metadata.
        let request = AdvertisementLayer::Module {
            request: true,
            modules: vec![ModuleIdentifier::standard(1)],
        };
        assert!(!table.note_advertisement(cid(1), &request));

        let snapshot = table.snapshot(cid(1)).expect("snapshot");
        assert_eq!(snapshot.systems, vec![1, 2]);
        assert!(snapshot.modules.is_empty());
    }

    #[test]
    fn test_candidates_span_producers_and_priorities() {
        let mut table = ProducerTable::new(Duration::from_millis(7_500));
        let now = Instant::now();
        table.note_packet(cid(1), "p1", Family::V4, now);
        table.note_packet(cid(2), "p2", Family::V4, now);

        table.commit_transform(cid(1), &layer(10, vec![5], false), now);
        let mut high = layer(10, vec![5], false);
        high.points[0].priority = 150;
        table.commit_transform(cid(2), &high, now);

        let candidates = table.candidates(addr(5));
        assert_eq!(candidates.len(), 2);
    }
}
