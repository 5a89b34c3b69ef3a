// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Folio reassembly for messages spanning multiple datagrams (pages).
//!
//! Pages of a folio must arrive in order; a gap aborts the folio and the
//! whole message is discarded. Folio numbers are modulo-2^32 sequence
//! numbers compared circularly. The pending set is memory-bounded: a cap on
//! concurrently open folios with oldest-first eviction, plus age-based
//! eviction for folios that stall.

use crate::core::Cid;
use crate::protocol::advertisement::AdvertisementLayer;
use crate::protocol::root::RootLayer;
use crate::protocol::OtpPacket;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Circular comparison: is folio `a` newer than folio `b`?
pub fn folio_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Identifies an independent folio sequence from one producer.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum StreamKey {
    /// Transform message stream for one system.
    Transform(u8),
    ModuleAdvertisement,
    NameAdvertisement,
    SystemAdvertisement,
}

impl StreamKey {
    pub fn of(packet: &OtpPacket) -> Self {
        match packet {
            OtpPacket::Transform(layer) => StreamKey::Transform(layer.system),
            OtpPacket::Advertisement(AdvertisementLayer::Module { .. }) => {
                StreamKey::ModuleAdvertisement
            }
            OtpPacket::Advertisement(AdvertisementLayer::Name { .. }) => {
                StreamKey::NameAdvertisement
            }
            OtpPacket::Advertisement(AdvertisementLayer::System { .. }) => {
                StreamKey::SystemAdvertisement
            }
        }
    }
}

/// Result of feeding one page into the assembler.
#[derive(Debug)]
pub enum FolioOutcome {
    /// The message is complete (single page, or last page just landed).
    Complete(OtpPacket),
    /// More pages expected.
    Pending,
    /// The page was dropped; any affected folio was aborted.
    Discarded,
}

struct PendingFolio {
    folio: u32,
    next_page: u16,
    last_page: u16,
    pages: Vec<OtpPacket>,
    first_seen: Instant,
    last_updated: Instant,
}

/// Per-(CID, stream) page reassembly buffer.
pub struct FolioAssembler {
    pending: HashMap<(Cid, StreamKey), PendingFolio>,
    max_pending: usize,
    timeout: Duration,
    aborted: u64,
}

impl FolioAssembler {
    pub fn new(max_pending: usize, timeout: Duration) -> Self {
        Self {
            pending: HashMap::with_capacity(max_pending),
            max_pending,
            timeout,
            aborted: 0,
        }
    }

    /// Total folios aborted since construction (gap, stall, eviction, or
    /// inconsistent pages).
    pub fn aborted_total(&self) -> u64 {
        self.aborted
    }

    /// Number of folios currently awaiting pages.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Feed one parsed page. `root` supplies the folio/page coordinates.
    pub fn insert(&mut self, root: &RootLayer, packet: OtpPacket) -> FolioOutcome {
        let key = (root.cid, StreamKey::of(&packet));
        let now = Instant::now();

        if root.last_page == 0 {
            // Single-page message; a newer complete message supersedes any
            // stalled folio on the same stream.
            if self.pending.remove(&key).is_some() {
                self.aborted += 1;
                log::debug!(
                    "[FOLIO] single-page message superseded pending folio cid={} key={:?}",
                    root.cid,
                    key.1
                );
            }
            return FolioOutcome::Complete(packet);
        }

        enum Step {
            Start,
            MissedOpen,
            Preempt,
            StaleDrop,
            Abort { expected: u16 },
            Append { complete: bool },
        }

        let step = match self.pending.get(&key) {
            None => {
                if root.page == 0 {
                    Step::Start
                } else {
                    Step::MissedOpen
                }
            }
            Some(open) => {
                if open.folio != root.folio {
                    if folio_newer(root.folio, open.folio) {
                        Step::Preempt
                    } else {
                        Step::StaleDrop
                    }
                } else if root.page != open.next_page || root.last_page != open.last_page {
                    Step::Abort {
                        expected: open.next_page,
                    }
                } else {
                    Step::Append {
                        complete: root.page == root.last_page,
                    }
                }
            }
        };

        match step {
            Step::Start => {
                self.open_folio(key, root, packet, now);
                FolioOutcome::Pending
            }
            Step::MissedOpen => {
                // Missed the opening page; nothing to assemble onto.
                self.aborted += 1;
                log::debug!(
                    "[FOLIO] page {}/{} without page 0, folio {} discarded cid={}",
                    root.page,
                    root.last_page,
                    root.folio,
                    root.cid
                );
                FolioOutcome::Discarded
            }
            Step::Preempt => {
                // Newer folio preempts the stalled one.
                self.pending.remove(&key);
                self.aborted += 1;
                if root.page == 0 {
                    self.open_folio(key, root, packet, now);
                    FolioOutcome::Pending
                } else {
                    self.aborted += 1;
                    FolioOutcome::Discarded
                }
            }
            // Stale page of an older folio; pending unaffected.
            Step::StaleDrop => FolioOutcome::Discarded,
            Step::Abort { expected } => {
                self.pending.remove(&key);
                self.aborted += 1;
                log::debug!(
                    "[FOLIO] aborted folio {} cid={}: got page {}/{}, expected {}",
                    root.folio,
                    root.cid,
                    root.page,
                    root.last_page,
                    expected
                );
                FolioOutcome::Discarded
            }
            Step::Append { complete } => {
                if complete {
                    let mut done = self
                        .pending
                        .remove(&key)
                        .expect("pending folio present, just matched");
                    done.pages.push(packet);
                    match merge_pages(done.pages) {
                        Some(merged) => FolioOutcome::Complete(merged),
                        None => {
                            self.aborted += 1;
                            FolioOutcome::Discarded
                        }
                    }
                } else {
                    let open = self
                        .pending
                        .get_mut(&key)
                        .expect("pending folio present, just matched");
                    open.pages.push(packet);
                    open.next_page += 1;
                    open.last_updated = now;
                    FolioOutcome::Pending
                }
            }
        }
    }

    fn open_folio(
        &mut self,
        key: (Cid, StreamKey),
        root: &RootLayer,
        packet: OtpPacket,
        now: Instant,
    ) {
        self.pending.insert(
            key,
            PendingFolio {
                folio: root.folio,
                next_page: 1,
                last_page: root.last_page,
                pages: vec![packet],
                first_seen: now,
                last_updated: now,
            },
        );
        if self.pending.len() > self.max_pending {
            self.evict_oldest();
        }
    }

    /// Drop folios whose first page is older than the timeout. Returns the
    /// number evicted.
    pub fn evict_expired(&mut self) -> usize {
        let now = Instant::now();
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, folio| now.duration_since(folio.first_seen) <= timeout);
        let evicted = before - self.pending.len();
        self.aborted += evicted as u64;
        if evicted > 0 {
            log::debug!("[FOLIO] evicted {} stalled folios", evicted);
            self.pending.shrink_to_fit();
        }
        evicted
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, folio)| folio.last_updated)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            self.pending.remove(&key);
            self.aborted += 1;
            log::debug!("[FOLIO] capacity eviction cid={} key={:?}", key.0, key.1);
        }
    }
}

/// Combine the pages of a completed folio into one logical message.
///
/// Pages must agree on kind (and on system for transforms); the first page
/// supplies the timestamp and option flags.
fn merge_pages(pages: Vec<OtpPacket>) -> Option<OtpPacket> {
    let mut iter = pages.into_iter();
    let first = iter.next()?;
    match first {
        OtpPacket::Transform(mut head) => {
            for page in iter {
                match page {
                    OtpPacket::Transform(tail) if tail.system == head.system => {
                        head.points.extend(tail.points);
                    }
                    _ => return None,
                }
            }
            Some(OtpPacket::Transform(head))
        }
        OtpPacket::Advertisement(AdvertisementLayer::Module {
            request,
            mut modules,
        }) => {
            for page in iter {
                match page {
                    OtpPacket::Advertisement(AdvertisementLayer::Module {
                        modules: tail, ..
                    }) => modules.extend(tail),
                    _ => return None,
                }
            }
            Some(OtpPacket::Advertisement(AdvertisementLayer::Module {
                request,
                modules,
            }))
        }
        OtpPacket::Advertisement(AdvertisementLayer::Name { mut points }) => {
            for page in iter {
                match page {
                    OtpPacket::Advertisement(AdvertisementLayer::Name { points: tail }) => {
                        points.extend(tail);
                    }
                    _ => return None,
                }
            }
            Some(OtpPacket::Advertisement(AdvertisementLayer::Name { points }))
        }
        OtpPacket::Advertisement(AdvertisementLayer::System { mut systems }) => {
            for page in iter {
                match page {
                    OtpPacket::Advertisement(AdvertisementLayer::System { systems: tail }) => {
                        systems.extend(tail);
                    }
                    _ => return None,
                }
            }
            Some(OtpPacket::Advertisement(AdvertisementLayer::System { systems }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::VECTOR_TRANSFORM;
    use crate::protocol::transform::{PointLayer, TransformLayer};

    fn transform_page(points: Vec<u32>) -> OtpPacket {
        OtpPacket::Transform(TransformLayer {
            system: 1,
            timestamp: 42,
            full_point_set: false,
            points: points
                .into_iter()
                .map(|point| PointLayer {
                    priority: 100,
                    group: 1,
                    point,
                    timestamp: 42,
                    modules: Vec::new(),
                })
                .collect(),
        })
    }

    fn root_page(folio: u32, page: u16, last_page: u16) -> RootLayer {
        RootLayer {
            vector: VECTOR_TRANSFORM,
            cid: Cid::from_bytes([9; 16]),
            folio,
            page,
            last_page,
            options: 0,
            name: String::new(),
        }
    }

    fn assembler() -> FolioAssembler {
        FolioAssembler::new(16, Duration::from_millis(500))
    }

    #[test]
    fn test_single_page_completes_immediately() {
        let mut asm = assembler();
        match asm.insert(&root_page(5, 0, 0), transform_page(vec![1])) {
            FolioOutcome::Complete(OtpPacket::Transform(layer)) => {
                assert_eq!(layer.points.len(), 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(asm.pending_count(), 0);
        assert_eq!(asm.aborted_total(), 0);
    }

    #[test]
    fn test_in_order_pages_reassemble() {
        let mut asm = assembler();
        assert!(matches!(
            asm.insert(&root_page(7, 0, 2), transform_page(vec![1])),
            FolioOutcome::Pending
        ));
        assert!(matches!(
            asm.insert(&root_page(7, 1, 2), transform_page(vec![2])),
            FolioOutcome::Pending
        ));
        match asm.insert(&root_page(7, 2, 2), transform_page(vec![3])) {
            FolioOutcome::Complete(OtpPacket::Transform(layer)) => {
                let points: Vec<u32> = layer.points.iter().map(|p| p.point).collect();
                assert_eq!(points, vec![1, 2, 3]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(asm.aborted_total(), 0);
    }

    #[test]
    fn test_gap_aborts_folio() {
        let mut asm = assembler();
        assert!(matches!(
            asm.insert(&root_page(7, 0, 3), transform_page(vec![1])),
            FolioOutcome::Pending
        ));
        // Page 2 arrives where page 1 was expected.
        assert!(matches!(
            asm.insert(&root_page(7, 2, 3), transform_page(vec![3])),
            FolioOutcome::Discarded
        ));
        assert_eq!(asm.pending_count(), 0);
        assert_eq!(asm.aborted_total(), 1);

        // Remaining pages of the aborted folio are discarded too.
        assert!(matches!(
            asm.insert(&root_page(7, 3, 3), transform_page(vec![4])),
            FolioOutcome::Discarded
        ));
    }

    #[test]
    fn test_missing_opening_page_discards() {
        let mut asm = assembler();
        assert!(matches!(
            asm.insert(&root_page(9, 1, 2), transform_page(vec![1])),
            FolioOutcome::Discarded
        ));
        assert_eq!(asm.aborted_total(), 1);
    }

    #[test]
    fn test_newer_folio_preempts_stalled_one() {
        let mut asm = assembler();
        assert!(matches!(
            asm.insert(&root_page(10, 0, 2), transform_page(vec![1])),
            FolioOutcome::Pending
        ));
        // Folio 11 starts before 10 completes.
        assert!(matches!(
            asm.insert(&root_page(11, 0, 1), transform_page(vec![5])),
            FolioOutcome::Pending
        ));
        assert_eq!(asm.aborted_total(), 1);
        match asm.insert(&root_page(11, 1, 1), transform_page(vec![6])) {
            FolioOutcome::Complete(OtpPacket::Transform(layer)) => {
                let points: Vec<u32> = layer.points.iter().map(|p| p.point).collect();
                assert_eq!(points, vec![5, 6]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_folio_wrap_is_circular() {
        assert!(folio_newer(0, u32::MAX));
        assert!(!folio_newer(u32::MAX, 0));
        assert!(folio_newer(5, 3));
        assert!(!folio_newer(3, 5));

        // A folio starting at u32::MAX completes into folio 0.
        let mut asm = assembler();
        assert!(matches!(
            asm.insert(&root_page(u32::MAX, 0, 1), transform_page(vec![1])),
            FolioOutcome::Pending
        ));
        assert!(matches!(
            asm.insert(&root_page(u32::MAX, 1, 1), transform_page(vec![2])),
            FolioOutcome::Complete(_)
        ));
        assert!(matches!(
            asm.insert(&root_page(0, 0, 0), transform_page(vec![3])),
            FolioOutcome::Complete(_)
        ));
    }

    #[test]
    fn test_random_page_walks() {
        let mut rng = fastrand::Rng::with_seed(0xF0110);

        for _ in 0..100 {
            let mut asm = assembler();
            let last_page = rng.u16(2..=6);
            let folio = rng.u32(..);
            // Either a clean in-order walk, or one page dropped mid-folio.
            let gap = rng.bool().then(|| rng.u16(1..last_page));

            let mut resolved = false;
            for page in 0..=last_page {
                if Some(page) == gap {
                    continue;
                }
                let packet = transform_page(vec![u32::from(page) + 1]);
                match asm.insert(&root_page(folio, page, last_page), packet) {
                    FolioOutcome::Complete(OtpPacket::Transform(layer)) => {
                        assert!(gap.is_none(), "gap walk must never complete");
                        assert_eq!(page, last_page);
                        let seq: Vec<u32> = layer.points.iter().map(|p| p.point).collect();
                        let expected: Vec<u32> = (1..=u32::from(last_page) + 1).collect();
                        assert_eq!(seq, expected, "pages must merge in order");
                        resolved = true;
                    }
                    FolioOutcome::Complete(other) => panic!("unexpected packet {:?}", other),
                    FolioOutcome::Pending => {}
                    FolioOutcome::Discarded => {
                        assert!(gap.is_some(), "clean walk must never discard");
                        assert_eq!(asm.pending_count(), 0, "gap aborts the folio");
                        resolved = true;
                        break;
                    }
                }
            }
            assert!(resolved, "every walk ends in completion or abort");
        }
    }

    #[test]
    fn test_timeout_eviction() {
        let mut asm = FolioAssembler::new(16, Duration::from_millis(50));
        asm.insert(&root_page(1, 0, 2), transform_page(vec![1]));
        assert_eq!(asm.pending_count(), 1);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(asm.evict_expired(), 1);
        assert_eq!(asm.pending_count(), 0);
        assert_eq!(asm.aborted_total(), 1);
    }

    #[test]
    fn test_capacity_eviction() {
        let mut asm = FolioAssembler::new(2, Duration::from_millis(500));
        for folio in 0..3u32 {
            let mut root = root_page(folio, 0, 2);
            // Distinct streams so the folios coexist.
            root.cid = Cid::from_bytes([folio as u8; 16]);
            asm.insert(&root, transform_page(vec![1]));
        }
        assert_eq!(asm.pending_count(), 2);
        assert_eq!(asm.aborted_total(), 1);
    }

    #[test]
    fn test_streams_are_independent() {
        let mut asm = assembler();
        let mut transform_root = root_page(3, 0, 1);
        asm.insert(&transform_root.clone(), transform_page(vec![1]));

        // A system advertisement folio on the same CID does not interfere.
        let ad = OtpPacket::Advertisement(AdvertisementLayer::System { systems: vec![1] });
        transform_root.folio = 90;
        transform_root.last_page = 0;
        transform_root.page = 0;
        assert!(matches!(
            asm.insert(&transform_root, ad),
            FolioOutcome::Complete(_)
        ));
        assert_eq!(asm.pending_count(), 1);
    }
}
