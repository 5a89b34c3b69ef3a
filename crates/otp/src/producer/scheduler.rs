// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transmit scheduling and datagram assembly.
//!
//! The scheduler is pure bookkeeping: given "now" it decides which systems
//! get a partial transform, which get a keepalive full point set, and when
//! the advertisement triple goes out. The builders turn snapshots into
//! ready-to-send datagrams, splitting at point/list-entry boundaries when a
//! message would exceed the datagram ceiling. Folio counters advance
//! independently per transform stream and per advertisement kind.

use crate::config::{ADVERTISEMENT_INTERVAL_MS, FULL_POINT_SET_INTERVAL_MS};
use crate::core::ser::SerResult;
use crate::core::Cid;
use crate::protocol::advertisement::{AdvertisementLayer, NameAdvertisement};
use crate::protocol::constants::{
    ADVERTISEMENT_HEADER_SIZE, MAX_DATAGRAM_SIZE, MODULE_AD_ENTRY_SIZE, NAME_AD_ENTRY_SIZE,
    ROOT_LAYER_SIZE, SYSTEM_AD_ENTRY_SIZE, TRANSFORM_HEADER_SIZE, VECTOR_ADVERTISEMENT,
    VECTOR_TRANSFORM,
};
use crate::protocol::module::ModuleIdentifier;
use crate::protocol::root::RootLayer;
use crate::protocol::transform::{PointLayer, TransformLayer};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What one tick should emit.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickPlan {
    /// Systems to send a dirty-points-only transform for.
    pub partial_systems: Vec<u8>,
    /// Systems due a full point set (keepalive/resync).
    pub full_systems: Vec<u8>,
    /// Whether the advertisement triple is due.
    pub advertise: bool,
}

/// Cadence bookkeeping for one producer.
pub struct TransmitScheduler {
    full_interval: Duration,
    advertisement_interval: Duration,
    last_full: HashMap<u8, Instant>,
    last_advertisement: Option<Instant>,
    transform_folios: HashMap<u8, u32>,
    module_ad_folio: u32,
    name_ad_folio: u32,
    system_ad_folio: u32,
}

impl Default for TransmitScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmitScheduler {
    pub fn new() -> Self {
        Self {
            full_interval: Duration::from_millis(FULL_POINT_SET_INTERVAL_MS),
            advertisement_interval: Duration::from_millis(ADVERTISEMENT_INTERVAL_MS),
            last_full: HashMap::new(),
            last_advertisement: None,
            transform_folios: HashMap::new(),
            module_ad_folio: 0,
            name_ad_folio: 0,
            system_ad_folio: 0,
        }
    }

    /// Decide the emissions of this tick.
    ///
    /// `dirty` holds systems touched since the previous tick; `active` holds
    /// every system owning at least one point. Systems promoted to a full
    /// set are dropped from the partial list; their keepalive clock resets.
    pub fn plan(&mut self, now: Instant, dirty: &[u8], active: &[u8]) -> TickPlan {
        let mut full_systems = Vec::new();
        for &system in active {
            let due = self
                .last_full
                .get(&system)
                .map_or(true, |last| now.duration_since(*last) >= self.full_interval);
            if due {
                self.last_full.insert(system, now);
                full_systems.push(system);
            }
        }
        // Systems no longer active stop accruing keepalive state.
        self.last_full.retain(|system, _| active.contains(system));

        let partial_systems = dirty
            .iter()
            .copied()
            .filter(|system| active.contains(system) && !full_systems.contains(system))
            .collect();

        let advertise = self
            .last_advertisement
            .map_or(true, |last| now.duration_since(last) >= self.advertisement_interval);
        if advertise {
            self.last_advertisement = Some(now);
        }

        TickPlan {
            partial_systems,
            full_systems,
            advertise,
        }
    }

    /// Next folio number of the transform stream for `system`.
    pub fn next_transform_folio(&mut self, system: u8) -> u32 {
        let counter = self.transform_folios.entry(system).or_insert(0);
        let folio = *counter;
        *counter = counter.wrapping_add(1);
        folio
    }

    pub fn next_module_ad_folio(&mut self) -> u32 {
        let folio = self.module_ad_folio;
        self.module_ad_folio = self.module_ad_folio.wrapping_add(1);
        folio
    }

    pub fn next_name_ad_folio(&mut self) -> u32 {
        let folio = self.name_ad_folio;
        self.name_ad_folio = self.name_ad_folio.wrapping_add(1);
        folio
    }

    pub fn next_system_ad_folio(&mut self) -> u32 {
        let folio = self.system_ad_folio;
        self.system_ad_folio = self.system_ad_folio.wrapping_add(1);
        folio
    }
}

/// Payload budget available to point layers within one transform datagram.
pub const fn transform_point_budget() -> usize {
    MAX_DATAGRAM_SIZE - ROOT_LAYER_SIZE - TRANSFORM_HEADER_SIZE
}

/// Split points into pages that each fit the datagram budget.
///
/// Splitting happens only at point boundaries. A single point too large for
/// a page cannot be transmitted and is dropped with a log line. An empty
/// input still yields one (empty) page so a full point set of an emptied
/// system goes out.
pub fn paginate_points(points: Vec<PointLayer>, budget: usize) -> Vec<Vec<PointLayer>> {
    let mut pages: Vec<Vec<PointLayer>> = Vec::new();
    let mut current: Vec<PointLayer> = Vec::new();
    let mut current_size = 0usize;

    for point in points {
        let size = point.encoded_size();
        if size > budget {
            log::warn!(
                "[PRODUCER] point {}/{} with {} module bytes exceeds datagram budget, dropped",
                point.group,
                point.point,
                size
            );
            continue;
        }
        if current_size + size > budget && !current.is_empty() {
            pages.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += size;
        current.push(point);
    }
    if !current.is_empty() || pages.is_empty() {
        pages.push(current);
    }
    pages
}

/// Build the datagram sequence for one transform message.
///
/// Every page shares the folio, timestamp, and option flags; pages are
/// numbered 0..=last.
pub fn build_transform_datagrams(
    cid: Cid,
    name: &str,
    system: u8,
    timestamp: u64,
    full_point_set: bool,
    points: Vec<PointLayer>,
    folio: u32,
) -> SerResult<Vec<Vec<u8>>> {
    let pages = paginate_points(points, transform_point_budget());
    let last_page = (pages.len() - 1) as u16;

    let mut datagrams = Vec::with_capacity(pages.len());
    for (index, page) in pages.into_iter().enumerate() {
        let layer = TransformLayer {
            system,
            timestamp,
            full_point_set,
            points: page,
        };
        let root = RootLayer {
            vector: VECTOR_TRANSFORM,
            cid,
            folio,
            page: index as u16,
            last_page,
            options: 0,
            name: name.to_owned(),
        };
        datagrams.push(root.build(&layer.encode()?)?);
    }
    Ok(datagrams)
}

fn advertisement_pages(layer: AdvertisementLayer) -> Vec<AdvertisementLayer> {
    let budget = MAX_DATAGRAM_SIZE - ROOT_LAYER_SIZE - ADVERTISEMENT_HEADER_SIZE;
    match layer {
        AdvertisementLayer::Module { request, modules } => {
            let per_page = (budget - 1) / MODULE_AD_ENTRY_SIZE;
            chunk(modules, per_page)
                .into_iter()
                .map(|modules| AdvertisementLayer::Module { request, modules })
                .collect()
        }
        AdvertisementLayer::Name { points } => {
            let per_page = budget / NAME_AD_ENTRY_SIZE;
            chunk(points, per_page)
                .into_iter()
                .map(|points| AdvertisementLayer::Name { points })
                .collect()
        }
        AdvertisementLayer::System { systems } => {
            let per_page = budget / SYSTEM_AD_ENTRY_SIZE;
            chunk(systems, per_page)
                .into_iter()
                .map(|systems| AdvertisementLayer::System { systems })
                .collect()
        }
    }
}

fn chunk<T>(items: Vec<T>, per_page: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return vec![Vec::new()];
    }
    let mut pages = Vec::with_capacity(items.len().div_ceil(per_page));
    let mut current = Vec::new();
    for item in items {
        if current.len() == per_page {
            pages.push(std::mem::take(&mut current));
        }
        current.push(item);
    }
    pages.push(current);
    pages
}

/// Build the datagram sequence for one advertisement message, paginating
/// the contained list when it exceeds a single datagram.
pub fn build_advertisement_datagrams(
    cid: Cid,
    name: &str,
    layer: AdvertisementLayer,
    folio: u32,
) -> SerResult<Vec<Vec<u8>>> {
    let pages = advertisement_pages(layer);
    let last_page = (pages.len() - 1) as u16;

    let mut datagrams = Vec::with_capacity(pages.len());
    for (index, page) in pages.into_iter().enumerate() {
        let root = RootLayer {
            vector: VECTOR_ADVERTISEMENT,
            cid,
            folio,
            page: index as u16,
            last_page,
            options: 0,
            name: name.to_owned(),
        };
        datagrams.push(root.build(&page.encode()?)?);
    }
    Ok(datagrams)
}

/// Convenience builder for a producer's module advertisement response.
pub fn module_advertisement(modules: Vec<ModuleIdentifier>) -> AdvertisementLayer {
    AdvertisementLayer::Module {
        request: false,
        modules,
    }
}

/// Convenience builder for the name advertisement list.
pub fn name_advertisement(points: Vec<(crate::core::Address, String)>) -> AdvertisementLayer {
    AdvertisementLayer::Name {
        points: points
            .into_iter()
            .map(|(address, name)| NameAdvertisement { address, name })
            .collect(),
    }
}
