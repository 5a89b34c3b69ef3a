// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer engine: discovery, reassembly, merge, and delegate events.
//!
//! One background thread owns the sockets and every mutable table. Inbound
//! datagrams run the full validation stack; failures are counted, never
//! surfaced. Application threads read through [`MergedTable`] snapshots and
//! drain coalesced [`Event`] batches from a channel, so the ingress worker
//! never runs application code.

pub mod events;
pub mod merge;
pub mod table;

pub use events::Event;
pub use merge::{MergedPoint, MergedTable};
pub use table::{DiscoveredProducer, ProducerTable};

use crate::config::{
    ADVERTISEMENT_INTERVAL_MS, DATA_LOSS_TIMEOUT_MS, DEFAULT_DELEGATE_INTERVAL_MS,
    FOLIO_MAX_PENDING, FOLIO_TIMEOUT_MS, OTP_PORT, RECV_BUFFER_SIZE,
};
use crate::core::address::{SYSTEM_MAX, SYSTEM_MIN};
use crate::core::{Address, Cid};
use crate::error::{Error, Result};
use crate::protocol::advertisement::AdvertisementLayer;
use crate::protocol::constants::VECTOR_ADVERTISEMENT;
use crate::protocol::module::{Module, ModuleIdentifier, ModuleRegistry};
use crate::protocol::root::RootLayer;
use crate::protocol::{parse_datagram, FolioAssembler, FolioOutcome, OtpPacket};
use crate::transport::multicast::{ADVERTISEMENT_GROUP_V4, ADVERTISEMENT_GROUP_V6};
use crate::transport::{Family, IpMode, SocketBundle, TtlConfig};
use crossbeam::channel::{Receiver, Sender};
use dashmap::DashMap;
use events::EventQueue;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use table::{DiscoveryChange, TransformCommit};

const TOKEN_V4: Token = Token(0);
const TOKEN_V6: Token = Token(1);
const TOKEN_WAKE: Token = Token(2);

/// Consumer configuration. Construct with [`ConsumerConfig::new`] and chain
/// `with_*` methods.
#[derive(Clone)]
pub struct ConsumerConfig {
    pub(crate) name: String,
    pub(crate) cid: Cid,
    pub(crate) ip_mode: IpMode,
    pub(crate) iface_v4: Option<Ipv4Addr>,
    pub(crate) ifindex_v6: u32,
    pub(crate) systems: Vec<u8>,
    pub(crate) modules: Vec<ModuleIdentifier>,
    pub(crate) delegate_interval: Duration,
    pub(crate) data_loss_timeout: Duration,
    pub(crate) ttl: TtlConfig,
}

impl ConsumerConfig {
    /// Defaults: random CID, IPv4 only, no observed systems, the full
    /// standard module decode set, 100 ms delegate interval, 7.5 s
    /// data-loss timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cid: Cid::generate(),
            ip_mode: IpMode::default(),
            iface_v4: None,
            ifindex_v6: 0,
            systems: Vec::new(),
            modules: ModuleRegistry::standard().identifiers(),
            delegate_interval: Duration::from_millis(DEFAULT_DELEGATE_INTERVAL_MS),
            data_loss_timeout: Duration::from_millis(DATA_LOSS_TIMEOUT_MS),
            ttl: TtlConfig::from_env(),
        }
    }

    pub fn with_cid(mut self, cid: Cid) -> Self {
        self.cid = cid;
        self
    }

    pub fn with_ip_mode(mut self, mode: IpMode) -> Self {
        self.ip_mode = mode;
        self
    }

    pub fn with_interface_v4(mut self, iface: Ipv4Addr) -> Self {
        self.iface_v4 = Some(iface);
        self
    }

    pub fn with_interface_v6_index(mut self, ifindex: u32) -> Self {
        self.ifindex_v6 = ifindex;
        self
    }

    /// Systems to observe. Out-of-range numbers are dropped with a log
    /// line; duplicates collapse.
    pub fn with_systems(mut self, systems: impl IntoIterator<Item = u8>) -> Self {
        let mut valid: Vec<u8> = systems
            .into_iter()
            .filter(|system| {
                let ok = (SYSTEM_MIN..=SYSTEM_MAX).contains(system);
                if !ok {
                    log::debug!("[CONSUMER] ignoring out-of-range system {}", system);
                }
                ok
            })
            .collect();
        valid.sort_unstable();
        valid.dedup();
        self.systems = valid;
        self
    }

    /// Module types to decode; everything else surfaces as unknown.
    pub fn with_modules(mut self, modules: Vec<ModuleIdentifier>) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_delegate_interval_ms(mut self, millis: u64) -> Self {
        self.delegate_interval = Duration::from_millis(millis);
        self
    }

    pub fn with_data_loss_timeout_ms(mut self, millis: u64) -> Self {
        self.data_loss_timeout = Duration::from_millis(millis);
        self
    }

    pub fn with_ttl(mut self, ttl: TtlConfig) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Receive-side counters, readable while the consumer runs.
#[derive(Default)]
pub struct ConsumerStats {
    datagrams_received: AtomicU64,
    malformed_dropped: AtomicU64,
    stale_dropped: AtomicU64,
    folios_completed: AtomicU64,
    folios_aborted: AtomicU64,
    producers_discovered: AtomicU64,
    producers_lost: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub datagrams_received: u64,
    pub malformed_dropped: u64,
    pub stale_dropped: u64,
    pub folios_completed: u64,
    pub folios_aborted: u64,
    pub producers_discovered: u64,
    pub producers_lost: u64,
}

impl ConsumerStats {
    fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            folios_completed: self.folios_completed.load(Ordering::Relaxed),
            folios_aborted: self.folios_aborted.load(Ordering::Relaxed),
            producers_discovered: self.producers_discovered.load(Ordering::Relaxed),
            producers_lost: self.producers_lost.load(Ordering::Relaxed),
        }
    }
}

/// An OTP consumer: discovers producers and maintains the merged address
/// table.
pub struct Consumer {
    config: ConsumerConfig,
    merged: MergedTable,
    producers: Arc<DashMap<Cid, DiscoveredProducer>>,
    stats: Arc<ConsumerStats>,
    events_tx: Sender<Vec<Event>>,
    events_rx: Receiver<Vec<Event>>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    waker: Option<Waker>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig) -> Self {
        let (events_tx, events_rx) = crossbeam::channel::unbounded();
        log::info!(
            "[CONSUMER] created cid={} name={:?} systems={:?}",
            config.cid,
            config.name,
            config.systems
        );
        Self {
            config,
            merged: MergedTable::new(),
            producers: Arc::new(DashMap::new()),
            stats: Arc::new(ConsumerStats::default()),
            events_tx,
            events_rx,
            worker: None,
            stop: Arc::new(AtomicBool::new(false)),
            waker: None,
        }
    }

    pub fn cid(&self) -> Cid {
        self.config.cid
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// The coalesced event channel; drain it from any application thread.
    pub fn events(&self) -> Receiver<Vec<Event>> {
        self.events_rx.clone()
    }

    /// Winning view of one address, if any non-stale producer reports it.
    pub fn merged_point(&self, address: Address) -> Option<MergedPoint> {
        self.merged.get(address)
    }

    /// The whole merged address table, in address order.
    pub fn merged_points(&self) -> Vec<MergedPoint> {
        self.merged.entries()
    }

    /// Snapshot of every known producer, in CID order.
    pub fn producers(&self) -> Vec<DiscoveredProducer> {
        let mut out: Vec<DiscoveredProducer> = self
            .producers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|producer| producer.cid);
        out
    }

    pub fn statistics(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Bind sockets, join the advertisement group and every observed
    /// system's transform group, and start the ingress worker. On failure
    /// the consumer stays Idle.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::InvalidState("consumer already running"));
        }

        let bundle = SocketBundle::bind(
            self.config.ip_mode,
            self.config.iface_v4,
            self.config.ifindex_v6,
            &self.config.ttl,
        )
        .map_err(Error::Bind)?;
        bundle.join_advertisement_group().map_err(Error::Io)?;
        for &system in &self.config.systems {
            bundle.join_transform_system(system).map_err(Error::Io)?;
        }
        bundle.set_nonblocking(true).map_err(Error::Io)?;

        let poll = Poll::new().map_err(Error::Io)?;
        let (std_v4, std_v6) = bundle.into_parts();
        let mut sock_v4 = std_v4.map(MioUdpSocket::from_std);
        let mut sock_v6 = std_v6.map(MioUdpSocket::from_std);
        if let Some(socket) = &mut sock_v4 {
            poll.registry()
                .register(socket, TOKEN_V4, Interest::READABLE)
                .map_err(Error::Io)?;
        }
        if let Some(socket) = &mut sock_v6 {
            poll.registry()
                .register(socket, TOKEN_V6, Interest::READABLE)
                .map_err(Error::Io)?;
        }
        let waker = Waker::new(poll.registry(), TOKEN_WAKE).map_err(Error::Io)?;

        self.stop.store(false, Ordering::Relaxed);
        // A restart begins from an empty view; producers re-announce within
        // one advertisement interval.
        self.merged.clear();
        self.producers.clear();
        let worker = Worker {
            cid: self.config.cid,
            name: self.config.name.clone(),
            systems: self.config.systems.clone(),
            decode_set: self.config.modules.clone(),
            registry: ModuleRegistry::standard_subset(&self.config.modules),
            table: ProducerTable::new(self.config.data_loss_timeout),
            assembler: FolioAssembler::new(
                FOLIO_MAX_PENDING,
                Duration::from_millis(FOLIO_TIMEOUT_MS),
            ),
            merged: self.merged.clone(),
            producers: Arc::clone(&self.producers),
            stats: Arc::clone(&self.stats),
            events: EventQueue::new(self.config.delegate_interval, self.events_tx.clone()),
            poll,
            sock_v4,
            sock_v6,
            stop: Arc::clone(&self.stop),
            delegate_interval: self.config.delegate_interval,
            last_tick: None,
            last_request: None,
            request_folio: 0,
        };
        let handle = std::thread::Builder::new()
            .name("otp-consumer".into())
            .spawn(move || worker.run())
            .map_err(Error::Io)?;

        self.worker = Some(handle);
        self.waker = Some(waker);
        log::info!("[CONSUMER] started cid={}", self.config.cid);
        Ok(())
    }

    /// Signal the worker, wait for the in-flight callback to return,
    /// release the sockets.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.worker.take() else {
            return Err(Error::InvalidState("consumer not running"));
        };
        self.stop.store(true, Ordering::Relaxed);
        if let Some(waker) = self.waker.take() {
            let _ = waker.wake();
        }
        let _ = handle.join();
        log::info!("[CONSUMER] stopped cid={}", self.config.cid);
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop();
        }
    }
}

struct Worker {
    cid: Cid,
    name: String,
    systems: Vec<u8>,
    decode_set: Vec<ModuleIdentifier>,
    registry: ModuleRegistry,
    table: ProducerTable,
    assembler: FolioAssembler,
    merged: MergedTable,
    producers: Arc<DashMap<Cid, DiscoveredProducer>>,
    stats: Arc<ConsumerStats>,
    events: EventQueue,
    poll: Poll,
    sock_v4: Option<MioUdpSocket>,
    sock_v6: Option<MioUdpSocket>,
    stop: Arc<AtomicBool>,
    delegate_interval: Duration,
    last_tick: Option<Instant>,
    last_request: Option<Instant>,
    request_folio: u32,
}

impl Worker {
    fn run(mut self) {
        let mut mio_events = Events::with_capacity(64);
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            match self.poll.poll(&mut mio_events, Some(self.delegate_interval)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("[CONSUMER] poll failed: {}", err);
                    break;
                }
            }
            if self.stop.load(Ordering::Relaxed) {
                break;
            }

            let mut readable_v4 = false;
            let mut readable_v6 = false;
            for event in mio_events.iter() {
                match event.token() {
                    TOKEN_V4 => readable_v4 = true,
                    TOKEN_V6 => readable_v6 = true,
                    _ => {}
                }
            }
            if readable_v4 {
                self.drain_family(Family::V4, &mut buf);
            }
            if readable_v6 {
                self.drain_family(Family::V6, &mut buf);
            }

            self.tick(Instant::now());
        }
        log::debug!("[CONSUMER] worker exiting cid={}", self.cid);
    }

    fn drain_family(&mut self, family: Family, buf: &mut [u8]) {
        loop {
            let socket = match family {
                Family::V4 => self.sock_v4.as_ref(),
                Family::V6 => self.sock_v6.as_ref(),
            };
            let Some(socket) = socket else { return };
            match socket.recv_from(buf) {
                Ok((len, _source)) => self.handle_datagram(len, buf, family),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::debug!("[CONSUMER] recv_from failed on {:?}: {}", family, err);
                    return;
                }
            }
        }
    }

    fn handle_datagram(&mut self, len: usize, buf: &[u8], family: Family) {
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
        let datagram = &buf[..len];

        let parsed = match parse_datagram(datagram, &self.registry) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("[CONSUMER] dropped malformed datagram: {}", err);
                return;
            }
        };

        if parsed.root.cid == self.cid {
            return; // our own advertisement requests looped back
        }
        // Requests from peer consumers are not producer traffic.
        if matches!(
            parsed.packet,
            OtpPacket::Advertisement(AdvertisementLayer::Module { request: true, .. })
        ) {
            return;
        }
        // Membership is per host, so traffic for unobserved systems can
        // still land on our port.
        if let OtpPacket::Transform(layer) = &parsed.packet {
            if !self.systems.contains(&layer.system) {
                return;
            }
        }

        let now = Instant::now();
        let cid = parsed.root.cid;
        match self.table.note_packet(cid, &parsed.root.name, family, now) {
            DiscoveryChange::Discovered => {
                self.stats.producers_discovered.fetch_add(1, Ordering::Relaxed);
                self.publish_producer(cid, Event::ProducerDiscovered);
            }
            DiscoveryChange::Updated => self.publish_producer(cid, Event::ProducerUpdated),
            DiscoveryChange::Unchanged => {}
        }

        if let OtpPacket::Transform(layer) = &parsed.packet {
            for point in &layer.points {
                for module in &point.modules {
                    if let Module::Opaque { ident, .. } = module {
                        self.events.note_unknown_module(cid, *ident);
                    }
                }
            }
        }

        match self.assembler.insert(&parsed.root, parsed.packet) {
            FolioOutcome::Complete(packet) => {
                self.stats.folios_completed.fetch_add(1, Ordering::Relaxed);
                self.commit(cid, packet, now);
            }
            FolioOutcome::Pending | FolioOutcome::Discarded => {}
        }
        self.stats
            .folios_aborted
            .store(self.assembler.aborted_total(), Ordering::Relaxed);
    }

    fn publish_producer(&mut self, cid: Cid, wrap: fn(DiscoveredProducer) -> Event) {
        if let Some(snapshot) = self.table.snapshot(cid) {
            self.producers.insert(cid, snapshot.clone());
            self.events.push(wrap(snapshot));
        }
    }

    fn commit(&mut self, cid: Cid, packet: OtpPacket, now: Instant) {
        match packet {
            OtpPacket::Transform(layer) => match self.table.commit_transform(cid, &layer, now) {
                TransformCommit::Applied(addresses) => self.remerge(&addresses),
                TransformCommit::Stale => {
                    self.stats.stale_dropped.fetch_add(1, Ordering::Relaxed);
                }
                TransformCommit::UnknownProducer => {}
            },
            OtpPacket::Advertisement(layer) => {
                if self.table.note_advertisement(cid, &layer) {
                    self.publish_producer(cid, Event::ProducerUpdated);
                }
            }
        }
    }

    fn remerge(&mut self, addresses: &[Address]) {
        for &address in addresses {
            let merged = merge::merge_address(&self.table, address);
            let outcome = self.merged.apply(address, merged);
            if outcome.winner_changed() {
                self.events.push(Event::WinnerChanged {
                    address,
                    previous: outcome.previous_winner,
                    current: outcome.current_winner,
                });
            }
            if outcome.changed {
                if outcome.current_winner.is_some() {
                    self.events.note_point_updated(address);
                } else {
                    self.events.note_point_removed(address);
                }
            }
        }
    }

    /// Periodic duties, rate-limited to the delegate interval: staleness
    /// sweep (with winner promotion in the same pass), folio eviction, the
    /// consumer's module advertisement request, and the event flush.
    fn tick(&mut self, now: Instant) {
        let due = self
            .last_tick
            .map_or(true, |last| now.duration_since(last) >= self.delegate_interval);
        if !due {
            return;
        }
        self.last_tick = Some(now);

        let lost = self.table.sweep(now);
        for (cid, addresses) in lost {
            self.stats.producers_lost.fetch_add(1, Ordering::Relaxed);
            self.producers.remove(&cid);
            self.events.push(Event::ProducerLost { cid });
            self.remerge(&addresses);
        }

        self.assembler.evict_expired();
        self.stats
            .folios_aborted
            .store(self.assembler.aborted_total(), Ordering::Relaxed);

        self.send_module_request_if_due(now);
        self.events.flush_due(now);
    }

    fn send_module_request_if_due(&mut self, now: Instant) {
        let interval = Duration::from_millis(ADVERTISEMENT_INTERVAL_MS);
        let due = self
            .last_request
            .map_or(true, |last| now.duration_since(last) >= interval);
        if !due {
            return;
        }
        self.last_request = Some(now);

        let layer = AdvertisementLayer::Module {
            request: true,
            modules: self.decode_set.clone(),
        };
        let root = RootLayer {
            vector: VECTOR_ADVERTISEMENT,
            cid: self.cid,
            folio: self.request_folio,
            page: 0,
            last_page: 0,
            options: 0,
            name: self.name.clone(),
        };
        self.request_folio = self.request_folio.wrapping_add(1);

        let datagram = match layer.encode().and_then(|payload| root.build(&payload)) {
            Ok(datagram) => datagram,
            Err(err) => {
                log::debug!("[CONSUMER] module request build failed: {}", err);
                return;
            }
        };
        if let Some(socket) = &self.sock_v4 {
            let dest = SocketAddr::from(SocketAddrV4::new(ADVERTISEMENT_GROUP_V4, OTP_PORT));
            if let Err(err) = socket.send_to(&datagram, dest) {
                log::debug!("[CONSUMER] module request send failed (v4): {}", err);
            }
        }
        if let Some(socket) = &self.sock_v6 {
            let dest =
                SocketAddr::from(SocketAddrV6::new(ADVERTISEMENT_GROUP_V6, OTP_PORT, 0, 0));
            if let Err(err) = socket.send_to(&datagram, dest) {
                log::debug!("[CONSUMER] module request send failed (v6): {}", err);
            }
        }
    }
}
