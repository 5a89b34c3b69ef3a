// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer engine: point/module state, transmit worker, advertisement
//! responder.
//!
//! The producer is single-writer: one background thread owns the sockets
//! and the transmit schedule. The application mutates the point store
//! through the [`Producer`] handle (legal both before and while running);
//! the worker snapshots it under a short lock each tick.
//!
//! Lifecycle: Idle -> Running -> Idle. `start()` binds the sockets and
//! joins the advertisement group; a bind failure leaves the producer Idle.
//! `stop()` is cooperative: it signals the worker, waits for the in-flight
//! tick to finish, then closes the sockets by dropping them.

pub mod scheduler;
pub mod store;

use crate::config::{
    DEFAULT_TRANSMIT_INTERVAL_MS, RECV_BUFFER_SIZE, TRANSMIT_INTERVAL_MAX_MS,
    TRANSMIT_INTERVAL_MIN_MS,
};
use crate::core::address::{Address, PRIORITY_DEFAULT};
use crate::core::Cid;
use crate::error::{Error, Result};
use crate::protocol::advertisement::AdvertisementLayer;
use crate::protocol::module::{Module, ModuleIdentifier, ModuleRegistry};
use crate::protocol::{parse_datagram, OtpPacket};
use crate::transport::{IpMode, SocketBundle, TtlConfig};
use crossbeam::channel::{self, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use scheduler::TransmitScheduler;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use store::PointStore;

/// Microseconds since the Unix epoch; the producer's transform timebase.
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Producer configuration. Construct with [`ProducerConfig::new`] and chain
/// `with_*` methods.
#[derive(Clone)]
pub struct ProducerConfig {
    pub(crate) name: String,
    pub(crate) cid: Cid,
    pub(crate) ip_mode: IpMode,
    pub(crate) iface_v4: Option<Ipv4Addr>,
    pub(crate) ifindex_v6: u32,
    pub(crate) default_priority: u8,
    pub(crate) transmit_interval: Duration,
    pub(crate) ttl: TtlConfig,
}

impl ProducerConfig {
    /// Defaults: random CID, IPv4 only, default priority 100, 50 ms
    /// transmit interval, TTL 1.
    ///
    /// The component name is truncated to the 32-byte wire field when
    /// transmitted.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cid: Cid::generate(),
            ip_mode: IpMode::default(),
            iface_v4: None,
            ifindex_v6: 0,
            default_priority: PRIORITY_DEFAULT,
            transmit_interval: Duration::from_millis(DEFAULT_TRANSMIT_INTERVAL_MS),
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

    pub fn with_default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }

    /// Transform transmit interval in milliseconds, clamped into 1..=50.
    pub fn with_transmit_interval_ms(mut self, millis: u64) -> Self {
        let clamped = millis.clamp(TRANSMIT_INTERVAL_MIN_MS, TRANSMIT_INTERVAL_MAX_MS);
        if clamped != millis {
            log::debug!(
                "[PRODUCER] transmit interval {} ms clamped to {} ms",
                millis,
                clamped
            );
        }
        self.transmit_interval = Duration::from_millis(clamped);
        self
    }

    pub fn with_ttl(mut self, ttl: TtlConfig) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Transmit-side counters, readable while the producer runs.
#[derive(Default)]
pub struct ProducerStats {
    transform_datagrams: AtomicU64,
    advertisement_datagrams: AtomicU64,
    requests_answered: AtomicU64,
    send_errors: AtomicU64,
}

/// Point-in-time copy of [`ProducerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerStatsSnapshot {
    pub transform_datagrams: u64,
    pub advertisement_datagrams: u64,
    pub requests_answered: u64,
    pub send_errors: u64,
}

impl ProducerStats {
    fn snapshot(&self) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            transform_datagrams: self.transform_datagrams.load(Ordering::Relaxed),
            advertisement_datagrams: self.advertisement_datagrams.load(Ordering::Relaxed),
            requests_answered: self.requests_answered.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// An OTP producer: owns a point set and transmits it periodically.
pub struct Producer {
    config: ProducerConfig,
    store: Arc<Mutex<PointStore>>,
    stats: Arc<ProducerStats>,
    worker: Option<JoinHandle<()>>,
    stop_tx: Option<Sender<()>>,
}

impl Producer {
    pub fn new(config: ProducerConfig) -> Self {
        let store = Arc::new(Mutex::new(PointStore::new(config.default_priority)));
        log::info!(
            "[PRODUCER] created cid={} name={:?} mode={:?} interval={:?}",
            config.cid,
            config.name,
            config.ip_mode,
            config.transmit_interval
        );
        Self {
            config,
            store,
            stats: Arc::new(ProducerStats::default()),
            worker: None,
            stop_tx: None,
        }
    }

    pub fn cid(&self) -> Cid {
        self.config.cid
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    // ===== Point/module mutation (valid in Idle and Running) =====

    pub fn add_point(&self, address: Address, name: &str, priority: Option<u8>) -> Result<()> {
        self.store.lock().add_point(address, name, priority, now_micros())
    }

    /// Add several points in one call. Stops at the first failure, leaving
    /// earlier additions in place.
    pub fn add_points<'a, I>(&self, points: I, priority: Option<u8>) -> Result<()>
    where
        I: IntoIterator<Item = (Address, &'a str)>,
    {
        let mut store = self.store.lock();
        let now = now_micros();
        for (address, name) in points {
            store.add_point(address, name, priority, now)?;
        }
        Ok(())
    }

    pub fn remove_point(&self, address: Address, priority: Option<u8>) -> Result<()> {
        self.store.lock().remove_point(address, priority)
    }

    pub fn rename_point(&self, address: Address, name: &str, priority: Option<u8>) -> Result<()> {
        self.store
            .lock()
            .rename_point(address, name, priority, now_micros())
    }

    pub fn add_module(
        &self,
        address: Address,
        module: Module,
        priority: Option<u8>,
    ) -> Result<()> {
        self.store
            .lock()
            .add_module(address, module, priority, now_micros())
    }

    pub fn remove_module(
        &self,
        address: Address,
        ident: ModuleIdentifier,
        priority: Option<u8>,
    ) -> Result<()> {
        self.store
            .lock()
            .remove_module(address, ident, priority, now_micros())
    }

    pub fn number_of_points(&self) -> usize {
        self.store.lock().number_of_points()
    }

    pub fn number_of_modules(&self) -> usize {
        self.store.lock().number_of_modules()
    }

    pub fn point_names(&self) -> Vec<(Address, u8, String)> {
        self.store.lock().point_names()
    }

    pub fn statistics(&self) -> ProducerStatsSnapshot {
        self.stats.snapshot()
    }

    // ===== Lifecycle =====

    /// Bind sockets, join the advertisement group, and start the transmit
    /// worker. On failure the producer stays Idle.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::InvalidState("producer already running"));
        }

        let bundle = SocketBundle::bind(
            self.config.ip_mode,
            self.config.iface_v4,
            self.config.ifindex_v6,
            &self.config.ttl,
        )
        .map_err(Error::Bind)?;
        bundle.join_advertisement_group().map_err(Error::Io)?;
        bundle.set_nonblocking(true).map_err(Error::Io)?;

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let worker = Worker {
            cid: self.config.cid,
            name: self.config.name.clone(),
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.stats),
            bundle,
            scheduler: TransmitScheduler::new(),
            registry: ModuleRegistry::empty(),
            respond_modules: false,
        };
        let interval = self.config.transmit_interval;
        let handle = std::thread::Builder::new()
            .name("otp-producer".into())
            .spawn(move || worker.run(interval, &stop_rx))
            .map_err(Error::Io)?;

        self.worker = Some(handle);
        self.stop_tx = Some(stop_tx);
        log::info!("[PRODUCER] started cid={}", self.config.cid);
        Ok(())
    }

    /// Signal the worker, wait for the in-flight tick to return, release
    /// the sockets.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.worker.take() else {
            return Err(Error::InvalidState("producer not running"));
        };
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let _ = handle.join();
        log::info!("[PRODUCER] stopped cid={}", self.config.cid);
        Ok(())
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop();
        }
    }
}

struct Worker {
    cid: Cid,
    name: String,
    store: Arc<Mutex<PointStore>>,
    stats: Arc<ProducerStats>,
    bundle: SocketBundle,
    scheduler: TransmitScheduler,
    /// Producers never decode module payloads; requests arrive in
    /// advertisement PDUs, so an empty registry suffices.
    registry: ModuleRegistry,
    /// A module advertisement request arrived; answer on the next tick.
    respond_modules: bool,
}

impl Worker {
    fn run(mut self, interval: Duration, stop_rx: &channel::Receiver<()>) {
        let ticker = channel::tick(interval);
        loop {
            select! {
                recv(stop_rx) -> _ => break,
                recv(ticker) -> _ => self.tick(),
            }
        }
        log::debug!("[PRODUCER] worker exiting cid={}", self.cid);
    }

    fn tick(&mut self) {
        self.drain_requests();

        let now = std::time::Instant::now();
        let timestamp = now_micros();

        let (plan, partial_snapshots, full_snapshots, names, idents, systems) = {
            let mut store = self.store.lock();
            let dirty = store.take_dirty_systems();
            let active = store.systems();
            let plan = self.scheduler.plan(now, &dirty, &active);

            let partial: Vec<_> = plan
                .partial_systems
                .iter()
                .map(|&system| (system, store.snapshot_system(system, false)))
                .collect();
            let full: Vec<_> = plan
                .full_systems
                .iter()
                .map(|&system| (system, store.snapshot_system(system, true)))
                .collect();

            let advertise = plan.advertise || self.respond_modules;
            let names = advertise.then(|| store.point_names());
            let idents = advertise.then(|| store.module_identifiers());
            (plan, partial, full, names, idents, active)
        };

        for (system, points) in full_snapshots {
            self.send_transform(system, timestamp, true, points);
        }
        for (system, points) in partial_snapshots {
            if points.is_empty() {
                continue;
            }
            self.send_transform(system, timestamp, false, points);
        }

        if plan.advertise {
            self.send_system_advertisement(systems);
            if let Some(names) = names {
                self.send_name_advertisement(names);
            }
        }
        if plan.advertise || self.respond_modules {
            if let Some(idents) = idents {
                self.send_module_advertisement(idents);
            }
            if self.respond_modules {
                self.stats.requests_answered.fetch_add(1, Ordering::Relaxed);
                self.respond_modules = false;
            }
        }
    }

    /// Pull queued datagrams off the sockets; the only inbound traffic a
    /// producer acts on is a module advertisement request.
    fn drain_requests(&mut self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let cid = self.cid;
        let registry = &self.registry;
        let mut request_seen = false;
        self.bundle.drain(&mut buf, |datagram, source, family| {
            let Ok(parsed) = parse_datagram(datagram, registry) else {
                return;
            };
            if parsed.root.cid == cid {
                return; // our own multicast loopback
            }
            if let OtpPacket::Advertisement(AdvertisementLayer::Module { request: true, .. }) =
                parsed.packet
            {
                log::debug!(
                    "[PRODUCER] module advertisement request from {} via {:?} ({:?})",
                    parsed.root.cid,
                    source,
                    family
                );
                request_seen = true;
            }
        });
        if request_seen {
            self.respond_modules = true;
        }
    }

    fn send_transform(&mut self, system: u8, timestamp: u64, full: bool, points: Vec<crate::protocol::transform::PointLayer>) {
        let folio = self.scheduler.next_transform_folio(system);
        match scheduler::build_transform_datagrams(
            self.cid,
            &self.name,
            system,
            timestamp,
            full,
            points,
            folio,
        ) {
            Ok(datagrams) => {
                for datagram in datagrams {
                    match self.bundle.send_transform(system, &datagram) {
                        Ok(()) => {
                            self.stats.transform_datagrams.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                            log::debug!(
                                "[PRODUCER] transform send failed system={}: {}",
                                system,
                                err
                            );
                        }
                    }
                }
            }
            Err(err) => {
                log::debug!("[PRODUCER] transform build failed system={}: {}", system, err);
            }
        }
    }

    fn send_advertisement(&self, layer: AdvertisementLayer, folio: u32) {
        match scheduler::build_advertisement_datagrams(self.cid, &self.name, layer, folio) {
            Ok(datagrams) => {
                for datagram in datagrams {
                    match self.bundle.send_advertisement(&datagram) {
                        Ok(()) => {
                            self.stats
                                .advertisement_datagrams
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                            log::debug!("[PRODUCER] advertisement send failed: {}", err);
                        }
                    }
                }
            }
            Err(err) => {
                log::debug!("[PRODUCER] advertisement build failed: {}", err);
            }
        }
    }

    fn send_system_advertisement(&mut self, systems: Vec<u8>) {
        let folio = self.scheduler.next_system_ad_folio();
        self.send_advertisement(AdvertisementLayer::System { systems }, folio);
    }

    fn send_module_advertisement(&mut self, idents: Vec<ModuleIdentifier>) {
        let folio = self.scheduler.next_module_ad_folio();
        self.send_advertisement(scheduler::module_advertisement(idents), folio);
    }

    fn send_name_advertisement(&mut self, names: Vec<(Address, u8, String)>) {
        let folio = self.scheduler.next_name_ad_folio();
        let entries = names
            .into_iter()
            .map(|(address, _priority, name)| (address, name))
            .collect();
        self.send_advertisement(scheduler::name_advertisement(entries), folio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_clamps_interval() {
        let config = ProducerConfig::new("p").with_transmit_interval_ms(0);
        assert_eq!(config.transmit_interval, Duration::from_millis(1));

        let config = ProducerConfig::new("p").with_transmit_interval_ms(500);
        assert_eq!(config.transmit_interval, Duration::from_millis(50));

        let config = ProducerConfig::new("p").with_transmit_interval_ms(25);
        assert_eq!(config.transmit_interval, Duration::from_millis(25));
    }

    #[test]
    fn test_idle_producer_mutations() {
        let producer = Producer::new(ProducerConfig::new("stage"));
        let address = Address::new(1, 1, 1).expect("valid address");
        producer
            .add_point(address, "spot", None)
            .expect("add point should succeed");
        assert_eq!(producer.number_of_points(), 1);

        producer
            .add_module(address, Module::rotation(1, 2, 3), None)
            .expect("add module should succeed");
        assert_eq!(producer.number_of_modules(), 1);

        producer.remove_point(address, None).expect("remove point");
        assert_eq!(producer.number_of_points(), 0);
    }

    #[test]
    fn test_stop_without_start_is_invalid_state() {
        let mut producer = Producer::new(ProducerConfig::new("p"));
        assert!(matches!(
            producer.stop(),
            Err(Error::InvalidState("producer not running"))
        ));
    }

    #[test]
    fn test_stats_start_at_zero() {
        let producer = Producer::new(ProducerConfig::new("p"));
        let stats = producer.statistics();
        assert_eq!(stats.transform_datagrams, 0);
        assert_eq!(stats.advertisement_datagrams, 0);
        assert_eq!(stats.requests_answered, 0);
        assert_eq!(stats.send_errors, 0);
    }
}
