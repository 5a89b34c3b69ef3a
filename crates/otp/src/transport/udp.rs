// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP socket construction and send/receive paths.
//!
//! One socket per enabled family, bound to the wildcard address on the OTP
//! port with `SO_REUSEADDR` so producers and consumers can share a host.
//! The same socket carries both directions of traffic.

use crate::config::OTP_PORT;
use crate::transport::multicast::{
    transform_group_v4, transform_group_v6, ADVERTISEMENT_GROUP_V4, ADVERTISEMENT_GROUP_V6,
};
use crate::transport::ttl::TtlConfig;
use crate::transport::{multicast, Family, IpMode};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};

/// The socket pair (one per enabled family) of a producer or consumer.
pub struct SocketBundle {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
    iface_v4: Option<Ipv4Addr>,
    ifindex_v6: u32,
}

impl SocketBundle {
    /// Bind sockets for every family the mode enables.
    ///
    /// `iface_v4` selects the IPv4 interface for membership and outbound
    /// multicast (unset: outbound follows the routing table, membership is
    /// joined on every non-loopback interface). `ifindex_v6` is the IPv6
    /// interface index (0 = any).
    pub fn bind(
        mode: IpMode,
        iface_v4: Option<Ipv4Addr>,
        ifindex_v6: u32,
        ttl: &TtlConfig,
    ) -> io::Result<Self> {
        let v4 = if mode.uses_v4() {
            Some(bind_v4(iface_v4, ttl)?)
        } else {
            None
        };
        let v6 = if mode.uses_v6() {
            Some(bind_v6(ifindex_v6, ttl)?)
        } else {
            None
        };
        Ok(Self {
            v4,
            v6,
            iface_v4,
            ifindex_v6,
        })
    }

    /// Join the advertisement group on every enabled family.
    pub fn join_advertisement_group(&self) -> io::Result<()> {
        if let Some(socket) = &self.v4 {
            multicast::join_groups_v4(socket, &[ADVERTISEMENT_GROUP_V4], self.iface_v4)?;
        }
        if let Some(socket) = &self.v6 {
            multicast::join_groups_v6(socket, &[ADVERTISEMENT_GROUP_V6], self.ifindex_v6)?;
        }
        Ok(())
    }

    /// Join the per-system transform group on every enabled family.
    pub fn join_transform_system(&self, system: u8) -> io::Result<()> {
        if let Some(socket) = &self.v4 {
            multicast::join_groups_v4(socket, &[transform_group_v4(system)], self.iface_v4)?;
        }
        if let Some(socket) = &self.v6 {
            multicast::join_groups_v6(socket, &[transform_group_v6(system)], self.ifindex_v6)?;
        }
        Ok(())
    }

    /// Send a transform datagram to the per-system group of every enabled
    /// family.
    pub fn send_transform(&self, system: u8, datagram: &[u8]) -> io::Result<()> {
        if let Some(socket) = &self.v4 {
            let dest = SocketAddrV4::new(transform_group_v4(system), OTP_PORT);
            socket.send_to(datagram, dest)?;
        }
        if let Some(socket) = &self.v6 {
            let dest = SocketAddrV6::new(transform_group_v6(system), OTP_PORT, 0, 0);
            socket.send_to(datagram, dest)?;
        }
        Ok(())
    }

    /// Send an advertisement datagram on every enabled family.
    pub fn send_advertisement(&self, datagram: &[u8]) -> io::Result<()> {
        if let Some(socket) = &self.v4 {
            let dest = SocketAddrV4::new(ADVERTISEMENT_GROUP_V4, OTP_PORT);
            socket.send_to(datagram, dest)?;
        }
        if let Some(socket) = &self.v6 {
            let dest = SocketAddrV6::new(ADVERTISEMENT_GROUP_V6, OTP_PORT, 0, 0);
            socket.send_to(datagram, dest)?;
        }
        Ok(())
    }

    /// Switch both sockets between blocking and non-blocking modes.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        if let Some(socket) = &self.v4 {
            socket.set_nonblocking(nonblocking)?;
        }
        if let Some(socket) = &self.v6 {
            socket.set_nonblocking(nonblocking)?;
        }
        Ok(())
    }

    /// Drain every queued datagram from both sockets (which must be in
    /// non-blocking mode), invoking `handler` per datagram.
    pub fn drain<F>(&self, buf: &mut [u8], mut handler: F)
    where
        F: FnMut(&[u8], SocketAddr, Family),
    {
        for (socket, family) in [(&self.v4, Family::V4), (&self.v6, Family::V6)] {
            let Some(socket) = socket else { continue };
            loop {
                match socket.recv_from(buf) {
                    Ok((len, source)) => handler(&buf[..len], source, family),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        log::debug!("[UDP] recv_from failed on {:?}: {}", family, err);
                        break;
                    }
                }
            }
        }
    }

    /// Tear the bundle apart, handing the raw sockets to a readiness-driven
    /// worker (the consumer converts them into mio sockets).
    pub fn into_parts(self) -> (Option<UdpSocket>, Option<UdpSocket>) {
        (self.v4, self.v6)
    }
}

fn bind_v4(iface: Option<Ipv4Addr>, ttl: &TtlConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    ttl.apply_v4(&socket)?;
    if let Some(iface) = iface {
        socket.set_multicast_if_v4(&iface)?;
    }
    let bind_addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, OTP_PORT));
    socket.bind(&bind_addr.into())?;
    log::debug!(
        "[UDP] bound v4 socket on {} (iface={:?}, ttl={})",
        bind_addr,
        iface,
        ttl.multicast_ttl
    );
    Ok(socket.into())
}

fn bind_v6(ifindex: u32, ttl: &TtlConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(true)?;
    ttl.apply_v6(&socket)?;
    if ifindex != 0 {
        socket.set_multicast_if_v6(ifindex)?;
    }
    let bind_addr = SocketAddr::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, OTP_PORT, 0, 0));
    socket.bind(&bind_addr.into())?;
    log::debug!(
        "[UDP] bound v6 socket on {} (ifindex={}, hops={})",
        bind_addr,
        ifindex,
        ttl.hop_limit
    );
    Ok(socket.into())
}
