// crates/bacnet-rs/src/udp.rs
//! The UDP director: owns the socket, tracks one actor per remote peer,
//! and converts between socket addresses and BACnet/IP MACs.
//!
//! Actors exist so per-peer state has somewhere to live; today that is
//! an optional idle timer that forgets a peer after a quiet spell.

use crate::error::BacnetError;
use crate::pdu::{Address, Pdu};
use crate::task::{TaskManager, TimerHandle, TimerTarget};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;
use log::{debug, error, trace, warn};

/// Largest datagram the director will accept; comfortably above the
/// biggest BVLL frame a 1497-octet NPDU produces.
const RECEIVE_BUFFER_SIZE: usize = 1600;

/// Convert a six-octet BACnet/IP MAC into a socket address.
pub fn socket_addr_from_mac(mac: &[u8]) -> Result<SocketAddr, BacnetError> {
    if mac.len() != 6 {
        return Err(BacnetError::InvalidAddress("BACnet/IP MAC needs 6 octets"));
    }
    let ip = Ipv4Addr::new(mac[0], mac[1], mac[2], mac[3]);
    let port = u16::from_be_bytes([mac[4], mac[5]]);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Convert a socket address into a six-octet BACnet/IP MAC.
pub fn mac_from_socket_addr(addr: &SocketAddr) -> Result<Vec<u8>, BacnetError> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut mac = Vec::with_capacity(6);
            mac.extend_from_slice(&v4.ip().octets());
            mac.extend_from_slice(&v4.port().to_be_bytes());
            Ok(mac)
        }
        SocketAddr::V6(_) => Err(BacnetError::InvalidAddress("IPv6 peers are not supported")),
    }
}

#[derive(Debug)]
struct UdpActor {
    timer: Option<TimerHandle>,
    token: u64,
}

/// Datagram send/receive bound to one local address.
#[derive(Debug)]
pub struct UdpDirector {
    socket: UdpSocket,
    /// Where local broadcasts go (usually the subnet broadcast address).
    broadcast: SocketAddr,
    /// Seconds of silence before a peer actor is closed; 0 disables.
    idle_timeout_s: u64,
    peers: HashMap<SocketAddr, UdpActor>,
    actor_tokens: HashMap<u64, SocketAddr>,
    next_token: u64,
}

impl UdpDirector {
    /// Bind to `local`. `broadcast` is the address local broadcasts are
    /// sent to.
    pub fn bind(
        local: SocketAddr,
        broadcast: SocketAddr,
        idle_timeout_s: u64,
    ) -> Result<Self, BacnetError> {
        let socket = UdpSocket::bind(local).map_err(|err| {
            error!("binding {} failed: {}", local, err);
            BacnetError::IoError
        })?;
        socket.set_broadcast(true).map_err(|err| {
            error!("enabling broadcast failed: {}", err);
            BacnetError::IoError
        })?;
        debug!("udp director bound to {}", local);
        Ok(UdpDirector {
            socket,
            broadcast,
            idle_timeout_s,
            peers: HashMap::new(),
            actor_tokens: HashMap::new(),
            next_token: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BacnetError> {
        self.socket.local_addr().map_err(|_| BacnetError::IoError)
    }

    /// The local address as a BACnet/IP station address.
    pub fn local_address(&self) -> Result<Address, BacnetError> {
        let addr = self.local_addr()?;
        Ok(Address::LocalStation(mac_from_socket_addr(&addr)?))
    }

    /// Refresh (or create) the actor for a peer, rescheduling its idle
    /// timer.
    fn touch_actor(&mut self, peer: SocketAddr, tasks: &mut TaskManager, now_ms: u64) {
        if self.idle_timeout_s == 0 {
            return;
        }
        let deadline = now_ms + self.idle_timeout_s * 1000;
        match self.peers.get_mut(&peer) {
            Some(actor) => {
                if let Some(handle) = actor.timer.take() {
                    tasks.cancel(handle);
                }
                actor.timer = Some(tasks.install(deadline, TimerTarget::Director, actor.token));
            }
            None => {
                self.next_token += 1;
                let token = self.next_token;
                trace!("new peer actor for {}", peer);
                let timer = Some(tasks.install(deadline, TimerTarget::Director, token));
                self.peers.insert(peer, UdpActor { timer, token });
                self.actor_tokens.insert(token, peer);
            }
        }
    }

    /// An actor's idle timer fired; forget the peer.
    pub fn timer_expired(&mut self, token: u64) {
        if let Some(peer) = self.actor_tokens.remove(&token) {
            debug!("peer {} idle, actor closed", peer);
            self.peers.remove(&peer);
        }
    }

    /// Send one frame. The destination must be a local station or the
    /// local broadcast.
    pub fn send(&mut self, pdu: Pdu, tasks: &mut TaskManager, now_ms: u64) {
        let target = match &pdu.destination {
            Some(Address::LocalStation(mac)) => match socket_addr_from_mac(mac) {
                Ok(addr) => addr,
                Err(err) => {
                    error!("undeliverable frame: {}", err);
                    return;
                }
            },
            Some(Address::LocalBroadcast) => self.broadcast,
            other => {
                error!("undeliverable frame to {:?}", other);
                return;
            }
        };

        self.touch_actor(target, tasks, now_ms);
        match self.socket.send_to(pdu.octets(), target) {
            Ok(sent) => {
                if sent != pdu.remaining() {
                    warn!("short send to {}: {} of {}", target, sent, pdu.remaining());
                }
            }
            Err(err) => error!("send to {} failed: {}", target, err),
        }
    }

    /// Wait up to `timeout_ms` for one datagram.
    pub fn poll(&mut self, timeout_ms: u64, tasks: &mut TaskManager, now_ms: u64) -> Option<Pdu> {
        let timeout = Duration::from_millis(timeout_ms.max(1));
        if self.socket.set_read_timeout(Some(timeout)).is_err() {
            return None;
        }

        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
        match self.socket.recv_from(&mut buffer) {
            Ok((length, peer)) => {
                trace!("{} octets from {}", length, peer);
                self.touch_actor(peer, tasks, now_ms);
                let mac = match mac_from_socket_addr(&peer) {
                    Ok(mac) => mac,
                    Err(err) => {
                        warn!("datagram from unusable peer: {}", err);
                        return None;
                    }
                };
                let mut pdu = Pdu::with_data(buffer[..length].to_vec());
                pdu.source = Some(Address::LocalStation(mac));
                Some(pdu)
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => None,
            Err(err) => {
                error!("receive failed: {}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_socket_addr_roundtrip() {
        let mac = vec![192, 168, 1, 20, 0xBA, 0xC0];
        let addr = socket_addr_from_mac(&mac).unwrap();
        assert_eq!(addr.to_string(), "192.168.1.20:47808");
        assert_eq!(mac_from_socket_addr(&addr).unwrap(), mac);

        assert!(socket_addr_from_mac(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_loopback_send_receive() {
        let mut tasks = TaskManager::new();
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let broadcast: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let mut receiver = UdpDirector::bind(loopback, broadcast, 0).unwrap();
        let mut sender = UdpDirector::bind(loopback, broadcast, 0).unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let mut pdu = Pdu::with_data(vec![0x81, 0x0A, 0x00, 0x05, 0xAA]);
        pdu.destination = Some(Address::LocalStation(
            mac_from_socket_addr(&receiver_addr).unwrap(),
        ));
        sender.send(pdu, &mut tasks, 0);

        let mut received = None;
        for _ in 0..50 {
            if let Some(pdu) = receiver.poll(20, &mut tasks, 0) {
                received = Some(pdu);
                break;
            }
        }
        let received = received.expect("datagram arrives on loopback");
        assert_eq!(received.octets(), &[0x81, 0x0A, 0x00, 0x05, 0xAA]);
        let source = received.source.clone().unwrap();
        assert_eq!(
            source,
            Address::LocalStation(mac_from_socket_addr(&sender.local_addr().unwrap()).unwrap())
        );
    }

    #[test]
    fn test_idle_timer_closes_actor() {
        let mut tasks = TaskManager::new();
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let broadcast: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut director = UdpDirector::bind(loopback, broadcast, 30).unwrap();

        let peer: SocketAddr = "127.0.0.1:47999".parse().unwrap();
        director.touch_actor(peer, &mut tasks, 0);
        assert_eq!(director.peers.len(), 1);

        let (target, token) = tasks.pop_due(30_000).unwrap();
        assert_eq!(target, TimerTarget::Director);
        director.timer_expired(token);
        assert!(director.peers.is_empty());
    }
}
