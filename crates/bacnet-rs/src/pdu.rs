// crates/bacnet-rs/src/pdu.rs
//! Protocol data units and BACnet addressing.

use crate::error::BacnetError;
use crate::types::BACNET_IP_DEFAULT_PORT;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;
use core::str::FromStr;

/// A BACnet address. MAC addresses are raw octet strings; for BACnet/IP
/// they are six octets (IPv4 address followed by the big-endian port).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    /// Every station on the local network.
    LocalBroadcast,
    /// A single station on the local network.
    LocalStation(Vec<u8>),
    /// Every station on a remote network.
    RemoteBroadcast(u16),
    /// A single station on a remote network.
    RemoteStation(u16, Vec<u8>),
    /// Every station on every network.
    GlobalBroadcast,
}

impl Address {
    /// Build a local station address from an IPv4 address and port.
    pub fn local_station_ip(octets: [u8; 4], port: u16) -> Self {
        let mut mac = Vec::with_capacity(6);
        mac.extend_from_slice(&octets);
        mac.extend_from_slice(&port.to_be_bytes());
        Address::LocalStation(mac)
    }

    /// True for any of the three broadcast forms.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Address::LocalBroadcast | Address::RemoteBroadcast(_) | Address::GlobalBroadcast
        )
    }

    /// True for a local or remote station (a unicast destination).
    pub fn is_station(&self) -> bool {
        matches!(self, Address::LocalStation(_) | Address::RemoteStation(_, _))
    }
}

/// Parse a MAC portion: dotted IPv4 with optional `:port`, an even-length
/// hex string, or a single decimal octet.
fn parse_mac(s: &str) -> Result<Vec<u8>, BacnetError> {
    if s.contains('.') {
        let (ip, port) = match s.split_once(':') {
            Some((ip, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| BacnetError::InvalidAddress("bad port"))?;
                (ip, port)
            }
            None => (s, BACNET_IP_DEFAULT_PORT),
        };
        let mut mac = Vec::with_capacity(6);
        let mut count = 0;
        for part in ip.split('.') {
            let octet: u8 = part
                .parse()
                .map_err(|_| BacnetError::InvalidAddress("bad IPv4 octet"))?;
            mac.push(octet);
            count += 1;
        }
        if count != 4 {
            return Err(BacnetError::InvalidAddress("IPv4 address needs 4 octets"));
        }
        mac.extend_from_slice(&port.to_be_bytes());
        return Ok(mac);
    }

    // A short decimal number is a one-octet MAC (MS/TP style).
    if let Ok(n) = s.parse::<u8>() {
        return Ok([n].to_vec());
    }

    // Otherwise it must be an even-length hex string.
    if s.is_empty() || s.len() % 2 != 0 {
        return Err(BacnetError::InvalidAddress("odd-length hex MAC"));
    }
    let mut mac = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char)
            .to_digit(16)
            .ok_or(BacnetError::InvalidAddress("bad hex digit"))?;
        let lo = (pair[1] as char)
            .to_digit(16)
            .ok_or(BacnetError::InvalidAddress("bad hex digit"))?;
        mac.push(((hi << 4) | lo) as u8);
    }
    Ok(mac)
}

impl FromStr for Address {
    type Err = BacnetError;

    /// Textual forms: `"*"` (local broadcast), `"*:*"` (global broadcast),
    /// `"net:*"` (remote broadcast), `"addr"` (local station) and
    /// `"net:addr"` (remote station).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" => return Ok(Address::LocalBroadcast),
            "*:*" => return Ok(Address::GlobalBroadcast),
            _ => {}
        }

        if let Some((left, right)) = s.split_once(':') {
            // "a.b.c.d:port" is a local station, not a network prefix.
            if !left.contains('.') {
                let net: u16 = left
                    .parse()
                    .map_err(|_| BacnetError::InvalidAddress("bad network number"))?;
                if right == "*" {
                    return Ok(Address::RemoteBroadcast(net));
                }
                return Ok(Address::RemoteStation(net, parse_mac(right)?));
            }
        }

        Ok(Address::LocalStation(parse_mac(s)?))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn fmt_mac(mac: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if mac.len() == 6 {
                let port = u16::from_be_bytes([mac[4], mac[5]]);
                write!(f, "{}.{}.{}.{}:{}", mac[0], mac[1], mac[2], mac[3], port)
            } else {
                for octet in mac {
                    write!(f, "{:02x}", octet)?;
                }
                Ok(())
            }
        }
        match self {
            Address::LocalBroadcast => write!(f, "*"),
            Address::GlobalBroadcast => write!(f, "*:*"),
            Address::RemoteBroadcast(net) => write!(f, "{}:*", net),
            Address::LocalStation(mac) => fmt_mac(mac, f),
            Address::RemoteStation(net, mac) => {
                write!(f, "{}:", net)?;
                fmt_mac(mac, f)
            }
        }
    }
}

/// A protocol data unit: a byte buffer with addressing and opaque user
/// data. Readers consume from the head; writers append to the tail and
/// never truncate. Reading past the end is a decoding error.
#[derive(Clone, Default)]
pub struct Pdu {
    pub source: Option<Address>,
    pub destination: Option<Address>,
    /// Carried through the stack unmodified; never inspected by the engine.
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
    data: Vec<u8>,
    pos: usize,
}

impl Pdu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Pdu {
            data,
            ..Self::default()
        }
    }

    /// Copy the addressing and user data of another PDU.
    pub fn update(&mut self, other: &Pdu) {
        self.source = other.source.clone();
        self.destination = other.destination.clone();
        self.user_data = other.user_data.clone();
    }

    /// The octets not yet consumed by a reader.
    pub fn octets(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Consume the buffer, returning the unread octets.
    pub fn into_octets(mut self) -> Vec<u8> {
        self.data.split_off(self.pos)
    }

    pub fn get(&mut self) -> Result<u8, BacnetError> {
        if self.pos >= self.data.len() {
            return Err(BacnetError::Decoding("no more packet data"));
        }
        let octet = self.data[self.pos];
        self.pos += 1;
        Ok(octet)
    }

    pub fn get_data(&mut self, dlen: usize) -> Result<Vec<u8>, BacnetError> {
        if self.remaining() < dlen {
            return Err(BacnetError::Decoding("no more packet data"));
        }
        let data = self.data[self.pos..self.pos + dlen].to_vec();
        self.pos += dlen;
        Ok(data)
    }

    pub fn get_short(&mut self) -> Result<u16, BacnetError> {
        let data = self.get_data(2)?;
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    pub fn get_long(&mut self) -> Result<u32, BacnetError> {
        let data = self.get_data(4)?;
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    pub fn put(&mut self, octet: u8) {
        self.data.push(octet);
    }

    pub fn put_data(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn put_short(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_long(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }
}

impl fmt::Debug for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pdu")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("data", &self.octets())
            .finish()
    }
}

impl PartialEq for Pdu {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.destination == other.destination
            && self.octets() == other.octets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_read_write_roundtrip() {
        let mut pdu = Pdu::new();
        pdu.put(0x81);
        pdu.put_short(0xBAC0);
        pdu.put_long(0xDEADBEEF);
        pdu.put_data(&[1, 2, 3]);

        assert_eq!(pdu.remaining(), 10);
        assert_eq!(pdu.get().unwrap(), 0x81);
        assert_eq!(pdu.get_short().unwrap(), 0xBAC0);
        assert_eq!(pdu.get_long().unwrap(), 0xDEADBEEF);
        assert_eq!(pdu.get_data(3).unwrap(), [1, 2, 3].to_vec());
        assert!(pdu.is_empty());
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut pdu = Pdu::with_data([1].to_vec());
        assert_eq!(pdu.get().unwrap(), 1);
        assert!(matches!(pdu.get(), Err(BacnetError::Decoding(_))));
        assert!(matches!(pdu.get_short(), Err(BacnetError::Decoding(_))));
    }

    #[test]
    fn test_address_parsing() {
        assert_eq!("*".parse::<Address>().unwrap(), Address::LocalBroadcast);
        assert_eq!("*:*".parse::<Address>().unwrap(), Address::GlobalBroadcast);
        assert_eq!(
            "5:*".parse::<Address>().unwrap(),
            Address::RemoteBroadcast(5)
        );
        assert_eq!(
            "192.168.0.10".parse::<Address>().unwrap(),
            Address::local_station_ip([192, 168, 0, 10], BACNET_IP_DEFAULT_PORT)
        );
        assert_eq!(
            "10.0.1.2:47809".parse::<Address>().unwrap(),
            Address::local_station_ip([10, 0, 1, 2], 47809)
        );
        assert_eq!(
            "2:0a0b".parse::<Address>().unwrap(),
            Address::RemoteStation(2, [0x0a, 0x0b].to_vec())
        );
        assert_eq!(
            "2:12".parse::<Address>().unwrap(),
            Address::RemoteStation(2, [12].to_vec())
        );
        assert!("1.2.3".parse::<Address>().is_err());
        assert!("2:xyz".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_display_roundtrip() {
        for text in ["*", "*:*", "7:*", "10.0.1.2:47809"] {
            let addr: Address = text.parse().unwrap();
            assert_eq!(addr.to_string(), text);
        }
    }
}
