// crates/bacnet-rs/src/npdu.rs
//! NPDU codec and the network service access point.
//!
//! Wire layout (ASHRAE 135, Clause 6.2): version octet, control octet,
//! then optional DNET/DLEN/DADDR, SNET/SLEN/SADDR and hop count groups
//! selected by control bits. Routing across networks is out of scope;
//! remote destinations are emitted with routing headers onto the local
//! broadcast domain, where a router can pick them up.

use crate::comm::{Layer, LayerCtx, Sdu};
use crate::error::BacnetError;
use crate::pdu::{Address, Pdu};
use crate::types::{ApduType, GLOBAL_BROADCAST_NETWORK, NPDU_PROTOCOL_VERSION};
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// A decoded NPDU header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Npdu {
    pub expecting_reply: bool,
    pub priority: u8,
    /// DNET and DADDR; an empty DADDR is a broadcast on that network.
    pub destination: Option<(u16, Vec<u8>)>,
    pub source: Option<(u16, Vec<u8>)>,
    pub hop_count: Option<u8>,
    /// Message type when this is a network layer message instead of an
    /// APDU.
    pub network_message: Option<u8>,
}

impl Npdu {
    /// Serialize the header into the tail of `pdu`.
    pub fn encode(&self, pdu: &mut Pdu) {
        pdu.put(NPDU_PROTOCOL_VERSION);

        let mut control = self.priority & 0x03;
        if self.network_message.is_some() {
            control |= 0x80;
        }
        if self.destination.is_some() {
            control |= 0x20;
        }
        if self.source.is_some() {
            control |= 0x08;
        }
        if self.expecting_reply {
            control |= 0x04;
        }
        pdu.put(control);

        if let Some((dnet, daddr)) = &self.destination {
            pdu.put_short(*dnet);
            pdu.put(daddr.len() as u8);
            pdu.put_data(daddr);
        }
        if let Some((snet, saddr)) = &self.source {
            pdu.put_short(*snet);
            pdu.put(saddr.len() as u8);
            pdu.put_data(saddr);
        }
        if self.destination.is_some() {
            pdu.put(self.hop_count.unwrap_or(255));
        }
        if let Some(message_type) = self.network_message {
            pdu.put(message_type);
        }
    }

    /// Parse a header from the head of `pdu`, leaving the payload.
    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        let version = pdu.get()?;
        if version != NPDU_PROTOCOL_VERSION {
            return Err(BacnetError::InvalidNpdu);
        }
        let control = pdu.get()?;
        let mut npdu = Npdu {
            expecting_reply: control & 0x04 != 0,
            priority: control & 0x03,
            ..Npdu::default()
        };

        if control & 0x20 != 0 {
            let dnet = pdu.get_short()?;
            let dlen = pdu.get()? as usize;
            npdu.destination = Some((dnet, pdu.get_data(dlen)?));
        }
        if control & 0x08 != 0 {
            let snet = pdu.get_short()?;
            let slen = pdu.get()? as usize;
            npdu.source = Some((snet, pdu.get_data(slen)?));
        }
        if npdu.destination.is_some() {
            npdu.hop_count = Some(pdu.get()?);
        }
        if control & 0x80 != 0 {
            npdu.network_message = Some(pdu.get()?);
        }
        Ok(npdu)
    }
}

/// The network layer of a stack: wraps outbound APDUs in NPDUs, unwraps
/// inbound ones, and picks the link-level destination.
#[derive(Debug, Default)]
pub struct NetworkAccessPoint;

impl NetworkAccessPoint {
    pub fn new() -> Self {
        NetworkAccessPoint
    }
}

impl Layer for NetworkAccessPoint {
    fn indication(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let apdu_pdu = sdu.expect_data()?;
        let destination = apdu_pdu
            .destination
            .clone()
            .ok_or(BacnetError::Configuration("downstream PDU without destination"))?;

        // A confirmed request wants the routers along the way to know a
        // reply is coming back.
        let expecting_reply = apdu_pdu
            .octets()
            .first()
            .map(|octet0| octet0 >> 4 == ApduType::ConfirmedRequest as u8)
            .unwrap_or(false);

        let mut npdu = Npdu {
            expecting_reply,
            ..Npdu::default()
        };

        // Remote destinations get routing headers and ride the local
        // broadcast so a router can forward them.
        let link_destination = match &destination {
            Address::LocalStation(_) | Address::LocalBroadcast => destination.clone(),
            Address::RemoteStation(net, mac) => {
                npdu.destination = Some((*net, mac.clone()));
                npdu.hop_count = Some(255);
                Address::LocalBroadcast
            }
            Address::RemoteBroadcast(net) => {
                npdu.destination = Some((*net, Vec::new()));
                npdu.hop_count = Some(255);
                Address::LocalBroadcast
            }
            Address::GlobalBroadcast => {
                npdu.destination = Some((GLOBAL_BROADCAST_NETWORK, Vec::new()));
                npdu.hop_count = Some(255);
                Address::LocalBroadcast
            }
        };

        let mut out = Pdu::new();
        npdu.encode(&mut out);
        out.put_data(apdu_pdu.octets());
        out.source = apdu_pdu.source.clone();
        out.user_data = apdu_pdu.user_data.clone();
        out.destination = Some(link_destination);
        trace!("npdu out {:?}", out);
        ctx.send_down(Sdu::Data(out));
        Ok(())
    }

    fn confirmation(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let mut pdu = sdu.expect_data()?;
        let npdu = Npdu::decode(&mut pdu)?;

        if let Some(message_type) = npdu.network_message {
            // network layer messages (router discovery etc.) are not handled
            debug!("network layer message {:#04x} dropped", message_type);
            return Ok(());
        }

        let mut up = Pdu::with_data(pdu.octets().to_vec());
        up.user_data = pdu.user_data.clone();

        // A routed PDU names its true originator in SNET/SADDR.
        up.source = match &npdu.source {
            Some((snet, saddr)) => Some(Address::RemoteStation(*snet, saddr.clone())),
            None => pdu.source.clone(),
        };
        up.destination = match &npdu.destination {
            Some((dnet, _)) if *dnet == GLOBAL_BROADCAST_NETWORK => {
                Some(Address::GlobalBroadcast)
            }
            _ => pdu.destination.clone(),
        };

        if up.destination.is_none() {
            warn!("inbound NPDU without link destination");
        }
        ctx.send_up(Sdu::Data(up));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_npdu_roundtrip_plain() {
        let npdu = Npdu {
            expecting_reply: true,
            priority: 0,
            ..Npdu::default()
        };
        let mut pdu = Pdu::new();
        npdu.encode(&mut pdu);
        pdu.put_data(&[0xAA]);
        let decoded = Npdu::decode(&mut pdu).unwrap();
        assert_eq!(decoded, npdu);
        assert_eq!(pdu.octets(), &[0xAA]);
    }

    #[test]
    fn test_npdu_roundtrip_routed() {
        let npdu = Npdu {
            expecting_reply: false,
            priority: 2,
            destination: Some((12, vec![1, 2])),
            source: Some((7, vec![9])),
            hop_count: Some(254),
            network_message: None,
        };
        let mut pdu = Pdu::new();
        npdu.encode(&mut pdu);
        assert_eq!(Npdu::decode(&mut pdu).unwrap(), npdu);
    }

    #[test]
    fn test_npdu_wrong_version_rejected() {
        let mut pdu = Pdu::with_data(vec![0x02, 0x00]);
        assert_eq!(Npdu::decode(&mut pdu), Err(BacnetError::InvalidNpdu));
    }

    #[test]
    fn test_npdu_global_broadcast_header() {
        let npdu = Npdu {
            destination: Some((GLOBAL_BROADCAST_NETWORK, Vec::new())),
            hop_count: Some(255),
            ..Npdu::default()
        };
        let mut pdu = Pdu::new();
        npdu.encode(&mut pdu);
        // version, control with dest bit, DNET FFFF, DLEN 0, hop count
        assert_eq!(pdu.octets(), &[0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF]);
    }
}
