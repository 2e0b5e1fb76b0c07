// crates/bacnet-rs/src/bvll.rs
//! BACnet Virtual Link Layer: the Annex J framing over UDP.
//!
//! `Bvll` is the header codec; `BipNormal` and `BipForeign` are the two
//! link layers built on it. A normal station sends broadcasts onto the
//! local subnet; a foreign station registers with a BBMD and asks it to
//! distribute broadcasts instead.

use crate::comm::{Layer, LayerCtx, Sdu};
use crate::error::BacnetError;
use crate::pdu::{Address, Pdu};
use crate::types::BVLL_TYPE_BACNET_IP;
use alloc::vec::Vec;
use core::convert::TryFrom;
use log::{debug, info, trace, warn};

/// Annex J function codes (ASHRAE 135, Clause J.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvllFunction {
    Result = 0,
    WriteBroadcastDistributionTable = 1,
    ReadBroadcastDistributionTable = 2,
    ReadBroadcastDistributionTableAck = 3,
    ForwardedNpdu = 4,
    RegisterForeignDevice = 5,
    ReadForeignDeviceTable = 6,
    ReadForeignDeviceTableAck = 7,
    DeleteForeignDeviceTableEntry = 8,
    DistributeBroadcastToNetwork = 9,
    OriginalUnicastNpdu = 10,
    OriginalBroadcastNpdu = 11,
}

impl TryFrom<u8> for BvllFunction {
    type Error = BacnetError;
    fn try_from(value: u8) -> Result<Self, BacnetError> {
        match value {
            0 => Ok(Self::Result),
            1 => Ok(Self::WriteBroadcastDistributionTable),
            2 => Ok(Self::ReadBroadcastDistributionTable),
            3 => Ok(Self::ReadBroadcastDistributionTableAck),
            4 => Ok(Self::ForwardedNpdu),
            5 => Ok(Self::RegisterForeignDevice),
            6 => Ok(Self::ReadForeignDeviceTable),
            7 => Ok(Self::ReadForeignDeviceTableAck),
            8 => Ok(Self::DeleteForeignDeviceTableEntry),
            9 => Ok(Self::DistributeBroadcastToNetwork),
            10 => Ok(Self::OriginalUnicastNpdu),
            11 => Ok(Self::OriginalBroadcastNpdu),
            _ => Err(BacnetError::InvalidEnumValue),
        }
    }
}

/// One BVLL frame: `[0x81][function][length:2]` followed by the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bvll {
    pub function: BvllFunction,
    pub payload: Vec<u8>,
}

impl Bvll {
    pub fn new(function: BvllFunction, payload: Vec<u8>) -> Self {
        Bvll { function, payload }
    }

    pub fn encode(&self, pdu: &mut Pdu) {
        pdu.put(BVLL_TYPE_BACNET_IP);
        pdu.put(self.function as u8);
        pdu.put_short(self.payload.len() as u16 + 4);
        pdu.put_data(&self.payload);
    }

    pub fn decode(pdu: &mut Pdu) -> Result<Self, BacnetError> {
        if pdu.get()? != BVLL_TYPE_BACNET_IP {
            return Err(BacnetError::InvalidBvllFrame);
        }
        let function = BvllFunction::try_from(pdu.get()?)?;
        let length = pdu.get_short()? as usize;
        if length < 4 || length - 4 != pdu.remaining() {
            return Err(BacnetError::InvalidBvllFrame);
        }
        Ok(Bvll {
            function,
            payload: pdu.get_data(length - 4)?,
        })
    }
}

/// A BACnet/IP MAC is four IPv4 octets and a big-endian port.
fn mac_from_payload(payload: &[u8]) -> Result<Address, BacnetError> {
    if payload.len() < 6 {
        return Err(BacnetError::InvalidBvllFrame);
    }
    Ok(Address::LocalStation(payload[..6].to_vec()))
}

/// Normal (on-subnet) BACnet/IP link layer.
#[derive(Debug)]
pub struct BipNormal {
    local_address: Address,
}

impl BipNormal {
    pub fn new(local_address: Address) -> Self {
        BipNormal { local_address }
    }
}

impl Layer for BipNormal {
    fn indication(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let pdu = sdu.expect_data()?;
        let function = match pdu.destination {
            Some(Address::LocalBroadcast) => BvllFunction::OriginalBroadcastNpdu,
            Some(Address::LocalStation(_)) => BvllFunction::OriginalUnicastNpdu,
            ref other => {
                warn!("link layer cannot reach {:?}, dropped", other);
                return Ok(());
            }
        };

        let mut out = Pdu::new();
        Bvll::new(function, pdu.octets().to_vec()).encode(&mut out);
        out.update(&pdu);
        ctx.send_down(Sdu::Data(out));
        Ok(())
    }

    fn confirmation(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let mut pdu = sdu.expect_data()?;
        let frame = Bvll::decode(&mut pdu)?;
        trace!("bvll in: {:?} from {:?}", frame.function, pdu.source);

        match frame.function {
            BvllFunction::OriginalUnicastNpdu => {
                let mut up = Pdu::with_data(frame.payload);
                up.source = pdu.source.clone();
                up.destination = Some(self.local_address.clone());
                up.user_data = pdu.user_data.clone();
                ctx.send_up(Sdu::Data(up));
            }
            BvllFunction::OriginalBroadcastNpdu => {
                let mut up = Pdu::with_data(frame.payload);
                up.source = pdu.source.clone();
                up.destination = Some(Address::LocalBroadcast);
                up.user_data = pdu.user_data.clone();
                ctx.send_up(Sdu::Data(up));
            }
            BvllFunction::ForwardedNpdu => {
                // a BBMD relayed this; the original source leads the payload
                let source = mac_from_payload(&frame.payload)?;
                let mut up = Pdu::with_data(frame.payload[6..].to_vec());
                up.source = Some(source);
                up.destination = Some(Address::LocalBroadcast);
                up.user_data = pdu.user_data.clone();
                ctx.send_up(Sdu::Data(up));
            }
            BvllFunction::Result => {
                let mut result = Pdu::with_data(frame.payload);
                let code = result.get_short().unwrap_or(0xFFFF);
                if code != 0 {
                    warn!("BVLL result error {:#06x}", code);
                }
            }
            other => debug!("BVLL function {:?} not handled here, dropped", other),
        }
        Ok(())
    }
}

const REGISTRATION_TOKEN: u64 = 1;

/// Foreign-device BACnet/IP link layer: registers with a BBMD and routes
/// broadcasts through it.
#[derive(Debug)]
pub struct BipForeign {
    bbmd_address: Address,
    ttl_seconds: u16,
    registered: bool,
}

impl BipForeign {
    pub fn new(bbmd_address: Address, ttl_seconds: u16) -> Self {
        BipForeign {
            bbmd_address,
            ttl_seconds,
            registered: false,
        }
    }

    fn register(&mut self, ctx: &mut LayerCtx) {
        let mut out = Pdu::new();
        Bvll::new(
            BvllFunction::RegisterForeignDevice,
            self.ttl_seconds.to_be_bytes().to_vec(),
        )
        .encode(&mut out);
        out.destination = Some(self.bbmd_address.clone());
        ctx.send_down(Sdu::Data(out));

        // renew comfortably inside the TTL
        let renew_s = self.ttl_seconds.saturating_sub(5).max(1) as u64;
        ctx.start_timer(REGISTRATION_TOKEN, renew_s * 1000);
    }
}

impl Layer for BipForeign {
    fn startup(&mut self, ctx: &mut LayerCtx) {
        info!(
            "registering as foreign device with {} (ttl {}s)",
            self.bbmd_address, self.ttl_seconds
        );
        self.register(ctx);
    }

    fn indication(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let pdu = sdu.expect_data()?;
        let (function, link_destination) = match &pdu.destination {
            Some(Address::LocalBroadcast) => (
                BvllFunction::DistributeBroadcastToNetwork,
                self.bbmd_address.clone(),
            ),
            Some(station @ Address::LocalStation(_)) => {
                (BvllFunction::OriginalUnicastNpdu, station.clone())
            }
            other => {
                warn!("link layer cannot reach {:?}, dropped", other);
                return Ok(());
            }
        };
        if !self.registered && function == BvllFunction::DistributeBroadcastToNetwork {
            debug!("broadcast before registration is acknowledged");
        }

        let mut out = Pdu::new();
        Bvll::new(function, pdu.octets().to_vec()).encode(&mut out);
        out.source = pdu.source.clone();
        out.user_data = pdu.user_data.clone();
        out.destination = Some(link_destination);
        ctx.send_down(Sdu::Data(out));
        Ok(())
    }

    fn confirmation(&mut self, sdu: Sdu, ctx: &mut LayerCtx) -> Result<(), BacnetError> {
        let mut pdu = sdu.expect_data()?;
        let frame = Bvll::decode(&mut pdu)?;

        match frame.function {
            BvllFunction::Result => {
                let mut result = Pdu::with_data(frame.payload);
                let code = result.get_short().unwrap_or(0xFFFF);
                if code == 0 {
                    if !self.registered {
                        info!("foreign device registration acknowledged");
                    }
                    self.registered = true;
                } else {
                    warn!("foreign device registration failed: {:#06x}", code);
                    self.registered = false;
                }
            }
            BvllFunction::OriginalUnicastNpdu => {
                let mut up = Pdu::with_data(frame.payload);
                up.source = pdu.source.clone();
                up.user_data = pdu.user_data.clone();
                ctx.send_up(Sdu::Data(up));
            }
            BvllFunction::ForwardedNpdu => {
                let source = mac_from_payload(&frame.payload)?;
                let mut up = Pdu::with_data(frame.payload[6..].to_vec());
                up.source = Some(source);
                up.destination = Some(Address::LocalBroadcast);
                up.user_data = pdu.user_data.clone();
                ctx.send_up(Sdu::Data(up));
            }
            other => debug!("BVLL function {:?} not handled here, dropped", other),
        }
        Ok(())
    }

    fn timer_expired(&mut self, token: u64, ctx: &mut LayerCtx) {
        if token == REGISTRATION_TOKEN {
            trace!("renewing foreign device registration");
            self.register(ctx);
        }
    }
}
