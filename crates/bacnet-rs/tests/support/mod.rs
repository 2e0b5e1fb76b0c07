// crates/bacnet-rs/tests/support/mod.rs
//! A virtual BACnet/IP network for the end-to-end tests: in-process
//! stacks exchange frames through inboxes and share a synthetic
//! millisecond clock, so segment timers and retries can be driven
//! deterministically.

use bacnet_rs::apdu::Apdu;
use bacnet_rs::app::{bip_simple_stack, Application};
use bacnet_rs::bvll::{Bvll, BvllFunction};
use bacnet_rs::comm::Stack;
use bacnet_rs::device::DeviceConfig;
use bacnet_rs::npdu::Npdu;
use bacnet_rs::pdu::{Address, Pdu};
use bacnet_rs::task::TaskManager;

/// One frame on the virtual wire.
#[derive(Debug, Clone)]
pub struct Packet {
    pub source: Address,
    pub destination: Address,
    pub data: Vec<u8>,
}

/// Decode the APDU inside a captured frame, when it carries one.
pub fn apdu_of(packet: &Packet) -> Option<Apdu> {
    let mut frame = Pdu::with_data(packet.data.clone());
    let bvll = Bvll::decode(&mut frame).ok()?;
    if !matches!(
        bvll.function,
        BvllFunction::OriginalUnicastNpdu | BvllFunction::OriginalBroadcastNpdu
    ) {
        return None;
    }
    let mut inner = Pdu::with_data(bvll.payload);
    Npdu::decode(&mut inner).ok()?;
    Apdu::decode(&mut inner).ok()
}

/// One simulated device: a full stack plus its own timer wheel.
pub struct DeviceHarness {
    pub stack: Stack<Application>,
    pub tasks: TaskManager,
    pub address: Address,
}

impl DeviceHarness {
    pub fn with_app<R>(
        &mut self,
        now_ms: u64,
        f: impl FnOnce(&mut Application, &mut bacnet_rs::comm::LayerCtx) -> R,
    ) -> R {
        self.stack.with_app(&mut self.tasks, now_ms, f)
    }
}

/// The virtual network.
pub struct TestNet {
    pub now_ms: u64,
    pub devices: Vec<DeviceHarness>,
    pub history: Vec<Packet>,
    /// Frames for which this returns true are recorded but not
    /// delivered.
    pub drop_filter: Option<Box<dyn FnMut(&Packet) -> bool>>,
}

impl TestNet {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        TestNet {
            now_ms: 0,
            devices: Vec::new(),
            history: Vec::new(),
            drop_filter: None,
        }
    }

    /// Add a device at 10.0.0.`host`:47808, returning its index.
    pub fn add_device(
        &mut self,
        device_identifier: u32,
        host: u8,
        configure: impl FnOnce(&mut DeviceConfig),
    ) -> usize {
        let address = Address::local_station_ip([10, 0, 0, host], 47808);
        let mut config = DeviceConfig {
            device_identifier,
            vendor_identifier: 15,
            ..DeviceConfig::default()
        };
        configure(&mut config);
        let stack = bip_simple_stack(config, address.clone()).expect("stack assembles");
        let mut harness = DeviceHarness {
            stack,
            tasks: TaskManager::new(),
            address,
        };
        harness.stack.start(&mut harness.tasks, self.now_ms);
        self.devices.push(harness);
        self.devices.len() - 1
    }

    /// Move frames between devices until the network is quiet.
    pub fn exchange(&mut self) {
        loop {
            let mut traffic = Vec::new();
            for device in &mut self.devices {
                for pdu in device.stack.take_outbound() {
                    let destination = pdu
                        .destination
                        .clone()
                        .expect("outbound frame has a destination");
                    traffic.push(Packet {
                        source: device.address.clone(),
                        destination,
                        data: pdu.into_octets(),
                    });
                }
            }
            if traffic.is_empty() {
                break;
            }

            for packet in traffic {
                self.history.push(packet.clone());
                if let Some(filter) = &mut self.drop_filter {
                    if filter(&packet) {
                        continue;
                    }
                }
                self.deliver(&packet);
            }
        }
    }

    fn deliver(&mut self, packet: &Packet) {
        let now_ms = self.now_ms;
        for device in &mut self.devices {
            let matches = match &packet.destination {
                Address::LocalBroadcast => device.address != packet.source,
                unicast => *unicast == device.address,
            };
            if !matches {
                continue;
            }
            let mut pdu = Pdu::with_data(packet.data.clone());
            pdu.source = Some(packet.source.clone());
            device.stack.receive(pdu, &mut device.tasks, now_ms);
        }
    }

    /// Advance the clock, firing timers in deadline order and letting
    /// any resulting traffic settle.
    pub fn advance(&mut self, duration_ms: u64) {
        let target = self.now_ms + duration_ms;
        loop {
            self.exchange();
            let next_deadline = self
                .devices
                .iter_mut()
                .filter_map(|device| device.tasks.next_deadline())
                .min();
            match next_deadline {
                Some(deadline) if deadline <= target => {
                    self.now_ms = deadline;
                    for device in &mut self.devices {
                        while let Some((timer_target, token)) = device.tasks.pop_due(deadline) {
                            device.stack.timer_expired(
                                timer_target,
                                token,
                                &mut device.tasks,
                                deadline,
                            );
                        }
                    }
                }
                _ => break,
            }
        }
        self.now_ms = target;
        self.exchange();
    }

    /// Hand-deliver a raw APDU to a device, as if `source` had sent it.
    pub fn inject_apdu(&mut self, device: usize, source: &Address, apdu: &Apdu) {
        let mut inner = Pdu::new();
        Npdu::default().encode(&mut inner);
        apdu.encode(&mut inner).expect("apdu encodes");
        let mut frame = Pdu::new();
        Bvll::new(BvllFunction::OriginalUnicastNpdu, inner.into_octets()).encode(&mut frame);

        let mut pdu = Pdu::with_data(frame.into_octets());
        pdu.source = Some(source.clone());
        let now_ms = self.now_ms;
        let target = &mut self.devices[device];
        target.stack.receive(pdu, &mut target.tasks, now_ms);
    }

    /// Every APDU put on the wire so far, in order.
    pub fn apdu_history(&self) -> Vec<(Address, Apdu)> {
        self.history
            .iter()
            .filter_map(|packet| apdu_of(packet).map(|apdu| (packet.source.clone(), apdu)))
            .collect()
    }
}
