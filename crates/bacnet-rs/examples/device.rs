// A minimal BACnet/IP device: answers Who-Is and serves one analog
// input over ReadProperty/WriteProperty.
//
// Run with `RUST_LOG=debug cargo run --example device`, then point any
// BACnet browser at the host.

use bacnet_rs::app::{bip_simple_stack, BacnetObject};
use bacnet_rs::device::DeviceConfig;
use bacnet_rs::primitives::{object_type, ObjectId};
use bacnet_rs::runtime::Runtime;
use bacnet_rs::services::{property_id, PropertyValue};
use bacnet_rs::udp::UdpDirector;
use std::net::SocketAddr;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = DeviceConfig {
        device_identifier: 599,
        vendor_identifier: 15,
        ..DeviceConfig::default()
    };

    let local: SocketAddr = "0.0.0.0:47808".parse()?;
    let broadcast: SocketAddr = "255.255.255.255:47808".parse()?;
    let director = UdpDirector::bind(local, broadcast, 0)?;
    let address = director.local_address()?;
    println!("device 599 listening on {}", address);

    let stack = bip_simple_stack(config, address)?;
    let mut runtime = Runtime::new(stack, director);

    runtime.with_app(|app, _| {
        app.add_object(
            BacnetObject::new(
                ObjectId::new(object_type::ANALOG_INPUT, 1),
                "outside-air-temp",
            )
            .with_property(property_id::PRESENT_VALUE, PropertyValue::Real(21.0)),
        )
    })?;

    runtime.run();
    Ok(())
}
