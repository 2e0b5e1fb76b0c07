#![cfg_attr(not(feature = "std"), no_std)]

// 'alloc' is used for dynamic allocation (e.g., Vec<u8> in PDU buffers)
extern crate alloc;

// --- Foundation Modules ---
pub mod error;
pub mod types;
pub mod pdu;
pub mod task;
pub mod comm;

// --- Codecs ---
pub mod primitives;
pub mod apdu;
pub mod npdu;
pub mod bvll;
pub mod services;

// --- Higher Layers ---
pub mod device;
pub mod appservice;

// --- Application & I/O (standard library only) ---
#[cfg(feature = "std")]
pub mod iocb;
#[cfg(feature = "std")]
pub mod app;
#[cfg(feature = "std")]
pub mod udp;
#[cfg(feature = "std")]
pub mod runtime;

// --- Top-level Exports ---
pub use error::BacnetError;
pub use pdu::{Address, Pdu};
pub use comm::{Layer, LayerCtx, Sdu, Stack};
pub use task::TaskManager;
pub use apdu::Apdu;
pub use device::{CommunicationControl, DeviceConfig, DeviceInfo, DeviceInfoCache};
pub use services::{PropertyValue, ServiceBody, ServiceMessage};
pub use appservice::{ApplicationServiceAccessPoint, StateMachineAccessPoint};
#[cfg(feature = "std")]
pub use app::{bip_foreign_stack, bip_simple_stack, Application, BacnetObject};
#[cfg(feature = "std")]
pub use iocb::{Iocb, IocbError, IocbRef, IoState};
#[cfg(feature = "std")]
pub use runtime::Runtime;
#[cfg(feature = "std")]
pub use udp::UdpDirector;
