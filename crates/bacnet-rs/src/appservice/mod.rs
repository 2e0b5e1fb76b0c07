// crates/bacnet-rs/src/appservice/mod.rs
//! The application service layer: segmentation state machines, the
//! transaction registry, and the service access point above it.

pub mod asap;
pub mod client;
pub mod server;
pub mod smap;
pub mod ssm;

pub use asap::ApplicationServiceAccessPoint;
pub use client::ClientSsm;
pub use server::ServerSsm;
pub use smap::StateMachineAccessPoint;
pub use ssm::{SsmCore, SsmState};
