//! Receive side: filter registry and dispatch

pub mod registry;

pub use registry::{AdvReceiver, RegistryError, RxRegistry, ScanChange};
