//! RX filter registry
//!
//! Receivers register a byte-prefix filter. Each decoded AD structure is
//! offered to every receiver whose filter is a prefix of it, most recently
//! registered first. The registry also decides whether scanning has to be
//! active: mesh AD types are broadcast by non-connectable advertisers and
//! only need passive scanning, anything else asks for scan responses.

use crate::adv::{is_mesh_ad_type, RecvInfo};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Consumer of received advertising data
pub trait AdvReceiver: Send + Sync {
    /// `data` is the AD type byte followed by the AD payload
    fn on_receive(&self, info: &RecvInfo, data: &[u8]);
}

impl<F> AdvReceiver for F
where
    F: Fn(&RecvInfo, &[u8]) + Send + Sync,
{
    fn on_receive(&self, info: &RecvInfo, data: &[u8]) {
        self(info, data)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Receive filter must not be empty")]
    EmptyFilter,

    #[error("Too many receive filters (max {0})")]
    TooManyFilters(usize),
}

/// Scan commands needed after a registry change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanChange {
    None,
    /// Disable scanning, program parameters for the given mode, re-enable
    Reconfigure { active: bool },
    /// Last receiver gone
    Disable,
}

#[derive(Clone)]
struct RxEntry {
    filter: Vec<u8>,
    receiver: Arc<dyn AdvReceiver>,
}

impl fmt::Debug for RxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxEntry")
            .field("filter", &hex::encode(&self.filter))
            .finish()
    }
}

fn requires_active_scan(filter: &[u8]) -> bool {
    filter.first().is_some_and(|t| !is_mesh_ad_type(*t))
}

#[derive(Debug, Clone)]
pub struct RxRegistry {
    entries: VecDeque<RxEntry>,
    active: bool,
    max_filters: usize,
}

impl RxRegistry {
    pub fn new(max_filters: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            active: false,
            max_filters,
        }
    }

    /// Register `receiver` for fields starting with `filter`, replacing any
    /// receiver registered with the identical filter.
    pub fn register(
        &mut self,
        filter: &[u8],
        receiver: Arc<dyn AdvReceiver>,
    ) -> Result<ScanChange, RegistryError> {
        if filter.is_empty() {
            return Err(RegistryError::EmptyFilter);
        }

        let replaced = self.remove(filter);
        if !replaced && self.entries.len() >= self.max_filters {
            return Err(RegistryError::TooManyFilters(self.max_filters));
        }

        info!("Registering receiver for {}", hex::encode(filter));
        let already_scanning = !self.entries.is_empty();
        self.entries.push_front(RxEntry {
            filter: filter.to_vec(),
            receiver,
        });

        let active = self.compute_active();
        if !already_scanning || active != self.active {
            self.active = active;
            return Ok(ScanChange::Reconfigure { active });
        }
        Ok(ScanChange::None)
    }

    /// Remove the receiver registered with exactly `filter`
    pub fn deregister(&mut self, filter: &[u8]) -> ScanChange {
        if !self.remove(filter) {
            debug!("No receiver registered for {}", hex::encode(filter));
        }

        if self.entries.is_empty() {
            self.active = false;
            return ScanChange::Disable;
        }

        let active = self.compute_active();
        if active != self.active {
            self.active = active;
            return ScanChange::Reconfigure { active };
        }
        ScanChange::None
    }

    /// Offer a received field to every matching receiver; returns how many fired
    pub fn dispatch(&self, info: &RecvInfo, data: &[u8]) -> usize {
        let mut delivered = 0;
        for entry in self.entries.iter().filter(|e| data.starts_with(&e.filter)) {
            entry.receiver.on_receive(info, data);
            delivered += 1;
        }
        delivered
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered filters, dispatch order
    pub fn filters(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(|e| e.filter.as_slice())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.active = false;
    }

    fn remove(&mut self, filter: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.filter != filter);
        self.entries.len() != before
    }

    fn compute_active(&self) -> bool {
        self.entries.iter().any(|e| requires_active_scan(&e.filter))
    }
}
