use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use super::machine::PortPair;
use crate::errors::ContainerError;

/// Hands out frontend/backend host port pairs from a fixed range.
///
/// A pair is only handed out when neither port is reserved by another
/// container and both can currently be bound on the loopback interface.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            used: Mutex::new(HashSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<PortPair, ContainerError> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let mut port = self.start;
        while port < self.end {
            let pair = PortPair {
                frontend: port,
                backend: port + 1,
            };
            if !used.contains(&pair.frontend)
                && !used.contains(&pair.backend)
                && is_bindable(pair.frontend)
                && is_bindable(pair.backend)
            {
                used.insert(pair.frontend);
                used.insert(pair.backend);
                return Ok(pair);
            }
            port += 2;
        }
        Err(ContainerError::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }

    pub fn release(&self, pair: PortPair) {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        used.remove(&pair.frontend);
        used.remove(&pair.backend);
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).len() / 2
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
