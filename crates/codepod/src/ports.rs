//! Host port allocation for session containers.
//!
//! A port is found by binding a probe socket and dropping it again, so the
//! returned port is only reserved by convention: the container must bind it
//! promptly. The allocator additionally remembers every port it has handed
//! out until it is released, so two live sessions never share a port even
//! when the OS hands the same ephemeral port back twice.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Mutex;

use log::{debug, warn};
use thiserror::Error;

/// Errors from port allocation.
#[derive(Debug, Error)]
pub enum PortError {
    /// Neither the preferred port nor an OS-assigned port could be bound.
    #[error("no host port available: {0}")]
    Exhausted(String),
}

/// Allocates host ports for new sessions.
pub trait PortAllocator: Send + Sync {
    /// Reserve `preferred` if it is free, otherwise an OS-assigned ephemeral port.
    fn allocate(&self, preferred: u16) -> Result<u16, PortError>;

    /// Return a port to the pool. Releasing an unknown port is a no-op.
    fn release(&self, port: u16);

    /// Ports currently handed out.
    fn reserved(&self) -> Vec<u16>;
}

/// Port allocator that probes by binding TCP sockets.
#[derive(Debug)]
pub struct TcpPortAllocator {
    bind_addr: Ipv4Addr,
    reserved: Mutex<HashSet<u16>>,
}

impl Default for TcpPortAllocator {
    fn default() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED)
    }
}

impl TcpPortAllocator {
    /// Attempts at getting a fresh ephemeral port before giving up.
    const MAX_EPHEMERAL_ATTEMPTS: usize = 16;

    /// Create an allocator that probes on the given address.
    ///
    /// Containers publish on all interfaces by default, so `0.0.0.0` is the
    /// address that has to be free.
    pub fn new(bind_addr: Ipv4Addr) -> Self {
        Self {
            bind_addr,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    fn probe(&self, port: u16) -> std::io::Result<u16> {
        let listener = TcpListener::bind(SocketAddr::from((self.bind_addr, port)))?;
        let bound = listener.local_addr()?.port();
        drop(listener);
        Ok(bound)
    }
}

impl PortAllocator for TcpPortAllocator {
    fn allocate(&self, preferred: u16) -> Result<u16, PortError> {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if preferred != 0 && !reserved.contains(&preferred) {
            match self.probe(preferred) {
                Ok(port) => {
                    reserved.insert(port);
                    debug!("Allocated preferred port {}", port);
                    return Ok(port);
                }
                Err(e) => debug!("Preferred port {} unavailable: {}", preferred, e),
            }
        }

        let mut last_error = None;
        for _ in 0..Self::MAX_EPHEMERAL_ATTEMPTS {
            match self.probe(0) {
                Ok(port) if reserved.contains(&port) => {
                    debug!("OS returned already-reserved port {}, retrying", port);
                }
                Ok(port) => {
                    reserved.insert(port);
                    debug!("Allocated ephemeral port {}", port);
                    return Ok(port);
                }
                Err(e) => {
                    warn!("Failed to bind ephemeral port: {}", e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(PortError::Exhausted(last_error.unwrap_or_else(|| {
            format!(
                "no unreserved port after {} attempts",
                Self::MAX_EPHEMERAL_ATTEMPTS
            )
        })))
    }

    fn release(&self, port: u16) {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if reserved.remove(&port) {
            debug!("Released port {}", port);
        }
    }

    fn reserved(&self) -> Vec<u16> {
        let reserved = self
            .reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ports: Vec<u16> = reserved.iter().copied().collect();
        ports.sort_unstable();
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> TcpPortAllocator {
        TcpPortAllocator::new(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn allocates_preferred_port_when_free() {
        // Find a free port first, then ask for it explicitly
        let free = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let allocator = loopback();
        assert_eq!(allocator.allocate(free).unwrap(), free);
        assert_eq!(allocator.reserved(), vec![free]);
    }

    #[test]
    fn falls_back_to_ephemeral_when_preferred_is_taken() {
        let holder = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap().port();

        let allocator = loopback();
        let port = allocator.allocate(taken).unwrap();
        assert_ne!(port, taken);
        assert_ne!(port, 0);
    }

    #[test]
    fn never_hands_out_a_reserved_port_twice() {
        let allocator = loopback();
        let first = allocator.allocate(0).unwrap();
        // The probe socket is closed, so the OS would allow the same port again
        let second = allocator.allocate(first).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn released_port_can_be_allocated_again() {
        let allocator = loopback();
        let port = allocator.allocate(0).unwrap();
        allocator.release(port);
        assert!(allocator.reserved().is_empty());

        assert_eq!(allocator.allocate(port).unwrap(), port);
    }

    #[test]
    fn releasing_unknown_port_is_noop() {
        let allocator = loopback();
        allocator.release(65000);
        assert!(allocator.reserved().is_empty());
    }
}
