use std::collections::BTreeSet;

use crate::error::BridgeError;

/// Allocator over a dense, contiguous debug-port range.
///
/// `allocate` hands out the lowest free port; `release` returns a port to
/// the pool immediately. The allocator is the sole authority on port
/// ownership within the fleet.
#[derive(Debug)]
pub struct PortAllocator {
    min: u16,
    max: u16,
    allocated: BTreeSet<u16>,
}

impl PortAllocator {
    /// Build an allocator over `[min, max]` inclusive.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when `min > max` or `min` is zero (ports
    /// must lie in `[1, 65535]`).
    pub fn new(min: u16, max: u16) -> Result<Self, BridgeError> {
        if min == 0 {
            return Err(BridgeError::InvalidArgument {
                field: "port_range".into(),
                message: "range must lie within [1, 65535]".into(),
            });
        }
        if min > max {
            return Err(BridgeError::InvalidArgument {
                field: "port_range".into(),
                message: format!("min {min} exceeds max {max}"),
            });
        }
        Ok(Self {
            min,
            max,
            allocated: BTreeSet::new(),
        })
    }

    /// Capacity of the range.
    #[must_use]
    pub fn capacity(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    /// Number of ports currently out.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// The lowest free port.
    ///
    /// # Errors
    ///
    /// Returns `PortExhausted` when every port in the range is out.
    pub fn allocate(&mut self) -> Result<u16, BridgeError> {
        for port in self.min..=self.max {
            if !self.allocated.contains(&port) {
                self.allocated.insert(port);
                return Ok(port);
            }
        }
        Err(BridgeError::PortExhausted {
            min: self.min,
            max: self.max,
        })
    }

    /// Like [`allocate`](Self::allocate), but additionally binds and
    /// releases the port to confirm OS-level availability. Ports that fail
    /// the bind probe stay allocated-skipped for this call and are released
    /// again before returning.
    ///
    /// # Errors
    ///
    /// Returns `PortExhausted` when no port in the range is both free in
    /// the pool and bindable.
    pub fn allocate_verified(&mut self) -> Result<u16, BridgeError> {
        let mut skipped = Vec::new();
        let result = loop {
            match self.allocate() {
                Ok(port) => {
                    if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                        break Ok(port);
                    }
                    // OS says taken; keep it out of the running and try the
                    // next one.
                    skipped.push(port);
                }
                Err(e) => break Err(e),
            }
        };
        for port in skipped {
            self.allocated.remove(&port);
        }
        result
    }

    /// Return a port to the pool. Returns `false` (and changes nothing)
    /// when the port was not allocated.
    pub fn release(&mut self, port: u16) -> bool {
        self.allocated.remove(&port)
    }

    /// Whether a port is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.contains(&port)
    }
}
