//! Memory bus cost model
//!
//! Charges nanoseconds for the local reads and writes a collective step
//! performs. With `shared` set, reads and writes contend for one bus and
//! their bytes serialize; otherwise read and write paths overlap.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemBus {
    /// Local memory bandwidth in bytes per nanosecond.
    pub bytes_per_ns: f64,
    /// One bus for reads and writes.
    pub shared: bool,
}

impl MemBus {
    pub fn new(bytes_per_ns: f64, shared: bool) -> Self {
        Self {
            bytes_per_ns,
            shared,
        }
    }

    /// Nanoseconds to move `read` bytes in and `write` bytes out.
    pub fn access_ns(&self, read: u64, write: u64) -> u64 {
        if self.bytes_per_ns <= 0.0 {
            return 0;
        }
        let cost = if self.shared {
            (read + write) as f64 / self.bytes_per_ns
        } else {
            (read.max(write)) as f64 / self.bytes_per_ns
        };
        cost.ceil() as u64
    }
}

impl Default for MemBus {
    fn default() -> Self {
        // 100 GB/s local bandwidth
        Self {
            bytes_per_ns: 100.0,
            shared: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_bus_serializes() {
        let private = MemBus::new(10.0, false);
        let shared = MemBus::new(10.0, true);
        assert_eq!(private.access_ns(1000, 1000), 100);
        assert_eq!(shared.access_ns(1000, 1000), 200);
    }

    #[test]
    fn test_zero_bandwidth_is_free() {
        let bus = MemBus::new(0.0, false);
        assert_eq!(bus.access_ns(4096, 4096), 0);
    }
}
