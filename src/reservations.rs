// SPDX-License-Identifier: Apache-2.0

//! Runtime reservation tables tracking which `io_proxy` owns which MMIO
//! range or IRQ number, ported from `original_source/src/mmio_reservations.c`
//! and `original_source/src/irq_reservations.c`. The originals use an
//! intrusive comparator-ordered list; a `Vec` scanned linearly is the
//! idiomatic equivalent here since these tables hold at most a handful
//! of entries (one per emulated device).

use std::sync::Mutex;

use crate::error::{ProxyError, Result};

/// Opaque handle identifying the `io_proxy` backend a reservation
/// belongs to. Equality is by backend identity, matching the original's
/// `io_proxy` pointer comparison.
pub type IoProxyId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MmioReservation {
    addr: u64,
    size: u64,
    io_proxy: IoProxyId,
}

fn overlaps(a_addr: u64, a_size: u64, b_addr: u64, b_size: u64) -> bool {
    a_addr < b_addr + b_size && b_addr < a_addr + a_size
}

/// Table of MMIO ranges claimed by emulated devices, keyed on the exact
/// `(addr, size, io_proxy)` triple so the same backend can free exactly
/// the reservation it made.
#[derive(Default)]
pub struct MmioReservations {
    entries: Mutex<Vec<MmioReservation>>,
}

impl MmioReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new reservation, rejecting an exact-triple duplicate as
    /// well as any range overlapping one already held by a different
    /// backend.
    pub fn assign(&self, addr: u64, size: u64, io_proxy: IoProxyId) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries
            .iter()
            .any(|e| e.addr == addr && e.size == size && e.io_proxy == io_proxy)
        {
            return Err(ProxyError::ResourceExhausted(
                "mmio reservation already exists for this triple",
            ));
        }
        if entries
            .iter()
            .any(|e| e.io_proxy != io_proxy && overlaps(e.addr, e.size, addr, size))
        {
            return Err(ProxyError::ResourceExhausted(
                "mmio range overlaps an existing reservation",
            ));
        }
        entries.push(MmioReservation {
            addr,
            size,
            io_proxy,
        });
        Ok(())
    }

    /// Remove the reservation matching the exact triple. Fails if no
    /// such reservation exists (spec §8: "missing free fails").
    pub fn free(&self, addr: u64, size: u64, io_proxy: IoProxyId) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| !(e.addr == addr && e.size == size && e.io_proxy == io_proxy));
        if entries.len() == before {
            return Err(ProxyError::BadArgument(
                "no matching mmio reservation to free",
            ));
        }
        Ok(())
    }

    /// Find the backend owning the reservation that covers `addr`, if
    /// any.
    pub fn find(&self, addr: u64) -> Option<IoProxyId> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| addr >= e.addr && addr < e.addr + e.size)
            .map(|e| e.io_proxy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IrqReservation {
    irq: u32,
    io_proxy: IoProxyId,
}

/// Table of IRQ numbers claimed by emulated devices, keyed on
/// `(irq, io_proxy)`.
#[derive(Default)]
pub struct IrqReservations {
    entries: Mutex<Vec<IrqReservation>>,
}

impl IrqReservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, irq: u32, io_proxy: IoProxyId) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries
            .iter()
            .any(|e| e.irq == irq && e.io_proxy != io_proxy)
        {
            return Err(ProxyError::ResourceExhausted(
                "irq already reserved by another backend",
            ));
        }
        entries.push(IrqReservation { irq, io_proxy });
        Ok(())
    }

    pub fn find(&self, irq: u32) -> Option<IoProxyId> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.irq == irq)
            .map(|e| e.io_proxy)
    }

    /// Remove the reservation for `(irq, io_proxy)`. Fails if no such
    /// reservation exists. The underlying kernel IRQ registration itself
    /// cannot be undone (spec §4.4); this only drops our bookkeeping.
    pub fn free(&self, irq: u32, io_proxy: IoProxyId) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| !(e.irq == irq && e.io_proxy == io_proxy));
        if entries.len() == before {
            return Err(ProxyError::BadArgument("no matching irq reservation to free"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_mmio_from_another_backend_is_rejected() {
        let table = MmioReservations::new();
        table.assign(0x1000, 0x100, 1).unwrap();
        assert!(table.assign(0x1050, 0x10, 2).is_err());
        // Same backend re-asserting an overlapping range is also rejected;
        // callers that need idempotent re-assignment should free first.
        table.assign(0x2000, 0x10, 1).unwrap();
        assert_eq!(table.find(0x2005), Some(1));
    }

    #[test]
    fn free_then_reassign_round_trips() {
        let table = MmioReservations::new();
        table.assign(0x1000, 0x100, 1).unwrap();
        table.free(0x1000, 0x100, 1).unwrap();
        assert_eq!(table.find(0x1050), None);
        table.assign(0x1000, 0x100, 2).unwrap();
        assert_eq!(table.find(0x1050), Some(2));
    }

    #[test]
    fn second_free_fails() {
        let table = MmioReservations::new();
        table.assign(0x1000, 0x100, 1).unwrap();
        table.free(0x1000, 0x100, 1).unwrap();
        assert!(table.free(0x1000, 0x100, 1).is_err());
    }

    #[test]
    fn exact_duplicate_assignment_fails() {
        let table = MmioReservations::new();
        table.assign(0x1000, 0x100, 1).unwrap();
        assert!(table.assign(0x1000, 0x100, 1).is_err());
    }

    #[test]
    fn irq_reservation_is_exclusive_across_backends() {
        let table = IrqReservations::new();
        table.assign(33, 1).unwrap();
        assert!(table.assign(33, 2).is_err());
        table.assign(33, 1).unwrap(); // same backend, idempotent re-assert
        assert_eq!(table.find(33), Some(1));
    }
}
