// SPDX-License-Identifier: Apache-2.0

//! Virtual PCI bus: device records, INTx pin swizzling, and config-space
//! access forwarding, ported from `original_source/src/pci.c` and
//! `original_source/apps/Arm/vm_qemu_virtio/src/{pci_proxy,pci_intx}.c`.
//!
//! Per the decision recorded in `DESIGN.md` (the original's
//! `pci_proxy_start` has a vCPU-vs-native-thread split whose vCPU arm is
//! an acknowledged incomplete fallthrough), config-space access here is
//! always performed by a native worker thread blocked on its
//! [`crate::ioreq::IoReqTable`] slot; there is no vCPU-trap path into PCI
//! config space.

use std::sync::Arc;

use crate::error::{ProxyError, Result};
use crate::io_proxy::IoProxyHandle;
use crate::irq::SharedIrqLine;
use crate::kernel::Microkernel;
use crate::reservations::IoProxyId;

/// Slot 0 is reserved for the host bridge; devices occupy the remaining
/// 31 slots.
pub const NUM_SLOTS: u32 = 32;
pub const NUM_AVAIL_DEVICES: u32 = NUM_SLOTS - 1;
pub const NUM_PINS: u32 = 4;

/// Standard PCI type-0 config-space offsets the VMM intercepts locally
/// instead of forwarding to the backend: the guest's view of these must
/// reflect the VMM's own INTx swizzle, not whatever the backend's
/// emulated device thinks its pin/line is.
const PCI_INTERRUPT_LINE: u64 = 0x3c;
const PCI_INTERRUPT_PIN: u64 = 0x3d;

/// One registered PCI device: the guest-visible devfn, the backend's own
/// devfn (they need not match), and the backend that emulates it.
#[derive(Clone)]
pub struct PciDeviceRecord {
    pub guest_devfn: u8,
    pub backend_devfn: u8,
    pub io_proxy: Arc<IoProxyHandle>,
}

impl PciDeviceRecord {
    fn slot(&self) -> u32 {
        (self.guest_devfn >> 3) as u32
    }

    /// INTx pin this device's slot swizzles to, `(slot) mod 4`, matching
    /// `original_source/apps/Arm/vm_qemu_virtio/src/pci_intx.c`.
    pub fn intx_pin(&self) -> u32 {
        self.slot() % NUM_PINS
    }
}

/// The virtual PCI bus: a fixed set of device slots plus the four
/// wired-OR INTx lines (A-D) they swizzle onto. Each pin aggregates
/// every device slot that swizzles to it, so two devices sharing a pin
/// don't require the guest to coordinate EOI ordering between them.
pub struct PciBus {
    devices: std::sync::Mutex<Vec<PciDeviceRecord>>,
    intx: [SharedIrqLine; NUM_PINS as usize],
    intx_base: u32,
}

impl PciBus {
    /// `kernel` and `intx_base` determine the four per-pin lines:
    /// pin `p` is guest IRQ `intx_base + p`, matching spec §6's
    /// `[0, PCI_NUM_SLOTS)` INTx mapping.
    pub fn new(kernel: Arc<dyn Microkernel>, intx_base: u32) -> Self {
        let intx = std::array::from_fn(|p| SharedIrqLine::new(kernel.clone(), intx_base + p as u32));
        PciBus {
            devices: std::sync::Mutex::new(Vec::new()),
            intx,
            intx_base,
        }
    }

    /// Register a new device, rejecting slot 0 (the bridge) and any slot
    /// already occupied.
    pub fn register(&self, record: PciDeviceRecord) -> Result<()> {
        let slot = record.slot();
        if slot == 0 {
            return Err(ProxyError::BadArgument("slot 0 is reserved for the bridge"));
        }
        if slot >= NUM_SLOTS {
            return Err(ProxyError::BadArgument("pci slot out of range"));
        }

        let mut devices = self.devices.lock().unwrap();
        if devices.iter().any(|d| d.slot() == slot) {
            return Err(ProxyError::ResourceExhausted("pci slot already occupied"));
        }
        devices.push(record);
        Ok(())
    }

    /// Handle a `REGISTER_PCI_DEV` event: allocate the next free guest
    /// slot (function 0, the bridge at slot 0 already excluded) for a
    /// backend naming its own `backend_devfn`, and add the resulting
    /// `(guest_devfn, backend_devfn, io_proxy)` triple. Returns the
    /// assigned guest devfn, matching `pci_register_device` in
    /// `original_source/src/pci.c`.
    pub fn register_backend(
        &self,
        backend_devfn: u8,
        io_proxy: Arc<IoProxyHandle>,
    ) -> Result<u8> {
        let mut devices = self.devices.lock().unwrap();
        if devices.iter().any(|d| {
            d.backend_devfn == backend_devfn && Arc::ptr_eq(&d.io_proxy, &io_proxy)
        }) {
            return Err(ProxyError::ResourceExhausted(
                "backend devfn already registered",
            ));
        }
        let used: std::collections::HashSet<u32> = devices.iter().map(|d| d.slot()).collect();
        let slot = (1..NUM_SLOTS)
            .find(|s| !used.contains(s))
            .ok_or(ProxyError::ResourceExhausted("no free pci slots"))?;
        let guest_devfn = (slot as u8) << 3;
        devices.push(PciDeviceRecord {
            guest_devfn,
            backend_devfn,
            io_proxy,
        });
        Ok(guest_devfn)
    }

    pub fn find(&self, guest_devfn: u8) -> Option<PciDeviceRecord> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.guest_devfn == guest_devfn)
            .cloned()
    }

    /// Raise or lower this device's INTx line, swizzled onto whichever
    /// of the bus's four wired-OR pins its slot maps to. The slot number
    /// doubles as the source bit within that pin's aggregate, matching
    /// `shared_irq_line_change(pci_intx[p], g, level)` in spec §4.5.
    pub fn intx_set(&self, record: &PciDeviceRecord, asserted: bool) {
        let pin = record.intx_pin() as usize;
        self.intx[pin].change(record.slot(), asserted);
    }

    /// Set or clear INTx for whichever registered device occupies the
    /// given backend slot, as named by a device-initiated `SET_IRQ`
    /// whose `mr1` falls in the PCI range (spec §4.5 "INTx delivery").
    pub fn intx_set_by_backend_slot(&self, backend_devfn: u8, asserted: bool) -> Result<()> {
        let record = self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.backend_devfn == backend_devfn)
            .cloned()
            .ok_or(ProxyError::BadArgument("no pci device at this backend slot"))?;
        self.intx_set(&record, asserted);
        Ok(())
    }

    /// Forward a config-space access to the owning backend over its
    /// native-thread RPC path and return the (possibly dummy, on write)
    /// result word. Mirrors `pci_cfg_ioreq_native`.
    ///
    /// `PCI_INTERRUPT_LINE`/`PCI_INTERRUPT_PIN` are answered locally from
    /// the VMM's own INTx swizzle instead of being forwarded: the
    /// backend's emulated device has no notion of which guest slot (and
    /// therefore which pin) the VMM actually assigned it.
    pub fn config_access(
        &self,
        guest_devfn: u8,
        offset: u64,
        len: u8,
        write_value: Option<u64>,
    ) -> Result<u64> {
        let record = self
            .find(guest_devfn)
            .ok_or(ProxyError::BadArgument("no pci device at this devfn"))?;

        if offset == PCI_INTERRUPT_PIN {
            // PCI pin values are 1-based (1=INTA .. 4=INTD).
            return Ok(write_value.map(|_| 0).unwrap_or(record.intx_pin() as u64 + 1));
        }
        if offset == PCI_INTERRUPT_LINE {
            return Ok(write_value
                .map(|_| 0)
                .unwrap_or((self.intx_base + record.intx_pin()) as u64));
        }

        record
            .io_proxy
            .config_access_native(record.backend_devfn, offset, len, write_value)
    }
}

/// Ties an `io_proxy` identity (used by the reservation tables) to the
/// handle used to actually talk to it.
pub fn io_proxy_id(handle: &IoProxyHandle) -> IoProxyId {
    handle.id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::MockKernel;

    fn test_bus() -> PciBus {
        let kernel = Arc::new(MockKernel::new());
        PciBus::new(kernel, 100)
    }

    #[test]
    fn slot_zero_is_reserved() {
        let bus = test_bus();
        let kernel = Arc::new(MockKernel::new());
        let proxy = Arc::new(IoProxyHandle::new_for_test(1, kernel));
        let record = PciDeviceRecord {
            guest_devfn: 0,
            backend_devfn: 0,
            io_proxy: proxy,
        };
        assert!(matches!(bus.register(record), Err(ProxyError::BadArgument(_))));
    }

    #[test]
    fn intx_pin_follows_slot_modulo_four() {
        let kernel = Arc::new(MockKernel::new());
        let proxy = Arc::new(IoProxyHandle::new_for_test(1, kernel));
        let record = PciDeviceRecord {
            guest_devfn: 5 << 3, // slot 5
            backend_devfn: 0,
            io_proxy: proxy,
        };
        assert_eq!(record.intx_pin(), 1);
    }

    #[test]
    fn duplicate_slot_registration_fails() {
        let bus = test_bus();
        let kernel = Arc::new(MockKernel::new());
        let proxy = Arc::new(IoProxyHandle::new_for_test(1, kernel));
        let a = PciDeviceRecord {
            guest_devfn: 1 << 3,
            backend_devfn: 0,
            io_proxy: proxy.clone(),
        };
        let b = PciDeviceRecord {
            guest_devfn: 1 << 3,
            backend_devfn: 1,
            io_proxy: proxy,
        };
        bus.register(a).unwrap();
        assert!(bus.register(b).is_err());
    }

    #[test]
    fn register_backend_assigns_first_free_slot_skipping_the_bridge() {
        let bus = test_bus();
        let kernel = Arc::new(MockKernel::new());
        let proxy = Arc::new(IoProxyHandle::new_for_test(1, kernel));

        let devfn = bus.register_backend(5, proxy).unwrap();
        assert_eq!(devfn, 1 << 3);
        assert_eq!(bus.find(devfn).unwrap().backend_devfn, 5);
    }

    #[test]
    fn registering_the_same_backend_devfn_twice_fails() {
        let bus = test_bus();
        let kernel = Arc::new(MockKernel::new());
        let proxy = Arc::new(IoProxyHandle::new_for_test(1, kernel));

        bus.register_backend(5, proxy.clone()).unwrap();
        assert!(bus.register_backend(5, proxy).is_err());
    }

    #[test]
    fn interrupt_pin_and_line_reads_are_intercepted_locally() {
        let bus = test_bus();
        let kernel = Arc::new(MockKernel::new());
        let proxy = Arc::new(IoProxyHandle::new_for_test(1, kernel));
        let devfn = bus.register_backend(0, proxy).unwrap(); // slot 1, pin 1

        assert_eq!(bus.config_access(devfn, PCI_INTERRUPT_PIN, 1, None).unwrap(), 2);
        assert_eq!(
            bus.config_access(devfn, PCI_INTERRUPT_LINE, 1, None).unwrap(),
            100 + 1
        );
    }

    #[test]
    fn intx_set_by_backend_slot_raises_the_right_pin() {
        let kernel = Arc::new(MockKernel::new());
        let bus = PciBus::new(kernel.clone(), 100);
        let proxy = Arc::new(IoProxyHandle::new_for_test(1, kernel.clone()));
        bus.register_backend(9, proxy).unwrap(); // slot 1, pin 1

        bus.intx_set_by_backend_slot(9, true).unwrap();
        assert_eq!(kernel.irq_events(), vec![(101, true)]);
    }
}
