// SPDX-License-Identifier: Apache-2.0

//! Generic emulated-device registration: a backend can claim an MMIO
//! range or an IRQ number for a device it emulates entirely itself,
//! without the proxy knowing anything about the device beyond "forward
//! faults in this range" / "this backend owns this IRQ". Ported from
//! `original_source/include/tii/emulated_device.h` and
//! `original_source/src/emulated_device.c`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{ProxyError, Result};
use crate::io_proxy::IoProxyHandle;
use crate::irq::IrqLine;
use crate::kernel::Microkernel;
use crate::reservations::{IrqReservations, MmioReservations};

/// Flag bit on a `MMIO_REGION_CONFIG` request indicating the backend is
/// releasing a previously-claimed range rather than claiming a new one.
pub const MMIO_REGION_CONFIG_FREE: u64 = 1 << 0;

/// Registry of emulated-device MMIO and IRQ claims, shared across all
/// backends attached to this proxy.
pub struct EmulatedDeviceRegistry {
    kernel: Arc<dyn Microkernel>,
    mmio: MmioReservations,
    irqs: IrqReservations,
    irq_lines: Mutex<HashMap<u32, IrqLine>>,
}

impl EmulatedDeviceRegistry {
    pub fn new(kernel: Arc<dyn Microkernel>) -> Self {
        EmulatedDeviceRegistry {
            kernel,
            mmio: MmioReservations::new(),
            irqs: IrqReservations::new(),
            irq_lines: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a `MMIO_REGION_CONFIG` request: claim `[addr, addr+size)`
    /// for `backend`, or release it if the free flag is set.
    pub fn mmio_config(
        &self,
        backend: &IoProxyHandle,
        addr: u64,
        size: u64,
        flags: u64,
    ) -> Result<()> {
        let id = backend.id();
        if flags & MMIO_REGION_CONFIG_FREE != 0 {
            self.mmio.free(addr, size, id)?;
            self.kernel.reserve_mmio_region(addr, 0)?;
            return Ok(());
        }
        self.mmio.assign(addr, size, id)?;
        self.kernel.reserve_mmio_region(addr, size)
    }

    /// Handle a `SET_IRQ`/`CLR_IRQ` request for an emulated device,
    /// lazily creating the line the first time this IRQ is used, the way
    /// `emudev_irq_set` does.
    pub fn irq_set(&self, backend: &IoProxyHandle, irq: u32, asserted: bool) -> Result<()> {
        let id = backend.id();
        match self.irqs.find(irq) {
            Some(owner) if owner != id => {
                return Err(ProxyError::BadArgument(
                    "irq is owned by a different backend",
                ))
            }
            Some(_) => {}
            None => self.irqs.assign(irq, id)?,
        }

        let mut lines = self.irq_lines.lock().unwrap();
        let line = lines
            .entry(irq)
            .or_insert_with(|| IrqLine::new(Arc::clone(&self.kernel), irq));
        if asserted {
            line.change();
        }
        Ok(())
    }

    pub fn owner_of_mmio(&self, addr: u64) -> Option<u32> {
        self.mmio.find(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::MockKernel;

    #[test]
    fn mmio_config_claims_then_frees() {
        let kernel = Arc::new(MockKernel::new());
        let registry = EmulatedDeviceRegistry::new(kernel.clone());
        let backend = IoProxyHandle::new_for_test(1, kernel);

        registry.mmio_config(&backend, 0x4000, 0x1000, 0).unwrap();
        assert_eq!(registry.owner_of_mmio(0x4010), Some(1));

        registry
            .mmio_config(&backend, 0x4000, 0x1000, MMIO_REGION_CONFIG_FREE)
            .unwrap();
        assert_eq!(registry.owner_of_mmio(0x4010), None);
    }

    #[test]
    fn irq_set_is_lazy_and_exclusive() {
        let kernel = Arc::new(MockKernel::new());
        let registry = EmulatedDeviceRegistry::new(kernel.clone());
        let a = IoProxyHandle::new_for_test(1, kernel.clone());
        let b = IoProxyHandle::new_for_test(2, kernel.clone());

        registry.irq_set(&a, 55, true).unwrap();
        assert!(registry.irq_set(&b, 55, true).is_err());
        assert_eq!(kernel.irq_events(), vec![(55, true)]);
    }
}
