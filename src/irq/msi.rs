// SPDX-License-Identifier: Apache-2.0

//! GICv2m MSI frame emulation, ported from
//! `original_source/src/gicv2m.c` and the platform constants in
//! `original_source/src/plat/qemu-arm-virt/msi.c`. A guest write to
//! `V2M_MSI_SETSPI_NS` with a valid SPI number triggers the
//! corresponding IRQ; reads of `V2M_MSI_TYPER`/`V2M_MSI_IIDR` report the
//! frame's SPI range and a fixed product id.

use std::sync::Arc;

use log::warn;
use vm_device::bus::MmioAddress;
use vm_device::DeviceMmio;

use crate::kernel::Microkernel;

const V2M_MSI_TYPER: u64 = 0x008;
const V2M_MSI_SETSPI_NS: u64 = 0x040;
const V2M_MSI_IIDR: u64 = 0xFCC;

/// GICv2m-specific JEP106 product id baked into `V2M_MSI_IIDR`.
const PRODUCT_ID: u32 = 0x53;

/// Per-platform constants for a GICv2m MSI frame, replacing the
/// duplicated `qemu-arm-virt`/`rpi4` platform source files with one
/// parameterized value.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PlatformMsiConfig {
    pub base: u64,
    pub size: u64,
    pub irq_base: u32,
    pub num_irq: u32,
}

impl PlatformMsiConfig {
    pub fn qemu_arm_virt() -> Self {
        PlatformMsiConfig {
            base: 0x0802_0000,
            size: 0x1000,
            irq_base: 96,
            num_irq: 32,
        }
    }

    pub fn rpi4() -> Self {
        PlatformMsiConfig {
            base: 0x0802_0000,
            size: 0x1000,
            irq_base: 144,
            num_irq: 32,
        }
    }
}

/// One GICv2m MSI frame.
pub struct Gicv2m {
    kernel: Arc<dyn Microkernel>,
    config: PlatformMsiConfig,
}

impl Gicv2m {
    pub fn new(kernel: Arc<dyn Microkernel>, config: PlatformMsiConfig) -> Self {
        Gicv2m { kernel, config }
    }

    pub fn base(&self) -> u64 {
        self.config.base
    }

    pub fn size(&self) -> u64 {
        self.config.size
    }

    fn spi_valid(&self, spi: u32) -> bool {
        spi >= self.config.irq_base && spi < self.config.irq_base + self.config.num_irq
    }

    /// Handle a guest read from the MSI frame at `offset`. Per spec
    /// §4.3, reads are expected to be 4 bytes wide; a narrower or wider
    /// access still gets a best-effort reply rather than being treated
    /// as fatal, since the handler can't itself fail a vCPU fault.
    pub fn read(&self, offset: u64, len: u8) -> u64 {
        if len != 4 {
            warn!("msi frame read at {:#x} with unexpected width {}", offset, len);
        }
        match offset {
            V2M_MSI_TYPER => {
                // [9:0] number of SPIs, [25:16] base SPI.
                ((self.config.irq_base & 0x3ff) << 16) as u64 | (self.config.num_irq & 0x3ff) as u64
            }
            V2M_MSI_IIDR => (PRODUCT_ID << 20) as u64,
            _ => {
                warn!("msi frame read at unhandled offset {:#x}", offset);
                0
            }
        }
    }

    /// Handle a guest write to the MSI frame at `offset`; a write to
    /// `V2M_MSI_SETSPI_NS` with a valid SPI injects that interrupt. Spec
    /// §4.3 allows a 2- or 4-byte write here.
    pub fn write(&self, offset: u64, len: u8, value: u64) {
        if len != 2 && len != 4 {
            warn!("msi frame write at {:#x} with unexpected width {}", offset, len);
        }
        match offset {
            V2M_MSI_SETSPI_NS => {
                let spi = value as u32;
                if self.spi_valid(spi) {
                    self.kernel.inject_irq(spi);
                } else {
                    warn!("msi setspi with out-of-range spi {}", spi);
                }
            }
            _ => warn!("msi frame write at unhandled offset {:#x}", offset),
        }
    }
}

/// Lets the frame be registered on a `vm-device` MMIO bus like any other
/// emulated device, translating byte-slice accesses to the `u64`
/// register reads/writes above.
impl DeviceMmio for Gicv2m {
    fn mmio_read(&self, _base: MmioAddress, offset: u64, data: &mut [u8]) {
        let value = self.read(offset, data.len() as u8);
        let len = data.len().min(8);
        data[..len].copy_from_slice(&value.to_le_bytes()[..len]);
    }

    fn mmio_write(&self, _base: MmioAddress, offset: u64, data: &[u8]) {
        let mut bytes = [0u8; 8];
        let len = data.len().min(8);
        bytes[..len].copy_from_slice(&data[..len]);
        self.write(offset, data.len() as u8, u64::from_le_bytes(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::MockKernel;

    #[test]
    fn typer_reports_configured_range() {
        let kernel = Arc::new(MockKernel::new());
        let msi = Gicv2m::new(kernel, PlatformMsiConfig::qemu_arm_virt());
        let typer = msi.read(V2M_MSI_TYPER, 4);
        assert_eq!(typer & 0x3ff, 32);
        assert_eq!((typer >> 16) & 0x3ff, 96);
    }

    #[test]
    fn setspi_injects_only_in_range() {
        let kernel = Arc::new(MockKernel::new());
        let msi = Gicv2m::new(kernel.clone(), PlatformMsiConfig::qemu_arm_virt());

        msi.write(V2M_MSI_SETSPI_NS, 4, 100);
        msi.write(V2M_MSI_SETSPI_NS, 4, 5); // out of range, ignored

        assert_eq!(kernel.irq_events(), vec![(100, true)]);
    }

    #[test]
    fn iidr_carries_product_id() {
        let kernel = Arc::new(MockKernel::new());
        let msi = Gicv2m::new(kernel, PlatformMsiConfig::rpi4());
        assert_eq!((msi.read(V2M_MSI_IIDR, 4) >> 20) & 0xff, PRODUCT_ID as u64);
    }

    #[test]
    fn unhandled_offset_reads_as_zero() {
        let kernel = Arc::new(MockKernel::new());
        let msi = Gicv2m::new(kernel, PlatformMsiConfig::qemu_arm_virt());
        assert_eq!(msi.read(0x800, 4), 0);
    }
}
