// SPDX-License-Identifier: Apache-2.0

//! Platform descriptor unifying the handful of board-specific constants
//! that `original_source/src/plat/{qemu-arm-virt,rpi4}` used to
//! duplicate into separate source files per platform: GICv2m MSI frame
//! geometry today, with room for the PCI ECAM window and INTx base once
//! a second platform needs to differ there too.

use serde::{Deserialize, Serialize};

use crate::irq::PlatformMsiConfig;

/// Everything the proxy needs to know about the board it's running on
/// that isn't already implied by the guest's own device tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub msi: PlatformMsiConfig,
    /// Base IRQ number PCI legacy INTx pins start from, ahead of
    /// swizzling.
    pub pci_intx_base: u32,
}

impl PlatformConfig {
    pub fn qemu_arm_virt() -> Self {
        PlatformConfig {
            msi: PlatformMsiConfig::qemu_arm_virt(),
            pci_intx_base: 64,
        }
    }

    pub fn rpi4() -> Self {
        PlatformConfig {
            msi: PlatformMsiConfig::rpi4(),
            pci_intx_base: 64,
        }
    }
}
