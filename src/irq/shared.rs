// SPDX-License-Identifier: Apache-2.0

//! A single physical IRQ line wired-OR across up to 64 independent
//! sources, as used for PCI INTx pins where several devices may share a
//! line. Ported from `original_source/src/shared_irq_line.c`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::kernel::Microkernel;

/// Up to 64 sources sharing one physical line. The line is asserted
/// whenever at least one source bit is set, and only transitions
/// (rather than re-pulsing on every source change) are forwarded to the
/// kernel.
pub struct SharedIrqLine {
    kernel: Arc<dyn Microkernel>,
    irq: u32,
    sources: AtomicU64,
}

impl SharedIrqLine {
    pub fn new(kernel: Arc<dyn Microkernel>, irq: u32) -> Self {
        SharedIrqLine {
            kernel,
            irq,
            sources: AtomicU64::new(0),
        }
    }

    /// Set or clear the given source bit, injecting an edge on the
    /// shared line only if the aggregate level (any bit set) actually
    /// changed.
    pub fn change(&self, source: u32, asserted: bool) {
        assert!(source < 64, "shared irq line supports at most 64 sources");
        let bit = 1u64 << source;
        let old = if asserted {
            self.sources.fetch_or(bit, Ordering::SeqCst)
        } else {
            self.sources.fetch_and(!bit, Ordering::SeqCst)
        };
        let old_level = old != 0;
        let new_level = (old & !bit | if asserted { bit } else { 0 }) != 0;
        if old_level != new_level {
            self.kernel.set_irq_level(self.irq, new_level);
        }
    }
}
