// SPDX-License-Identifier: Apache-2.0

//! Simplest interrupt primitive: an edge-triggered line with no
//! resampling, ported from `original_source/src/irq_line.c`.

use std::sync::Arc;

use crate::kernel::Microkernel;

/// An edge-triggered IRQ line. Asserting it pulses the line once;
/// there is nothing to resample on ack.
pub struct IrqLine {
    kernel: Arc<dyn Microkernel>,
    irq: u32,
}

impl IrqLine {
    pub fn new(kernel: Arc<dyn Microkernel>, irq: u32) -> Self {
        IrqLine { kernel, irq }
    }

    pub fn change(&self) {
        self.kernel.inject_irq(self.irq);
    }
}
