// SPDX-License-Identifier: Apache-2.0

//! Level-triggered IRQ line with resample-on-ack, ported from
//! `original_source/src/level_irq.c`. The kernel calls back into
//! [`LevelIrq::resample`] (registered via `register_irq_ack`) whenever
//! the guest acks/EOIs the interrupt; if the line's source is still
//! asserted at that point, the interrupt is re-raised rather than
//! staying low.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::kernel::Microkernel;

/// A level-triggered line whose "is it still active" predicate is
/// supplied by the device emulation and re-checked on every ack.
pub struct LevelIrq {
    kernel: Arc<dyn Microkernel>,
    irq: u32,
    active: AtomicBool,
}

impl LevelIrq {
    pub fn new(kernel: Arc<dyn Microkernel>, irq: u32) -> Arc<Self> {
        let line = Arc::new(LevelIrq {
            kernel,
            irq,
            active: AtomicBool::new(false),
        });

        let resample = Arc::clone(&line);
        line.kernel
            .register_irq_ack(irq, Box::new(move || resample.resample()));
        line
    }

    /// Set the line's level. A rising edge asserts the interrupt; a
    /// falling edge only updates the stored state (there is nothing to
    /// un-assert once the guest has already seen the interrupt).
    pub fn change_level(&self, level: bool) {
        self.active.store(level, Ordering::SeqCst);
        if level {
            self.kernel.set_irq_level(self.irq, true);
        }
    }

    /// Invoked when the guest acks the interrupt. Re-raises it if the
    /// source is still active, the "resample" in `level_irq_resample`.
    fn resample(&self) {
        if self.active.load(Ordering::SeqCst) {
            self.kernel.set_irq_level(self.irq, true);
        } else {
            self.kernel.set_irq_level(self.irq, false);
        }
    }
}
