// SPDX-License-Identifier: Apache-2.0

//! Narrow interface onto the handful of microkernel primitives this crate
//! consumes but does not implement: reading/completing a vCPU's MMIO
//! fault, injecting or leveling an IRQ line, and reserving a physical
//! MMIO range so the guest cannot map over a device-side-backed window.
//!
//! A real binding crate for these primitives does not exist in this
//! workspace; every caller in this crate is written against the
//! [`Microkernel`] trait so swapping in one later is a matter of
//! implementing it, not rewriting the proxy.

use crate::error::{ProxyError, Result};

/// Opaque identifier for a vCPU, as handed out by the microkernel. Kept
/// as a newtype rather than a bare `u32` so ack-table slot arithmetic in
/// [`crate::ioreq`] can't accidentally mix it up with a native slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(pub u32);

/// A single guest-physical MMIO access that trapped to the host.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub addr: u64,
    pub is_write: bool,
    pub len: u8,
    /// Raw contents of the vCPU's fault-data register. Meaningful only
    /// for a write fault, where it holds the guest's store value aligned
    /// to the register width (the caller must shift/mask it down to the
    /// faulting byte lane); unused on a read fault, where the register is
    /// instead the destination the reply gets written into.
    pub data: u64,
}

/// The subset of microkernel/hypervisor functionality this crate treats
/// as an external collaborator rather than something it implements.
///
/// Implementations are expected to be cheap to clone (an `Arc` around a
/// thin handle, typically) since the dispatcher, the PCI proxy and the
/// fault handler all hold one.
pub trait Microkernel: Send + Sync {
    /// Read the faulting address/direction/length for the given vCPU's
    /// most recent trap.
    fn read_fault_address(&self, vcpu: VcpuId) -> FaultInfo;

    /// Store the read result for a completed read fault; the value is
    /// shifted/masked by the caller to match the access width before
    /// being handed here.
    fn set_fault_data(&self, vcpu: VcpuId, value: u64);

    /// Resume the vCPU past the instruction that faulted.
    fn advance_fault(&self, vcpu: VcpuId);

    /// Assert or clear an edge-triggered IRQ line.
    fn inject_irq(&self, irq: u32);

    /// Set a level-triggered IRQ line high or low.
    fn set_irq_level(&self, irq: u32, level: bool);

    /// Register a callback the kernel invokes when the guest acks
    /// (EOIs) the given IRQ, used by level-triggered lines to resample.
    fn register_irq_ack(&self, irq: u32, ack: Box<dyn Fn() + Send + Sync>);

    /// Reserve a guest-physical MMIO range so the guest's own memory map
    /// cannot be extended over it. Fails if the range overlaps an
    /// existing reservation or guest RAM.
    fn reserve_mmio_region(&self, addr: u64, size: u64) -> Result<()>;
}

/// In-memory [`Microkernel`] used by unit tests and the smoke-test
/// harness binary. Records every call it receives instead of talking to
/// real hardware.
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        fault_data: Vec<(VcpuId, u64)>,
        advanced: Vec<VcpuId>,
        irqs: Vec<(u32, bool)>,
        reservations: Vec<(u64, u64)>,
        pending_faults: std::collections::HashMap<VcpuId, FaultInfo>,
    }

    /// A [`Microkernel`] that just logs what it was asked to do.
    #[derive(Default)]
    pub struct MockKernel {
        state: Mutex<State>,
    }

    impl MockKernel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advanced_vcpus(&self) -> Vec<VcpuId> {
            self.state.lock().unwrap().advanced.clone()
        }

        pub fn irq_events(&self) -> Vec<(u32, bool)> {
            self.state.lock().unwrap().irqs.clone()
        }

        pub fn fault_data_writes(&self) -> Vec<(VcpuId, u64)> {
            self.state.lock().unwrap().fault_data.clone()
        }

        /// Arrange for the next [`Microkernel::read_fault_address`] call
        /// for `vcpu` to report the given access, as if the guest had
        /// just trapped on it.
        pub fn set_pending_fault(&self, vcpu: VcpuId, fault: FaultInfo) {
            self.state.lock().unwrap().pending_faults.insert(vcpu, fault);
        }
    }

    impl Microkernel for MockKernel {
        fn read_fault_address(&self, vcpu: VcpuId) -> FaultInfo {
            self.state
                .lock()
                .unwrap()
                .pending_faults
                .get(&vcpu)
                .copied()
                .unwrap_or(FaultInfo {
                    addr: 0,
                    is_write: false,
                    len: 4,
                    data: 0,
                })
        }

        fn set_fault_data(&self, vcpu: VcpuId, value: u64) {
            self.state.lock().unwrap().fault_data.push((vcpu, value));
        }

        fn advance_fault(&self, vcpu: VcpuId) {
            self.state.lock().unwrap().advanced.push(vcpu);
        }

        fn inject_irq(&self, irq: u32) {
            self.state.lock().unwrap().irqs.push((irq, true));
        }

        fn set_irq_level(&self, irq: u32, level: bool) {
            self.state.lock().unwrap().irqs.push((irq, level));
        }

        fn register_irq_ack(&self, _irq: u32, _ack: Box<dyn Fn() + Send + Sync>) {}

        fn reserve_mmio_region(&self, addr: u64, size: u64) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state
                .reservations
                .iter()
                .any(|&(a, s)| addr < a + s && a < addr + size)
            {
                return Err(ProxyError::KernelReject(format!(
                    "range {:#x}+{:#x} overlaps an existing reservation",
                    addr, size
                )));
            }
            state.reservations.push((addr, size));
            Ok(())
        }
    }
}
