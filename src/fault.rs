// SPDX-License-Identifier: Apache-2.0

//! Translates a trapped vCPU MMIO fault into an RPC request and parks
//! the vCPU until the backend replies. Ported from the vCPU-facing half
//! of `original_source/src/ioreq.c` (`ioack_vcpu_read`/`ioack_vcpu_write`)
//! and `handle_mmio` in `original_source/include/tii/io_proxy.h`.

use std::sync::Arc;

use crate::error::{FaultOutcome, ProxyError, Result};
use crate::io_proxy::IoProxyHandle;
use crate::kernel::{Microkernel, VcpuId};
use crate::rpc::iobuf::QUEUE_DRVRPC_REQ;
use crate::rpc::msg::{AddressSpace, Direction, RpcMsg};

/// Drives vCPU-originated MMIO faults into the RPC protocol for one
/// backend. Holds no state of its own beyond a reference to the backend
/// it forwards to; the outstanding-request bookkeeping lives in the
/// backend's [`crate::ioreq::IoReqTable`].
pub struct FaultDriver {
    kernel: Arc<dyn Microkernel>,
    backend: Arc<IoProxyHandle>,
}

impl FaultDriver {
    pub fn new(kernel: Arc<dyn Microkernel>, backend: Arc<IoProxyHandle>) -> Self {
        FaultDriver { kernel, backend }
    }

    /// Handle one vCPU's trapped MMIO access. On success the vCPU has
    /// already been resumed by the ack path (for a request that
    /// completes synchronously against a cached value) or will be
    /// resumed asynchronously once the backend's reply drains through
    /// [`crate::dispatch::Dispatcher::poll_responses`].
    pub fn handle_mmio(&self, vcpu: VcpuId, addr_space: AddressSpace) -> FaultOutcome {
        match self.try_handle_mmio(vcpu, addr_space) {
            Ok(()) => FaultOutcome::Handled,
            Err(ProxyError::BadArgument(_)) => FaultOutcome::Unhandled,
            Err(_) => FaultOutcome::Fatal,
        }
    }

    fn try_handle_mmio(&self, vcpu: VcpuId, addr_space: AddressSpace) -> Result<()> {
        let fault = self.kernel.read_fault_address(vcpu);
        if fault.len == 0 || fault.len > 8 {
            return Err(ProxyError::BadArgument("mmio access length out of range"));
        }

        let direction = if fault.is_write {
            Direction::Write
        } else {
            Direction::Read
        };

        let slot = self
            .backend
            .ioreqs()
            .start_vcpu(vcpu, direction, fault.addr)?;

        let value = if fault.is_write {
            // The fault-data register holds the guest's store value
            // aligned to the register width; bring it down to the
            // faulting byte lane before it goes on the wire.
            let shift = (fault.addr & 3) * 8;
            let width_mask: u64 = if fault.len >= 8 {
                u64::MAX
            } else {
                (1u64 << (fault.len as u32 * 8)) - 1
            };
            (fault.data >> shift) & width_mask
        } else {
            0
        };

        let msg = RpcMsg::mmio(slot, direction, addr_space, fault.len, fault.addr, value);

        let id = self.backend.iobuf().buffer.lend()?;
        self.backend.iobuf().buffer.write(id, msg);
        self.backend
            .iobuf()
            .queue(QUEUE_DRVRPC_REQ)
            .enqueue(id)
            .map_err(|_| ProxyError::QueueFull)?;
        self.backend.ring_doorbell();
        Ok(())
    }
}
