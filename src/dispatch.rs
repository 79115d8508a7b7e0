// SPDX-License-Identifier: Apache-2.0

//! The RPC dispatcher: drains a backend's response/event queues and
//! routes each message to the handler chain (MMIO ack, PCI, emulated
//! device, MSI, control) by opcode. Ported from `handle_mmio`/`handle_pci`
//! /`handle_emudev` in `original_source/include/tii/io_proxy.h` and
//! `original_source/src/pci.c`.

use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::emudev::EmulatedDeviceRegistry;
use crate::error::{ProxyError, Result};
use crate::fdt::{self, DeviceTree};
use crate::io_proxy::{BackendStatus, IoProxyHandle};
use crate::kernel::Microkernel;
use crate::pci::{self, PciBus};
use crate::rpc::iobuf::{QUEUE_DEVEVT, QUEUE_DRVRPC_RESP};
use crate::rpc::msg::Opcode;

/// Prefix used for this crate's `/pci/<prefix>@<slot>,<fn>` device-tree
/// nodes, matching the `virtio@...` naming the reference images use.
const PCI_FDT_PREFIX: &str = "virtio";

/// Routes backend traffic for one proxy: replies to driver-initiated
/// requests land on `QUEUE_DRVRPC_RESP`, unsolicited device events land
/// on `QUEUE_DEVEVT`.
pub struct Dispatcher {
    kernel: Arc<dyn Microkernel>,
    backend: Arc<IoProxyHandle>,
    pci: Arc<PciBus>,
    emudev: Arc<EmulatedDeviceRegistry>,
    fdt: Arc<Mutex<dyn DeviceTree>>,
}

impl Dispatcher {
    pub fn new(
        kernel: Arc<dyn Microkernel>,
        backend: Arc<IoProxyHandle>,
        pci: Arc<PciBus>,
        emudev: Arc<EmulatedDeviceRegistry>,
        fdt: Arc<Mutex<dyn DeviceTree>>,
    ) -> Self {
        Dispatcher {
            kernel,
            backend,
            pci,
            emudev,
            fdt,
        }
    }

    /// Drain every message currently queued on `QUEUE_DRVRPC_RESP`,
    /// completing the matching ack-table slot for each. Called from the
    /// doorbell-notification thread.
    pub fn poll_responses(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(id) = self.backend.iobuf().queue(QUEUE_DRVRPC_RESP).dequeue() {
            let msg = self.backend.iobuf().buffer.read(id);
            let slot = msg.mmio_slot();
            let value = msg.mmio_value();
            self.backend.ioreqs().finish(slot, value, &*self.kernel)?;
            self.backend.iobuf().buffer.reclaim(id);
            handled += 1;
        }
        Ok(handled)
    }

    /// Drain every unsolicited device event on `QUEUE_DEVEVT`, routing
    /// each by opcode. Returns the count handled; an unknown opcode is
    /// logged and skipped rather than treated as fatal, since a future
    /// device-side backend may speak a newer protocol version.
    pub fn poll_events(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(id) = self.backend.iobuf().queue(QUEUE_DEVEVT).dequeue() {
            let msg = self.backend.iobuf().buffer.read(id);
            self.dispatch_event(msg.opcode(), msg)?;
            self.backend.iobuf().buffer.reclaim(id);
            handled += 1;
        }
        Ok(handled)
    }

    fn dispatch_event(&self, opcode: Opcode, msg: crate::rpc::RpcMsg) -> Result<()> {
        match opcode {
            Opcode::SetIrq | Opcode::ClrIrq => {
                let asserted = match opcode {
                    Opcode::ClrIrq => false,
                    _ => crate::rpc::msg::IrqEvent::from_raw(msg.mr2) != crate::rpc::msg::IrqEvent::Clear,
                };
                self.dispatch_irq_event(msg.mr1 as u32, asserted)
            }
            Opcode::MmioRegionConfig => {
                let addr = msg.mr1;
                let size = msg.mr2;
                let flags = msg.mr3;
                self.emudev.mmio_config(&self.backend, addr, size, flags)
            }
            Opcode::RegisterPciDev => {
                let backend_devfn = msg.mr1 as u8;
                let guest_devfn = self
                    .pci
                    .register_backend(backend_devfn, Arc::clone(&self.backend))?;
                let mut tree = self.fdt.lock().unwrap();
                fdt::publish_pci_device(&mut *tree, PCI_FDT_PREFIX, guest_devfn)?;
                debug!(
                    "registered pci backend devfn {:#x} as guest devfn {:#x}",
                    backend_devfn, guest_devfn
                );
                Ok(())
            }
            Opcode::StartVm => {
                self.backend.legacy_start_vm();
                Ok(())
            }
            Opcode::PutcLog => {
                debug!("backend console byte: {:#x}", msg.mr1 as u8);
                Ok(())
            }
            Opcode::Mmio => Err(ProxyError::ProtocolViolation(
                "mmio replies must arrive on the response queue, not the event queue",
            )),
            Opcode::Unknown(raw) => {
                warn!("ignoring unknown device event opcode {}", raw);
                Err(ProxyError::UnknownOp(raw))
            }
        }
    }

    /// Route a `SET_IRQ`/`CLR_IRQ` event's `mr1` to whichever of the PCI
    /// or emulated-device handlers claims it, per spec §4.7's handler
    /// chain: a value naming a registered backend PCI slot goes to
    /// `PciBus`; anything else (or a value `< PCI_NUM_SLOTS` that names
    /// no registered device) falls through to the emulated-device IRQ
    /// table, exactly as `handle_pci`/`handle_emudev` try in sequence in
    /// `original_source/include/tii/io_proxy.h`.
    fn dispatch_irq_event(&self, value: u32, asserted: bool) -> Result<()> {
        if value < pci::NUM_SLOTS {
            match self
                .pci
                .intx_set_by_backend_slot(value as u8, asserted)
            {
                Ok(()) => return Ok(()),
                Err(ProxyError::BadArgument(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.emudev.irq_set(&self.backend, value, asserted)
    }

    pub fn backend_status(&self) -> BackendStatus {
        if self.backend.is_running() {
            BackendStatus::Ready
        } else {
            BackendStatus::Starting
        }
    }

    pub fn pci_bus(&self) -> &Arc<PciBus> {
        &self.pci
    }

    /// Publish `/reserved-memory/<prefix>@<base>` for this backend's
    /// data-plane window, if it has reported one. Idempotent in the
    /// sense that calling it again with the same window re-publishes
    /// under the same name; callers are expected to call this once,
    /// after the backend's handshake has populated the window.
    pub fn publish_data_window(&self, prefix: &str, compatible: &str) -> Result<Option<u32>> {
        let window = match self.backend.data_window() {
            Some(w) => w,
            None => return Ok(None),
        };
        let mut tree = self.fdt.lock().unwrap();
        let phandle = fdt::publish_reserved_memory(&mut *tree, prefix, compatible, window.base, window.size)?;
        Ok(Some(phandle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::mock::MockDeviceTree;
    use crate::kernel::mock::MockKernel;
    use crate::rpc::msg::{AddressSpace, Direction, RpcMsg};

    fn dispatcher() -> (Arc<MockKernel>, Dispatcher, Arc<IoProxyHandle>, Arc<PciBus>) {
        let kernel = Arc::new(MockKernel::new());
        let backend = Arc::new(IoProxyHandle::new(1, kernel.clone()));
        let pci = Arc::new(PciBus::new(kernel.clone(), 77));
        let emudev = Arc::new(EmulatedDeviceRegistry::new(kernel.clone()));
        let fdt: Arc<Mutex<dyn DeviceTree>> = Arc::new(Mutex::new(MockDeviceTree::new(1, 5)));
        let dispatcher = Dispatcher::new(
            kernel.clone(),
            Arc::clone(&backend),
            Arc::clone(&pci),
            emudev,
            fdt,
        );
        (kernel, dispatcher, backend, pci)
    }

    #[test]
    fn poll_responses_completes_outstanding_vcpu_fault() {
        let (kernel, dispatcher, backend, _pci) = dispatcher();
        let slot = backend
            .ioreqs()
            .start_vcpu(crate::kernel::VcpuId(2), Direction::Read, 0)
            .unwrap();

        let reply = RpcMsg::mmio(slot, Direction::Read, AddressSpace::Global, 4, 0, 0xcafe);
        let id = backend.iobuf().buffer.lend().unwrap();
        backend.iobuf().buffer.write(id, reply);
        backend
            .iobuf()
            .queue(QUEUE_DRVRPC_RESP)
            .enqueue(id)
            .unwrap();

        assert_eq!(dispatcher.poll_responses().unwrap(), 1);
        assert_eq!(kernel.advanced_vcpus(), vec![crate::kernel::VcpuId(2)]);
        assert_eq!(
            kernel.fault_data_writes(),
            vec![(crate::kernel::VcpuId(2), 0xcafe)]
        );
    }

    #[test]
    fn poll_events_routes_set_irq() {
        let (kernel, dispatcher, backend, _pci) = dispatcher();
        let mut msg = RpcMsg::with_opcode(Opcode::SetIrq);
        msg.mr1 = 30;
        msg.mr2 = 1;
        let id = backend.iobuf().buffer.lend().unwrap();
        backend.iobuf().buffer.write(id, msg);
        backend.iobuf().queue(QUEUE_DEVEVT).enqueue(id).unwrap();

        assert_eq!(dispatcher.poll_events().unwrap(), 1);
        assert_eq!(kernel.irq_events(), vec![(30, true)]);
    }

    #[test]
    fn poll_events_reports_unknown_opcode() {
        let (_kernel, dispatcher, backend, _pci) = dispatcher();
        let msg = RpcMsg::with_opcode(Opcode::Unknown(250));
        let id = backend.iobuf().buffer.lend().unwrap();
        backend.iobuf().buffer.write(id, msg);
        backend.iobuf().queue(QUEUE_DEVEVT).enqueue(id).unwrap();

        assert!(matches!(
            dispatcher.poll_events(),
            Err(ProxyError::UnknownOp(250))
        ));
    }

    #[test]
    fn register_pci_dev_assigns_a_slot_and_publishes_a_node() {
        let (_kernel, dispatcher, backend, pci) = dispatcher();
        let mut msg = RpcMsg::with_opcode(Opcode::RegisterPciDev);
        msg.mr1 = 5; // backend devfn
        let id = backend.iobuf().buffer.lend().unwrap();
        backend.iobuf().buffer.write(id, msg);
        backend.iobuf().queue(QUEUE_DEVEVT).enqueue(id).unwrap();

        assert_eq!(dispatcher.poll_events().unwrap(), 1);

        // First free slot is 1 (slot 0 is the bridge).
        let guest_devfn = 1u8 << 3;
        let record = pci.find(guest_devfn).expect("device registered on slot 1");
        assert_eq!(record.backend_devfn, 5);

        assert_eq!(
            pci.config_access(guest_devfn, 0x3d, 1, None).unwrap(),
            record.intx_pin() as u64 + 1
        );
    }

    #[test]
    fn set_irq_in_pci_range_raises_the_registered_devices_intx_line() {
        let (kernel, dispatcher, backend, pci) = dispatcher();
        let proxy = Arc::clone(&backend);
        pci.register_backend(5, proxy).unwrap();

        let mut msg = RpcMsg::with_opcode(Opcode::SetIrq);
        msg.mr1 = 5; // backend devfn, within [0, PCI_NUM_SLOTS)
        msg.mr2 = 1; // IrqEvent::Set
        let id = backend.iobuf().buffer.lend().unwrap();
        backend.iobuf().buffer.write(id, msg);
        backend.iobuf().queue(QUEUE_DEVEVT).enqueue(id).unwrap();

        assert_eq!(dispatcher.poll_events().unwrap(), 1);
        // Slot 1, pin (1 % 4) = 1 -> guest irq base(77) + 1 = 78.
        assert_eq!(kernel.irq_events(), vec![(78, true)]);
    }

    #[test]
    fn publish_data_window_is_a_noop_without_one() {
        let (_kernel, dispatcher, _backend, _pci) = dispatcher();
        assert_eq!(
            dispatcher.publish_data_window("virtio-mem", "tii,shared-mem").unwrap(),
            None
        );
    }

    #[test]
    fn publish_data_window_emits_a_reserved_memory_node() {
        let (_kernel, dispatcher, backend, _pci) = dispatcher();
        backend.set_data_window(0x5000_0000, 0x1000);

        let phandle = dispatcher
            .publish_data_window("virtio-mem", "tii,shared-mem")
            .unwrap()
            .expect("data window was set");
        assert_eq!(phandle, 6); // MockDeviceTree::new(1, 5) -> max_phandle 5
    }

    #[test]
    fn mmio_on_event_queue_is_a_protocol_violation() {
        let (_kernel, dispatcher, backend, _pci) = dispatcher();
        let msg = RpcMsg::mmio(0, Direction::Read, AddressSpace::Global, 4, 0, 0);
        let id = backend.iobuf().buffer.lend().unwrap();
        backend.iobuf().buffer.write(id, msg);
        backend.iobuf().queue(QUEUE_DEVEVT).enqueue(id).unwrap();

        assert!(matches!(
            dispatcher.poll_events(),
            Err(ProxyError::ProtocolViolation(_))
        ));
    }
}
