// SPDX-License-Identifier: Apache-2.0

//! Minimal smoke-test harness wiring the proxy together against a mock
//! microkernel, so the crate's plumbing can be exercised without a real
//! seL4 image. Not a substitute for the CAmkES component that embeds
//! this crate in production; see `DESIGN.md`.

use std::sync::{Arc, Mutex};

use event_manager::{EventManager, MutEventSubscriber, SubscriberOps};
use log::info;

use virtio_proxy_vmm::config::PlatformConfig;
use virtio_proxy_vmm::dispatch::Dispatcher;
use virtio_proxy_vmm::emudev::EmulatedDeviceRegistry;
use virtio_proxy_vmm::fdt::mock::MockDeviceTree;
use virtio_proxy_vmm::io_proxy::{BackendStatus, IoProxyHandle};
use virtio_proxy_vmm::kernel::mock::MockKernel;
use virtio_proxy_vmm::notify::{new_doorbell_eventfd, DoorbellSubscriber};
use virtio_proxy_vmm::pci::PciBus;
use virtio_proxy_vmm::rpc::msg::{Opcode, RpcMsg};

fn main() {
    env_logger::init();

    let platform = PlatformConfig::qemu_arm_virt();
    info!(
        "starting proxy harness for qemu-arm-virt (msi base {:#x}, {} SPIs from {})",
        platform.msi.base, platform.msi.num_irq, platform.msi.irq_base
    );

    let kernel = Arc::new(MockKernel::new());
    let backend = Arc::new(IoProxyHandle::new(0, kernel.clone()));
    let pci = Arc::new(PciBus::new(kernel.clone(), platform.pci_intx_base));
    let emudev = Arc::new(EmulatedDeviceRegistry::new(kernel.clone()));
    let fdt = Arc::new(Mutex::new(MockDeviceTree::new(0, 0)));
    let dispatcher = Dispatcher::new(kernel, Arc::clone(&backend), pci, emudev, fdt);

    backend.notify_status(BackendStatus::Ready);
    info!("backend status: {:?}", dispatcher.backend_status());

    backend.set_data_window(0x5000_0000, 0x10_0000);
    if let Some(phandle) = dispatcher
        .publish_data_window("virtio-mem", "tii,shared-mem")
        .unwrap_or(None)
    {
        info!("published reserved-memory node, phandle {}", phandle);
    }

    // Wire the doorbell into a real event loop, the same plumbing a
    // production embedding uses, and prove a pending device event drains
    // through it rather than only through a direct `poll_events` call.
    let doorbell = new_doorbell_eventfd().expect("failed to create doorbell eventfd");
    let ring = doorbell.try_clone().expect("failed to clone doorbell fd");
    let subscriber: Arc<Mutex<dyn MutEventSubscriber>> =
        Arc::new(Mutex::new(DoorbellSubscriber::new(doorbell, dispatcher)));

    let mut event_mgr: EventManager<Arc<Mutex<dyn MutEventSubscriber>>> =
        EventManager::new().expect("failed to create event manager");
    event_mgr.add_subscriber(subscriber);

    let boot = RpcMsg::with_opcode(Opcode::StartVm);
    let id = backend.iobuf().buffer.lend().expect("message buffer exhausted");
    backend.iobuf().buffer.write(id, boot);
    backend
        .iobuf()
        .queue(virtio_proxy_vmm::rpc::iobuf::QUEUE_DEVEVT)
        .enqueue(id)
        .expect("device-event queue full");
    ring.write(1).expect("failed to ring doorbell");

    let handled = event_mgr.run().expect("event loop iteration failed");
    info!("event loop woke {} subscriber(s) for the pending device event", handled);
}
