// SPDX-License-Identifier: Apache-2.0

//! Wires a backend's doorbell notifications into an `event-manager`
//! event loop, the same mechanism the teacher uses to dispatch virtio
//! queue-notification events: an `EventFd` is registered with the
//! `EventManager`, and this subscriber's `process` method runs whenever
//! it's signalled.
//!
//! In production the doorbell is a microkernel notification (an IPC
//! endpoint the device-side emulator's thread signals), not a Linux
//! eventfd; [`DoorbellSubscriber`] is written against the `EventFd`
//! abstraction because that's the shape `event-manager`'s `EventOps`
//! needs regardless of what ultimately backs it, and a seL4 notification
//! can be bridged to one the same way an irqfd bridges a KVM interrupt
//! to the teacher's event loop.

use std::os::unix::io::AsRawFd;

use event_manager::{EventOps, Events, MutEventSubscriber};
use log::error;
use vmm_sys_util::eventfd::EventFd;

use crate::dispatch::Dispatcher;

/// Subscriber that drains a backend's response and event queues every
/// time its doorbell fires.
pub struct DoorbellSubscriber {
    doorbell: EventFd,
    dispatcher: Dispatcher,
}

impl DoorbellSubscriber {
    pub fn new(doorbell: EventFd, dispatcher: Dispatcher) -> Self {
        DoorbellSubscriber {
            doorbell,
            dispatcher,
        }
    }
}

/// Create the non-blocking `EventFd` a doorbell bridge signals, the same
/// flag the teacher passes when it creates an irqfd
/// (`CommonConfig::new`'s `EventFd::new(EFD_NONBLOCK)`): the subscriber
/// only ever drains the counter after being woken, never blocks on it.
pub fn new_doorbell_eventfd() -> std::io::Result<EventFd> {
    EventFd::new(libc::EFD_NONBLOCK)
}

impl MutEventSubscriber for DoorbellSubscriber {
    fn process(&mut self, events: Events, ops: &mut EventOps) {
        if events.data() != self.doorbell.as_raw_fd() as u32 {
            return;
        }

        // Level-triggered eventfds stay readable until drained; read the
        // counter back down so we don't busy-loop on the next poll.
        let _ = self.doorbell.read();

        if let Err(err) = self.dispatcher.poll_responses() {
            error!("error draining rpc response queue: {}", err);
        }
        if let Err(err) = self.dispatcher.poll_events() {
            error!("error draining rpc device-event queue: {}", err);
        }

        // Re-arm for the next doorbell ring.
        if let Err(err) = ops.remove(events) {
            error!("failed to remove doorbell event registration: {:?}", err);
        }
        if let Err(err) = ops.add(Events::new(&self.doorbell, event_manager::EventSet::IN)) {
            error!("failed to re-register doorbell event: {:?}", err);
        }
    }

    fn init(&mut self, ops: &mut EventOps) {
        if let Err(err) = ops.add(Events::new(&self.doorbell, event_manager::EventSet::IN)) {
            error!("failed to register doorbell event: {:?}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_eventfd_is_nonblocking() {
        let fd = new_doorbell_eventfd().unwrap();
        fd.write(1).unwrap();
        assert_eq!(fd.read().unwrap(), 1);
    }
}
