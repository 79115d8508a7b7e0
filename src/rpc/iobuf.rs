// SPDX-License-Identifier: Apache-2.0

//! Layout of the shared iobuf region carved up between the proxy and a
//! device-side backend: one message-cell buffer plus the four logical
//! queues named in `original_source/include/sel4/rpc.h`.

use crate::rpc::buffer::RpcMsgBuffer;
use crate::rpc::queue::RpcQueue;

/// Queue carrying driver-initiated requests to the backend.
pub const QUEUE_DRVRPC_REQ: usize = 0;
/// Queue carrying requests forwarded from the kernel straight to the
/// device side (not used by any handler in this proxy yet, but present
/// in the wire layout so a future forwarding path has somewhere to go).
pub const QUEUE_DRVRPC_REQ_DEV: usize = 1;
/// Queue carrying backend replies to driver-initiated requests.
pub const QUEUE_DRVRPC_RESP: usize = 2;
/// Queue carrying unsolicited device-side events (e.g. `SET_IRQ`).
pub const QUEUE_DEVEVT: usize = 3;

const NUM_QUEUES: usize = 4;

/// Number of 4KiB pages the control-plane half of an iobuf occupies.
pub const IOBUF_NUM_PAGES: usize = 2;

/// One backend's shared-memory control structure: a pool of message
/// cells and the four logical queues built on top of it.
pub struct IoBuf {
    pub buffer: RpcMsgBuffer,
    queues: [RpcQueue<u32>; NUM_QUEUES],
}

impl IoBuf {
    pub fn new() -> Self {
        IoBuf {
            buffer: RpcMsgBuffer::new(),
            queues: [
                RpcQueue::new(),
                RpcQueue::new(),
                RpcQueue::new(),
                RpcQueue::new(),
            ],
        }
    }

    pub fn queue(&self, id: usize) -> &RpcQueue<u32> {
        &self.queues[id]
    }
}

impl Default for IoBuf {
    fn default() -> Self {
        Self::new()
    }
}
