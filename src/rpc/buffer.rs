// SPDX-License-Identifier: Apache-2.0

//! Message-buffer allocator: a fixed pool of [`RpcMsg`] cells plus a
//! bitmap tracking which are currently lent out, ported from
//! `rpcmsg_lend_buffer`/`rpcmsg_reclaim_buffer` in
//! `original_source/include/sel4/rpc_queue.h`.
//!
//! The ring in [`crate::rpc::queue`] only ever carries cell *indices*;
//! this is the thing that owns the actual [`RpcMsg`] payloads and hands
//! out a transaction-id-bearing cell so out-of-order replies can be
//! matched back to their request.

use std::sync::Mutex;

use crate::error::{ProxyError, Result};
use crate::rpc::msg::RpcMsg;

use super::queue::CAPACITY;

/// Pool of message cells shared between the proxy and the device-side
/// emulator, with a bitmap of which cells are currently lent out.
pub struct RpcMsgBuffer {
    cells: Mutex<[RpcMsg; CAPACITY]>,
    state: Mutex<u64>,
}

impl RpcMsgBuffer {
    pub fn new() -> Self {
        RpcMsgBuffer {
            cells: Mutex::new([RpcMsg::default(); CAPACITY]),
            state: Mutex::new(0),
        }
    }

    /// Find a free cell, mark it lent, and return its index. The index
    /// doubles as the transaction id carried in the request/reply.
    pub fn lend(&self) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        let free = (0..CAPACITY as u32).find(|&bit| state & (1 << bit) == 0);
        match free {
            Some(bit) => {
                *state |= 1 << bit;
                Ok(bit)
            }
            None => Err(ProxyError::ResourceExhausted("message buffer exhausted")),
        }
    }

    /// Mark a previously lent cell as free again.
    pub fn reclaim(&self, id: u32) {
        let mut state = self.state.lock().unwrap();
        *state &= !(1 << id);
    }

    pub fn write(&self, id: u32, msg: RpcMsg) {
        self.cells.lock().unwrap()[id as usize] = msg;
    }

    pub fn read(&self, id: u32) -> RpcMsg {
        self.cells.lock().unwrap()[id as usize]
    }
}

impl Default for RpcMsgBuffer {
    fn default() -> Self {
        Self::new()
    }
}
