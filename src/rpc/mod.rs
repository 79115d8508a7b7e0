// SPDX-License-Identifier: Apache-2.0

//! The on-the-wire RPC protocol: message encoding ([`msg`]), the
//! lock-free ring used to exchange cell indices ([`queue`]), the message
//! cell pool that backs those indices ([`buffer`]), and the shared iobuf
//! layout that ties a pool and its queues together for one backend
//! ([`iobuf`]).

pub mod buffer;
pub mod iobuf;
pub mod msg;
pub mod queue;

pub use msg::{AddressSpace, Direction, Opcode, RpcMsg};
