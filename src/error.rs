// SPDX-License-Identifier: Apache-2.0

//! Crate-wide error type. Each module keeps its own narrow error enum where
//! it helps call sites match on a specific failure; [`ProxyError`] is the
//! type the dispatcher and fault handler actually propagate.

use thiserror::Error;

/// Custom defined [`std::result::Result`], mirroring the per-module
/// `Result` aliases used throughout this crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Failure modes of the RPC proxy, one variant per kind named in the
/// error-handling design.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A producer could not acquire a slot because the ring is full.
    #[error("rpc queue is full")]
    QueueFull,

    /// The ack slot a caller is about to claim is already occupied by an
    /// outstanding request.
    #[error("ioreq slot {0} is already in use")]
    SlotBusy(u32),

    /// The dispatcher read an opcode it has no handler for.
    #[error("unknown rpc opcode {0}")]
    UnknownOp(u32),

    /// A handler rejected a request whose arguments violate its own
    /// invariants (out-of-range address space, zero-length access, ...).
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// The microkernel refused an operation performed on the proxy's
    /// behalf (e.g. `reserve_mmio_region` failed because the range
    /// overlaps guest RAM).
    #[error("kernel rejected request: {0}")]
    KernelReject(String),

    /// A peer violated the wire protocol (malformed message, reply for an
    /// unknown transaction id, reply to an already-completed ack slot).
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A bounded resource (PCI slot, reservation table entry, message
    /// buffer) has no free entries left.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
}

/// Outcome of handling a guest MMIO fault, mirroring the
/// `HANDLED` / `FAULT_UNHANDLED` / `FAULT_ERROR` tri-state used by the
/// dispatcher handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The fault was serviced; the vCPU (or native caller) can proceed.
    Handled,
    /// No handler claimed this fault; try the next one in the chain.
    Unhandled,
    /// The fault cannot be serviced and the VM should be torn down.
    Fatal,
}

impl From<ProxyError> for FaultOutcome {
    fn from(_: ProxyError) -> Self {
        FaultOutcome::Fatal
    }
}
