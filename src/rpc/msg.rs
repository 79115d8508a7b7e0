// SPDX-License-Identifier: Apache-2.0

//! `rpcmsg_t`: the four-word message that crosses the shared-memory
//! mailbox between the proxy and the device-side emulator.
//!
//! `mr0` carries a 6-bit opcode in bits 0..5 and, for MMIO requests, a
//! further set of bit fields (slot / direction / address-space / length)
//! laid out exactly as `original_source/include/sel4/rpc.h` packs them,
//! so a wire capture from either implementation means the same thing.

/// Number of bits the opcode field occupies in `mr0` (`RPC_MR0_OP_WIDTH`).
const OPCODE_WIDTH: u32 = 6;
/// Number of bits the MMIO slot field occupies in `mr0`.
const MMIO_SLOT_WIDTH: u32 = 6;
const DIRECTION_WIDTH: u32 = 1;
const ADDR_SPACE_WIDTH: u32 = 8;
const LENGTH_WIDTH: u32 = 4;

const MMIO_SLOT_SHIFT: u32 = 6;
const DIRECTION_SHIFT: u32 = MMIO_SLOT_SHIFT + MMIO_SLOT_WIDTH;
const ADDR_SPACE_SHIFT: u32 = DIRECTION_SHIFT + DIRECTION_WIDTH;
const LENGTH_SHIFT: u32 = ADDR_SPACE_SHIFT + ADDR_SPACE_WIDTH;

fn mask(width: u32) -> u64 {
    (1u64 << width) - 1
}

/// Address space selector for an MMIO request: either the flat global
/// guest-physical space, or a given PCI device's config space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    Global,
    PciDevice(u8),
}

impl AddressSpace {
    const GLOBAL: u8 = 0xFF;

    fn encode(self) -> u8 {
        match self {
            AddressSpace::Global => Self::GLOBAL,
            AddressSpace::PciDevice(n) => n,
        }
    }

    fn decode(raw: u8) -> Self {
        if raw == Self::GLOBAL {
            AddressSpace::Global
        } else {
            AddressSpace::PciDevice(raw)
        }
    }
}

/// Direction of an MMIO access as seen by the trapping vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// The RPC opcodes the dispatcher understands, matching
/// `original_source/include/sel4/rpc.h`'s `QEMU_OP_*` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Mmio,
    PutcLog,
    SetIrq,
    /// Legacy equivalent of `SetIrq` with `mr2 = IrqEvent::Clear`, kept
    /// for backend images predating the `mr2`-encoded clear/set/pulse
    /// scheme (spec §6).
    ClrIrq,
    StartVm,
    RegisterPciDev,
    MmioRegionConfig,
    Unknown(u32),
}

impl Opcode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Opcode::Mmio,
            2 => Opcode::PutcLog,
            16 => Opcode::SetIrq,
            17 => Opcode::ClrIrq,
            18 => Opcode::StartVm,
            19 => Opcode::RegisterPciDev,
            20 => Opcode::MmioRegionConfig,
            other => Opcode::Unknown(other),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Opcode::Mmio => 0,
            Opcode::PutcLog => 2,
            Opcode::SetIrq => 16,
            Opcode::ClrIrq => 17,
            Opcode::StartVm => 18,
            Opcode::RegisterPciDev => 19,
            Opcode::MmioRegionConfig => 20,
            Opcode::Unknown(raw) => raw,
        }
    }
}

/// The three `mr2` values a `SET_IRQ` event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    Clear,
    Set,
    Pulse,
}

impl IrqEvent {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            0 => IrqEvent::Clear,
            2 => IrqEvent::Pulse,
            _ => IrqEvent::Set,
        }
    }
}

/// The four machine words exchanged over the mailbox. Interpretation of
/// `mr1..mr3` depends on the opcode carried in `mr0`; MMIO requests carry
/// the faulting address in `mr1` and the read/write value in `mr2`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcMsg {
    pub mr0: u64,
    pub mr1: u64,
    pub mr2: u64,
    pub mr3: u64,
}

impl RpcMsg {
    pub fn opcode(&self) -> Opcode {
        Opcode::from_raw((self.mr0 & mask(OPCODE_WIDTH)) as u32)
    }

    pub fn with_opcode(opcode: Opcode) -> Self {
        RpcMsg {
            mr0: opcode.to_raw() as u64,
            ..Default::default()
        }
    }

    /// Build the `mr0` word for an MMIO request/reply.
    #[allow(clippy::too_many_arguments)]
    pub fn mmio(
        slot: u32,
        direction: Direction,
        addr_space: AddressSpace,
        len: u8,
        addr: u64,
        value: u64,
    ) -> Self {
        let mut mr0 = Opcode::Mmio.to_raw() as u64;
        mr0 |= ((slot as u64) & mask(MMIO_SLOT_WIDTH)) << MMIO_SLOT_SHIFT;
        mr0 |= (matches!(direction, Direction::Write) as u64) << DIRECTION_SHIFT;
        mr0 |= ((addr_space.encode() as u64) & mask(ADDR_SPACE_WIDTH)) << ADDR_SPACE_SHIFT;
        mr0 |= ((len as u64) & mask(LENGTH_WIDTH)) << LENGTH_SHIFT;

        RpcMsg {
            mr0,
            mr1: addr,
            mr2: value,
            mr3: 0,
        }
    }

    pub fn mmio_slot(&self) -> u32 {
        ((self.mr0 >> MMIO_SLOT_SHIFT) & mask(MMIO_SLOT_WIDTH)) as u32
    }

    pub fn mmio_direction(&self) -> Direction {
        if (self.mr0 >> DIRECTION_SHIFT) & 1 == 1 {
            Direction::Write
        } else {
            Direction::Read
        }
    }

    pub fn mmio_address_space(&self) -> AddressSpace {
        AddressSpace::decode(((self.mr0 >> ADDR_SPACE_SHIFT) & mask(ADDR_SPACE_WIDTH)) as u8)
    }

    pub fn mmio_len(&self) -> u8 {
        ((self.mr0 >> LENGTH_SHIFT) & mask(LENGTH_WIDTH)) as u8
    }

    pub fn mmio_addr(&self) -> u64 {
        self.mr1
    }

    pub fn mmio_value(&self) -> u64 {
        self.mr2
    }
}
