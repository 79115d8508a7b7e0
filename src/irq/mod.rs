// SPDX-License-Identifier: Apache-2.0

//! Interrupt emulation primitives, from the simplest edge line up to
//! shared wired-OR lines and MSI frame emulation.

pub mod edge;
pub mod level;
pub mod msi;
pub mod shared;

pub use edge::IrqLine;
pub use level::LevelIrq;
pub use msi::{Gicv2m, PlatformMsiConfig};
pub use shared::SharedIrqLine;
