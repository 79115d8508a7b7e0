// SPDX-License-Identifier: Apache-2.0

//! Device-tree integration: emitting `/reserved-memory` and `/pci`
//! subnodes for devices this proxy registers, with phandle assignment.
//! Ported from `original_source/src/fdt.c`.
//!
//! The actual tree-mutation primitives (`fdt_path_offset`,
//! `fdt_add_subnode`, `fdt_appendprop*`) are an external collaborator
//! here, not something this crate implements — see [`DeviceTree`]. The
//! production implementation, [`host::FdtTree`], sits on top of the
//! rust-vmm `vm-fdt` builder crate, the same role `libfdt` plays in
//! `original_source/`. `vm-fdt` only builds a blob from scratch (no
//! `fdt_path_offset`-style in-place mutation), so [`host::FdtTree`]
//! keeps its own node list and serialises the whole tree on
//! [`host::FdtTree::to_bytes`] rather than mutating a live blob per
//! call. The static `SECTION("_fdt_node")`-based node
//! registration/filtering machinery in `fdt.c` is a C linker trick with
//! no Rust equivalent worth keeping; callers just call
//! [`DeviceTree::generate_reserved_node`]/[`DeviceTree::generate_pci_node`]
//! directly when they register a device.

use crate::error::{ProxyError, Result};

/// Narrow interface onto device-tree mutation. Implementations own the
/// actual `fdt` blob; this crate only ever asks for the two node shapes
/// the proxy needs to publish.
pub trait DeviceTree: Send + Sync {
    /// Look up (or fail) the phandle of an existing `/memory` region
    /// that a reserved-memory node should reference.
    fn memory_phandle(&self) -> Result<u32>;

    /// Highest phandle currently in use anywhere in the tree, so a new
    /// node can be assigned `max + 1`.
    fn max_phandle(&self) -> u32;

    /// Create `/reserved-memory/<prefix>@<base>` with `compatible`,
    /// `reg = <base size>` and the given phandle, plus a companion
    /// `/memory` sanity-check subnode covering the same range (mirrors
    /// `fdt_generate_reserved_node`'s paired call to
    /// `fdt_generate_memory_node`).
    fn generate_reserved_node(
        &mut self,
        prefix: &str,
        compatible: &str,
        base: u64,
        size: u64,
        phandle: u32,
    ) -> Result<()>;

    /// Create `/pci/<prefix>@<slot>,<func>` with the five-cell `reg`
    /// property PCI device nodes use, `phys.hi = (devfn & 0xff) << 8`.
    fn generate_pci_node(&mut self, prefix: &str, devfn: u8) -> Result<()>;

    /// Look up the phandle of a previously generated
    /// `/reserved-memory/<prefix>@<base>` node, the way
    /// `fdt_reserved_memory_phandle` does, so a PCI node can append a
    /// `memory-region` property linking back to it. `BadArgument` when
    /// no such node exists.
    fn reserved_memory_phandle(&self, prefix: &str, base: u64) -> Result<u32>;
}

/// Assigns the next free phandle for a new node, the way
/// `fdt_assign_phandle` does: `max_phandle() + 1`, rejecting the
/// maximum `u32` value since `0xffffffff` is reserved by the device-tree
/// spec to mean "no phandle".
pub fn assign_phandle(tree: &dyn DeviceTree) -> Result<u32> {
    let next = tree
        .max_phandle()
        .checked_add(1)
        .ok_or(ProxyError::ResourceExhausted("phandle space exhausted"))?;
    if next == u32::MAX {
        return Err(ProxyError::ResourceExhausted("phandle space exhausted"));
    }
    Ok(next)
}

/// Publish a reserved-memory node for a newly mapped shared-memory
/// region, returning the phandle it was assigned.
pub fn publish_reserved_memory(
    tree: &mut dyn DeviceTree,
    prefix: &str,
    compatible: &str,
    base: u64,
    size: u64,
) -> Result<u32> {
    let phandle = assign_phandle(tree)?;
    tree.generate_reserved_node(prefix, compatible, base, size, phandle)?;
    Ok(phandle)
}

/// Publish a PCI device node for a newly registered backend device.
pub fn publish_pci_device(tree: &mut dyn DeviceTree, prefix: &str, devfn: u8) -> Result<()> {
    tree.generate_pci_node(prefix, devfn)
}

/// Compute the quintet-style `reg` phys.hi cell used by
/// `fdt_generate_pci_node`: `(devfn & 0xff) << 8`.
pub fn pci_phys_hi(devfn: u8) -> u32 {
    (devfn as u32) << 8
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ReservedNode {
        pub prefix: String,
        pub compatible: String,
        pub base: u64,
        pub size: u64,
        pub phandle: u32,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PciNode {
        pub prefix: String,
        pub devfn: u8,
    }

    /// The `/memory@<base>` sanity-check node paired with every
    /// reserved-memory node, covering the same `[base, base+size)` range.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MemoryNode {
        pub base: u64,
        pub size: u64,
    }

    /// In-memory [`DeviceTree`] recording every node it was asked to
    /// create, for use in tests and the smoke-test harness.
    #[derive(Default)]
    pub struct MockDeviceTree {
        pub memory_phandle: u32,
        pub max_phandle: u32,
        pub reserved_nodes: Vec<ReservedNode>,
        pub memory_nodes: Vec<MemoryNode>,
        pub pci_nodes: Vec<PciNode>,
    }

    impl MockDeviceTree {
        pub fn new(memory_phandle: u32, max_phandle: u32) -> Self {
            MockDeviceTree {
                memory_phandle,
                max_phandle,
                ..Default::default()
            }
        }
    }

    impl DeviceTree for MockDeviceTree {
        fn memory_phandle(&self) -> Result<u32> {
            Ok(self.memory_phandle)
        }

        fn max_phandle(&self) -> u32 {
            self.max_phandle
        }

        fn generate_reserved_node(
            &mut self,
            prefix: &str,
            compatible: &str,
            base: u64,
            size: u64,
            phandle: u32,
        ) -> Result<()> {
            self.max_phandle = self.max_phandle.max(phandle);
            self.reserved_nodes.push(ReservedNode {
                prefix: prefix.to_string(),
                compatible: compatible.to_string(),
                base,
                size,
                phandle,
            });
            self.memory_nodes.push(MemoryNode { base, size });
            Ok(())
        }

        fn generate_pci_node(&mut self, prefix: &str, devfn: u8) -> Result<()> {
            self.pci_nodes.push(PciNode {
                prefix: prefix.to_string(),
                devfn,
            });
            Ok(())
        }

        fn reserved_memory_phandle(&self, prefix: &str, base: u64) -> Result<u32> {
            self.reserved_nodes
                .iter()
                .find(|n| n.prefix == prefix && n.base == base)
                .map(|n| n.phandle)
                .ok_or(ProxyError::BadArgument(
                    "no reserved-memory node with this name",
                ))
        }
    }
}

/// Production [`DeviceTree`] built on the rust-vmm `vm-fdt` crate.
///
/// `vm-fdt`'s `FdtWriter` only ever serialises a tree once, top to
/// bottom, so this keeps its own node lists and defers actually
/// invoking the writer to [`FdtTree::to_bytes`], called once the guest
/// image is finalised (mirroring the point at which
/// `original_source/src/fdt.c`'s node-generation pass runs over the
/// base DTB it was handed).
pub mod host {
    use std::collections::BTreeMap;

    use vm_fdt::{FdtWriter, FdtWriterResult};

    use super::*;

    #[derive(Clone)]
    struct ReservedMemNode {
        compatible: String,
        base: u64,
        size: u64,
        phandle: u32,
    }

    /// A companion `/memory@<base>` sanity-check node, one per reserved
    /// node, covering the same `[base, base+size)` range.
    #[derive(Clone)]
    struct MemoryNode {
        base: u64,
        size: u64,
    }

    /// Builds the `/reserved-memory` and `/pci` subtrees this proxy
    /// publishes on top of a base guest device tree supplied by the
    /// surrounding VMM (the part of the tree this crate has no opinion
    /// about: CPUs, root memory node, interrupt controller, ...).
    pub struct FdtTree {
        memory_phandle: u32,
        max_phandle: u32,
        address_cells: u32,
        size_cells: u32,
        reserved: BTreeMap<String, ReservedMemNode>,
        memory: BTreeMap<String, MemoryNode>,
        pci: Vec<(String, u8)>,
    }

    impl FdtTree {
        /// `memory_phandle` is the phandle of the base tree's existing
        /// `/memory` node; `max_phandle` is the highest phandle already
        /// in use anywhere in the base tree.
        pub fn new(memory_phandle: u32, max_phandle: u32) -> Self {
            FdtTree {
                memory_phandle,
                max_phandle,
                address_cells: 2,
                size_cells: 2,
                reserved: BTreeMap::new(),
                memory: BTreeMap::new(),
                pci: Vec::new(),
            }
        }

        fn node_name(prefix: &str, base: u64) -> String {
            format!("{}@{:x}", prefix, base)
        }

        fn memory_node_name(base: u64) -> String {
            format!("memory@{:x}", base)
        }

        fn pci_node_name(prefix: &str, devfn: u8) -> String {
            format!("{}@{},{}", prefix, devfn >> 3, devfn & 7)
        }

        /// Serialise just the `/reserved-memory` and `/pci` subtrees
        /// this proxy owns, standalone, for embedding or inspection.
        /// A full-image build additionally needs the root tree's other
        /// nodes (`/cpus`, `/memory`, the interrupt controller, ...),
        /// which are outside this crate's remit.
        pub fn to_bytes(&self) -> FdtWriterResult<Vec<u8>> {
            let mut fdt = FdtWriter::new()?;
            let root = fdt.begin_node("")?;
            fdt.property_u32("#address-cells", self.address_cells)?;
            fdt.property_u32("#size-cells", self.size_cells)?;

            let reserved_root = fdt.begin_node("reserved-memory")?;
            fdt.property_u32("#address-cells", self.address_cells)?;
            fdt.property_u32("#size-cells", self.size_cells)?;
            fdt.property_u32("ranges", 0)?;
            for (name, node) in self.reserved.iter() {
                let child = fdt.begin_node(name)?;
                fdt.property_string("compatible", &node.compatible)?;
                fdt.property_array_u64("reg", &[node.base, node.size])?;
                fdt.property_u32("phandle", node.phandle)?;
                fdt.end_node(child)?;
            }
            fdt.end_node(reserved_root)?;

            for (name, node) in self.memory.iter() {
                let child = fdt.begin_node(name)?;
                fdt.property_string("device_type", "memory")?;
                fdt.property_array_u64("reg", &[node.base, node.size])?;
                fdt.end_node(child)?;
            }

            let pci_root = fdt.begin_node("pci")?;
            for (name, devfn) in &self.pci {
                let child = fdt.begin_node(name)?;
                let phys_hi = pci_phys_hi(*devfn);
                fdt.property_array_u32("reg", &[phys_hi, 0, 0, 0, 0])?;
                fdt.end_node(child)?;
            }
            fdt.end_node(pci_root)?;

            fdt.end_node(root)?;
            fdt.finish()
        }
    }

    impl DeviceTree for FdtTree {
        fn memory_phandle(&self) -> Result<u32> {
            Ok(self.memory_phandle)
        }

        fn max_phandle(&self) -> u32 {
            self.max_phandle
        }

        fn generate_reserved_node(
            &mut self,
            prefix: &str,
            compatible: &str,
            base: u64,
            size: u64,
            phandle: u32,
        ) -> Result<()> {
            self.max_phandle = self.max_phandle.max(phandle);
            self.reserved.insert(
                Self::node_name(prefix, base),
                ReservedMemNode {
                    compatible: compatible.to_string(),
                    base,
                    size,
                    phandle,
                },
            );
            self.memory
                .insert(Self::memory_node_name(base), MemoryNode { base, size });
            Ok(())
        }

        fn generate_pci_node(&mut self, prefix: &str, devfn: u8) -> Result<()> {
            self.pci.push((Self::pci_node_name(prefix, devfn), devfn));
            Ok(())
        }

        fn reserved_memory_phandle(&self, prefix: &str, base: u64) -> Result<u32> {
            self.reserved
                .get(&Self::node_name(prefix, base))
                .map(|n| n.phandle)
                .ok_or(ProxyError::BadArgument(
                    "no reserved-memory node with this name",
                ))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn reserved_and_pci_nodes_round_trip_into_the_blob() {
            let mut tree = FdtTree::new(1, 5);
            let phandle = publish_reserved_memory(&mut tree, "virtio-mem", "tii,shared-mem", 0x5000_0000, 0x1000)
                .unwrap();
            publish_pci_device(&mut tree, "virtio", 1 << 3).unwrap();

            assert_eq!(tree.reserved_memory_phandle("virtio-mem", 0x5000_0000).unwrap(), phandle);
            assert!(tree.reserved_memory_phandle("virtio-mem", 0x6000_0000).is_err());

            let blob = tree.to_bytes().unwrap();
            assert!(!blob.is_empty());
        }

        #[test]
        fn reserved_node_gets_a_companion_memory_node_in_the_blob() {
            let mut tree = FdtTree::new(1, 5);
            publish_reserved_memory(&mut tree, "virtio-mem", "tii,shared-mem", 0x5000_0000, 0x1000).unwrap();

            assert_eq!(tree.memory.len(), 1);
            let node = tree.memory.get("memory@50000000").expect("companion memory node");
            assert_eq!(node.base, 0x5000_0000);
            assert_eq!(node.size, 0x1000);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDeviceTree;
    use super::*;

    #[test]
    fn phandle_assignment_increments_from_max() {
        let tree = MockDeviceTree::new(1, 5);
        assert_eq!(assign_phandle(&tree).unwrap(), 6);
    }

    #[test]
    fn publish_reserved_memory_records_the_node_and_bumps_max() {
        let mut tree = MockDeviceTree::new(1, 5);
        let phandle = publish_reserved_memory(&mut tree, "virtio-mem", "tii,shared-mem", 0x5000_0000, 0x1000)
            .unwrap();
        assert_eq!(phandle, 6);
        assert_eq!(tree.reserved_nodes[0].base, 0x5000_0000);
        assert_eq!(assign_phandle(&tree).unwrap(), 7);
    }

    #[test]
    fn publish_reserved_memory_also_emits_the_companion_memory_node() {
        let mut tree = MockDeviceTree::new(1, 5);
        publish_reserved_memory(&mut tree, "virtio-mem", "tii,shared-mem", 0x5000_0000, 0x1000).unwrap();
        assert_eq!(tree.memory_nodes.len(), 1);
        assert_eq!(tree.memory_nodes[0].base, 0x5000_0000);
        assert_eq!(tree.memory_nodes[0].size, 0x1000);
    }

    #[test]
    fn pci_phys_hi_shifts_devfn_into_the_upper_byte() {
        assert_eq!(pci_phys_hi(0x08), 0x0800);
    }

    #[test]
    fn reserved_memory_phandle_is_not_found_until_published() {
        let mut tree = MockDeviceTree::new(1, 5);
        assert!(matches!(
            tree.reserved_memory_phandle("virtio-mem", 0x5000_0000),
            Err(ProxyError::BadArgument(_))
        ));

        let phandle =
            publish_reserved_memory(&mut tree, "virtio-mem", "tii,shared-mem", 0x5000_0000, 0x1000).unwrap();
        assert_eq!(
            tree.reserved_memory_phandle("virtio-mem", 0x5000_0000).unwrap(),
            phandle
        );
    }
}
