use log::debug;
use modular_bitfield::prelude::*;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use textwrap::indent;

use crate::cpuid::{CpuSnapshot, VendorMask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CacheKind {
    Data = 1,
    Instruction = 2,
    Unified = 3,
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CacheKind::Data => "data cache",
            CacheKind::Instruction => "instruction cache",
            CacheKind::Unified => "unified cache",
        };
        write!(f, "{}", name)
    }
}

#[bitfield(bits = 8)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheFlags {
    pub fully_associative: bool,
    pub direct_mapped: bool,
    pub complex_addressed: bool,
    pub self_initializing: bool,
    pub invalidates_lower_levels: bool,
    pub inclusive: bool,
    #[skip]
    __: B2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One cache as described by the deterministic cache leaves.
pub struct Cache {
    pub level: u32,
    pub kind: CacheKind,
    pub ways: u32,
    pub sets: u32,
    pub line_size: u32,
    pub line_partitions: u32,
    pub total_size: u32,
    pub flags: CacheFlags,

    /// Maximum number of APIC ids sharing this cache, minus one, as the
    /// leaf reports it.
    pub sharing_mask: u32,
}

impl Cache {
    /// APIC-id shift above which two logical CPUs share this cache.
    pub fn sharing_shift(&self) -> u32 {
        index_width(self.sharing_mask + 1)
    }
}

impl Ord for Cache {
    fn cmp(&self, other: &Self) -> Ordering {
        self.level
            .cmp(&other.level)
            .then(self.kind.cmp(&other.kind))
            .then(self.total_size.cmp(&other.total_size))
    }
}

impl PartialOrd for Cache {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Cache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "L{} {}: {}, {} bytes ({} ways, {} sets, {}-byte lines, {} shared ids)",
            self.level,
            self.kind,
            if self.flags.fully_associative() {
                "fully associative"
            } else if self.flags.direct_mapped() {
                "direct-mapped"
            } else {
                "set associative"
            },
            self.total_size,
            self.ways,
            self.sets,
            self.line_size,
            self.sharing_mask + 1,
        )
    }
}

#[derive(Debug)]
pub struct CacheVec(pub Vec<Cache>);

impl fmt::Display for CacheVec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Caches:")?;
        for cache in &self.0 {
            let formatted = format!("{}\n", cache);
            write!(f, "{}", indent(&formatted, "  "))?;
        }
        Ok(())
    }
}

#[bitfield(bits = 32)]
struct CacheLeafEax {
    kind: B5,
    level: B3,
    self_initializing: bool,
    fully_associative: bool,
    #[skip]
    __: B4,
    threads_sharing: B12,
    #[skip]
    __: B6,
}

#[bitfield(bits = 32)]
struct CacheLeafEbx {
    line_size: B12,
    partitions: B10,
    ways: B10,
}

#[bitfield(bits = 32)]
struct CacheLeafEdx {
    wbinvd_not_inclusive: bool,
    inclusive: bool,
    complex_addressed: bool,
    #[skip]
    __: B29,
}

/// Decode the deterministic cache descriptions for one snapshot: leaf 4
/// on Intel-compatible parts, leaf 0x8000_001D where AMD publishes its
/// cache properties. Results are sorted by level, kind, size.
pub fn describe_caches(snapshot: &CpuSnapshot) -> CacheVec {
    let mut caches: Vec<Cache> = vec![];

    let leaf = if snapshot.vendor.contains(VendorMask::AMD) {
        0x8000_001D
    } else {
        0x0000_0004
    };

    if let Some(subleaves) = snapshot.get(leaf) {
        for (subleaf, regs) in subleaves {
            let eax = CacheLeafEax::from_bytes(regs.eax.to_le_bytes());
            let kind = match eax.kind() {
                1 => CacheKind::Data,
                2 => CacheKind::Instruction,
                3 => CacheKind::Unified,
                _ => continue,
            };
            let ebx = CacheLeafEbx::from_bytes(regs.ebx.to_le_bytes());
            let edx = CacheLeafEdx::from_bytes(regs.edx.to_le_bytes());

            let ways = u32::from(ebx.ways()) + 1;
            let partitions = u32::from(ebx.partitions()) + 1;
            let line_size = u32::from(ebx.line_size()) + 1;
            let sets = regs.ecx + 1;

            let flags = CacheFlags::new()
                .with_fully_associative(eax.fully_associative())
                .with_direct_mapped(ways == 1)
                .with_complex_addressed(edx.complex_addressed())
                .with_self_initializing(eax.self_initializing())
                .with_invalidates_lower_levels(!edx.wbinvd_not_inclusive())
                .with_inclusive(edx.inclusive());

            debug!("cache leaf 0x{:08x} subleaf {}: {:x?}", leaf, subleaf, regs);
            caches.push(Cache {
                level: u32::from(eax.level()),
                kind,
                ways,
                sets,
                line_size,
                line_partitions: partitions,
                total_size: ways * partitions * line_size * sets,
                flags,
                sharing_mask: u32::from(eax.threads_sharing()),
            });
        }
    }

    caches.sort();
    CacheVec(caches)
}

#[bitfield(bits = 32)]
struct TopologyLevelEax {
    shift: B5,
    #[skip]
    __: B27,
}

#[bitfield(bits = 32)]
struct TopologyLevelEcx {
    level_number: B8,
    level_kind: B8,
    #[skip]
    __: B16,
}

const LEVEL_KIND_SMT: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One logical processor's position in the package/core/thread tree,
/// plus the caches it can reach. Cache membership is carried as indices
/// into `Topology::all_caches`.
pub struct LogicalCore {
    pub full_apic_id: u32,
    pub package_id: u32,
    pub physical_core_id: u32,
    pub logical_core_id: u32,
    pub non_shared_cache_ids: Vec<usize>,
    pub shared_cache_ids: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct PhysicalCore {
    /// logical core id → index into `Topology::all_cores`.
    pub logical_cores: BTreeMap<u32, usize>,
}

#[derive(Debug, Default)]
pub struct Package {
    pub physical_cores: BTreeMap<u32, PhysicalCore>,
}

#[derive(Debug, Default)]
/// The reconstructed machine: flat cache and core tables plus a strict
/// package→core→thread tree of indices.
pub struct Topology {
    pub logical_mask_width: u32,
    pub physical_mask_width: u32,
    pub apic_ids: Vec<u32>,
    pub all_caches: Vec<Cache>,
    pub all_cores: Vec<LogicalCore>,
    pub packages: BTreeMap<u32, Package>,
}

fn index_width(count: u32) -> u32 {
    count.max(1).next_power_of_two().trailing_zeros()
}

fn mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

/// APIC-id partition widths for one snapshot. Leaf 0x1F is the v2
/// enumeration and wins when present; 0x0B is the original x2APIC
/// enumeration; the fallback derives a package width from leaf 1 and
/// extended leaf 0x8000_0008.
fn mask_widths(snapshot: &CpuSnapshot) -> (u32, u32) {
    for leaf in &[0x0000_001F, 0x0000_000B] {
        let subleaves = match snapshot.get(*leaf) {
            Some(subleaves) => subleaves,
            None => continue,
        };
        let mut smt_shift = 0u32;
        let mut core_shift = 0u32;
        let mut reported = false;
        for regs in subleaves.values() {
            let eax = TopologyLevelEax::from_bytes(regs.eax.to_le_bytes());
            let ecx = TopologyLevelEcx::from_bytes(regs.ecx.to_le_bytes());
            if ecx.level_kind() == 0 {
                continue;
            }
            reported = true;
            if ecx.level_kind() == LEVEL_KIND_SMT {
                smt_shift = u32::from(eax.shift());
            } else {
                // Core, module, tile and die levels all fold into the
                // physical width; the widest one borders the package bits.
                core_shift = core_shift.max(u32::from(eax.shift()));
            }
        }
        if reported {
            return (smt_shift, core_shift.max(smt_shift));
        }
    }

    // Pre-x2APIC fallback: package size from 0x8000_0008 ecx[7:0] + 1.
    let package_size = snapshot
        .get_subleaf(0x8000_0008, 0)
        .map(|regs| (regs.ecx & 0xFF) + 1)
        .unwrap_or(1);
    (0, index_width(package_size))
}

/// Rebuild the machine topology from a set of snapshots. Thread, core
/// and package ids are slices of each APIC id; caches deduplicate by
/// description and attach to cores through their sharing shift.
pub fn build_topology(cpus: &BTreeMap<u32, CpuSnapshot>) -> Topology {
    let mut topology = Topology::default();
    let first = match cpus.values().next() {
        Some(first) => first,
        None => return topology,
    };

    let (smt_shift, core_shift) = mask_widths(first);
    topology.logical_mask_width = smt_shift;
    topology.physical_mask_width = core_shift;
    topology.all_caches = describe_caches(first).0;
    topology.apic_ids = cpus.keys().copied().collect();

    let apic_ids = topology.apic_ids.clone();
    for (apic_id, _snapshot) in cpus {
        let apic_id = *apic_id;
        let mut shared = vec![];
        let mut non_shared = vec![];
        for (index, cache) in topology.all_caches.iter().enumerate() {
            let shift = cache.sharing_shift();
            let members = apic_ids
                .iter()
                .filter(|other| **other >> shift == apic_id >> shift)
                .count();
            if members > 1 {
                shared.push(index);
            } else {
                non_shared.push(index);
            }
        }

        let core = LogicalCore {
            full_apic_id: apic_id,
            package_id: apic_id >> core_shift,
            physical_core_id: (apic_id >> smt_shift) & mask(core_shift - smt_shift),
            logical_core_id: apic_id & mask(smt_shift),
            non_shared_cache_ids: non_shared,
            shared_cache_ids: shared,
        };

        let index = topology.all_cores.len();
        topology
            .packages
            .entry(core.package_id)
            .or_default()
            .physical_cores
            .entry(core.physical_core_id)
            .or_default()
            .logical_cores
            .insert(core.logical_core_id, index);
        topology.all_cores.push(core);
    }

    topology
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Topology:")?;
        writeln!(
            f,
            "  logical mask width {}, physical mask width {}",
            self.logical_mask_width, self.physical_mask_width
        )?;
        for (package_id, package) in &self.packages {
            writeln!(f, "  package {}", package_id)?;
            for (core_id, physical_core) in &package.physical_cores {
                writeln!(f, "    physical core {}", core_id)?;
                for (thread_id, index) in &physical_core.logical_cores {
                    let core = &self.all_cores[*index];
                    writeln!(
                        f,
                        "      thread {} (apic id 0x{:x}, {} shared / {} private caches)",
                        thread_id,
                        core.full_apic_id,
                        core.shared_cache_ids.len(),
                        core.non_shared_cache_ids.len()
                    )?;
                }
            }
        }
        for cache in &self.all_caches {
            let formatted = format!("{}\n", cache);
            write!(f, "{}", indent(&formatted, "  "))?;
        }
        Ok(())
    }
}
