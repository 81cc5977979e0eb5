use std::collections::BTreeMap;

use cpudiag::cpuid::{CpuSnapshot, LeafMap, Registers};
use cpudiag::topology::{build_topology, describe_caches, CacheKind};

/// Eight logical CPUs: four physical cores with two SMT threads each,
/// one package. SMT shift 1, core shift 3.
fn smt_machine() -> BTreeMap<u32, CpuSnapshot> {
    let mut cpus = BTreeMap::new();
    for apic_id in 0..8u32 {
        let mut leaves = LeafMap::new();
        let mut insert = |leaf: u32, subleaf: u32, regs: Registers| {
            leaves.entry(leaf).or_default().insert(subleaf, regs);
        };
        insert(0x0, 0, Registers::new(0x16, 0x756E_6547, 0x6C65_746E, 0x4965_6E69));
        insert(
            0x1,
            0,
            Registers::new(0x000906EA, apic_id << 24 | 0x0008_0800, 0x7FFA_FBFF, 0xBFEB_FBFF),
        );
        // L1d: shared by 2 apic ids (SMT pair).
        insert(0x4, 0, Registers::new(0x1C00_4121, 0x01C0_003F, 0x3F, 0));
        // L2: shared by 2 apic ids.
        insert(0x4, 1, Registers::new(0x1C00_4143, 0x00C0_003F, 0x3FF, 0));
        // L3: shared by 8 apic ids (the whole package).
        insert(0x4, 2, Registers::new(0x1C01_C163, 0x02C0_003F, 0x1FFF, 0x6));
        // x2APIC levels: SMT shift 1, core shift 3.
        insert(0xB, 0, Registers::new(0x1, 0x2, 0x100, apic_id));
        insert(0xB, 1, Registers::new(0x3, 0x8, 0x201, apic_id));
        cpus.insert(apic_id, CpuSnapshot::from_leaves(apic_id, leaves));
    }
    cpus
}

#[test]
fn apic_partition() {
    let cpus = smt_machine();
    let topology = build_topology(&cpus);

    assert_eq!(topology.logical_mask_width, 1);
    assert_eq!(topology.physical_mask_width, 3);
    assert_eq!(topology.all_cores.len(), 8);

    for core in &topology.all_cores {
        assert_eq!(core.package_id, core.full_apic_id >> 3);
        assert_eq!(core.physical_core_id, (core.full_apic_id >> 1) & 0x3);
        assert_eq!(core.logical_core_id, core.full_apic_id & 0x1);
    }

    // Exactly one package holding four physical cores of two threads.
    assert_eq!(topology.packages.len(), 1);
    let package = &topology.packages[&0];
    assert_eq!(package.physical_cores.len(), 4);
    for physical_core in package.physical_cores.values() {
        assert_eq!(physical_core.logical_cores.len(), 2);
    }
}

#[test]
fn logical_core_count_matches_snapshots() {
    let cpus = smt_machine();
    let topology = build_topology(&cpus);

    let total: usize = topology
        .packages
        .values()
        .flat_map(|package| package.physical_cores.values())
        .map(|core| core.logical_cores.len())
        .sum();
    assert_eq!(total, cpus.len());
}

#[test]
fn cache_sharing_prefixes() {
    let cpus = smt_machine();
    let topology = build_topology(&cpus);

    assert_eq!(topology.all_caches.len(), 3);

    // Every pair of logical cores that shares a cache agrees on the APIC
    // prefix above that cache's sharing shift.
    for (index, cache) in topology.all_caches.iter().enumerate() {
        let shift = cache.sharing_shift();
        let members: Vec<&_> = topology
            .all_cores
            .iter()
            .filter(|core| core.shared_cache_ids.contains(&index))
            .collect();
        for a in &members {
            for b in &members {
                if a.full_apic_id >> shift == b.full_apic_id >> shift {
                    assert_eq!(
                        a.package_id, b.package_id,
                        "cache sharers must sit in one package"
                    );
                }
            }
        }
    }

    // The SMT sibling shares everything; the L3 spans all eight threads.
    let first = &topology.all_cores[0];
    assert_eq!(first.shared_cache_ids.len(), 3);
    assert!(first.non_shared_cache_ids.is_empty());
}

#[test]
fn cache_decode() {
    let cpus = smt_machine();
    let caches = describe_caches(cpus.values().next().unwrap()).0;

    assert_eq!(caches.len(), 3);

    let l1 = &caches[0];
    assert_eq!(l1.level, 1);
    assert_eq!(l1.kind, CacheKind::Data);
    assert_eq!(l1.ways, 8);
    assert_eq!(l1.sets, 64);
    assert_eq!(l1.line_size, 64);
    assert_eq!(l1.total_size, 32 * 1024);
    assert!(l1.flags.self_initializing());
    assert_eq!(l1.sharing_shift(), 1);

    let l3 = &caches[2];
    assert_eq!(l3.level, 3);
    assert_eq!(l3.kind, CacheKind::Unified);
    assert_eq!(l3.sharing_shift(), 3);
    assert!(l3.flags.inclusive());
    assert!(l3.flags.complex_addressed());
}

/// Without extended topology leaves the package width comes from the
/// extended address leaf's core count.
#[test]
fn fallback_widths() {
    let mut cpus = BTreeMap::new();
    for apic_id in 0..4u32 {
        let mut leaves = LeafMap::new();
        let mut insert = |leaf: u32, subleaf: u32, regs: Registers| {
            leaves.entry(leaf).or_default().insert(subleaf, regs);
        };
        insert(0x0, 0, Registers::new(0x1, 0x756E_6547, 0x6C65_746E, 0x4965_6E69));
        insert(0x1, 0, Registers::new(0x0F41, apic_id << 24, 0, 0));
        insert(0x8000_0000, 0, Registers::new(0x8000_0008, 0, 0, 0));
        // ecx[7:0] = 3 means four logical CPUs per package.
        insert(0x8000_0008, 0, Registers::new(0x3027, 0, 0x3, 0));
        cpus.insert(apic_id, CpuSnapshot::from_leaves(apic_id, leaves));
    }

    let topology = build_topology(&cpus);
    assert_eq!(topology.logical_mask_width, 0);
    assert_eq!(topology.physical_mask_width, 2);
    assert_eq!(topology.packages.len(), 1);
}
