use log::{debug, warn};
use std::collections::BTreeMap;

use crate::cpuid::{
    self, apic_id_from_leaves, CpuSnapshot, LeafId, LeafMap, Registers, SubleafId, VendorMask,
    BASIC_BASE, CENTAUR_BASE, EXTENDED_BASE, HYPERVISOR_BASE, TRANSMETA_BASE, XEN_OFFSET_BASE,
};
use crate::error::Error;
use crate::timing;

// Easter-egg leaves published outside any range maximum on some parts.
const MYSTERY_LEAVES: [u32; 2] = [0x8FFF_FFFE, 0x8FFF_FFFF];

// Extended leaves that only AMD defines; probing them elsewhere returns
// garbage that would pollute a dump.
const AMD_ONLY_EXTENDED: [u32; 4] = [0x8000_001B, 0x8000_001D, 0x8000_001E, 0x8000_001F];

#[derive(Debug, Clone, Copy, Default)]
pub struct EnumerateOptions {
    /// Probe every leaf from each range base to its published maximum,
    /// including bases the vendor does not claim. Used to hunt for
    /// undocumented leaves.
    pub brute_force: bool,

    /// Do not skip vendor-specific leaves on foreign silicon.
    pub ignore_vendor: bool,

    /// Do not consult feature bits that gate subleaf walks (SGX, PCONFIG,
    /// TOPOEXT).
    pub ignore_feature: bool,
}

/// Walk the CPUID leaves of every logical processor, pinning to each in
/// turn. Snapshots are keyed by APIC id. When the host cannot pin at all
/// the walk degrades to the current processor with a warning, since
/// bouncing without affinity would attribute leaves to the wrong CPUs.
pub fn enumerate_processors(
    options: &EnumerateOptions,
) -> Result<BTreeMap<u32, CpuSnapshot>, Error> {
    let mut cpus = BTreeMap::new();
    let count = num_cpus::get();
    let previous = timing::current_affinity();

    for cpu in 0..count {
        if let Err(err) = timing::pin_to(cpu) {
            warn!(
                "cannot pin to CPU {}: {}; enumerating the current CPU only",
                cpu, err
            );
            let snapshot = snapshot_current(options);
            cpus.insert(snapshot.apic_id, snapshot);
            break;
        }
        debug!("collecting leaves for logical CPU {}", cpu);
        let snapshot = snapshot_current(options);
        cpus.insert(snapshot.apic_id, snapshot);
    }

    if let Some(mask) = previous {
        timing::restore_affinity(mask);
    }

    Ok(cpus)
}

/// Snapshot the processor the calling thread currently runs on. The
/// caller is responsible for pinning.
pub fn snapshot_current(options: &EnumerateOptions) -> CpuSnapshot {
    let mut leaves = LeafMap::new();

    // Vendor identification comes first: which leaves exist at all
    // depends on it.
    let leaf0 = cpuid::execute(BASIC_BASE, 0);
    let mut vendor = VendorMask::from_silicon_leaf(&leaf0);
    let leaf1 = cpuid::execute(0x0000_0001, 0);
    let hypervisor_present = leaf1.ecx & (1 << 31) != 0;
    let mut xen_base = HYPERVISOR_BASE;

    if hypervisor_present || options.brute_force {
        let hv0 = cpuid::execute(HYPERVISOR_BASE, 0);
        let hv_vendor = VendorMask::from_hypervisor_leaf(&hv0);
        vendor |= hv_vendor;
        // Xen parks its own range at +0x100 when a Hyper-V compatibility
        // stub occupies the base slot.
        if hv_vendor == VendorMask::HYPER_V {
            let offset0 = cpuid::execute(XEN_OFFSET_BASE, 0);
            if VendorMask::from_hypervisor_leaf(&offset0) == VendorMask::XEN_HVM {
                vendor |= VendorMask::XEN_HVM;
                xen_base = XEN_OFFSET_BASE;
            }
        }
    }
    debug!("pre-enumeration vendor mask: {:?}", vendor);

    let plan = Plan {
        vendor,
        xen_base,
        options: *options,
    };

    plan.walk_range(&mut leaves, BASIC_BASE);
    if hypervisor_present || options.brute_force {
        plan.walk_range(&mut leaves, HYPERVISOR_BASE);
        if xen_base == XEN_OFFSET_BASE {
            plan.walk_range(&mut leaves, XEN_OFFSET_BASE);
        }
    }
    plan.walk_range(&mut leaves, EXTENDED_BASE);

    if options.brute_force {
        plan.walk_range(&mut leaves, TRANSMETA_BASE);
        plan.walk_range(&mut leaves, CENTAUR_BASE);
        for leaf in &MYSTERY_LEAVES {
            store(&mut leaves, *leaf, 0, cpuid::execute(*leaf, 0));
        }
    } else {
        if vendor.contains(VendorMask::TRANSMETA) {
            plan.walk_range(&mut leaves, TRANSMETA_BASE);
        }
        if vendor.intersects(VendorMask::CENTAUR | VendorMask::VIA) {
            plan.walk_range(&mut leaves, CENTAUR_BASE);
        }
    }

    let apic_id = apic_id_from_leaves(&leaves).unwrap_or(0);
    CpuSnapshot::from_leaves(apic_id, leaves)
}

fn store(leaves: &mut LeafMap, leaf: LeafId, subleaf: SubleafId, regs: Registers) {
    leaves.entry(leaf).or_default().insert(subleaf, regs);
}

struct Plan {
    vendor: VendorMask,
    xen_base: u32,
    options: EnumerateOptions,
}

impl Plan {
    /// Enumerate one leaf range. Every valid base publishes the range
    /// maximum in `eax` of its zero leaf; a maximum outside the range
    /// means the base is not implemented and nothing is recorded for it,
    /// except under brute force, where the base response is kept so the
    /// dump stays comprehensive.
    fn walk_range(&self, leaves: &mut LeafMap, base: u32) {
        let first = cpuid::execute(base, 0);
        let maximum = first.eax;
        if maximum < base || maximum > base + 0xFFFF {
            if self.options.brute_force {
                store(leaves, base, 0, first);
            }
            return;
        }

        store(leaves, base, 0, first);
        for leaf in (base + 1)..=maximum {
            if self.skips(leaf) {
                continue;
            }
            self.walk_leaf(leaves, leaf);
        }
    }

    fn skips(&self, leaf: LeafId) -> bool {
        if self.options.brute_force || self.options.ignore_vendor {
            return false;
        }
        AMD_ONLY_EXTENDED.contains(&leaf) && !self.vendor.contains(VendorMask::AMD)
    }

    /// Apply the subleaf enumeration convention for one leaf. Most leaves
    /// answer a single subleaf; the indexed ones each follow their own
    /// termination rule.
    fn walk_leaf(&self, leaves: &mut LeafMap, leaf: LeafId) {
        let first = cpuid::execute(leaf, 0);
        store(leaves, leaf, 0, first);

        if leaf == self.xen_base + 3 && self.vendor.contains(VendorMask::XEN_HVM) {
            // Xen time leaf: fixed subleaves 0 through 2.
            for subleaf in 1..=2 {
                store(leaves, leaf, subleaf, cpuid::execute(leaf, subleaf));
            }
            return;
        }

        match leaf {
            // Deterministic cache parameters: walk until the cache type
            // field goes to zero.
            0x0000_0004 => self.walk_until_zero(leaves, leaf, |regs| regs.eax & 0x1F == 0),

            // Subleaf count published in eax of subleaf 0.
            0x0000_0007 | 0x0000_0014 | 0x0000_0017 | 0x0000_0018 | 0x0000_001D | 0x0000_0020 => {
                self.walk_counted(leaves, leaf, first.eax)
            }

            // Extended topology: levels end at an invalid (all-zero)
            // descriptor.
            0x0000_000B | 0x0000_001F => self.walk_levels(leaves, leaf),

            // Extended state: valid subleaves advertised as a bit mask
            // across eax/edx of subleaf 0; subleaf 1 always exists.
            0x0000_000D => {
                store(leaves, leaf, 1, cpuid::execute(leaf, 1));
                let mask = u64::from(first.eax) | u64::from(first.edx) << 32;
                self.walk_mask(leaves, leaf, mask & !0b11);
            }

            // RDT monitoring: resource subleaves advertised in edx.
            0x0000_000F => self.walk_mask(leaves, leaf, u64::from(first.edx) & !1),

            // RDT allocation: resource subleaves advertised in ebx.
            0x0000_0010 => self.walk_mask(leaves, leaf, u64::from(first.ebx) & !1),

            // SGX enumeration exists only when leaf 7 advertises SGX.
            0x0000_0012 => {
                if self.feature_gate(0x0000_0007, cpuid::RegisterName::EBX, 2) {
                    store(leaves, leaf, 1, cpuid::execute(leaf, 1));
                    self.walk_from(leaves, leaf, 2, |regs| regs.eax & 0xF == 0);
                }
            }

            // PCONFIG targets, gated on leaf 7 edx.
            0x0000_001B => {
                if self.feature_gate(0x0000_0007, cpuid::RegisterName::EDX, 18) {
                    self.walk_from(leaves, leaf, 1, |regs| regs.eax & 0xFFF == 0);
                }
            }

            // AMD cache properties, gated on TOPOEXT.
            0x8000_001D => {
                if self.feature_gate(0x8000_0001, cpuid::RegisterName::ECX, 22) {
                    self.walk_until_zero(leaves, leaf, |regs| regs.eax & 0x1F == 0)
                }
            }

            // PQOS extended features: two fixed subleaves.
            0x8000_0020 => self.walk_counted(leaves, leaf, 1),

            _ => {}
        }
    }

    fn feature_gate(&self, leaf: LeafId, register: cpuid::RegisterName, bit: u32) -> bool {
        if self.options.ignore_feature || self.options.brute_force {
            return true;
        }
        let regs = cpuid::execute(leaf, 0);
        regs.register(register) & (1 << bit) != 0
    }

    fn walk_counted(&self, leaves: &mut LeafMap, leaf: LeafId, maximum: u32) {
        for subleaf in 1..=maximum {
            store(leaves, leaf, subleaf, cpuid::execute(leaf, subleaf));
        }
    }

    fn walk_until_zero<F>(&self, leaves: &mut LeafMap, leaf: LeafId, terminated: F)
    where
        F: Fn(&Registers) -> bool,
    {
        self.walk_from(leaves, leaf, 1, terminated);
    }

    fn walk_from<F>(&self, leaves: &mut LeafMap, leaf: LeafId, start: SubleafId, terminated: F)
    where
        F: Fn(&Registers) -> bool,
    {
        let mut subleaf = start;
        loop {
            let regs = cpuid::execute(leaf, subleaf);
            if terminated(&regs) {
                break;
            }
            store(leaves, leaf, subleaf, regs);
            subleaf += 1;
        }
    }

    fn walk_levels(&self, leaves: &mut LeafMap, leaf: LeafId) {
        let mut subleaf = 1;
        loop {
            let regs = cpuid::execute(leaf, subleaf);
            if regs.eax == 0 && regs.ebx == 0 {
                break;
            }
            store(leaves, leaf, subleaf, regs);
            subleaf += 1;
        }
    }

    fn walk_mask(&self, leaves: &mut LeafMap, leaf: LeafId, mask: u64) {
        for bit in 1..64 {
            if mask & (1u64 << bit) != 0 {
                store(leaves, leaf, bit as SubleafId, cpuid::execute(leaf, bit as SubleafId));
            }
        }
    }
}
