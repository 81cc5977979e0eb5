use bitflags::bitflags;
use log::debug;
use modular_bitfield::prelude::*;
use std::collections::BTreeMap;
use std::fmt;

/// CPUID input `eax` value.
pub type LeafId = u32;

/// CPUID input `ecx` value.
pub type SubleafId = u32;

/// All observed register sets for one logical CPU, ordered leaf-major so
/// that iteration produces stable dump output.
pub type LeafMap = BTreeMap<LeafId, BTreeMap<SubleafId, Registers>>;

pub const BASIC_BASE: u32 = 0x0000_0000;
pub const HYPERVISOR_BASE: u32 = 0x4000_0000;
pub const XEN_OFFSET_BASE: u32 = 0x4000_0100;
pub const EXTENDED_BASE: u32 = 0x8000_0000;
pub const TRANSMETA_BASE: u32 = 0x8086_0000;
pub const CENTAUR_BASE: u32 = 0xC000_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Output registers of a single CPUID invocation.
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegisterName {
    EAX,
    EBX,
    ECX,
    EDX,
}

impl RegisterName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterName::EAX => "eax",
            RegisterName::EBX => "ebx",
            RegisterName::ECX => "ecx",
            RegisterName::EDX => "edx",
        }
    }
}

impl fmt::Display for RegisterName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Registers {
    pub fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Registers {
        Registers { eax, ebx, ecx, edx }
    }

    /// Read a register by name.
    pub fn register(&self, name: RegisterName) -> u32 {
        match name {
            RegisterName::EAX => self.eax,
            RegisterName::EBX => self.ebx,
            RegisterName::ECX => self.ecx,
            RegisterName::EDX => self.edx,
        }
    }
}

#[cfg(target_arch = "x86")]
use core::arch::x86::__cpuid_count;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::__cpuid_count;

/// Execute the CPUID instruction on the current processor with
/// `eax = leaf, ecx = subleaf`. No caching, no interpretation; callers
/// that care which package the answer comes from must pin first.
pub fn execute(leaf: LeafId, subleaf: SubleafId) -> Registers {
    let result = unsafe { __cpuid_count(leaf, subleaf) };
    Registers {
        eax: result.eax,
        ebx: result.ebx,
        ecx: result.ecx,
        edx: result.edx,
    }
}

bitflags! {
    /// Vendor identification. Two disjoint fields share the word: silicon
    /// vendors in the low half, hypervisor vendors in the high half. A CPU
    /// may advertise one of each, e.g. Xen HVM with Viridian extensions on
    /// Intel silicon.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VendorMask: u32 {
        const UNKNOWN   = 0x0000_0000;

        // Silicon vendors.
        const INTEL     = 0x0000_0001;
        const AMD       = 0x0000_0002;
        const CENTAUR   = 0x0000_0004;
        const CYRIX     = 0x0000_0008;
        const TRANSMETA = 0x0000_0010;
        const NAT_SEMI  = 0x0000_0020;
        const NEXGEN    = 0x0000_0040;
        const RISE      = 0x0000_0080;
        const SIS       = 0x0000_0100;
        const UMC       = 0x0000_0200;
        const VIA       = 0x0000_0400;
        const VORTEX    = 0x0000_0800;

        // Hypervisor vendors.
        const BHYVE     = 0x0001_0000;
        const KVM       = 0x0002_0000;
        const HYPER_V   = 0x0004_0000;
        const PARALLELS = 0x0008_0000;
        const VMWARE    = 0x0010_0000;
        const XEN_HVM   = 0x0020_0000;
        const QEMU      = 0x0040_0000;

        // Filtering helpers.
        const ANY_SILICON    = 0x0000_0FFF;
        const ANY_HYPERVISOR = 0x007F_0000;
        const INTEL_AMD      = Self::INTEL.bits() | Self::AMD.bits();
    }
}

impl VendorMask {
    fn from_silicon_string(input: &str) -> VendorMask {
        debug!("matching silicon vendor string {:?}", input);
        match input {
            "GenuineIntel" | "GenuineIotel" => VendorMask::INTEL,
            "AuthenticAMD" => VendorMask::AMD,
            "CentaurHauls" => VendorMask::CENTAUR,
            "CyrixInstead" => VendorMask::CYRIX,
            "TransmetaCPU" | "GenuineTMx86" => VendorMask::TRANSMETA,
            "Geode by NSC" => VendorMask::NAT_SEMI,
            "NexGenDriven" => VendorMask::NEXGEN,
            "RiseRiseRise" => VendorMask::RISE,
            "SiS SiS SiS " => VendorMask::SIS,
            "UMC UMC UMC " => VendorMask::UMC,
            "VIA VIA VIA " => VendorMask::VIA,
            "Vortex86 SoC" => VendorMask::VORTEX,
            _ => VendorMask::UNKNOWN,
        }
    }

    fn from_hypervisor_string(input: &str) -> VendorMask {
        debug!("matching hypervisor vendor string {:?}", input);
        match input {
            "bhyve bhyve " => VendorMask::BHYVE,
            "KVMKVMKVM" => VendorMask::KVM,
            "Microsoft Hv" => VendorMask::HYPER_V,
            "lrpepyh vr" | " lrpepyh  vr" | "prl hyperv" => VendorMask::PARALLELS,
            "VMwareVMware" => VendorMask::VMWARE,
            "XenVMMXenVMM" => VendorMask::XEN_HVM,
            "TCGTCGTCGTCG" => VendorMask::QEMU,
            _ => VendorMask::UNKNOWN,
        }
    }

    /// Silicon vendor from the basic range-zero leaf, whose identification
    /// string is laid out across `(ebx, edx, ecx)`.
    pub fn from_silicon_leaf(regs: &Registers) -> VendorMask {
        let bytes = register_bytes(&[regs.ebx, regs.edx, regs.ecx]);
        VendorMask::from_silicon_string(&bytes_to_ascii(&bytes))
    }

    /// Hypervisor vendor from a `0x4000_xxxx` range-zero leaf, whose
    /// identification string is laid out across `(ebx, ecx, edx)`.
    pub fn from_hypervisor_leaf(regs: &Registers) -> VendorMask {
        let bytes = register_bytes(&[regs.ebx, regs.ecx, regs.edx]);
        VendorMask::from_hypervisor_string(&bytes_to_ascii(&bytes))
    }

    pub fn silicon(&self) -> VendorMask {
        *self & VendorMask::ANY_SILICON
    }

    pub fn hypervisor(&self) -> VendorMask {
        *self & VendorMask::ANY_HYPERVISOR
    }

    fn silicon_name(&self) -> &'static str {
        const NAMES: &[(VendorMask, &str)] = &[
            (VendorMask::INTEL, "Intel"),
            (VendorMask::AMD, "AMD"),
            (VendorMask::CENTAUR, "Centaur"),
            (VendorMask::CYRIX, "Cyrix"),
            (VendorMask::TRANSMETA, "Transmeta"),
            (VendorMask::NAT_SEMI, "National Semiconductor"),
            (VendorMask::NEXGEN, "NexGen"),
            (VendorMask::RISE, "Rise"),
            (VendorMask::SIS, "SiS"),
            (VendorMask::UMC, "UMC"),
            (VendorMask::VIA, "VIA"),
            (VendorMask::VORTEX, "Vortex"),
        ];
        let silicon = self.silicon();
        for (mask, name) in NAMES {
            if silicon == *mask {
                return *name;
            }
        }
        "Unknown"
    }

    fn hypervisor_name(&self) -> &'static str {
        let viridian = VendorMask::XEN_HVM.union(VendorMask::HYPER_V);
        if self.hypervisor() == viridian {
            return "Xen HVM with Viridian Extensions";
        }
        const NAMES: &[(VendorMask, &str)] = &[
            (VendorMask::BHYVE, "bhyve"),
            (VendorMask::KVM, "KVM"),
            (VendorMask::HYPER_V, "Hyper-V"),
            (VendorMask::PARALLELS, "Parallels"),
            (VendorMask::VMWARE, "VMware"),
            (VendorMask::XEN_HVM, "Xen HVM"),
            (VendorMask::QEMU, "QEMU"),
        ];
        let hypervisor = self.hypervisor();
        for (mask, name) in NAMES {
            if hypervisor == *mask {
                return *name;
            }
        }
        ""
    }
}

impl fmt::Display for VendorMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let hypervisor = self.hypervisor_name();
        if hypervisor.is_empty() {
            write!(f, "{}", self.silicon_name())
        } else {
            write!(f, "{} on {}", hypervisor, self.silicon_name())
        }
    }
}

fn register_bytes(registers: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(registers.len() * 4);
    for register in registers {
        bytes.extend_from_slice(&register.to_le_bytes());
    }
    bytes
}

/// Printable prefix of a register-packed string; stops at the first NUL.
pub fn bytes_to_ascii(bytes: &[u8]) -> String {
    let mut string = String::with_capacity(bytes.len());
    for byte in bytes {
        let chr = *byte as char;
        if chr == '\0' {
            break;
        }
        if chr.is_ascii() && !chr.is_control() {
            string.push(chr);
        }
    }
    string
}

fn squeeze_str(input: &str) -> String {
    let mut output = String::new();
    let mut last_was_space = false;
    for inchar in input.trim().chars() {
        if inchar == '\0' {
            break;
        }
        if inchar.is_whitespace() {
            if !last_was_space {
                output.push(inchar);
                last_was_space = true;
            }
        } else if !inchar.is_control() {
            output.push(inchar);
            last_was_space = false;
        }
    }
    output.truncate(output.trim_end().len());
    output
}

#[bitfield(bits = 32)]
struct VersionEax {
    stepping: B4,
    model: B4,
    family: B4,
    #[skip]
    __: B4,
    extmodel: B4,
    extfamily: B8,
    #[skip]
    __: B4,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Effective family/model/stepping after the extended-field fold.
pub struct Model {
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
}

impl Model {
    /// Unpack the leaf 1 version word. The extended family only
    /// contributes when the base family is 0xF; the extended model only
    /// contributes when the base family is 6 or 0xF.
    pub fn from_eax(eax: u32) -> Model {
        let raw = VersionEax::from_bytes(eax.to_le_bytes());
        let mut family = u32::from(raw.family());
        let mut model = u32::from(raw.model());
        if raw.family() == 0xF {
            family += u32::from(raw.extfamily());
        }
        if raw.family() == 0x6 || raw.family() == 0xF {
            model |= u32::from(raw.extmodel()) << 4;
        }
        Model {
            family,
            model,
            stepping: u32::from(raw.stepping()),
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "family {:#x}, model {:#x}, stepping {:#x}",
            self.family, self.model, self.stepping
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Everything observed about one logical processor. Immutable once the
/// enumeration that produced it completes; every subleaf present here was
/// returned by an actual CPUID execution in that processor's pinned
/// context.
pub struct CpuSnapshot {
    pub apic_id: u32,
    pub vendor: VendorMask,
    pub model: Model,
    pub leaves: LeafMap,
}

impl CpuSnapshot {
    /// Build a snapshot from collected leaves, re-deriving vendor and
    /// model from the observed registers. Dump readers and the live
    /// enumerator share this path so a dump from one machine decodes
    /// identically on another.
    pub fn from_leaves(apic_id: u32, leaves: LeafMap) -> CpuSnapshot {
        let mut snapshot = CpuSnapshot {
            apic_id,
            vendor: VendorMask::UNKNOWN,
            model: Model::default(),
            leaves,
        };
        snapshot.derive_vendor();
        snapshot.derive_model();
        snapshot
    }

    fn derive_vendor(&mut self) {
        if let Some(regs) = self.get_subleaf(BASIC_BASE, 0) {
            self.vendor |= VendorMask::from_silicon_leaf(regs);
        }
        // Hyper-V owns the base hypervisor slot when both it and Xen are
        // present; Xen then re-publishes its range at the 0x100 offset.
        if let Some(regs) = self.get_subleaf(HYPERVISOR_BASE, 0) {
            self.vendor |= VendorMask::from_hypervisor_leaf(regs);
        }
        if let Some(regs) = self.get_subleaf(XEN_OFFSET_BASE, 0) {
            self.vendor |= VendorMask::from_hypervisor_leaf(regs);
        }
        debug!("derived vendor mask: {:?}", self.vendor);
    }

    fn derive_model(&mut self) {
        if let Some(regs) = self.get_subleaf(0x0000_0001, 0) {
            self.model = Model::from_eax(regs.eax);
        }
    }

    pub fn get(&self, leaf: LeafId) -> Option<&BTreeMap<SubleafId, Registers>> {
        self.leaves.get(&leaf)
    }

    pub fn get_subleaf(&self, leaf: LeafId, subleaf: SubleafId) -> Option<&Registers> {
        self.leaves.get(&leaf).and_then(|subleaves| subleaves.get(&subleaf))
    }

    /// Whether `bit` is set in `register` of the given leaf/subleaf.
    /// Absent leaves read as zero.
    pub fn has_feature_bit(
        &self,
        leaf: LeafId,
        subleaf: SubleafId,
        register: RegisterName,
        bit: u32,
    ) -> bool {
        match self.get_subleaf(leaf, subleaf) {
            None => false,
            Some(regs) => regs.register(register) & (1 << bit) != 0,
        }
    }

    /// Processor name string from the extended brand leaves, if published.
    pub fn brand_string(&self) -> Option<String> {
        let mut bytes: Vec<u8> = vec![];
        for leaf in &[0x8000_0002, 0x8000_0003, 0x8000_0004] {
            let regs = self.get_subleaf(*leaf, 0)?;
            bytes.extend_from_slice(&register_bytes(&[regs.eax, regs.ebx, regs.ecx, regs.edx]));
        }
        let name = squeeze_str(&bytes_to_ascii(&bytes));
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

/// APIC id as observed in the leaves themselves: the x2APIC id from leaf
/// 0x1F or 0x0B when either is present, otherwise the initial APIC id
/// from leaf 1.
pub fn apic_id_from_leaves(leaves: &LeafMap) -> Option<u32> {
    for leaf in &[0x0000_001F, 0x0000_000B] {
        if let Some(subleaves) = leaves.get(leaf) {
            if let Some(regs) = subleaves.get(&0) {
                if regs.eax != 0 || regs.ebx != 0 {
                    return Some(regs.edx);
                }
            }
        }
    }
    leaves
        .get(&0x0000_0001)
        .and_then(|subleaves| subleaves.get(&0))
        .map(|regs| regs.ebx >> 24)
}
