use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::PathBuf;

use cpudiag::cpuid::{CpuSnapshot, LeafMap, Model, Registers, VendorMask};
use cpudiag::dump::{read_dump, write_native, DumpFormat};

fn dump_path(name: &str) -> PathBuf {
    let mut pathbuf = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    pathbuf.push("resources/test/dumps");
    pathbuf.push(name);
    pathbuf
}

fn read_file(name: &str, format: DumpFormat) -> BTreeMap<u32, CpuSnapshot> {
    let file = File::open(dump_path(name)).unwrap();
    read_dump(BufReader::new(file), format).unwrap()
}

fn pack(text: &str) -> [u32; 3] {
    let bytes = text.as_bytes();
    assert_eq!(bytes.len(), 12);
    let word = |chunk: &[u8]| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    [word(&bytes[0..4]), word(&bytes[4..8]), word(&bytes[8..12])]
}

fn silicon_leaf(text: &str) -> Registers {
    // Leaf 0 scatters the string across ebx, edx, ecx.
    let [first, second, third] = pack(text);
    Registers::new(0, first, third, second)
}

fn hypervisor_leaf(text: &str) -> Registers {
    // Hypervisor range-zero leaves use ebx, ecx, edx order.
    let [first, second, third] = pack(text);
    Registers::new(0, first, second, third)
}

#[test]
fn silicon_vendor_strings() {
    let cases: &[(&str, VendorMask)] = &[
        ("GenuineIntel", VendorMask::INTEL),
        ("AuthenticAMD", VendorMask::AMD),
        ("CentaurHauls", VendorMask::CENTAUR),
        ("CyrixInstead", VendorMask::CYRIX),
        ("TransmetaCPU", VendorMask::TRANSMETA),
        ("GenuineTMx86", VendorMask::TRANSMETA),
        ("Geode by NSC", VendorMask::NAT_SEMI),
        ("NexGenDriven", VendorMask::NEXGEN),
        ("RiseRiseRise", VendorMask::RISE),
        ("SiS SiS SiS ", VendorMask::SIS),
        ("UMC UMC UMC ", VendorMask::UMC),
        ("VIA VIA VIA ", VendorMask::VIA),
        ("Vortex86 SoC", VendorMask::VORTEX),
        ("Unknown Inc.", VendorMask::UNKNOWN),
    ];
    for (text, expected) in cases {
        let decoded = VendorMask::from_silicon_leaf(&silicon_leaf(text));
        assert_eq!(decoded, *expected, "for {:?}", text);
    }
}

#[test]
fn hypervisor_vendor_strings() {
    let cases: &[(&str, VendorMask)] = &[
        ("bhyve bhyve ", VendorMask::BHYVE),
        ("KVMKVMKVM\0\0\0", VendorMask::KVM),
        ("Microsoft Hv", VendorMask::HYPER_V),
        ("lrpepyh vr\0\0", VendorMask::PARALLELS),
        ("VMwareVMware", VendorMask::VMWARE),
        ("XenVMMXenVMM", VendorMask::XEN_HVM),
        ("TCGTCGTCGTCG", VendorMask::QEMU),
    ];
    for (text, expected) in cases {
        let decoded = VendorMask::from_hypervisor_leaf(&hypervisor_leaf(text));
        assert_eq!(decoded, *expected, "for {:?}", text);
    }
}

#[test]
fn vendor_display() {
    assert_eq!(VendorMask::INTEL.to_string(), "Intel");
    assert_eq!(
        (VendorMask::INTEL | VendorMask::KVM).to_string(),
        "KVM on Intel"
    );
    assert_eq!(
        (VendorMask::INTEL | VendorMask::XEN_HVM | VendorMask::HYPER_V).to_string(),
        "Xen HVM with Viridian Extensions on Intel"
    );
}

#[test]
fn model_fold() {
    // Coffee Lake: base family 6 folds the extended model in.
    let coffee_lake = Model::from_eax(0x0009_06EA);
    assert_eq!(
        (coffee_lake.family, coffee_lake.model, coffee_lake.stepping),
        (6, 158, 10)
    );

    // AMD family 15h: base family 0xF folds the extended family in.
    let bulldozer = Model::from_eax(0x0060_0F11);
    assert_eq!(
        (bulldozer.family, bulldozer.model, bulldozer.stepping),
        (21, 1, 1)
    );

    // Base family below 6 folds nothing.
    let k5 = Model::from_eax(0x0000_0500);
    assert_eq!((k5.family, k5.model, k5.stepping), (5, 0, 0));
}

fn synthetic_cpus() -> BTreeMap<u32, CpuSnapshot> {
    let mut cpus = BTreeMap::new();
    for apic_id in 0..2u32 {
        let mut leaves = LeafMap::new();
        let mut insert = |leaf: u32, subleaf: u32, regs: Registers| {
            leaves.entry(leaf).or_default().insert(subleaf, regs);
        };
        insert(0x0, 0, silicon_leaf("GenuineIntel"));
        insert(
            0x1,
            0,
            Registers::new(0x000906EA, apic_id << 24 | 0x0010_0800, 0x7FFA_FBFF, 0xBFEB_FBFF),
        );
        insert(0x4, 0, Registers::new(0x1C00_4121, 0x01C0_003F, 0x3F, 0));
        insert(0x4, 1, Registers::new(0x1C00_4122, 0x01C0_003F, 0x3F, 0));
        insert(0x7, 0, Registers::new(0, 0x029C_6FBB, 0, 0));
        insert(0x8000_0000, 0, Registers::new(0x8000_0008, 0, 0, 0));
        insert(0x8000_0007, 0, Registers::new(0, 0, 0, 0x100));
        cpus.insert(apic_id, CpuSnapshot::from_leaves(apic_id, leaves));
    }
    cpus
}

#[test]
fn native_round_trip() {
    let cpus = synthetic_cpus();

    let mut written: Vec<u8> = vec![];
    write_native(&mut written, &cpus).unwrap();
    let reread = read_dump(Cursor::new(&written), DumpFormat::Native).unwrap();

    assert_eq!(cpus, reread);

    // A second trip through text is byte-identical.
    let mut rewritten: Vec<u8> = vec![];
    write_native(&mut rewritten, &reread).unwrap();
    assert_eq!(written, rewritten);
}

#[test]
fn native_rejects_junk() {
    let junk = "CPU 0:\n   leaf 0x0 = not a register line\n";
    assert!(read_dump(Cursor::new(junk.as_bytes()), DumpFormat::Native).is_err());

    let headerless = "   leaf 0x00000000 subleaf 0x00000000 = 0x1 0x2 0x3 0x4\n";
    assert!(read_dump(Cursor::new(headerless.as_bytes()), DumpFormat::Native).is_err());
}

#[test]
fn import_native_dump() {
    let cpus = read_file("native-i7-8700k.txt", DumpFormat::Native);
    assert_eq!(cpus.len(), 2);

    let cpu0 = &cpus[&0];
    assert_eq!(cpu0.vendor, VendorMask::INTEL);
    assert_eq!(
        (cpu0.model.family, cpu0.model.model, cpu0.model.stepping),
        (6, 158, 10)
    );
    assert_eq!(
        cpu0.brand_string().as_deref(),
        Some("Intel(R) Core(TM) i7-8700K CPU @ 3.70GHz")
    );
    assert!(cpu0.has_feature_bit(0x8000_0007, 0, cpudiag::cpuid::RegisterName::EDX, 8));
}

#[test]
fn import_etallen_dump() {
    let cpus = read_file("etallen-i7-8700k.txt", DumpFormat::Etallen);
    assert_eq!(cpus.len(), 1);
    let cpu = cpus.values().next().unwrap();
    assert_eq!(cpu.vendor, VendorMask::INTEL);
    assert_eq!(cpu.get_subleaf(0x8000_0001, 0).unwrap().edx, 0x2C10_0800);
}

#[test]
fn import_libcpuid_dump() {
    let cpus = read_file("libcpuid-i7-8700k.txt", DumpFormat::Libcpuid);
    assert_eq!(cpus.len(), 1);
    let cpu = cpus.values().next().unwrap();
    assert_eq!(cpu.vendor, VendorMask::INTEL);
    // intel_fn* records land on their own subleaves.
    assert_eq!(cpu.get_subleaf(0x4, 1).unwrap().eax, 0x1C00_4122);
    assert_eq!(cpu.get_subleaf(0xB, 1).unwrap().ecx, 0x201);
    // ext_cpuid[7] is extended leaf 0x8000_0007.
    assert_eq!(cpu.get_subleaf(0x8000_0007, 0).unwrap().edx, 0x100);
}

#[test]
fn import_instlat_dump() {
    let cpus = read_file("instlat-i7-8700k.txt", DumpFormat::Instlat);
    assert_eq!(cpus.len(), 2);
    // Snapshots re-key by the x2APIC id found in leaf 0xB.
    assert!(cpus.contains_key(&0) && cpus.contains_key(&1));
    let cpu1 = &cpus[&1];
    assert_eq!(cpu1.vendor, VendorMask::INTEL);
    assert_eq!(cpu1.get_subleaf(0xB, 1).unwrap().eax, 0x4);
}
