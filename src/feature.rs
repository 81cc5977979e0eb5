use std::fmt;
use textwrap::indent;

use crate::cpuid::{CpuSnapshot, LeafId, RegisterName, SubleafId, VendorMask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A catalogued datum is either a single flag bit or a packed field.
pub enum FeatureBits {
    Bit(u8),
    Field { lo: u8, hi: u8 },
}

impl FeatureBits {
    pub fn lo(&self) -> u8 {
        match self {
            FeatureBits::Bit(bit) => *bit,
            FeatureBits::Field { lo, .. } => *lo,
        }
    }

    pub fn hi(&self) -> u8 {
        match self {
            FeatureBits::Bit(bit) => *bit,
            FeatureBits::Field { hi, .. } => *hi,
        }
    }

    pub fn mask(&self) -> u32 {
        let width = u32::from(self.hi() - self.lo()) + 1;
        if width >= 32 {
            u32::MAX
        } else {
            ((1u32 << width) - 1) << self.lo()
        }
    }

    /// Value of this bit or field within a register.
    pub fn extract(&self, register: u32) -> u32 {
        (register & self.mask()) >> self.lo()
    }
}

#[derive(Debug)]
pub struct FeatureSpec {
    pub bits: FeatureBits,
    pub vendors: VendorMask,
    pub mnemonic: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
/// One register's worth of catalogued features, keyed by leaf, subleaf
/// and register. Several entries may share a key when vendors assign the
/// same register different meanings.
pub struct CatalogueEntry {
    pub leaf: LeafId,
    pub subleaf: SubleafId,
    pub register: RegisterName,
    pub vendors: VendorMask,
    pub title: &'static str,
    pub specs: &'static [FeatureSpec],
}

macro_rules! bit {
    ($bit:expr, $vendors:expr, $mnemonic:expr, $description:expr) => {
        FeatureSpec {
            bits: FeatureBits::Bit($bit),
            vendors: $vendors,
            mnemonic: $mnemonic,
            description: $description,
        }
    };
}

macro_rules! field {
    ($lo:expr, $hi:expr, $vendors:expr, $mnemonic:expr, $description:expr) => {
        FeatureSpec {
            bits: FeatureBits::Field { lo: $lo, hi: $hi },
            vendors: $vendors,
            mnemonic: $mnemonic,
            description: $description,
        }
    };
}

const ANY: VendorMask = VendorMask::ANY_SILICON;
const INTEL: VendorMask = VendorMask::INTEL;
const AMD: VendorMask = VendorMask::AMD;

static FEATURES_0000_0001_EDX: [FeatureSpec; 29] = [
    bit!(0, ANY, "fpu", "x87 FPU on chip"),
    bit!(1, ANY, "vme", "virtual-8086 mode enhancement"),
    bit!(2, ANY, "de", "debugging extensions"),
    bit!(3, ANY, "pse", "page size extensions"),
    bit!(4, ANY, "tsc", "time stamp counter"),
    bit!(5, ANY, "msr", "RDMSR and WRMSR support"),
    bit!(6, ANY, "pae", "physical address extensions"),
    bit!(7, ANY, "mce", "machine check exception"),
    bit!(8, ANY, "cx8", "CMPXCHG8B instruction"),
    bit!(9, ANY, "apic", "APIC on chip"),
    bit!(11, ANY, "sep", "SYSENTER and SYSEXIT instructions"),
    bit!(12, ANY, "mtrr", "memory type range registers"),
    bit!(13, ANY, "pge", "PTE global bit"),
    bit!(14, ANY, "mca", "machine check architecture"),
    bit!(15, ANY, "cmov", "conditional move instructions"),
    bit!(16, ANY, "pat", "page attribute table"),
    bit!(17, ANY, "pse-36", "36-bit page size extension"),
    bit!(18, INTEL, "psn", "processor serial number"),
    bit!(19, ANY, "clfsh", "CLFLUSH instruction"),
    bit!(21, INTEL, "ds", "debug store"),
    bit!(22, INTEL, "acpi", "thermal monitor and clock control"),
    bit!(23, ANY, "mmx", "MMX instruction set"),
    bit!(24, ANY, "fxsr", "FXSAVE/FXRSTOR instructions"),
    bit!(25, ANY, "sse", "SSE instructions"),
    bit!(26, ANY, "sse2", "SSE2 instructions"),
    bit!(27, INTEL, "ss", "self snoop"),
    bit!(28, ANY, "htt", "max APIC ids reserved field is valid"),
    bit!(29, INTEL, "tm", "thermal monitor"),
    bit!(31, INTEL, "pbe", "pending break enable"),
];

static FEATURES_0000_0001_ECX: [FeatureSpec; 31] = [
    bit!(0, ANY, "sse3", "SSE3 instructions"),
    bit!(1, ANY, "pclmulqdq", "PCLMULQDQ instruction"),
    bit!(2, INTEL, "dtes64", "64-bit DS area"),
    bit!(3, ANY, "monitor", "MONITOR/MWAIT instructions"),
    bit!(4, INTEL, "ds-cpl", "CPL-qualified debug store"),
    bit!(5, INTEL, "vmx", "virtual machine extensions"),
    bit!(6, INTEL, "smx", "safer mode extensions"),
    bit!(7, INTEL, "eist", "enhanced SpeedStep technology"),
    bit!(8, INTEL, "tm2", "thermal monitor 2"),
    bit!(9, ANY, "ssse3", "SSSE3 instructions"),
    bit!(10, INTEL, "cnxt-id", "L1 context id"),
    bit!(11, INTEL, "sdbg", "silicon debug interface"),
    bit!(12, ANY, "fma", "fused multiply-add AVX instructions"),
    bit!(13, ANY, "cmpxchg16b", "CMPXCHG16B instruction"),
    bit!(14, INTEL, "xtpr", "xTPR update control"),
    bit!(15, INTEL, "pdcm", "perfmon and debug capability"),
    bit!(17, ANY, "pcid", "process-context identifiers"),
    bit!(18, INTEL, "dca", "direct cache access for device prefetch"),
    bit!(19, ANY, "sse4.1", "SSE4.1 instructions"),
    bit!(20, ANY, "sse4.2", "SSE4.2 instructions"),
    bit!(21, ANY, "x2apic", "x2APIC"),
    bit!(22, ANY, "movbe", "MOVBE instruction"),
    bit!(23, ANY, "popcnt", "POPCNT instruction"),
    bit!(24, ANY, "tsc-deadline", "APIC one-shot via TSC deadline"),
    bit!(25, ANY, "aes-ni", "AES-NI instruction set"),
    bit!(26, ANY, "xsave", "XSAVE/XRSTOR extended state instructions"),
    bit!(27, ANY, "osxsave", "XSAVE enabled by OS"),
    bit!(28, ANY, "avx", "AVX instructions"),
    bit!(29, ANY, "f16c", "16-bit floating-point conversion instructions"),
    bit!(30, ANY, "rdrand", "RDRAND instruction"),
    bit!(31, ANY, "raz", "hypervisor guest"),
];

static FEATURES_0000_0007_0_EBX: [FeatureSpec; 31] = [
    bit!(0, ANY, "fsgsbase", "FSGSBASE instructions"),
    bit!(1, INTEL, "tsc-adjust", "IA32_TSC_ADJUST MSR"),
    bit!(2, INTEL, "sgx", "software guard extensions"),
    bit!(3, ANY, "bmi1", "bit manipulation instructions, set 1"),
    bit!(4, INTEL, "hle", "hardware lock elision"),
    bit!(5, ANY, "avx2", "AVX2 instructions"),
    bit!(6, ANY, "fdp-excptn-only", "x87 FPU data pointer updated only on exceptions"),
    bit!(7, ANY, "smep", "supervisor-mode execution prevention"),
    bit!(8, ANY, "bmi2", "bit manipulation instructions, set 2"),
    bit!(9, ANY, "erms", "enhanced REP MOVSB/STOSB"),
    bit!(10, ANY, "invpcid", "INVPCID instruction"),
    bit!(11, INTEL, "rtm", "restricted transactional memory"),
    bit!(12, ANY, "rdt-m", "resource director technology monitoring"),
    bit!(13, ANY, "dep-fpu-cs-ds", "FPU CS and DS deprecated"),
    bit!(14, INTEL, "mpx", "memory protection extensions"),
    bit!(15, ANY, "rdt-a", "resource director technology allocation"),
    bit!(16, ANY, "avx512f", "AVX-512 foundation"),
    bit!(17, ANY, "avx512dq", "AVX-512 double/quadword instructions"),
    bit!(18, ANY, "rdseed", "RDSEED instruction"),
    bit!(19, ANY, "adx", "ADCX/ADOX multi-precision add-carry"),
    bit!(20, ANY, "smap", "supervisor-mode access prevention"),
    bit!(21, ANY, "avx512-ifma", "AVX-512 integer fused multiply-add"),
    bit!(23, ANY, "clflushopt", "CLFLUSHOPT instruction"),
    bit!(24, ANY, "clwb", "CLWB instruction"),
    bit!(25, INTEL, "intel-pt", "processor trace"),
    bit!(26, INTEL, "avx512pf", "AVX-512 prefetch instructions"),
    bit!(27, INTEL, "avx512er", "AVX-512 exponential and reciprocal instructions"),
    bit!(28, INTEL, "avx512cd", "AVX-512 conflict detection"),
    bit!(29, ANY, "sha", "SHA extensions"),
    bit!(30, ANY, "avx512bw", "AVX-512 byte/word instructions"),
    bit!(31, ANY, "avx512vl", "AVX-512 vector length extensions"),
];

static FEATURES_0000_0007_0_ECX: [FeatureSpec; 24] = [
    bit!(0, INTEL, "prefetchwt1", "PREFETCHWT1 instruction"),
    bit!(1, ANY, "avx512-vbmi", "AVX-512 vector byte manipulation"),
    bit!(2, ANY, "umip", "user-mode instruction prevention"),
    bit!(3, ANY, "pku", "protection keys for user-mode pages"),
    bit!(4, ANY, "ospke", "protection keys enabled by OS"),
    bit!(5, ANY, "waitpkg", "UMONITOR/UMWAIT/TPAUSE"),
    bit!(6, ANY, "avx512-vbmi2", "AVX-512 vector byte manipulation 2"),
    bit!(7, ANY, "cet-ss", "CET shadow stack"),
    bit!(8, ANY, "gfni", "Galois field instructions"),
    bit!(9, ANY, "vaes", "vector AES"),
    bit!(10, ANY, "vpclmulqdq", "vector carry-less multiply"),
    bit!(11, ANY, "avx512-vnni", "AVX-512 vector neural network instructions"),
    bit!(12, ANY, "avx512-bitalg", "AVX-512 bit algorithms"),
    bit!(13, INTEL, "tme-en", "total memory encryption enabled"),
    bit!(14, ANY, "avx512-vpopcntdq", "AVX-512 vector population count"),
    bit!(16, ANY, "la57", "57-bit linear addresses, 5-level paging"),
    field!(17, 21, INTEL, "mawau", "MPX address-width adjust for user-mode"),
    bit!(22, ANY, "rdpid", "RDPID instruction"),
    bit!(23, INTEL, "kl", "key locker"),
    bit!(25, INTEL, "cldemote", "CLDEMOTE instruction"),
    bit!(27, ANY, "movdiri", "MOVDIRI instruction"),
    bit!(28, ANY, "movdir64b", "MOVDIR64B instruction"),
    bit!(29, INTEL, "enqcmd", "enqueue stores"),
    bit!(30, INTEL, "sgx-lc", "SGX launch configuration"),
];

static FEATURES_0000_0007_0_EDX: [FeatureSpec; 21] = [
    bit!(2, INTEL, "avx512-4vnniw", "AVX-512 4-register vector neural network instructions"),
    bit!(3, INTEL, "avx512-4fmaps", "AVX-512 4-register fused multiply-add"),
    bit!(4, ANY, "fsrm", "fast short REP MOVSB"),
    bit!(5, INTEL, "uintr", "user interrupts"),
    bit!(8, INTEL, "avx512-vp2intersect", "AVX-512 vector pair intersection"),
    bit!(10, INTEL, "md-clear", "VERW clears microarchitectural buffers"),
    bit!(14, INTEL, "serialize", "SERIALIZE instruction"),
    bit!(15, INTEL, "hybrid", "hybrid part"),
    bit!(16, INTEL, "tsxldtrk", "TSX suspend load address tracking"),
    bit!(18, INTEL, "pconfig", "PCONFIG instruction"),
    bit!(19, INTEL, "arch-lbr", "architectural last-branch records"),
    bit!(20, INTEL, "cet-ibt", "CET indirect branch tracking"),
    bit!(22, INTEL, "amx-bf16", "AMX bfloat16 tiles"),
    bit!(23, INTEL, "avx512-fp16", "AVX-512 half-precision arithmetic"),
    bit!(24, INTEL, "amx-tile", "AMX tile architecture"),
    bit!(25, INTEL, "amx-int8", "AMX 8-bit integer tiles"),
    bit!(26, ANY, "ibrs-ibpb", "indirect branch restricted speculation and predictor barrier"),
    bit!(27, ANY, "stibp", "single-thread indirect branch predictors"),
    bit!(28, INTEL, "l1d-flush", "IA32_FLUSH_CMD MSR"),
    bit!(29, INTEL, "arch-capabilities", "IA32_ARCH_CAPABILITIES MSR"),
    bit!(31, ANY, "ssbd", "speculative store bypass disable"),
];

static FEATURES_8000_0001_ECX: [FeatureSpec; 26] = [
    bit!(0, ANY, "lahf-sahf", "LAHF/SAHF in 64-bit mode"),
    bit!(1, AMD, "cmp-legacy", "core multi-processing legacy mode"),
    bit!(2, AMD, "svm", "secure virtual machine"),
    bit!(3, AMD, "extapic", "extended APIC space"),
    bit!(4, AMD, "cr8-legacy", "LOCK MOV CR0 means MOV CR8"),
    bit!(5, ANY, "lzcnt", "LZCNT instruction"),
    bit!(6, AMD, "sse4a", "SSE4A instructions"),
    bit!(7, AMD, "misalignsse", "misaligned SSE mode"),
    bit!(8, ANY, "3dnowprefetch", "PREFETCH/PREFETCHW instructions"),
    bit!(9, AMD, "osvw", "OS-visible workaround"),
    bit!(10, AMD, "ibs", "instruction-based sampling"),
    bit!(11, AMD, "xop", "extended operation support"),
    bit!(12, AMD, "skinit", "SKINIT and STGI instructions"),
    bit!(13, AMD, "wdt", "watchdog timer"),
    bit!(15, AMD, "lwp", "lightweight profiling"),
    bit!(16, AMD, "fma4", "four-operand FMA instructions"),
    bit!(17, AMD, "tce", "translation cache extension"),
    bit!(19, AMD, "nodeid-msr", "node id MSR"),
    bit!(21, AMD, "tbm", "trailing bit manipulation"),
    bit!(22, AMD, "topoext", "topology extensions"),
    bit!(23, AMD, "perfctr-core", "core performance counter extensions"),
    bit!(24, AMD, "perfctr-nb", "northbridge performance counter extensions"),
    bit!(26, AMD, "dbx", "data access breakpoint extension"),
    bit!(27, AMD, "perftsc", "performance time-stamp counter"),
    bit!(28, AMD, "perfctr-llc", "last-level cache performance counter extensions"),
    bit!(29, AMD, "monitorx", "MONITORX/MWAITX instructions"),
];

static FEATURES_8000_0001_EDX: [FeatureSpec; 10] = [
    // Bits mirrored from leaf 1 edx are catalogued there and omitted here.
    bit!(11, ANY, "syscall", "SYSCALL and SYSRET instructions"),
    bit!(19, AMD, "mp", "multiprocessor capable"),
    bit!(20, ANY, "nx", "no-execute page protection"),
    bit!(22, AMD, "mmxext", "AMD extensions to MMX"),
    bit!(25, AMD, "fxsr-opt", "FXSAVE/FXRSTOR optimizations"),
    bit!(26, ANY, "pdpe1gb", "1GB pages"),
    bit!(27, ANY, "rdtscp", "RDTSCP instruction"),
    bit!(29, ANY, "lm", "long mode (64-bit)"),
    bit!(30, AMD, "3dnowext", "extended 3DNow! instructions"),
    bit!(31, AMD, "3dnow", "3DNow! instructions"),
];

static FEATURES_8000_0007_EBX: [FeatureSpec; 4] = [
    bit!(0, AMD, "mca-overflow-recov", "MCA overflow recovery"),
    bit!(1, AMD, "succor", "software uncorrectable error containment and recovery"),
    bit!(2, AMD, "hwa", "hardware assert MSRs"),
    bit!(3, AMD, "scalable-mca", "scalable MCA"),
];

static FEATURES_8000_0007_EDX: [FeatureSpec; 13] = [
    bit!(0, AMD, "ts", "temperature sensor"),
    bit!(1, AMD, "fid", "frequency id control"),
    bit!(2, AMD, "vid", "voltage id control"),
    bit!(3, AMD, "ttp", "thermal trip"),
    bit!(4, AMD, "tm", "hardware thermal control"),
    bit!(5, AMD, "stc", "software thermal control"),
    bit!(6, AMD, "100mhzsteps", "100 MHz multiplier control"),
    bit!(7, AMD, "hwpstate", "hardware P-state control"),
    bit!(8, ANY, "invariant-tsc", "TSC rate invariant across P/C/T states"),
    bit!(9, AMD, "cpb", "core performance boost"),
    bit!(10, AMD, "efro", "read-only effective frequency interface"),
    bit!(11, AMD, "proc-feedback", "processor feedback interface"),
    bit!(12, AMD, "proc-power-reporting", "processor power reporting interface"),
];

static FEATURES_8000_000A_EDX: [FeatureSpec; 17] = [
    bit!(0, AMD, "npt", "nested paging"),
    bit!(1, AMD, "lbr-virt", "LBR virtualization"),
    bit!(2, AMD, "svm-lock", "SVM lock"),
    bit!(3, AMD, "nrip-save", "next RIP save on #VMEXIT"),
    bit!(4, AMD, "tsc-rate-msr", "MSR-based TSC rate control"),
    bit!(5, AMD, "vmcb-clean", "VMCB clean bits"),
    bit!(6, AMD, "flush-by-asid", "TLB flush selectable by ASID"),
    bit!(7, AMD, "decode-assists", "decode assists"),
    bit!(10, AMD, "pause-filter", "PAUSE intercept filter"),
    bit!(12, AMD, "pause-filter-threshold", "PAUSE filter cycle count threshold"),
    bit!(13, AMD, "avic", "advanced virtual interrupt controller"),
    bit!(15, AMD, "v-vmsave-vmload", "virtualized VMSAVE/VMLOAD"),
    bit!(16, AMD, "vgif", "virtualized global interrupt flag"),
    bit!(17, AMD, "gmet", "guest mode execution trap"),
    bit!(18, AMD, "x2avic", "virtualized x2APIC"),
    bit!(19, AMD, "sss-check", "supervisor shadow stack restrictions"),
    bit!(20, AMD, "spec-ctrl", "SPEC_CTRL virtualization"),
];

static FEATURES_8000_001A_EAX: [FeatureSpec; 3] = [
    bit!(0, AMD, "fp128", "full-width 128-bit SSE pipelines"),
    bit!(1, AMD, "movu", "efficient unaligned SSE moves"),
    bit!(2, AMD, "fp256", "full-width 256-bit AVX pipelines"),
];

static FEATURES_8000_001B_EAX: [FeatureSpec; 11] = [
    bit!(0, AMD, "ibsffv", "IBS feature flags valid"),
    bit!(1, AMD, "fetchsam", "IBS fetch sampling"),
    bit!(2, AMD, "opsam", "IBS execution sampling"),
    bit!(3, AMD, "rdwropcnt", "read/write of op counter"),
    bit!(4, AMD, "opcnt", "op counting mode"),
    bit!(5, AMD, "brntrgt", "branch target address reporting"),
    bit!(6, AMD, "opcntext", "op counters extended by 7 bits"),
    bit!(7, AMD, "ripinvalidchk", "invalid RIP indication"),
    bit!(8, AMD, "opbrnfuse", "fused branch micro-op indication"),
    bit!(9, AMD, "ibsfetchctlextd", "IBS fetch control extended MSR"),
    bit!(10, AMD, "ibsopdata4", "IBS op data 4 MSR"),
];

static FEATURES_8000_001F_EAX: [FeatureSpec; 11] = [
    bit!(0, AMD, "sme", "secure memory encryption"),
    bit!(1, AMD, "sev", "secure encrypted virtualization"),
    bit!(2, AMD, "page-flush-msr", "page flush MSR"),
    bit!(3, AMD, "sev-es", "SEV encrypted state"),
    bit!(4, AMD, "sev-snp", "SEV secure nested paging"),
    bit!(5, AMD, "vmpl", "VM permission levels"),
    bit!(10, AMD, "coherency-enforced", "hardware cache coherency across encryption domains"),
    bit!(11, AMD, "64bit-host", "SEV guests require 64-bit host"),
    bit!(12, AMD, "restricted-injection", "restricted interrupt injection"),
    bit!(13, AMD, "alternate-injection", "alternate interrupt injection"),
    bit!(14, AMD, "debug-swap", "debug register swap on guest entry"),
];

static FEATURES_8000_001F_EBX: [FeatureSpec; 2] = [
    field!(0, 5, AMD, "cbitpos", "page-table bit used to mark encrypted pages"),
    field!(6, 11, AMD, "phys-addr-reduction", "physical address bits consumed by encryption"),
];

static FEATURES_4000_0001_EAX_KVM: [FeatureSpec; 17] = [
    bit!(0, VendorMask::KVM, "kvmclock", "paravirtual clock at MSR 0x11/0x12"),
    bit!(1, VendorMask::KVM, "nop-io-delay", "no delay needed on port I/O"),
    bit!(2, VendorMask::KVM, "mmu-op", "deprecated MMU hypercalls"),
    bit!(3, VendorMask::KVM, "kvmclock2", "paravirtual clock at MSR 0x4b564d00/01"),
    bit!(4, VendorMask::KVM, "async-pf", "asynchronous page faults"),
    bit!(5, VendorMask::KVM, "steal-time", "steal time accounting"),
    bit!(6, VendorMask::KVM, "pv-eoi", "paravirtual end-of-interrupt"),
    bit!(7, VendorMask::KVM, "pv-unhalt", "paravirtual spinlock kick"),
    bit!(9, VendorMask::KVM, "pv-tlb-flush", "paravirtual TLB shootdown"),
    bit!(10, VendorMask::KVM, "async-pf-vmexit", "async page faults delivered via #VMEXIT"),
    bit!(11, VendorMask::KVM, "pv-send-ipi", "paravirtual IPI hypercall"),
    bit!(12, VendorMask::KVM, "poll-control", "host-side polling control"),
    bit!(13, VendorMask::KVM, "pv-sched-yield", "paravirtual sched yield"),
    bit!(14, VendorMask::KVM, "async-pf-int", "async page faults via interrupt"),
    bit!(15, VendorMask::KVM, "msi-ext-dest-id", "extended MSI destination ids"),
    bit!(16, VendorMask::KVM, "hc-map-gpa-range", "map GPA range hypercall"),
    bit!(24, VendorMask::KVM, "clocksource-stable", "kvmclock stable across CPUs"),
];

static FEATURES_4000_0003_EAX_HYPERV: [FeatureSpec; 13] = [
    bit!(0, VendorMask::HYPER_V, "vp-runtime", "VP runtime MSR"),
    bit!(1, VendorMask::HYPER_V, "partition-reference-counter", "partition reference counter MSR"),
    bit!(2, VendorMask::HYPER_V, "synic", "synthetic interrupt controller MSRs"),
    bit!(3, VendorMask::HYPER_V, "synthetic-timers", "synthetic timer MSRs"),
    bit!(4, VendorMask::HYPER_V, "apic-access-msrs", "APIC access MSRs"),
    bit!(5, VendorMask::HYPER_V, "hypercall-msrs", "hypercall MSRs"),
    bit!(6, VendorMask::HYPER_V, "vp-index-msr", "VP index MSR"),
    bit!(7, VendorMask::HYPER_V, "reset-msr", "system reset MSR"),
    bit!(8, VendorMask::HYPER_V, "stats-pages", "statistics pages MSRs"),
    bit!(9, VendorMask::HYPER_V, "partition-reference-tsc", "partition reference TSC MSR"),
    bit!(10, VendorMask::HYPER_V, "guest-idle-msr", "guest idle state MSR"),
    bit!(11, VendorMask::HYPER_V, "frequency-msrs", "TSC and APIC frequency MSRs"),
    bit!(12, VendorMask::HYPER_V, "debug-msrs", "guest debugging MSRs"),
];

static FEATURES_4000_0003_EDX_HYPERV: [FeatureSpec; 15] = [
    bit!(0, VendorMask::HYPER_V, "mwait", "MWAIT available (deprecated)"),
    bit!(1, VendorMask::HYPER_V, "guest-debugging", "guest debugging support"),
    bit!(2, VendorMask::HYPER_V, "performance-monitor", "performance monitor support"),
    bit!(3, VendorMask::HYPER_V, "cpu-dynamic-partitioning", "physical CPU dynamic partitioning events"),
    bit!(4, VendorMask::HYPER_V, "hypercall-xmm-input", "hypercall input via XMM registers"),
    bit!(5, VendorMask::HYPER_V, "virtual-guest-idle", "virtual guest idle state"),
    bit!(7, VendorMask::HYPER_V, "query-numa-distance", "NUMA distance query support"),
    bit!(8, VendorMask::HYPER_V, "timer-frequencies", "timer frequency determination"),
    bit!(9, VendorMask::HYPER_V, "synthetic-machine-checks", "synthetic machine check injection"),
    bit!(10, VendorMask::HYPER_V, "crash-msrs", "guest crash MSRs"),
    bit!(13, VendorMask::HYPER_V, "npiep", "non-privileged instruction execution prevention"),
    bit!(14, VendorMask::HYPER_V, "disable-hypervisor", "hypervisor disable support"),
    bit!(15, VendorMask::HYPER_V, "extended-gva-ranges", "extended GVA ranges for flush-virtual-address-list"),
    bit!(16, VendorMask::HYPER_V, "hypercall-xmm-output", "hypercall output via XMM registers"),
    bit!(17, VendorMask::HYPER_V, "sint-polling", "SINT polling mode"),
];

static FEATURES_4000_0004_EAX_HYPERV: [FeatureSpec; 15] = [
    bit!(0, VendorMask::HYPER_V, "hypercall-address-switch", "use hypercall for address space switches"),
    bit!(1, VendorMask::HYPER_V, "hypercall-local-tlb-flush", "use hypercall for local TLB flushes"),
    bit!(2, VendorMask::HYPER_V, "hypercall-remote-tlb-flush", "use hypercall for remote TLB flushes"),
    bit!(3, VendorMask::HYPER_V, "msr-apic-access", "use MSRs for APIC access"),
    bit!(4, VendorMask::HYPER_V, "msr-system-reset", "use MSR for system reset"),
    bit!(5, VendorMask::HYPER_V, "relaxed-timing", "use relaxed timing"),
    bit!(6, VendorMask::HYPER_V, "dma-remapping", "use DMA remapping"),
    bit!(7, VendorMask::HYPER_V, "interrupt-remapping", "use interrupt remapping"),
    bit!(8, VendorMask::HYPER_V, "x2apic-msrs", "use x2APIC MSRs"),
    bit!(9, VendorMask::HYPER_V, "deprecate-auto-eoi", "deprecate AutoEOI"),
    bit!(10, VendorMask::HYPER_V, "synthetic-cluster-ipi", "use synthetic cluster IPI"),
    bit!(11, VendorMask::HYPER_V, "ex-processor-masks", "use ExProcessorMasks interface"),
    bit!(12, VendorMask::HYPER_V, "nested", "running in a nested partition"),
    bit!(13, VendorMask::HYPER_V, "int-for-mbec", "use INT for MBEC system calls"),
    bit!(14, VendorMask::HYPER_V, "enlightened-vmcs", "enlightened VMCS interface"),
];

static FEATURES_XEN_HVM_EAX: [FeatureSpec; 6] = [
    bit!(0, VendorMask::XEN_HVM, "apic-access-virt", "virtualized APIC registers"),
    bit!(1, VendorMask::XEN_HVM, "x2apic-virt", "virtualized x2APIC accesses"),
    bit!(2, VendorMask::XEN_HVM, "iommu-mappings", "IOMMU mappings for other domain memory"),
    bit!(3, VendorMask::XEN_HVM, "vcpu-id", "vcpu id is present in ebx"),
    bit!(4, VendorMask::XEN_HVM, "domid", "domain id is present in ecx"),
    bit!(5, VendorMask::XEN_HVM, "direct-upcall", "per-vcpu event channel upcalls"),
];

/// The single source of truth for named bits: full-leaf rendering and
/// single-flag queries both resolve through this table.
pub static CATALOGUE: &[CatalogueEntry] = &[
    CatalogueEntry {
        leaf: 0x0000_0001,
        subleaf: 0,
        register: RegisterName::EDX,
        vendors: ANY,
        title: "Feature Identifiers",
        specs: &FEATURES_0000_0001_EDX,
    },
    CatalogueEntry {
        leaf: 0x0000_0001,
        subleaf: 0,
        register: RegisterName::ECX,
        vendors: ANY,
        title: "Feature Identifiers",
        specs: &FEATURES_0000_0001_ECX,
    },
    CatalogueEntry {
        leaf: 0x0000_0007,
        subleaf: 0,
        register: RegisterName::EBX,
        vendors: ANY,
        title: "Structured Extended Feature Identifiers",
        specs: &FEATURES_0000_0007_0_EBX,
    },
    CatalogueEntry {
        leaf: 0x0000_0007,
        subleaf: 0,
        register: RegisterName::ECX,
        vendors: ANY,
        title: "Structured Extended Feature Identifiers",
        specs: &FEATURES_0000_0007_0_ECX,
    },
    CatalogueEntry {
        leaf: 0x0000_0007,
        subleaf: 0,
        register: RegisterName::EDX,
        vendors: ANY,
        title: "Structured Extended Feature Identifiers",
        specs: &FEATURES_0000_0007_0_EDX,
    },
    CatalogueEntry {
        leaf: 0x4000_0001,
        subleaf: 0,
        register: RegisterName::EAX,
        vendors: VendorMask::KVM,
        title: "KVM Feature Identification",
        specs: &FEATURES_4000_0001_EAX_KVM,
    },
    CatalogueEntry {
        leaf: 0x4000_0003,
        subleaf: 0,
        register: RegisterName::EAX,
        vendors: VendorMask::HYPER_V,
        title: "Hyper-V Partition Privileges",
        specs: &FEATURES_4000_0003_EAX_HYPERV,
    },
    CatalogueEntry {
        leaf: 0x4000_0003,
        subleaf: 0,
        register: RegisterName::EDX,
        vendors: VendorMask::HYPER_V,
        title: "Hyper-V Feature Identification",
        specs: &FEATURES_4000_0003_EDX_HYPERV,
    },
    CatalogueEntry {
        leaf: 0x4000_0004,
        subleaf: 0,
        register: RegisterName::EAX,
        vendors: VendorMask::HYPER_V,
        title: "Hyper-V Enlightenment Recommendations",
        specs: &FEATURES_4000_0004_EAX_HYPERV,
    },
    CatalogueEntry {
        leaf: 0x4000_0004,
        subleaf: 0,
        register: RegisterName::EAX,
        vendors: VendorMask::XEN_HVM,
        title: "Xen HVM Features",
        specs: &FEATURES_XEN_HVM_EAX,
    },
    CatalogueEntry {
        leaf: 0x4000_0104,
        subleaf: 0,
        register: RegisterName::EAX,
        vendors: VendorMask::XEN_HVM,
        title: "Xen HVM Features",
        specs: &FEATURES_XEN_HVM_EAX,
    },
    CatalogueEntry {
        leaf: 0x8000_0001,
        subleaf: 0,
        register: RegisterName::ECX,
        vendors: ANY,
        title: "Feature Identifiers",
        specs: &FEATURES_8000_0001_ECX,
    },
    CatalogueEntry {
        leaf: 0x8000_0001,
        subleaf: 0,
        register: RegisterName::EDX,
        vendors: ANY,
        title: "Feature Identifiers",
        specs: &FEATURES_8000_0001_EDX,
    },
    CatalogueEntry {
        leaf: 0x8000_0007,
        subleaf: 0,
        register: RegisterName::EBX,
        vendors: AMD,
        title: "RAS Capabilities",
        specs: &FEATURES_8000_0007_EBX,
    },
    CatalogueEntry {
        leaf: 0x8000_0007,
        subleaf: 0,
        register: RegisterName::EDX,
        vendors: ANY,
        title: "Advanced Power Management Information",
        specs: &FEATURES_8000_0007_EDX,
    },
    CatalogueEntry {
        leaf: 0x8000_000A,
        subleaf: 0,
        register: RegisterName::EDX,
        vendors: AMD,
        title: "SVM Feature Identifiers",
        specs: &FEATURES_8000_000A_EDX,
    },
    CatalogueEntry {
        leaf: 0x8000_001A,
        subleaf: 0,
        register: RegisterName::EAX,
        vendors: AMD,
        title: "Performance Optimization Identifiers",
        specs: &FEATURES_8000_001A_EAX,
    },
    CatalogueEntry {
        leaf: 0x8000_001B,
        subleaf: 0,
        register: RegisterName::EAX,
        vendors: AMD,
        title: "Instruction Based Sampling Identifiers",
        specs: &FEATURES_8000_001B_EAX,
    },
    CatalogueEntry {
        leaf: 0x8000_001F,
        subleaf: 0,
        register: RegisterName::EAX,
        vendors: AMD,
        title: "Encrypted Memory Capabilities",
        specs: &FEATURES_8000_001F_EAX,
    },
    CatalogueEntry {
        leaf: 0x8000_001F,
        subleaf: 0,
        register: RegisterName::EBX,
        vendors: AMD,
        title: "Encrypted Memory Capabilities",
        specs: &FEATURES_8000_001F_EBX,
    },
];

/// Resolve a mnemonic against the catalogue for one register key.
pub fn find(
    leaf: LeafId,
    subleaf: SubleafId,
    register: RegisterName,
    vendor: VendorMask,
    mnemonic: &str,
) -> Option<&'static FeatureSpec> {
    for entry in CATALOGUE {
        if entry.leaf != leaf || entry.subleaf != subleaf || entry.register != register {
            continue;
        }
        if !entry.vendors.intersects(vendor) {
            continue;
        }
        for spec in entry.specs {
            if spec.vendors.intersects(vendor) && spec.mnemonic.eq_ignore_ascii_case(mnemonic) {
                return Some(spec);
            }
        }
    }
    None
}

#[derive(Debug)]
/// A feature observed in a snapshot, ready for rendering.
pub struct DetectedFeature {
    pub leaf: LeafId,
    pub subleaf: SubleafId,
    pub register: RegisterName,
    pub title: &'static str,
    pub bits: FeatureBits,
    pub value: u32,
    pub mnemonic: &'static str,
    pub description: &'static str,
}

impl fmt::Display for DetectedFeature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.bits {
            FeatureBits::Bit(bit) => {
                write!(f, "{:<22} {:>5}  {}", self.mnemonic, bit, self.description)?;
                if self.value == 0 {
                    write!(f, " = 0")?;
                }
                Ok(())
            }
            FeatureBits::Field { lo, hi } => {
                let range = format!("{}:{}", hi, lo);
                write!(
                    f,
                    "{:<22} {:>5}  {} = {}",
                    self.mnemonic, range, self.description, self.value
                )
            }
        }
    }
}

#[derive(Debug)]
pub struct FeatureVec(pub Vec<DetectedFeature>);

impl FeatureVec {
    pub fn new() -> FeatureVec {
        FeatureVec(vec![])
    }
}

impl Default for FeatureVec {
    fn default() -> FeatureVec {
        FeatureVec::new()
    }
}

/// Collect every catalogued feature the snapshot advertises. `vendor` is
/// the gating mask (pass `VendorMask::all()` to disable vendor gating);
/// `include_unlit` reports zero-valued entries as well.
pub fn describe_features(
    snapshot: &CpuSnapshot,
    vendor: VendorMask,
    include_unlit: bool,
) -> FeatureVec {
    let mut output = FeatureVec::new();
    for entry in CATALOGUE {
        if !entry.vendors.intersects(vendor) {
            continue;
        }
        let regs = match snapshot.get_subleaf(entry.leaf, entry.subleaf) {
            Some(regs) => regs,
            None => continue,
        };
        let register = regs.register(entry.register);
        for spec in entry.specs {
            if spec.mnemonic.is_empty() || !spec.vendors.intersects(vendor) {
                continue;
            }
            let value = spec.bits.extract(register);
            if value == 0 && !include_unlit {
                continue;
            }
            output.0.push(DetectedFeature {
                leaf: entry.leaf,
                subleaf: entry.subleaf,
                register: entry.register,
                title: entry.title,
                bits: spec.bits,
                value,
                mnemonic: spec.mnemonic,
                description: spec.description,
            });
        }
    }
    output
}

impl fmt::Display for FeatureVec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Features:")?;
        let mut last_key: Option<(LeafId, SubleafId, RegisterName)> = None;
        for feature in &self.0 {
            let key = (feature.leaf, feature.subleaf, feature.register);
            if last_key != Some(key) {
                if last_key.is_some() {
                    writeln!(f)?;
                }
                writeln!(
                    f,
                    "  leaf 0x{:08x} subleaf 0x{:02x}, register {} ({})",
                    feature.leaf, feature.subleaf, feature.register, feature.title
                )?;
                last_key = Some(key);
            }
            let formatted = format!("{}\n", feature);
            write!(f, "{}", indent(&formatted, "    "))?;
        }
        Ok(())
    }
}
