use cpudiag::cpuid::RegisterName;
use cpudiag::flag::{parse_flag_spec, FlagSpec, WHOLE_REGISTER};

fn spec(
    eax: u32,
    ecx: u32,
    register: RegisterName,
    name: &str,
    lo: u32,
    hi: u32,
) -> FlagSpec {
    FlagSpec {
        selector_eax: eax,
        selector_ecx: ecx,
        register,
        name: name.to_string(),
        bit_lo: lo,
        bit_hi: hi,
    }
}

#[test]
fn flag_spec_cracking() {
    use RegisterName::*;

    let whole = WHOLE_REGISTER;
    let cases: Vec<(&str, FlagSpec)> = vec![
        ("CPUID.01:ECX[SSE4.2]", spec(0x1, 0x0, ECX, "sse4.2", whole, whole)),
        ("CPUID.01:ECX.MOVBE[bit 22]", spec(0x1, 0x0, ECX, "movbe", 22, 22)),
        ("CPUID.01H.EDX.SSE[bit 25]", spec(0x1, 0x0, EDX, "sse", 25, 25)),
        (
            "CPUID.(EAX=07H, ECX=0H):EBX.BMI1[bit 3]",
            spec(0x7, 0x0, EBX, "bmi1", 3, 3),
        ),
        (
            "CPUID.EAX=80000001H:ECX.LZCNT[bit 5]",
            spec(0x8000_0001, 0x0, ECX, "lzcnt", 5, 5),
        ),
        ("CPUID.(EAX=07H, ECX=0H):EBX[bit 9]", spec(0x7, 0x0, EBX, "", 9, 9)),
        ("CPUID.(EAX=0DH,ECX=0):EAX[4:3]", spec(0xD, 0x0, EAX, "", 3, 4)),
        ("CPUID.(EAX=0DH,ECX=0):EAX[9]", spec(0xD, 0x0, EAX, "", 9, 9)),
        ("CPUID.1:ECX.OSXSAVE[bit 27]", spec(0x1, 0x0, ECX, "osxsave", 27, 27)),
        ("CPUID.1:ECX.OSXSAVE", spec(0x1, 0x0, ECX, "osxsave", whole, whole)),
        ("CPUID.(EAX=0DH,ECX=0):EBX", spec(0xD, 0x0, EBX, "", whole, whole)),
        (
            "CPUID.0x7.0:EBX.AVX512PF[bit 26]",
            spec(0x7, 0x0, EBX, "avx512pf", 26, 26),
        ),
        (
            "CPUID.(EAX=0DH, ECX=04H).EBX[31:0]",
            spec(0xD, 0x4, EBX, "", 0, 31),
        ),
        (
            "CPUID.(EAX=07H,ECX=0H):ECX.MAWAU[bits 21:17]",
            spec(0x7, 0x0, ECX, "mawau", 17, 21),
        ),
        (
            "CPUID.(EAX=07H, ECX=0H).EBX.MPX ",
            spec(0x7, 0x0, EBX, "mpx", whole, whole),
        ),
        ("CPUID.1.ECX", spec(0x1, 0x0, ECX, "", whole, whole)),
        (
            "CPUID.(EAX=07H, ECX=0H):EBX[SGX]",
            spec(0x7, 0x0, EBX, "sgx", whole, whole),
        ),
        ("CPUID.80000008H:EAX[7:0]", spec(0x8000_0008, 0x0, EAX, "", 0, 7)),
        ("CPUID.1.EBX[23:16]", spec(0x1, 0x0, EBX, "", 16, 23)),
        (
            "CPUID.(EAX=07H, ECX=0H):EBX.INVPCID (bit 10)",
            spec(0x7, 0x0, EBX, "invpcid", 10, 10),
        ),
        (
            "CPUID.80000001H:ECX.LAHF-SAHF[bit 0]",
            spec(0x8000_0001, 0x0, ECX, "lahf-sahf", 0, 0),
        ),
        (
            "CPUID.01H:ECX.POPCNT [Bit 23]",
            spec(0x1, 0x0, ECX, "popcnt", 23, 23),
        ),
        (
            "CPUID.(EAX=0DH,ECX=1):EAX.XSS[bit 3]",
            spec(0xD, 0x1, EAX, "xss", 3, 3),
        ),
        (
            "CPUID.80000008H:EAX[bits 7-0]",
            spec(0x8000_0008, 0x0, EAX, "", 0, 7),
        ),
    ];

    for (input, expected) in cases {
        let parsed = parse_flag_spec(input).unwrap_or_else(|err| {
            panic!("{:?} failed to parse: {}", input, err);
        });
        assert_eq!(parsed, expected, "mismatch for {:?}", input);
    }
}

#[test]
fn rejects_garbage() {
    assert!(parse_flag_spec("FOO.01:ECX").is_err());
    assert!(parse_flag_spec("CPUID.01:EFX").is_err());
    assert!(parse_flag_spec("CPUID.01:ECX[").is_err());
    assert!(parse_flag_spec("CPUID.01:ECX[bit]").is_err());
    assert!(parse_flag_spec("CPUID.01:ECX extra").is_err());
}
