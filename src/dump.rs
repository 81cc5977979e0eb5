use scan_fmt::scan_fmt;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::str::FromStr;

use crate::cpuid::{apic_id_from_leaves, CpuSnapshot, LeafMap, Registers};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Native,
    Etallen,
    Libcpuid,
    Instlat,
}

impl FromStr for DumpFormat {
    type Err = Error;

    fn from_str(input: &str) -> Result<DumpFormat, Error> {
        match input.to_ascii_lowercase().as_str() {
            "native" => Ok(DumpFormat::Native),
            "etallen" => Ok(DumpFormat::Etallen),
            "libcpuid" => Ok(DumpFormat::Libcpuid),
            "instlat" => Ok(DumpFormat::Instlat),
            _ => Err(Error::ParseDump {
                line: 0,
                content: format!("unknown dump format {:?}", input),
            }),
        }
    }
}

/// Write the native line-oriented dump. Leaf-major BTreeMap iteration
/// keeps the output stable, which the read path and the round-trip tests
/// rely on.
pub fn write_native<W: Write>(
    out: &mut W,
    cpus: &BTreeMap<u32, CpuSnapshot>,
) -> Result<(), Error> {
    for (apic_id, snapshot) in cpus {
        writeln!(out, "CPU {}:", apic_id)?;
        for (leaf, subleaves) in &snapshot.leaves {
            for (subleaf, regs) in subleaves {
                writeln!(
                    out,
                    "   leaf 0x{:08x} subleaf 0x{:08x} = 0x{:08x} 0x{:08x} 0x{:08x} 0x{:08x}",
                    leaf, subleaf, regs.eax, regs.ebx, regs.ecx, regs.edx
                )?;
            }
        }
    }
    Ok(())
}

/// Read a dump in any supported format. Only the native reader is
/// strict; the third-party readers skip lines they do not understand,
/// since those files carry decoded prose around the raw registers.
pub fn read_dump<R: BufRead>(
    input: R,
    format: DumpFormat,
) -> Result<BTreeMap<u32, CpuSnapshot>, Error> {
    match format {
        DumpFormat::Native => read_native(input),
        DumpFormat::Etallen => read_etallen(input),
        DumpFormat::Libcpuid => read_libcpuid(input),
        DumpFormat::Instlat => read_instlat(input),
    }
}

fn finish(cpus: &mut BTreeMap<u32, CpuSnapshot>, apic_id: u32, leaves: LeafMap) {
    if !leaves.is_empty() {
        cpus.insert(apic_id, CpuSnapshot::from_leaves(apic_id, leaves));
    }
}

/// Strict native reader. Vendor and model are re-derived from the
/// registers themselves; the file carries no decoded metadata.
pub fn read_native<R: BufRead>(input: R) -> Result<BTreeMap<u32, CpuSnapshot>, Error> {
    let mut cpus = BTreeMap::new();
    let mut current: Option<(u32, LeafMap)> = None;

    for (index, line) in input.lines().enumerate() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        if let Ok(apic_id) = scan_fmt!(text, "CPU {d}:", u32) {
            if let Some((previous, leaves)) = current.take() {
                finish(&mut cpus, previous, leaves);
            }
            current = Some((apic_id, LeafMap::new()));
            continue;
        }

        if let Ok((leaf, subleaf, eax, ebx, ecx, edx)) = scan_fmt!(
            text,
            "leaf 0x{x} subleaf 0x{x} = 0x{x} 0x{x} 0x{x} 0x{x}",
            [hex u32],
            [hex u32],
            [hex u32],
            [hex u32],
            [hex u32],
            [hex u32]
        ) {
            match current.as_mut() {
                Some((_, leaves)) => {
                    leaves
                        .entry(leaf)
                        .or_default()
                        .insert(subleaf, Registers::new(eax, ebx, ecx, edx));
                    continue;
                }
                None => {
                    return Err(Error::ParseDump {
                        line: index + 1,
                        content: line,
                    })
                }
            }
        }

        return Err(Error::ParseDump {
            line: index + 1,
            content: line,
        });
    }

    if let Some((apic_id, leaves)) = current.take() {
        finish(&mut cpus, apic_id, leaves);
    }
    Ok(cpus)
}

/// Reader for `cpuid -r` style dumps: `CPU n:` headers followed by
/// `0xLLLLLLLL 0xSS: eax=0x... ebx=0x... ecx=0x... edx=0x...` lines.
fn read_etallen<R: BufRead>(input: R) -> Result<BTreeMap<u32, CpuSnapshot>, Error> {
    let mut cpus = BTreeMap::new();
    let mut current: Option<(u32, LeafMap)> = None;

    for line in input.lines() {
        let line = line?;
        let text = line.trim();

        if let Ok(index) = scan_fmt!(text, "CPU {d}:", u32) {
            if let Some((previous, leaves)) = current.take() {
                finish(&mut cpus, previous, leaves);
            }
            current = Some((index, LeafMap::new()));
            continue;
        }

        if let Ok((leaf, subleaf, eax, ebx, ecx, edx)) = scan_fmt!(
            text,
            "0x{x} 0x{x}: eax=0x{x} ebx=0x{x} ecx=0x{x} edx=0x{x}",
            [hex u32],
            [hex u32],
            [hex u32],
            [hex u32],
            [hex u32],
            [hex u32]
        ) {
            if let Some((_, leaves)) = current.as_mut() {
                leaves
                    .entry(leaf)
                    .or_default()
                    .insert(subleaf, Registers::new(eax, ebx, ecx, edx));
            }
        }
    }

    if let Some((index, leaves)) = current.take() {
        finish(&mut cpus, index, leaves);
    }
    Ok(relabel_by_apic(cpus))
}

/// Reader for libcpuid raw files: `basic_cpuid[i]=`, `ext_cpuid[i]=` and
/// `intel_fn*[i]=` records describing a single processor.
fn read_libcpuid<R: BufRead>(input: R) -> Result<BTreeMap<u32, CpuSnapshot>, Error> {
    let mut leaves = LeafMap::new();

    for line in input.lines() {
        let line = line?;
        let text = line.trim();

        let keys: [(&str, u32, bool); 6] = [
            ("basic_cpuid", 0x0000_0000, false),
            ("ext_cpuid", 0x8000_0000, false),
            ("intel_fn4", 0x0000_0004, true),
            ("intel_fn11", 0x0000_000B, true),
            ("intel_fn12h", 0x0000_0012, true),
            ("intel_fn14h", 0x0000_0014, true),
        ];

        for (key, base, indexed) in &keys {
            let pattern = format!("{}[{{d}}]={{x}} {{x}} {{x}} {{x}}", key);
            if let Ok((index, eax, ebx, ecx, edx)) = scan_fmt!(
                text,
                &pattern,
                u32,
                [hex u32],
                [hex u32],
                [hex u32],
                [hex u32]
            ) {
                let (leaf, subleaf) = if *indexed {
                    (*base, index)
                } else {
                    (*base + index, 0)
                };
                leaves
                    .entry(leaf)
                    .or_default()
                    .insert(subleaf, Registers::new(eax, ebx, ecx, edx));
                break;
            }
        }
    }

    let mut cpus = BTreeMap::new();
    finish(&mut cpus, 0, leaves);
    Ok(relabel_by_apic(cpus))
}

/// Reader for InstLatx64 dumps: `CPUID llllllll: eax-ebx-ecx-edx`
/// optionally tagged `[SL nn]`. A fresh leaf 0 line opens the next CPU;
/// untagged repeats of one leaf are successive subleaves.
fn read_instlat<R: BufRead>(input: R) -> Result<BTreeMap<u32, CpuSnapshot>, Error> {
    let mut cpus = BTreeMap::new();
    let mut ordinal = 0u32;
    let mut leaves = LeafMap::new();

    for line in input.lines() {
        let line = line?;
        let text = line.trim();

        let parsed = scan_fmt!(
            text,
            "CPUID {x}: {x}-{x}-{x}-{x} [SL {x}]",
            [hex u32],
            [hex u32],
            [hex u32],
            [hex u32],
            [hex u32],
            [hex u32]
        )
        .map(|(leaf, eax, ebx, ecx, edx, subleaf)| (leaf, eax, ebx, ecx, edx, Some(subleaf)))
        .or_else(|_| {
            scan_fmt!(
                text,
                "CPUID {x}: {x}-{x}-{x}-{x}",
                [hex u32],
                [hex u32],
                [hex u32],
                [hex u32],
                [hex u32]
            )
            .map(|(leaf, eax, ebx, ecx, edx)| (leaf, eax, ebx, ecx, edx, None))
        });

        let (leaf, eax, ebx, ecx, edx, tagged) = match parsed {
            Ok(values) => values,
            Err(_) => continue,
        };

        if leaf == 0 && !leaves.is_empty() && leaves.contains_key(&0) {
            finish(&mut cpus, ordinal, std::mem::take(&mut leaves));
            ordinal += 1;
        }

        let subleaves = leaves.entry(leaf).or_default();
        let subleaf = tagged.unwrap_or_else(|| {
            subleaves.keys().next_back().map_or(0, |last| last + 1)
        });
        subleaves.insert(subleaf, Registers::new(eax, ebx, ecx, edx));
    }

    finish(&mut cpus, ordinal, leaves);
    Ok(relabel_by_apic(cpus))
}

/// The third-party formats key processors by file order; re-key them by
/// the APIC id observed in their own leaves so downstream topology code
/// sees the same shape as a live enumeration.
fn relabel_by_apic(cpus: BTreeMap<u32, CpuSnapshot>) -> BTreeMap<u32, CpuSnapshot> {
    let mut relabeled = BTreeMap::new();
    for (ordinal, snapshot) in cpus {
        let apic_id = apic_id_from_leaves(&snapshot.leaves).unwrap_or(ordinal);
        let key = if relabeled.contains_key(&apic_id) {
            ordinal
        } else {
            apic_id
        };
        relabeled.insert(key, CpuSnapshot { apic_id: key, ..snapshot });
    }
    relabeled
}
