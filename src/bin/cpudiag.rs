use getopts::Options;
use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::process;

use cpudiag::cpuid::{CpuSnapshot, VendorMask};
use cpudiag::dump::{self, DumpFormat};
use cpudiag::enumerate::{self, EnumerateOptions};
use cpudiag::feature;
use cpudiag::flag;
use cpudiag::topology;
use cpudiag::Error;

fn usage(program: &str, opts: &Options) -> String {
    opts.usage(&format!("Usage: {} [options]", program))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("", "dump", "emit a native dump to stdout");
    opts.optopt(
        "",
        "read-dump",
        "read a dump instead of querying the host",
        "PATH",
    );
    opts.optopt(
        "",
        "format",
        "dump format: native, etallen, libcpuid, instlat",
        "FORMAT",
    );
    opts.optopt("", "cpu", "restrict output to one APIC id", "APIC_ID");
    opts.optopt("", "flag", "evaluate one flag specification", "SPEC");
    opts.optflag("", "topology", "print the reconstructed topology");
    opts.optflag(
        "",
        "brute-force",
        "probe every leaf up to each range maximum",
    );
    opts.optflag("", "ignore-vendor", "disable vendor gating");
    opts.optflag("", "ignore-feature", "disable feature-bit gating");
    opts.optflag("h", "help", "print this help text");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(failure) => {
            eprintln!("{}: {}", program, failure);
            process::exit(1);
        }
    };

    if matches.opt_present("help") {
        print!("{}", usage(&program, &opts));
        return;
    }

    match run(&matches) {
        Ok(()) => {}
        Err(err) => {
            eprintln!("{}: {}", program, err);
            process::exit(err.exit_code());
        }
    }
}

fn run(matches: &getopts::Matches) -> Result<(), Error> {
    let options = EnumerateOptions {
        brute_force: matches.opt_present("brute-force"),
        ignore_vendor: matches.opt_present("ignore-vendor"),
        ignore_feature: matches.opt_present("ignore-feature"),
    };

    let mut cpus = match matches.opt_str("read-dump") {
        Some(path) => {
            let format: DumpFormat = matches
                .opt_str("format")
                .map(|name| name.parse())
                .transpose()?
                .unwrap_or(DumpFormat::Native);
            let file = File::open(path)?;
            dump::read_dump(BufReader::new(file), format)?
        }
        None => enumerate::enumerate_processors(&options)?,
    };

    if let Some(filter) = matches.opt_str("cpu") {
        let apic_id: u32 = filter.parse().map_err(|_| Error::ParseDump {
            line: 0,
            content: format!("invalid APIC id {:?}", filter),
        })?;
        cpus.retain(|key, _| *key == apic_id);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if matches.opt_present("dump") {
        dump::write_native(&mut out, &cpus)?;
        return Ok(());
    }

    if let Some(spec_text) = matches.opt_str("flag") {
        let spec = flag::parse_flag_spec(&spec_text)?;
        for (apic_id, snapshot) in &cpus {
            match flag::evaluate(snapshot, &spec, options.ignore_feature)? {
                Some(value) => writeln!(out, "CPU {}: {}", apic_id, value)?,
                None => writeln!(out, "CPU {}: leaf not present", apic_id)?,
            }
        }
        return Ok(());
    }

    if matches.opt_present("topology") {
        write!(out, "{}", topology::build_topology(&cpus))?;
        return Ok(());
    }

    decode(&mut out, &cpus, &options)
}

fn decode<W: Write>(
    out: &mut W,
    cpus: &BTreeMap<u32, CpuSnapshot>,
    options: &EnumerateOptions,
) -> Result<(), Error> {
    for (apic_id, snapshot) in cpus {
        writeln!(out, "CPU {} (apic id 0x{:x}):", apic_id, snapshot.apic_id)?;
        writeln!(out, "  vendor: {}", snapshot.vendor)?;
        if let Some(brand) = snapshot.brand_string() {
            writeln!(out, "  brand: {}", brand)?;
        }
        writeln!(out, "  signature: {}", snapshot.model)?;

        let vendor = if options.ignore_vendor {
            VendorMask::all()
        } else {
            snapshot.vendor
        };
        let features = feature::describe_features(snapshot, vendor, options.ignore_feature);
        write!(out, "{}", features)?;
        write!(out, "{}", topology::describe_caches(snapshot))?;
        writeln!(out)?;
    }
    Ok(())
}
