use getopts::Options;
use std::env;
use std::process;

use cpudiag::cpuid;
use cpudiag::latency::{self, PairSelection};
use cpudiag::timing;
use cpudiag::Error;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt(
        "",
        "iterations",
        "pings per measured pair (default 100000)",
        "COUNT",
    );
    opts.optopt("", "pairs", "pair selection: all or ring", "WHICH");
    opts.optflag("h", "help", "print this help text");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(failure) => {
            eprintln!("{}: {}", program, failure);
            process::exit(1);
        }
    };

    if matches.opt_present("help") {
        print!("{}", opts.usage(&format!("Usage: {} [options]", program)));
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
    let iterations = match matches.opt_str("iterations") {
        Some(count) => count.parse().map_err(|_| Error::ParseDump {
            line: 0,
            content: format!("invalid iteration count {:?}", count),
        })?,
        None => timing::ITERATION_COUNT,
    };
    let selection = matches
        .opt_str("pairs")
        .map(|name| name.parse())
        .transpose()?
        .unwrap_or(PairSelection::All);

    latency::verify_invariant_tsc()?;

    let extended = cpuid::execute(cpuid::EXTENDED_BASE, 0);
    if extended.eax >= 0x8000_0004 {
        let snapshot = cpudiag::enumerate::snapshot_current(&Default::default());
        if let Some(brand) = snapshot.brand_string() {
            println!("{}", brand);
        }
    }

    println!("rdtsc ticks at {} ticks per second", timing::tick_rate());
    println!(
        "measurement overhead in ticks: {}",
        timing::overhead()
    );

    let matrix = latency::measure(iterations, selection)?;
    print!("{}", matrix);
    Ok(())
}
