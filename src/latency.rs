use log::debug;
use std::fmt;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use crate::cpuid;
use crate::error::Error;
use crate::timing::{self, PingSlot, PriorityBoost};

const NANOSECONDS_PER_SECOND: u64 = 1_000_000_000;

/// Which ordered pairs to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSelection {
    /// Every `(source, destination)` with `source != destination`.
    All,
    /// Each CPU pinging only its successor, `(i, (i + 1) % n)`.
    Ring,
}

impl std::str::FromStr for PairSelection {
    type Err = Error;

    fn from_str(input: &str) -> Result<PairSelection, Error> {
        match input.to_ascii_lowercase().as_str() {
            "all" => Ok(PairSelection::All),
            "ring" => Ok(PairSelection::Ring),
            _ => Err(Error::ParseDump {
                line: 0,
                content: format!("unknown pair selection {:?}", input),
            }),
        }
    }
}

/// Round-trip results in nanoseconds, indexed `[source][destination]`.
/// The diagonal is reserved; unmeasured pairs stay empty.
pub struct LatencyMatrix {
    cpu_count: usize,
    cells: Vec<Option<f64>>,
}

impl LatencyMatrix {
    pub fn new(cpu_count: usize) -> LatencyMatrix {
        LatencyMatrix {
            cpu_count,
            cells: vec![None; cpu_count * cpu_count],
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    pub fn get(&self, source: usize, destination: usize) -> Option<f64> {
        self.cells[source * self.cpu_count + destination]
    }

    pub fn set(&mut self, source: usize, destination: usize, nanoseconds: f64) {
        self.cells[source * self.cpu_count + destination] = Some(nanoseconds);
    }
}

impl fmt::Display for LatencyMatrix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "       \\ core-to-core ping time/ns")?;
        writeln!(f, "        \\ destination")?;
        write!(f, " source  \\ ")?;
        for destination in 0..self.cpu_count {
            write!(f, "{:>5}|", destination)?;
        }
        writeln!(f)?;
        write!(f, "__________\\")?;
        for _ in 0..self.cpu_count {
            write!(f, "_____|")?;
        }
        writeln!(f)?;
        for source in 0..self.cpu_count {
            write!(f, "{:>9} |", source)?;
            for destination in 0..self.cpu_count {
                match self.get(source, destination) {
                    Some(nanoseconds) => write!(f, "{:>5.0}|", nanoseconds)?,
                    None => write!(f, "{:>5}|", "-")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Refuse to time anything on hardware whose TSC stops or rescales with
/// power management: extended leaf 0x8000_0007 must exist and advertise
/// the invariant TSC bit.
pub fn verify_invariant_tsc() -> Result<(), Error> {
    let extended = cpuid::execute(cpuid::EXTENDED_BASE, 0);
    if extended.eax < 0x8000_0007 {
        return Err(Error::UnsupportedHardware(
            "no advanced power management leaf",
        ));
    }
    let apm = cpuid::execute(0x8000_0007, 0);
    if apm.edx & (1 << 8) == 0 {
        return Err(Error::UnsupportedHardware("no invariant TSC"));
    }
    Ok(())
}

/// Both probe threads block here, after pinning and boosting, until the
/// pair is ready; the hot loop itself never blocks.
struct StartGate {
    started: Mutex<usize>,
    ready: Condvar,
}

impl StartGate {
    fn new() -> StartGate {
        StartGate {
            started: Mutex::new(0),
            ready: Condvar::new(),
        }
    }

    fn arrive_and_wait(&self, total: usize) {
        let mut started = self.started.lock().unwrap();
        *started += 1;
        if *started >= total {
            self.ready.notify_all();
        } else {
            while *started < total {
                started = self.ready.wait(started).unwrap();
            }
        }
    }
}

/// One ordered pair. The source spins for an empty slot, takes a
/// serialized TSC, and posts it; the destination spins for the
/// timestamp, takes a serialized RDTSCP, banks the overhead-corrected
/// delta in a thread-local sum, and clears the slot. Mean ticks convert
/// to nanoseconds through the calibrated rate.
pub fn measure_pair(source: usize, destination: usize, iterations: usize) -> Result<f64, Error> {
    let slot = PingSlot::new();
    let gate = StartGate::new();
    let abort = AtomicBool::new(false);
    let overhead = timing::overhead();

    let running_sum = thread::scope(|scope| {
        let sender = scope.spawn(|| -> Result<(), Error> {
            let pinned = timing::pin_to(source);
            if pinned.is_err() {
                abort.store(true, Ordering::Release);
            }
            let _boost = PriorityBoost::acquire();
            gate.arrive_and_wait(2);
            pinned?;
            if abort.load(Ordering::Acquire) {
                return Ok(());
            }

            // One register-held address for the hot loop: a single load
            // per spin iteration, no reload of the slot's address.
            let ping = &slot.value;
            for _ in 0..iterations {
                while ping.load(Ordering::Acquire) != 0 {
                    spin_loop();
                }
                let sent = timing::serialized_rdtsc();
                ping.store(sent, Ordering::Release);
            }
            Ok(())
        });

        let receiver = scope.spawn(|| -> Result<u64, Error> {
            let pinned = timing::pin_to(destination);
            if pinned.is_err() {
                abort.store(true, Ordering::Release);
            }
            let _boost = PriorityBoost::acquire();
            gate.arrive_and_wait(2);
            pinned?;
            if abort.load(Ordering::Acquire) {
                return Ok(0);
            }

            let ping = &slot.value;
            let mut sum = 0u64;
            for _ in 0..iterations {
                let mut sent = ping.load(Ordering::Acquire);
                while sent == 0 {
                    spin_loop();
                    sent = ping.load(Ordering::Acquire);
                }
                let received = timing::rdtscp_serialized();
                ping.store(0, Ordering::Release);
                sum += received.wrapping_sub(sent).saturating_sub(overhead);
            }
            Ok(sum)
        });

        let send_result = sender.join().expect("probe source thread panicked");
        let recv_result = receiver.join().expect("probe destination thread panicked");
        send_result.and(recv_result)
    })?;

    let mean_cycles = running_sum as f64 / iterations as f64;
    let nanoseconds_per_cycle = NANOSECONDS_PER_SECOND as f64 / timing::tick_rate() as f64;
    Ok(mean_cycles * nanoseconds_per_cycle)
}

/// Measure the selected ordered pairs across every logical CPU.
pub fn measure(iterations: usize, selection: PairSelection) -> Result<LatencyMatrix, Error> {
    let cpu_count = num_cpus::get();
    let mut matrix = LatencyMatrix::new(cpu_count);

    for source in 0..cpu_count {
        for destination in 0..cpu_count {
            if source == destination {
                continue;
            }
            if selection == PairSelection::Ring && destination != (source + 1) % cpu_count {
                continue;
            }
            let nanoseconds = measure_pair(source, destination, iterations)?;
            debug!(
                "pair ({}, {}): {:.1} ns per ping",
                source, destination, nanoseconds
            );
            matrix.set(source, destination, nanoseconds);
        }
    }

    Ok(matrix)
}
