use log::{debug, warn};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::cpuid;
use crate::error::Error;

/// Inner-loop length shared by the overhead estimator and the probe.
pub const ITERATION_COUNT: usize = 100_000;

const NANOSECONDS_PER_SECOND: u64 = 1_000_000_000;

#[cfg(target_arch = "x86")]
use core::arch::x86::{__rdtscp, _rdtsc};
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::{__rdtscp, _rdtsc};

/// A `u64` slot on its own cache line, so the probe's ping traffic never
/// false-shares with anything the measuring thread keeps nearby.
#[repr(align(64))]
pub struct PingSlot {
    pub value: AtomicU64,
}

impl PingSlot {
    pub fn new() -> PingSlot {
        PingSlot {
            value: AtomicU64::new(0),
        }
    }
}

impl Default for PingSlot {
    fn default() -> PingSlot {
        PingSlot::new()
    }
}

/// Serializing read of the time-stamp counter. The CPUID execution ahead
/// of RDTSC keeps instructions from after the call out of the measured
/// region; CPUID remains the only dependable cross-vendor serializer.
pub fn serialized_rdtsc() -> u64 {
    cpuid::execute(0, 0);
    unsafe { _rdtsc() }
}

/// RDTSCP followed by a serializing CPUID, so nothing from before the
/// call drifts past the read.
pub fn rdtscp_serialized() -> u64 {
    let stamp = raw_rdtscp();
    cpuid::execute(0, 0);
    stamp
}

fn raw_rdtscp() -> u64 {
    let mut aux = 0u32;
    unsafe { __rdtscp(&mut aux) }
}

/// Restrict the calling thread to exactly one logical processor.
#[cfg(not(target_os = "macos"))]
pub fn pin_to(index: usize) -> Result<(), Error> {
    let count = num_cpus::get();
    if index >= count {
        return Err(Error::CpuOutOfRange { index, count });
    }
    affinity::set_thread_affinity(vec![index])
        .map_err(|err| Error::Permission(format!("cannot pin to CPU {}: {:?}", index, err)))
}

#[cfg(target_os = "macos")]
pub fn pin_to(_index: usize) -> Result<(), Error> {
    Err(Error::AffinityUnsupported)
}

/// Current affinity mask, for callers that bounce across CPUs and put the
/// mask back afterwards.
#[cfg(not(target_os = "macos"))]
pub fn current_affinity() -> Option<Vec<usize>> {
    affinity::get_thread_affinity().ok()
}

#[cfg(target_os = "macos")]
pub fn current_affinity() -> Option<Vec<usize>> {
    None
}

#[cfg(not(target_os = "macos"))]
pub fn restore_affinity(mask: Vec<usize>) {
    if let Err(err) = affinity::set_thread_affinity(mask) {
        warn!("failed to restore thread affinity: {:?}", err);
    }
}

#[cfg(target_os = "macos")]
pub fn restore_affinity(_mask: Vec<usize>) {}

/// Raises the calling thread to the host's time-critical scheduling tier
/// for the lifetime of the guard. Refusal (typically missing privileges)
/// is a warning; the measurement continues at normal priority with a
/// noisier tail.
pub struct PriorityBoost {
    raised: bool,
}

impl PriorityBoost {
    pub fn acquire() -> PriorityBoost {
        let raised = raise_priority();
        if !raised {
            warn!("cannot raise scheduling priority; timing tails will be noisier");
        }
        PriorityBoost { raised }
    }
}

impl Drop for PriorityBoost {
    fn drop(&mut self) {
        if self.raised {
            lower_priority();
        }
    }
}

#[cfg(unix)]
fn raise_priority() -> bool {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max < 0 {
            return false;
        }
        let param = libc::sched_param {
            sched_priority: max,
        };
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) == 0
    }
}

#[cfg(unix)]
fn lower_priority() {
    unsafe {
        let param = libc::sched_param { sched_priority: 0 };
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_OTHER, &param);
    }
}

#[cfg(not(unix))]
fn raise_priority() -> bool {
    false
}

#[cfg(not(unix))]
fn lower_priority() {}

/// Counts how fast the TSC ticks by bracketing one wall-clock second with
/// serialized reads. Returns ticks per second.
pub fn calibrate_tick_rate() -> u64 {
    let _boost = PriorityBoost::acquire();

    let start = Instant::now();
    let timestamp_start = serialized_rdtsc();
    let mut elapsed = start.elapsed();
    while elapsed < Duration::from_secs(1) {
        elapsed = start.elapsed();
    }
    let timestamp_end = rdtscp_serialized();

    let wall_ns = elapsed.as_nanos() as u64;
    let ticks = timestamp_end.wrapping_sub(timestamp_start);
    ((u128::from(ticks) * u128::from(NANOSECONDS_PER_SECOND)) / u128::from(wall_ns)) as u64
}

/// Estimates the fixed per-iteration cost of the probe's receive side:
/// two equally long loops, one a bare atomic store, the other adding an
/// RDTSCP behind an always-true load, differenced and divided down.
pub fn measure_overhead() -> u64 {
    let _boost = PriorityBoost::acquire();
    let previous = current_affinity();
    if let Err(err) = pin_to(0) {
        warn!("overhead calibration not pinned: {}", err);
    }

    let slot = PingSlot::new();

    cpuid::execute(0, 0);
    let empty_loop_start = serialized_rdtsc();
    for i in 0..ITERATION_COUNT {
        slot.value.store(i as u64, Ordering::Release);
    }
    let empty_loop_end = rdtscp_serialized();

    slot.value.store(0, Ordering::Release);

    let rdtscp_loop_start = serialized_rdtsc();
    for _ in 0..ITERATION_COUNT {
        slot.value.store(0, Ordering::Release);
        if slot.value.load(Ordering::Acquire) == 0 {
            black_box(raw_rdtscp());
        }
    }
    let rdtscp_loop_end = rdtscp_serialized();

    if let Some(mask) = previous {
        restore_affinity(mask);
    }

    let empty_duration = empty_loop_end.wrapping_sub(empty_loop_start);
    let rdtscp_duration = rdtscp_loop_end.wrapping_sub(rdtscp_loop_start);
    rdtscp_duration.saturating_sub(empty_duration) / ITERATION_COUNT as u64
}

static TICK_RATE: OnceLock<u64> = OnceLock::new();
static MEASUREMENT_OVERHEAD: OnceLock<u64> = OnceLock::new();

/// Calibrated TSC frequency, computed once per process.
pub fn tick_rate() -> u64 {
    *TICK_RATE.get_or_init(|| {
        let rate = calibrate_tick_rate();
        debug!("TSC ticks at {} Hz", rate);
        rate
    })
}

/// Per-sample measurement overhead in ticks, computed once per process.
pub fn overhead() -> u64 {
    *MEASUREMENT_OVERHEAD.get_or_init(|| {
        let ticks = measure_overhead();
        debug!("measurement overhead is {} ticks per sample", ticks);
        ticks
    })
}
