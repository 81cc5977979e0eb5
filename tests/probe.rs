use cpudiag::latency::LatencyMatrix;
use cpudiag::timing;

#[test]
fn matrix_rendering() {
    let mut matrix = LatencyMatrix::new(3);
    matrix.set(0, 1, 48.4);
    matrix.set(0, 2, 51.6);
    matrix.set(1, 0, 47.0);
    matrix.set(1, 2, 46.0);
    matrix.set(2, 0, 52.0);
    matrix.set(2, 1, 45.5);

    let expected = "\
       \\ core-to-core ping time/ns
        \\ destination
 source  \\     0|    1|    2|
__________\\_____|_____|_____|
        0 |    -|   48|   52|
        1 |   47|    -|   46|
        2 |   52|   46|    -|
";
    assert_eq!(matrix.to_string(), expected);
}

#[test]
fn matrix_cells() {
    let mut matrix = LatencyMatrix::new(2);
    assert_eq!(matrix.cpu_count(), 2);
    assert_eq!(matrix.get(0, 1), None);
    matrix.set(0, 1, 100.0);
    assert_eq!(matrix.get(0, 1), Some(100.0));
    assert_eq!(matrix.get(1, 0), None);
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[test]
fn serialized_timestamps_advance() {
    let first = timing::serialized_rdtsc();
    let second = timing::rdtscp_serialized();
    assert!(second > first);
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[test]
fn overhead_is_sane() {
    // A couple thousand ticks per sample would mean the estimator is
    // broken; the real figure is tens of ticks.
    let overhead = timing::measure_overhead();
    assert!(overhead < 100_000, "overhead {} ticks", overhead);
}
