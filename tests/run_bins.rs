#![allow(dead_code, unused_imports)]

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs::read_to_string;
use std::path::PathBuf;
use std::process::Command;

fn dump_path(name: &str) -> String {
    let mut pathbuf = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    pathbuf.push("resources/test/dumps");
    pathbuf.push(name);
    pathbuf.as_path().to_str().unwrap().to_string()
}

#[test]
#[cfg(feature = "build-binaries")]
fn inspect_help() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("cpudiag")?;
    cmd.arg("--help").assert().success();
    Ok(())
}

#[test]
#[cfg(feature = "build-binaries")]
fn latency_help() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("corelat")?;
    cmd.arg("--help").assert().success();
    Ok(())
}

#[test]
#[cfg(feature = "build-binaries")]
fn inspect_on_missing_dump_file() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("cpudiag")?;
    cmd.arg("--read-dump")
        .arg("bogus-file-path")
        .assert()
        .failure()
        .code(1);
    Ok(())
}

#[test]
#[cfg(feature = "build-binaries")]
fn inspect_decodes_dump() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("cpudiag")?;
    cmd.arg("--read-dump")
        .arg(dump_path("native-i7-8700k.txt"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Intel(R) Core(TM) i7-8700K"))
        .stdout(predicate::str::contains("sse4.2"));
    Ok(())
}

#[test]
#[cfg(feature = "build-binaries")]
fn dump_round_trips_bit_exact() -> Result<(), Box<dyn std::error::Error>> {
    let path = dump_path("native-i7-8700k.txt");
    let contents = read_to_string(&path)?.replace('\r', "");
    let mut cmd = Command::cargo_bin("cpudiag")?;
    cmd.arg("--read-dump")
        .arg(&path)
        .arg("--dump")
        .assert()
        .success()
        .stdout(predicate::eq(contents));
    Ok(())
}

#[test]
#[cfg(feature = "build-binaries")]
fn flag_query_against_dump() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("cpudiag")?;
    cmd.arg("--read-dump")
        .arg(dump_path("native-i7-8700k.txt"))
        .arg("--flag")
        .arg("CPUID.01:ECX[SSE4.2]")
        .assert()
        .success()
        .stdout(predicate::eq("CPU 0: 1\nCPU 1: 1\n"));
    Ok(())
}

#[test]
#[cfg(feature = "build-binaries")]
fn flag_query_whole_register() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("cpudiag")?;
    cmd.arg("--read-dump")
        .arg(dump_path("native-i7-8700k.txt"))
        .arg("--cpu")
        .arg("0")
        .arg("--flag")
        .arg("CPUID.80000008H:EAX[bits 7-0]")
        .assert()
        .success()
        .stdout(predicate::eq("CPU 0: 39\n"));
    Ok(())
}

#[test]
#[cfg(feature = "build-binaries")]
fn topology_from_dump() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("cpudiag")?;
    cmd.arg("--read-dump")
        .arg(dump_path("native-i7-8700k.txt"))
        .arg("--topology")
        .assert()
        .success()
        .stdout(predicate::str::contains("package 0"))
        .stdout(predicate::str::contains("physical core 0"));
    Ok(())
}

#[test]
#[cfg(feature = "build-binaries")]
fn unknown_mnemonic_fails() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("cpudiag")?;
    cmd.arg("--read-dump")
        .arg(dump_path("native-i7-8700k.txt"))
        .arg("--flag")
        .arg("CPUID.01:ECX[NOTAFLAG]")
        .assert()
        .failure()
        .code(1);
    Ok(())
}
