//! Drives the `pvme` binary end to end.

use std::{io::Write, process::Command};

use rstest::rstest;
use serde_json::Value;
use tempfile::NamedTempFile;

const PVME: &str = env!("CARGO_BIN_EXE_pvme");

fn pvme(args: &[&str]) -> std::process::Output {
    Command::new(PVME).args(args).output().expect("failed to run pvme")
}

fn stdout(output: &std::process::Output) -> String {
    assert!(output.status.success(), "pvme failed: {}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout.clone()).unwrap().trim().to_string()
}

fn run_json(args: &[&str]) -> Value {
    let mut full = vec!["run", "--json"];
    full.extend_from_slice(args);
    serde_json::from_str(&stdout(&pvme(&full))).unwrap()
}

#[test]
fn test_run_add_program() {
    let blob = stdout(&pvme(&["assemble-demo"]));
    let json = run_json(&[&blob]);
    assert_eq!(json["exit_reason"], "halt");
    assert_eq!(json["exit_code"], 0);
    assert_eq!(json["gas_used"], 4);
    assert_eq!(json["registers"][7], 142);
    assert_eq!(json["executor"], "in-process interpreter");
}

#[rstest]
#[case::out_of_gas("loop", "50", "out of gas")]
#[case::sum("sum-to-n", "10000", "halt")]
fn test_run_demo_programs(#[case] program: &str, #[case] gas: &str, #[case] exit: &str) {
    let blob = stdout(&pvme(&["assemble-demo", "--program", program]));
    let json = run_json(&[&blob, "--gas", gas]);
    assert_eq!(json["exit_reason"], exit);
}

#[test]
fn test_echo_prints_output() {
    let blob = stdout(&pvme(&["assemble-demo", "--program", "echo"]));
    let output = pvme(&["run", &blob, "--input", "0xc0ffee"]);
    assert_eq!(stdout(&output), "0xc0ffee");
}

#[test]
fn test_blob_from_file() {
    let blob = stdout(&pvme(&["assemble-demo"]));
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{blob}").unwrap();
    let json = run_json(&["--file", file.path().to_str().unwrap()]);
    assert_eq!(json["registers"][7], 142);
}

#[test]
fn test_garbage_blob_traps() {
    let json = run_json(&["ffffffff", "--gas", "77"]);
    assert_eq!(json["exit_reason"], "panic(trap)");
    assert_eq!(json["gas_used"], 77);
}

#[rstest]
#[case::missing_blob(&["run"])]
#[case::odd_hex(&["run", "0x123"])]
#[case::jit(&["run", "00", "--mode", "jit"])]
fn test_errors_exit_nonzero(#[case] args: &[&str]) {
    let output = pvme(args);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error"));
}
