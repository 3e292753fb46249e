use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn qxlang() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_qxlang"));
    cmd.env_remove("RUST_LOG").env("NO_COLOR", "1");
    cmd
}

fn script(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp script");
    file.write_all(source.as_bytes()).expect("write temp script");
    file
}

/// Flags go before the script path; everything after it belongs to the script.
fn run_with(source: &str, flags: &[&str], args: &[&str]) -> Output {
    let file = script(source);
    qxlang()
        .args(flags)
        .arg(file.path())
        .args(args)
        .output()
        .expect("failed to run qxlang")
}

fn run(source: &str, flags: &[&str]) -> Output {
    run_with(source, flags, &[])
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

// --- Running scripts ---

#[test]
fn prints_sum() {
    let out = run("= $1 #i10\n= $2 #i20\n+i $3 $1 $2\npln $3", &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "30");
}

#[test]
fn prints_output_register() {
    let out = run("exit #s'done'", &[]);
    assert!(out.status.success());
    assert_eq!(stdout(&out), "done");
}

#[test]
fn undefined_output_prints_nothing() {
    let out = run("pass", &[]);
    assert!(out.status.success());
    assert_eq!(stdout(&out), "");
}

#[test]
fn call_and_deferred_order() {
    let src = "\
defer pln \"root done\"
call $3 :double #i21
pln $3
exit
:double
defer pln \"leaving double\"
[] $4 $in #i0
+i $out $4 $4
ret";
    let out = run(src, &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "leaving double\n42\nroot done");
}

#[test]
fn script_args_and_input() {
    let src = "getArgs $1\ngetInput $2\npln [$1,1] [$1,2] {$2,k}";
    let out = run_with(src, &["--input", r#"{"k":"v"}"#], &["alpha", "beta"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "alpha beta v");
}

#[test]
fn start_address_flag() {
    let out = run("exit #i1\nexit #i2", &["--start", "1"]);
    assert_eq!(stdout(&out), "2");
}

// --- Errors ---

#[test]
fn compile_error_reports_line() {
    let out = run("pass\nfrob $1", &[]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[QX-C004]"), "stderr: {err}");
    assert!(err.contains("frob"), "stderr: {err}");
    assert!(err.contains("--> line 2:1"), "stderr: {err}");
}

#[test]
fn runtime_error_reported_once() {
    let out = run("= $1 #L[1,2,3]\n[] $2 $1 #i3", &[]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.starts_with("error[QX-R002]: index out of range: 3/3"), "stderr: {err}");
    assert_eq!(err.matches("index out of range").count(), 1, "stderr: {err}");
    assert!(err.contains("(qxlang)"), "stderr: {err}");
    assert!(err.contains("--> line 2:1"), "stderr: {err}");
}

#[test]
fn runtime_fault_prints_no_panic_output() {
    let out = run("pass\ngoto :+9223372036854775807", &[]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.starts_with("error[QX-R001]"), "stderr: {err}");
    assert!(!err.contains("panicked"), "stderr: {err}");
}

#[test]
fn start_past_end_fails() {
    let out = run("exit #i1", &["--start", "5"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("start address 5 outside program"), "stderr: {}", stderr(&out));
}

#[test]
fn json_diagnostics() {
    let out = run("if $cond :yes\n:yes", &["--json"]);
    assert!(!out.status.success());
    let err = stderr(&out);
    let line = err.lines().last().unwrap_or_default();
    let v: serde_json::Value = serde_json::from_str(line).expect("JSON diagnostic");
    assert_eq!(v["code"], "QX-R003");
    assert_eq!(v["labels"][0]["line"], 1);
}

#[test]
fn deferred_runs_before_error_exit() {
    let out = run("defer pln \"cleanup\"\n+i $1 #s'x' #i1", &[]);
    assert!(!out.status.success());
    assert_eq!(stdout(&out), "cleanup");
}

#[test]
fn missing_script_file() {
    let out = qxlang().arg("/definitely/not/here.qx").output().expect("failed to run qxlang");
    assert!(!out.status.success());
    assert!(stderr(&out).contains("Error reading"));
}

// --- Tooling flags ---

#[test]
fn explain_code() {
    let out = qxlang().args(["--explain", "QX-R002"]).output().expect("failed to run qxlang");
    assert!(out.status.success());
    assert!(stdout(&out).contains("index out of range"));

    let out = qxlang().args(["--explain", "QX-NOPE"]).output().expect("failed to run qxlang");
    assert!(!out.status.success());
}

#[test]
fn emit_json_program() {
    let out = run(":top\n= $1 #i5\ngoto :top", &["--emit", "json"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("program JSON");
    assert_eq!(v["labels"]["top"], 0);
    assert_eq!(v["instructions"].as_array().unwrap().len(), 2);
    assert_eq!(v["instructions"][0]["opcode"], 401);
    assert!(v["lowered"].is_null());
}

#[test]
fn lowered_tier() {
    let out = run("= $1 #i10\n+i $2 $1 #i5", &["--lowered"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "$1 = 10\n$2 = 15");
}

#[test]
fn lowered_tier_refuses_partial_programs() {
    let out = run("= $1 #i10\npln $1", &["--lowered"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("QX-R010"), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "");
}
