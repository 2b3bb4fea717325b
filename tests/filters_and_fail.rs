//! Filter-stage and fail-sink behavior through the real binary, the way a
//! dispatcher runs them: records on stdin, records on stdout.

mod common;

use std::io::Write as _;
use std::process::{Command, Output, Stdio};

use common::{ABC_MD5, TestEnv, assert_success};

fn run_with_stdin(mut cmd: Command, input: &str) -> Output {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().expect("spawn o4");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(input.as_bytes())
        .expect("write stdin");
    child.wait_with_output().expect("wait o4")
}

fn stdout_lines(out: &Output) -> Vec<String> {
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(str::to_owned)
        .collect()
}

#[test]
fn drop_checksum_forwards_only_mismatches() {
    let env = TestEnv::new();
    env.write_file("good.txt", "abc");
    env.write_file("bad.txt", "def");

    let input = format!(
        "10,good.txt,1,3,{ABC_MD5}\n\
         10,bad.txt,2,3,{ABC_MD5}\n\
         10,missing.txt,3,3,{ABC_MD5}\n"
    );
    let out = run_with_stdin(env.o4_stage(&["drop", "--checksum"]), &input);
    assert_success(&out, "o4 drop --checksum");
    let lines = stdout_lines(&out);
    assert_eq!(lines.len(), 2, "{lines:?}");
    assert!(lines[0].contains("bad.txt"));
    assert!(lines[1].contains("missing.txt"));
}

#[test]
fn keep_deletes_and_inversion() {
    let env = TestEnv::new();
    let input = "10,gone.txt,0,0,\n10,kept.txt,1,3,AAAA\n";

    let out = run_with_stdin(env.o4_stage(&["keep", "--deletes"]), input);
    assert_success(&out, "o4 keep --deletes");
    assert_eq!(stdout_lines(&out), vec!["10,gone.txt,0,0,"]);

    let out = run_with_stdin(env.o4_stage(&["keep", "--not-deletes"]), input);
    assert_success(&out, "o4 keep --not-deletes");
    assert_eq!(stdout_lines(&out), vec!["10,kept.txt,1,3,AAAA"]);
}

#[test]
fn delete_pass_filter_shape() {
    // drop --not-deletes --existence: only deletes whose file still exists
    // survive — the records the delete pass must hand to p4.
    let env = TestEnv::new();
    env.write_file("stale.txt", "old content");

    let input = "10,stale.txt,0,0,\n\
                 10,gone.txt,0,0,\n\
                 10,normal.txt,1,3,AAAA\n";
    let out = run_with_stdin(
        env.o4_stage(&["drop", "--not-deletes", "--existence"]),
        input,
    );
    assert_success(&out, "o4 drop --not-deletes --existence");
    assert_eq!(stdout_lines(&out), vec!["10,stale.txt,0,0,"]);
}

#[test]
fn passthrough_lines_survive_every_stage() {
    let env = TestEnv::new();
    let input = "#o4pass-warn#something happened\n10,gone.txt,0,0,\n";
    let out = run_with_stdin(env.o4_stage(&["drop", "--deletes"]), input);
    assert_success(&out, "o4 drop --deletes");
    assert_eq!(stdout_lines(&out), vec!["#o4pass-warn#something happened"]);
}

#[test]
fn malformed_record_is_fatal() {
    let env = TestEnv::new();
    let out = run_with_stdin(env.o4_stage(&["drop", "--deletes"]), "garbage line\n");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("malformed"), "{stderr}");
}

#[test]
fn filter_without_predicates_is_an_error() {
    let env = TestEnv::new();
    let out = run_with_stdin(env.o4_stage(&["keep"]), "");
    assert!(!out.status.success());
}

#[test]
fn fail_rejects_leftover_records() {
    let env = TestEnv::new();
    let out = run_with_stdin(env.o4_stage(&["fail"]), "10,broken.txt,3,3,AAAA\n");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("These files did not sync"), "{stderr}");
    assert!(stderr.contains("broken.txt#3"), "{stderr}");
}

#[test]
fn fail_passes_on_empty_input() {
    let env = TestEnv::new();
    let out = run_with_stdin(env.o4_stage(&["fail"]), "");
    assert_success(&out, "o4 fail");
    assert!(!env.target.join(".o4/sync-incomplete").exists());
}

#[test]
fn fail_marks_incomplete_on_warnings_only() {
    let env = TestEnv::new();
    std::fs::create_dir_all(env.target.join(".o4")).unwrap();
    let out = run_with_stdin(env.o4_stage(&["fail"]), "#o4pass-warn#could not verify\n");
    assert_success(&out, "o4 fail with warnings");
    assert!(env.target.join(".o4/sync-incomplete").exists());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("could not verify"), "{stderr}");
}

#[test]
fn fail_errors_are_fatal_even_without_records() {
    let env = TestEnv::new();
    let out = run_with_stdin(env.o4_stage(&["fail"]), "#o4pass-err#server said no\n");
    assert!(!out.status.success());
}

#[test]
fn version_prints_and_compares() {
    let env = TestEnv::new();
    let out = env.o4(&["version"]).output().expect("o4 version");
    assert_success(&out, "o4 version");
    assert!(String::from_utf8_lossy(&out.stdout).contains("o4 "));

    let out = env
        .o4(&["version", "--at-least", "0.1.0"])
        .output()
        .expect("o4 version --at-least");
    assert_success(&out, "at-least satisfied");

    let out = env
        .o4(&["version", "--at-least", "99.0.0"])
        .output()
        .expect("o4 version --at-least");
    assert!(!out.status.success());
}
