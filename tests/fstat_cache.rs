//! The fstat source command against the fake p4: cache creation, cache
//! hits, incremental ranges, and report interpolation.

mod common;

use common::{ABC_MD5, DEPOT, TestEnv, XYZ_MD5, assert_success};

fn arm_fstat_full(env: &mut TestEnv) {
    let a = [
        ("code", "stat"),
        ("depotFile", "//depot/app/A.txt"),
        ("headChange", "10"),
        ("headRev", "1"),
        ("headAction", "add"),
        ("headType", "text"),
        ("fileSize", "3"),
        ("digest", ABC_MD5),
    ];
    let b = [
        ("code", "stat"),
        ("depotFile", "//depot/app/B.txt"),
        ("headChange", "20"),
        ("headRev", "2"),
        ("headAction", "add"),
        ("headType", "text"),
        ("fileSize", "3"),
        ("digest", XYZ_MD5),
    ];
    env.shim.marshal_arm("fstat", "fstat-full", &[&a, &b]);
    env.shim.install();
}

#[test]
fn quiet_fstat_builds_the_cache_and_later_runs_skip_p4() {
    let mut env = TestEnv::new();
    arm_fstat_full(&mut env);

    let out = env
        .o4_at_head(&["fstat", "-q", ".@20"], 20)
        .output()
        .expect("o4 fstat -q");
    assert_success(&out, "o4 fstat -q");
    assert!(env.target.join(".o4/20.fstat.gz").exists());
    assert_eq!(
        env.shim.log().iter().filter(|l| l.contains(" fstat ")).count(),
        1
    );

    // Same changelist again: the cache satisfies it without Perforce.
    env.shim.clear_log();
    let out = env
        .o4_at_head(&["fstat", ".@20"], 20)
        .output()
        .expect("o4 fstat");
    assert_success(&out, "o4 fstat from cache");
    let stdout = String::from_utf8_lossy(&out.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(
        lines,
        vec![
            format!("20,B.txt,2,3,{XYZ_MD5}").as_str(),
            format!("10,A.txt,1,3,{ABC_MD5}").as_str(),
        ],
        "records stream newest first"
    );
    assert!(
        !env.shim.log().iter().any(|l| l.contains(" fstat ")),
        "cache hit must not touch p4: {:?}",
        env.shim.log()
    );
}

#[test]
fn incremental_fstat_merges_the_delta_onto_the_cache() {
    let mut env = TestEnv::new();
    arm_fstat_full(&mut env);
    assert_success(
        &env.o4_at_head(&["fstat", "-q", ".@20"], 20)
            .output()
            .expect("seed cache"),
        "seed cache",
    );

    // At 21 the server deletes A.
    let deleted = [
        ("code", "stat"),
        ("depotFile", "//depot/app/A.txt"),
        ("headChange", "21"),
        ("headRev", "2"),
        ("headAction", "delete"),
        ("headType", "text"),
    ];
    env.shim.marshal_arm("@20,@21", "fstat-delta", &[&deleted]);
    // Range arms must win over the generic fstat arm.
    env.shim.promote_last();
    env.shim.install();

    let out = env
        .o4_at_head(&["fstat", ".@21", "--changed", "20"], 21)
        .output()
        .expect("o4 fstat --changed");
    assert_success(&out, "o4 fstat --changed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(stdout.trim(), "21,A.txt,2,0,", "only the delta streams");

    // The merged cache lands at 21 with one record per path.
    let cache = env.target.join(".o4/21.fstat.gz");
    assert!(cache.exists());
    let records: Vec<_> = o4_fstat::cache::read_records(&cache)
        .expect("read cache")
        .collect::<Result<_, _>>()
        .expect("decode cache");
    let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(paths, vec!["A.txt", "B.txt"]);
    assert!(records[0].is_delete());
}

#[test]
fn report_interpolates_the_actual_changelist() {
    let mut env = TestEnv::new();
    arm_fstat_full(&mut env);
    let out = env
        .o4_at_head(
            &["fstat", "-q", ".@25", "--report", "actual_cl={actual_cl}"],
            25,
        )
        .output()
        .expect("o4 fstat --report");
    assert_success(&out, "o4 fstat --report");
    // Nothing changed at 25 itself; the cache tops out at 20.
    assert!(
        String::from_utf8_lossy(&out.stdout).contains("actual_cl=20"),
        "stdout: {}",
        String::from_utf8_lossy(&out.stdout)
    );
}

#[test]
fn head_resolves_and_caches() {
    let mut env = TestEnv::new();
    env.shim.marshal_arm(
        "changes -s submitted -m1",
        "changes",
        &[&[("code", "stat"), ("change", "33"), ("path", "//depot/app/...")]],
    );
    env.shim.install();

    let out = env.o4(&["head", DEPOT]).output().expect("o4 head");
    assert_success(&out, "o4 head");
    let marker = std::fs::read_to_string(env.target.join(".o4/head")).expect("head marker");
    assert_eq!(marker.trim(), "33");
}
