//! Shared helpers for o4 integration tests.
//!
//! Every test gets its own temp tree with a fake `p4` on `$O4_P4_BIN`: a
//! shell script that logs each invocation and answers from canned marshal
//! streams (or arbitrary shell) keyed by argument patterns. No test touches
//! a real Perforce server or the user's configuration.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use o4_pyforce::marshal::{self, Value};
use tempfile::TempDir;

/// Encode p4 -G style marshal dictionaries from string pairs.
pub fn marshal_records(records: &[&[(&str, &str)]]) -> Vec<u8> {
    let mut wire = Vec::new();
    for record in records {
        let entries: Vec<(&str, Value)> = record
            .iter()
            .map(|(k, v)| (*k, Value::Bytes(v.as_bytes().to_vec())))
            .collect();
        marshal::write_dict(&mut wire, &entries);
    }
    wire
}

/// The scripted fake p4.
pub struct P4Shim {
    pub dir: PathBuf,
    arms: Vec<(String, String)>,
}

impl P4Shim {
    pub fn new(dir: &Path) -> Self {
        fs::create_dir_all(dir).expect("shim dir");
        let shim = Self {
            dir: dir.to_owned(),
            arms: Vec::new(),
        };
        shim.install();
        shim
    }

    /// Answer invocations whose argument string contains `pattern` with the
    /// given shell fragment. First matching arm wins; add specific arms
    /// (e.g. `sync -k`) before general ones (`sync`).
    pub fn arm(&mut self, pattern: &str, script: &str) -> &mut Self {
        self.arms.push((pattern.to_owned(), script.to_owned()));
        self
    }

    /// An arm that answers with a canned marshal stream.
    pub fn marshal_arm(
        &mut self,
        pattern: &str,
        name: &str,
        records: &[&[(&str, &str)]],
    ) -> &mut Self {
        let path = self.data_file(&format!("{name}.bin"), &marshal_records(records));
        self.arm(pattern, &format!("cat '{path}'"))
    }

    /// Move the most recently added arm to the front, so it wins over
    /// earlier, more general patterns.
    pub fn promote_last(&mut self) -> &mut Self {
        if let Some(arm) = self.arms.pop() {
            self.arms.insert(0, arm);
        }
        self
    }

    /// Drop a data file into the shim directory; returns its absolute path.
    pub fn data_file(&self, name: &str, bytes: &[u8]) -> String {
        let path = self.dir.join(name);
        fs::write(&path, bytes).expect("shim data file");
        path.display().to_string()
    }

    /// (Re)write the p4 script from the current arms.
    pub fn install(&self) {
        let mut arms = String::new();
        for (pattern, script) in &self.arms {
            arms.push_str(&format!("  *\" {pattern} \"*)\n    {script}\n    ;;\n"));
        }
        let script = format!(
            "#!/bin/sh\n\
             dir=\"$(dirname \"$0\")\"\n\
             printf '%s\\n' \"$*\" >> \"$dir/p4.log\"\n\
             case \" $* \" in\n\
             {arms}\
             esac\n\
             exit 0\n"
        );
        let path = self.bin();
        fs::write(&path, script).expect("shim script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("shim chmod");
    }

    pub fn bin(&self) -> PathBuf {
        self.dir.join("p4")
    }

    /// Every p4 invocation so far, one argument string per line.
    pub fn log(&self) -> Vec<String> {
        fs::read_to_string(self.dir.join("p4.log"))
            .map(|s| s.lines().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn clear_log(&self) {
        let _ = fs::remove_file(self.dir.join("p4.log"));
    }
}

/// A full test environment: client root, workspace directory, p4 shim.
pub struct TestEnv {
    pub root: TempDir,
    pub shim: P4Shim,
    pub client_root: PathBuf,
    /// The workspace directory for `//depot/app`.
    pub target: PathBuf,
}

pub const DEPOT: &str = "//depot/app";

impl TestEnv {
    pub fn new() -> Self {
        let root = TempDir::new().expect("temp root");
        let client_root = root.path().join("client");
        let target = client_root.join("depot/app");
        fs::create_dir_all(&target).expect("target dir");
        let shim = P4Shim::new(&root.path().join("shim"));
        Self {
            root,
            shim,
            client_root,
            target,
        }
    }

    /// A vanilla clientspec reply for `p4 client -o`.
    pub fn arm_vanilla_client(&mut self) {
        self.shim.marshal_arm(
            "client -o",
            "client",
            &[&[
                ("code", "stat"),
                ("Client", "testclient"),
                ("View0", "//depot/... //testclient/depot/..."),
            ]],
        );
        self.shim.install();
    }

    /// Build an `o4` command running in the workspace against the shim.
    pub fn o4(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_o4"));
        cmd.args(args)
            .current_dir(&self.target)
            .env("O4_P4_BIN", self.shim.bin())
            .env("CLIENT_ROOT", &self.client_root)
            .env("HOME", self.root.path())
            .env("NOO4SERVER", "1")
            .env_remove("DEPOT_PATH")
            .env_remove("CLIENT_PATH")
            .env_remove("CHANGELIST")
            .env_remove("O4HEAD")
            .env_remove("O4CONFIG")
            .env_remove("DEBUG");
        cmd
    }

    pub fn o4_at_head(&self, args: &[&str], head: u64) -> Command {
        let mut cmd = self.o4(args);
        cmd.env("O4HEAD", head.to_string());
        cmd
    }

    /// An `o4` stage subcommand (filter, pyforce, fail, …) with the context
    /// pre-marshaled into the environment, the way a dispatcher parent
    /// would spawn it.
    pub fn o4_stage(&self, args: &[&str]) -> Command {
        let mut cmd = self.o4(args);
        cmd.env("DEPOT_PATH", format!("{DEPOT}/..."))
            .env("CLIENT_PATH", self.target.display().to_string())
            .env("CHANGELIST", "0");
        cmd
    }

    pub fn write_file(&self, rel: &str, content: &str) {
        let path = self.target.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("parents");
        }
        fs::write(path, content).expect("write file");
    }

    pub fn read_marker(&self) -> Option<String> {
        fs::read_to_string(self.target.join(".o4/changelist"))
            .ok()
            .map(|s| s.trim().to_owned())
    }
}

pub fn assert_success(out: &Output, what: &str) {
    assert!(
        out.status.success(),
        "{what} failed\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
}

/// MD5("abc"), uppercase — the checksum of the canned file content used
/// throughout these tests.
pub const ABC_MD5: &str = "900150983CD24FB0D6963F7D28E17F72";
/// MD5("xyz"), uppercase.
pub const XYZ_MD5: &str = "D16FB36F0911F878998C136191AF705E";
