//! Perforce abstraction layer for o4.
//!
//! All p4 traffic goes through [`Pyforce`]: it spawns `p4 -G`, decodes the
//! marshal record stream, and classifies result codes so that callers see
//! benign server chatter as ordinary records and only genuine failures as
//! errors. Error records are accumulated and raised once the stream ends —
//! one bad file must not abort an otherwise good batch.
//!
//! The p4 executable is `p4` on `$PATH`, or `$O4_P4_BIN` when set.

use std::borrow::Cow;
use std::io::{self, BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

pub mod checksum;
pub mod marshal;

pub use checksum::{Flavor, SizeSpec, checksum};
use marshal::{MarshalError, Value, read_dict};

/// Info diagnostics that are noise, not failures. They are re-tagged `mute`
/// so operator stages can match them to an input file without emitting it
/// downstream.
const MUTE_INFO: &[&str] = &[
    "Diff chunks",
    "can't move (already opened for edit)",
    "is opened for add and can't be replaced",
    "resolve skipped",
];

/// Error bodies that merely report "nothing to do"; re-tagged `stat`.
const STAT_ERRORS: &[&str] = &[
    "file(s) up-to-date",
    "no file(s) to reconcile",
    "no file(s) to resolve",
    "no file(s) to unshelve",
    "file(s) not on client",
    "No shelved files in changelist to delete",
];

const SKIP_ERROR: &str = "no file(s) at that changelist number";

const TIMEOUT_MARKERS: &[&str] = &["Connection timed out", "TCP receive exceeded"];

/// Errors surfaced by p4 invocations.
#[derive(Debug, Error)]
pub enum P4Error {
    /// The server or network stalled past `net.maxwait`. Retryable.
    #[error("p4 timed out: {0}")]
    Timeout(String),

    /// The stream ended with unrecoverable error records accumulated.
    #[error("p4 failed: {}", summarize(.0))]
    Failed(Vec<P4Record>),

    #[error("bad p4 -G stream: {0}")]
    Marshal(#[from] MarshalError),

    #[error("I/O error driving p4: {0}")]
    Io(#[from] io::Error),
}

fn summarize(records: &[P4Record]) -> String {
    let first = records
        .first()
        .map(|r| r.data().trim().to_owned())
        .unwrap_or_default();
    if records.len() > 1 {
        format!("{first} (and {} more)", records.len() - 1)
    } else {
        first
    }
}

/// One decoded result dictionary from `p4 -G`.
#[derive(Clone, Debug, Default)]
pub struct P4Record {
    entries: Vec<(String, Value)>,
}

impl P4Record {
    fn from_entries(entries: Vec<(Vec<u8>, Value)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (String::from_utf8_lossy(&k).into_owned(), v))
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Field as text (lossy UTF-8), or `None` when absent.
    pub fn text(&self, key: &str) -> Option<Cow<'_, str>> {
        self.get(key).map(|v| match v {
            Value::Bytes(b) => String::from_utf8_lossy(b),
            Value::Int(i) => Cow::Owned(i.to_string()),
        })
    }

    pub fn code(&self) -> Cow<'_, str> {
        self.text("code").unwrap_or(Cow::Borrowed(""))
    }

    pub fn data(&self) -> Cow<'_, str> {
        self.text("data").unwrap_or(Cow::Borrowed(""))
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let value = Value::Bytes(value.as_bytes().to_vec());
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.entries.push((key.to_owned(), value)),
        }
    }

    /// All fields as text pairs, for diagnostics serialization.
    pub fn iter_text(&self) -> impl Iterator<Item = (&str, String)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_text()))
    }
}

/// A running `p4 -G` invocation, iterated as classified [`P4Record`]s.
///
/// The iterator is fused: after yielding an `Err` it yields `None`. Dropping
/// a partially consumed `Pyforce` kills the child process.
pub struct Pyforce {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: NamedTempFile,
    errors: Vec<P4Record>,
    done: bool,
}

impl Pyforce {
    /// Spawn `p4 -vnet.maxwait=<t> -G <args…>`.
    pub fn spawn<I, S>(args: I) -> Result<Self, P4Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let program = std::env::var("O4_P4_BIN").unwrap_or_else(|_| "p4".to_owned());
        let maxwait = std::env::var("O4_P4_TIMEOUT").unwrap_or_else(|_| "60".to_owned());
        debug!(p4 = %program, "p4 -G {}", args.join(" "));

        let stderr = NamedTempFile::new()?;
        let child = Command::new(&program)
            .arg(format!("-vnet.maxwait={maxwait}"))
            .arg("-G")
            .args(&args)
            // p4 trusts $PWD over the actual working directory.
            .env("PWD", std::env::current_dir()?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr.as_file().try_clone()?))
            .spawn()?;
        let mut child = child;
        let stdout = BufReader::new(
            child
                .stdout
                .take()
                .ok_or_else(|| io::Error::other("p4 stdout not captured"))?,
        );
        Ok(Self {
            child,
            stdout,
            stderr,
            errors: Vec::new(),
            done: false,
        })
    }

    /// Spawn and collect the full result set.
    pub fn run<I, S>(args: I) -> Result<Vec<P4Record>, P4Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::spawn(args)?.collect()
    }

    /// Classify one decoded record. `Ok(record)` is yielded to the caller;
    /// `Err(record)` is accumulated for the end-of-stream report.
    fn classify(mut record: P4Record) -> Result<Result<P4Record, P4Record>, P4Error> {
        let code = record.code().into_owned();
        let data = record.data().into_owned();
        match code.as_str() {
            "info" if MUTE_INFO.iter().any(|m| data.contains(m)) => {
                record.set("code", "mute");
                Ok(Ok(record))
            }
            "error" => {
                if TIMEOUT_MARKERS.iter().any(|m| data.contains(m)) {
                    return Err(P4Error::Timeout(data.trim().to_owned()));
                }
                if STAT_ERRORS.iter().any(|m| data.contains(m)) {
                    record.set("code", "stat");
                    Ok(Ok(record))
                } else if data.contains(SKIP_ERROR) {
                    record.set("code", "skip");
                    Ok(Ok(record))
                } else {
                    Ok(Err(record))
                }
            }
            _ => Ok(Ok(record)),
        }
    }

    /// End-of-stream bookkeeping: reap the child, fold captured stderr into
    /// the accumulated errors, raise if anything accumulated.
    fn finish(&mut self) -> Result<(), P4Error> {
        let _ = self.child.wait();
        let mut err_out = String::new();
        let mut f = self.stderr.reopen()?;
        f.read_to_string(&mut err_out)?;
        if !err_out.trim().is_empty() {
            if err_out.contains("timed out") {
                return Err(P4Error::Timeout(err_out.trim().to_owned()));
            }
            let mut record = P4Record::default();
            record.set("code", "error");
            record.set("data", &format!("stderr: {}", err_out.trim()));
            self.errors.push(record);
        }
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(P4Error::Failed(std::mem::take(&mut self.errors)))
        }
    }
}

impl Iterator for Pyforce {
    type Item = Result<P4Record, P4Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match read_dict(&mut self.stdout) {
                Ok(Some(entries)) => {
                    let record = P4Record::from_entries(entries);
                    match Self::classify(record) {
                        Ok(Ok(record)) => return Some(Ok(record)),
                        Ok(Err(record)) => self.errors.push(record),
                        Err(e) => {
                            self.done = true;
                            return Some(Err(e));
                        }
                    }
                }
                Ok(None) => {
                    self.done = true;
                    return self.finish().err().map(Err);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

impl Drop for Pyforce {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Run p4 in plain text mode and return stdout. Used where marshaling is
/// pure overhead, e.g. `p4 have` over a large workspace.
pub fn p4_text<I, S>(args: I) -> Result<String, P4Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
    let program = std::env::var("O4_P4_BIN").unwrap_or_else(|_| "p4".to_owned());
    debug!(p4 = %program, "p4 {}", args.join(" "));
    let out = Command::new(&program)
        .args(&args)
        .env("PWD", std::env::current_dir()?)
        .stdin(Stdio::null())
        .output()?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("timed out") {
            return Err(P4Error::Timeout(stderr.trim().to_owned()));
        }
        let mut record = P4Record::default();
        record.set("code", "error");
        record.set("data", &format!("p4 {}: {}", args.join(" "), stderr.trim()));
        return Err(P4Error::Failed(vec![record]));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Perforce wildcard escaping for depot paths.
pub fn escape(path: &str) -> String {
    path.replace('%', "%25")
        .replace('#', "%23")
        .replace('*', "%2a")
        .replace('@', "%40")
}

/// Inverse of [`escape`].
pub fn unescape(path: &str) -> String {
    path.replace("%40", "@")
        .replace("%23", "#")
        .replace("%2a", "*")
        .replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn escape_round_trip() {
        let path = "//depot/we%ird/f#1@2*";
        assert_eq!(escape(path), "//depot/we%25ird/f%231%402%2a");
        assert_eq!(unescape(&escape(path)), path);
    }

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    /// Install a fake `p4` that emits `wire` on stdout, and point
    /// `$O4_P4_BIN` lookups at it via an explicit spawn.
    fn fake_p4(dir: &TempDir, wire: &[u8]) -> std::path::PathBuf {
        let out = dir.path().join("out.bin");
        fs::write(&out, wire).unwrap();
        let script = dir.path().join("p4");
        fs::write(
            &script,
            format!("#!/bin/sh\ncat '{}'\n", out.display()),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    /// Build a `Pyforce` around the shim directly, bypassing the `$PATH`
    /// lookup, so parallel tests never race on process-global environment.
    fn spawn_against(script: &std::path::Path) -> Pyforce {
        let stderr = NamedTempFile::new().unwrap();
        let mut child = std::process::Command::new(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr.as_file().try_clone().unwrap()))
            .spawn()
            .unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        Pyforce {
            child,
            stdout,
            stderr,
            errors: Vec::new(),
            done: false,
        }
    }

    #[test]
    fn benign_error_is_retagged_stat() {
        let mut wire = Vec::new();
        marshal::write_dict(
            &mut wire,
            &[
                ("code", bytes("error")),
                ("data", bytes("//d/... - file(s) up-to-date.")),
            ],
        );
        let dir = TempDir::new().unwrap();
        let shim = fake_p4(&dir, &wire);
        let records: Vec<_> = spawn_against(&shim).collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code(), "stat");
    }

    #[test]
    fn benign_info_is_retagged_mute() {
        let mut wire = Vec::new();
        marshal::write_dict(
            &mut wire,
            &[("code", bytes("info")), ("data", bytes("Diff chunks: 3"))],
        );
        let dir = TempDir::new().unwrap();
        let shim = fake_p4(&dir, &wire);
        let records: Vec<_> = spawn_against(&shim).collect::<Result<_, _>>().unwrap();
        assert_eq!(records[0].code(), "mute");
    }

    #[test]
    fn errors_accumulate_and_raise_at_eof() {
        let mut wire = Vec::new();
        marshal::write_dict(&mut wire, &[("code", bytes("stat")), ("depotFile", bytes("//d/a"))]);
        marshal::write_dict(
            &mut wire,
            &[("code", bytes("error")), ("data", bytes("//d/b - no permission"))],
        );
        marshal::write_dict(&mut wire, &[("code", bytes("stat")), ("depotFile", bytes("//d/c"))]);
        let dir = TempDir::new().unwrap();
        let shim = fake_p4(&dir, &wire);
        let mut results = spawn_against(&shim);
        // Both good records come through before the accumulated error fires.
        assert_eq!(results.next().unwrap().unwrap().text("depotFile").unwrap(), "//d/a");
        assert_eq!(results.next().unwrap().unwrap().text("depotFile").unwrap(), "//d/c");
        match results.next().unwrap() {
            Err(P4Error::Failed(records)) => {
                assert_eq!(records.len(), 1);
                assert!(records[0].data().contains("no permission"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(results.next().is_none());
    }

    #[test]
    fn timeout_raises_immediately() {
        let mut wire = Vec::new();
        marshal::write_dict(
            &mut wire,
            &[
                ("code", bytes("error")),
                ("data", bytes("read: Connection timed out: Connection timed out")),
            ],
        );
        let dir = TempDir::new().unwrap();
        let shim = fake_p4(&dir, &wire);
        let mut results = spawn_against(&shim);
        assert!(matches!(results.next().unwrap(), Err(P4Error::Timeout(_))));
        assert!(results.next().is_none());
    }
}
