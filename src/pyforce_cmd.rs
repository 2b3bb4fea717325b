//! `o4 pyforce`: drive one p4 command over a stream of fstat records.
//!
//! The stage parses every input record, turns the survivors into p4 file
//! arguments, and matches each p4 reply back to the record that caused it.
//! Records are emitted downstream only after the p4 child has exited: p4
//! marshals its responses before actually performing the file I/O, and
//! emitting on receipt makes downstream checksum stages read files that are
//! not there yet.
//!
//! Bookkeeping is strict — an input record that p4 never answered for is a
//! bug worth a diagnostic bundle, not a silent pass.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result, anyhow, bail};
use o4_fstat::record::{Line, PassKind, decode_line, passthrough};
use o4_fstat::{FstatRecord, Revision};
use o4_pyforce::{P4Error, P4Record, Pyforce};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::context::Context;
use crate::filter::DirCache;

/// Arguments over ~30 KiB go through `p4 -x <file>` instead of argv.
const ARGV_LIMIT: usize = 30_000;

#[derive(Clone, Debug, Default)]
pub struct PyforceOptions {
    /// Send bare paths (no `#rev` / `@cl` selector), e.g. for `revert`.
    pub no_revision: bool,
    pub debug: bool,
    /// Suppress record emission (the caller only wants the side effects).
    pub quiet: bool,
    /// The p4 command and its flags, e.g. `["sync", "-f"]`.
    pub p4args: Vec<String>,
}

enum Attempt {
    /// Every reply accounted for (or recoverably patched up); re-check the
    /// remaining records.
    Continue,
    Timeout(String),
    /// Bookkeeping failed; dump a diagnostic bundle and abort.
    Abort {
        reason: String,
        errs: Vec<P4Record>,
        infos: Vec<P4Record>,
    },
}

pub fn run(
    ctx: &Context,
    opts: &PyforceOptions,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<()> {
    let mut case_cache = DirCache::default();
    let mut fstats: Vec<FstatRecord> = Vec::new();
    for line in input.lines() {
        let line = line?;
        match decode_line(&line)? {
            Line::Blank => {}
            Line::Passthrough(raw) => writeln!(out, "{raw}")?,
            Line::Record(record) => {
                if case_cache.caseful_accurate(&record.path) {
                    fstats.push(record);
                } else {
                    writeln!(
                        out,
                        "{}",
                        passthrough(
                            PassKind::Warn,
                            &format!(
                                "skipping {} because it casefully mismatches a local file",
                                record.path
                            ),
                        )
                    )?;
                }
            }
        }
    }

    fs::create_dir_all(".o4")?;
    let mut retries = 3;
    while !fstats.is_empty() {
        let p4paths: Vec<String> = fstats
            .iter()
            .map(|f| {
                if opts.no_revision {
                    o4_pyforce::escape(&f.path)
                } else {
                    match f.revision {
                        Revision::UseCl => {
                            format!("{}@{}", o4_pyforce::escape(&f.path), f.changelist)
                        }
                        Revision::Number(rev) => {
                            format!("{}#{rev}", o4_pyforce::escape(&f.path))
                        }
                    }
                }
            })
            .collect();

        // argv or -x batch file, depending on size.
        let mut args: Vec<String> = Vec::new();
        let mut batch_file: Option<NamedTempFile> = None;
        if p4paths.iter().map(String::len).sum::<usize>() > ARGV_LIMIT {
            let mut tmp = NamedTempFile::new_in(".o4")?;
            for p in &p4paths {
                writeln!(tmp, "{p}")?;
            }
            tmp.flush()?;
            args.push("-x".to_owned());
            args.push(tmp.path().display().to_string());
            args.extend(opts.p4args.iter().cloned());
            batch_file = Some(tmp);
        } else {
            args.extend(opts.p4args.iter().cloned());
            args.extend(p4paths);
        }

        let mut queued: Vec<FstatRecord> = Vec::new();
        let attempt = run_attempt(ctx, opts, &mut fstats, args, &mut queued, out);
        // p4 has exited by now (the result iterator is drained or dropped):
        // safe to release the matched records downstream.
        if !opts.quiet {
            for record in &queued {
                writeln!(out, "{}", record.encode())?;
            }
        }
        drop(batch_file);

        match attempt? {
            Attempt::Continue => {}
            Attempt::Timeout(msg) => {
                retries -= 1;
                warn!(retries, "p4 timed out: {msg}");
                if retries == 0 {
                    bail!("Perforce timed out too many times: {msg}");
                }
            }
            Attempt::Abort {
                reason,
                errs,
                infos,
            } => {
                let bundle = dump_debug_bundle(opts, &fstats, &errs, &infos)?;
                bail!("{reason}; detail in {bundle}");
            }
        }
    }
    Ok(())
}

/// One p4 invocation over the still-unmatched records. Matched records move
/// into `queued`; recoverable server complaints are patched up in place.
fn run_attempt(
    ctx: &Context,
    opts: &PyforceOptions,
    fstats: &mut Vec<FstatRecord>,
    args: Vec<String>,
    queued: &mut Vec<FstatRecord>,
    out: &mut dyn Write,
) -> Result<Attempt> {
    let head = ctx.depot_root().to_owned();
    let before = fstats.len();
    let mut errs: Vec<P4Record> = Vec::new();
    let mut infos: Vec<P4Record> = Vec::new();
    let mut matched_paths: Vec<String> = Vec::new();

    let results = Pyforce::spawn(args).context("spawning p4")?;
    for result in results {
        let res = match result {
            Ok(res) => res,
            Err(P4Error::Timeout(msg)) => return Ok(Attempt::Timeout(msg)),
            Err(P4Error::Failed(records)) => {
                let mut non_recoverable = false;
                for record in &records {
                    let data = record.data().into_owned();
                    if let Some(rest) = data.split("clobber writable file").nth(1) {
                        recover_clobber(rest.trim(), out)?;
                    } else {
                        writeln!(out, "{}", passthrough(PassKind::Err, data.trim()))?;
                        non_recoverable = true;
                    }
                }
                if non_recoverable {
                    return Err(anyhow!("p4 failed: {}", P4Error::Failed(records)));
                }
                // Clobbers recovered; the affected records are still in
                // `fstats` and the next attempt retries them.
                return Ok(Attempt::Continue);
            }
            Err(e) => return Err(e.into()),
        };

        if opts.debug {
            let fields: Vec<String> =
                res.iter_text().map(|(k, v)| format!("{k}={v}")).collect();
            debug!("p4 reply: {}", fields.join(" "));
        }
        let code = res.code().into_owned();
        let data = res.data().into_owned();
        match code.as_str() {
            "error" => {
                errs.push(res);
                continue;
            }
            // Unclassified info chatter: remembered for diagnostics, but
            // still given a chance to match a record below.
            "info" => infos.push(res.clone()),
            _ => {}
        }
        // The second record p4 sends per resolved file; the first one
        // carried the path.
        if res.get("resolveFlag").is_some() {
            continue;
        }

        let res_str = res
            .text("depotFile")
            .or_else(|| res.text("fromFile"))
            .map(|s| s.into_owned())
            .or_else(|| {
                if data.is_empty() {
                    None
                } else {
                    Some(
                        ctx.client_path_to_depot(&data)
                            .unwrap_or_else(|| format!("{head}/{data}")),
                    )
                }
            });
        let Some(res_str) = res_str else {
            errs.push(res);
            continue;
        };
        let res_str = o4_pyforce::unescape(&res_str);

        let hit = fstats
            .iter()
            .position(|f| res_str.contains(&format!("{head}/{}", f.path)));
        match hit {
            Some(i) => {
                let record = fstats.remove(i);
                let full_path = format!("{head}/{}", record.path);
                if code == "mute" {
                    // Benign diagnostics: the record is accounted for but
                    // not re-emitted. A skipped resolve on a moved file is
                    // worth flagging, the rest only worth tracing.
                    if data.contains("resolve skipped")
                        && p4_operation(&full_path, record.revision).starts_with("move/")
                    {
                        writeln!(
                            out,
                            "{}",
                            passthrough(PassKind::Err, &format!("But {full_path} was renamed"))
                        )?;
                    } else {
                        debug!(path = %record.path, "mute p4 diagnostic: {data}");
                    }
                } else {
                    queued.push(record);
                }
                matched_paths.push(full_path);
            }
            None => {
                if matched_paths.iter().any(|p| res_str.contains(p.as_str())) {
                    debug!(reply = %res_str, "repeat p4 reply for an already-matched file");
                } else {
                    errs.push(res);
                }
            }
        }
    }

    if !errs.is_empty() {
        return Ok(Attempt::Abort {
            reason: "Unexpected reply from p4".to_owned(),
            errs,
            infos,
        });
    }
    if fstats.len() == before {
        return Ok(Attempt::Abort {
            reason: "Nothing recognized from p4".to_owned(),
            errs,
            infos,
        });
    }
    Ok(Attempt::Continue)
}

/// p4 refuses to overwrite a writable file. Preserve the local content as
/// `<f>.bak` (rotating any previous backup), drop the write bit, and let
/// the retry clobber it.
fn recover_clobber(fname: &str, out: &mut dyn Write) -> Result<()> {
    let bak = format!("{fname}.bak");
    if Path::new(&bak).exists() {
        let now = epoch_now();
        fs::rename(&bak, format!("{bak}.{now}"))?;
        writeln!(
            out,
            "{}",
            passthrough(PassKind::Info, &format!("Moved previous .bak to {bak}.{now}"))
        )?;
    }
    writeln!(
        out,
        "{}",
        passthrough(PassKind::Info, &format!("Writable file {fname} copied to .bak"))
    )?;
    fs::copy(fname, &bak)?;
    fs::set_permissions(fname, fs::Permissions::from_mode(0o400))?;
    Ok(())
}

/// The recorded head action for `path#rev`, or empty when unknown.
fn p4_operation(path: &str, revision: Revision) -> String {
    let Revision::Number(rev) = revision else {
        return String::new();
    };
    let args = [
        "fstat".to_owned(),
        format!("{}#{rev}", o4_pyforce::escape(path)),
    ];
    match Pyforce::run(args) {
        Ok(records) => records
            .first()
            .and_then(|r| r.text("headAction"))
            .map(|a| o4_pyforce::unescape(&a))
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

fn dump_debug_bundle(
    opts: &PyforceOptions,
    fstats: &[FstatRecord],
    errs: &[P4Record],
    infos: &[P4Record],
) -> Result<String> {
    let as_maps = |records: &[P4Record]| -> Vec<BTreeMap<String, String>> {
        records
            .iter()
            .map(|r| r.iter_text().map(|(k, v)| (k.to_owned(), v)).collect())
            .collect()
    };
    let bundle = serde_json::json!({
        "args": opts.p4args,
        "fstats": fstats.iter().map(FstatRecord::encode).collect::<Vec<_>>(),
        "errs": as_maps(errs),
        "infos": as_maps(infos),
    });
    let fname = format!(".o4/debug-pyforce.{}.{}", std::process::id(), epoch_now());
    fs::write(&fname, serde_json::to_vec_pretty(&bundle)?)?;
    Ok(fname)
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
