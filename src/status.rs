//! `o4 status`: read-only workspace verification.
//!
//! Checksums the workspace against its fstat records and folds in the
//! `p4 opened` state, reporting one line per suspect file:
//!
//! ```text
//!  (!=Checksum fail A=Added D=Deleted M=Modified O=Open R=Renamed)
//! ```
//!
//! Nothing is written — not the workspace, not the have-list, not the
//! markers.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result, bail};
use o4_fstat::cache;
use o4_fstat::record::{FstatRecord, Line, decode_line};
use o4_pyforce::Pyforce;

use crate::config::O4Config;
use crate::context::Context;
use crate::filter::{FilterMode, FilterStage, Predicate};
use crate::fstat_cmd::{self, FstatOptions};
use crate::gatling::{DispatchOptions, Mode};
use crate::pipeline::Pipeline;
use crate::{context, gatling};

#[derive(Clone, Debug, Default)]
pub struct StatusOptions {
    /// The most recent server changelist for the directory.
    pub head: u64,
    /// Also verify deleted files (absence checks), not just content.
    pub check_all: bool,
    /// Only look at changes in the top fifth of the changelist range.
    pub quick: bool,
}

struct OpenInfo {
    action: String,
    moved_to: Option<String>,
}

pub fn run(ctx: &Context, config: &O4Config, opts: &StatusOptions) -> Result<()> {
    let here = std::env::current_dir()?;
    println!("*** INFO: o4 status {}", here.display());
    let o4_dir = Path::new(".o4");
    if !o4_dir.is_dir() {
        println!("Never synced with o4.");
        return Ok(());
    }
    let cur = cache::synced_changelist(o4_dir)
        .or_else(|| cache::find_nearest(o4_dir, opts.head).map(|(cl, _)| cl));
    let Some(cur) = cur else {
        bail!("current changelist could not be determined");
    };

    println!("Current changelist: {cur}");
    println!("  - HEAD is {} (+{})", opts.head, opts.head.saturating_sub(cur));

    let changed = opts.quick.then(|| cur * 4 / 5);
    if let Some(from) = changed {
        println!("Skipping changes before changelist {from}.");
    }
    if !opts.check_all {
        println!("Skipping deleted files.");
    }
    println!("Please be patient...");

    // fstat → [skip deletes] → manifold(drop --checksum) → collect.
    let checked = Arc::new(Mutex::new(0u64));
    let mismatched: Arc<Mutex<Vec<FstatRecord>>> = Arc::new(Mutex::new(Vec::new()));
    let mut p = Pipeline::new();
    {
        let ctx = ctx.clone();
        let config = config.clone();
        let fopts = FstatOptions {
            changelist: cur,
            previous: changed,
            ..Default::default()
        };
        p.stage(format!("o4 fstat ...@{cur}"), move |_, mut out| {
            fstat_cmd::run(&ctx, &config, &fopts, &mut *out)?;
            Ok(())
        });
    }
    {
        let checked = Arc::clone(&checked);
        let check_all = opts.check_all;
        p.stage("count records", move |mut input, mut out| {
            for line in input.lines() {
                let line = line?;
                match decode_line(&line)? {
                    Line::Record(r) if !check_all && r.is_delete() => {}
                    Line::Record(r) => {
                        *checked.lock().expect("poisoned") += 1;
                        use std::io::Write as _;
                        writeln!(out, "{}", r.encode())?;
                    }
                    _ => {}
                }
            }
            Ok(())
        });
    }
    {
        let mut cmd = gatling::ChildCommand::new(
            context::o4_binary()?,
            vec!["drop".to_owned(), "--checksum".to_owned()],
        );
        cmd.envs = ctx.export();
        let dopts = DispatchOptions::new(Mode::Manifold).max_bytes(10 * 1024 * 1024);
        p.stage(format!("manifold {}", cmd.display()), move |mut input, out| {
            gatling::distribute(&dopts, &cmd, &mut *input, out)?;
            Ok(())
        });
    }
    if cfg!(target_os = "macos") {
        let ctx = ctx.clone();
        p.stage("o4 keep --case", move |mut input, mut out| {
            FilterStage::new(ctx, FilterMode::Keep, vec![(Predicate::Case, false)])?
                .run(&mut *input, &mut *out)
        });
    }
    {
        let mismatched = Arc::clone(&mismatched);
        p.stage("collect", move |mut input, _| {
            for line in input.lines() {
                let line = line?;
                if let Line::Record(r) = decode_line(&line)? {
                    mismatched.lock().expect("poisoned").push(r);
                }
            }
            Ok(())
        });
    }
    p.run().context("status verification")?;

    let crcs: BTreeMap<String, FstatRecord> = mismatched
        .lock()
        .expect("poisoned")
        .drain(..)
        .map(|r| (r.path.clone(), r))
        .collect();
    let has_open = opened_details(ctx)?;
    println!("Files checked: {}", *checked.lock().expect("poisoned"));

    let renamed: BTreeMap<&String, &String> = has_open
        .iter()
        .filter(|(_, info)| info.action == "move/delete")
        .filter_map(|(path, info)| info.moved_to.as_ref().map(|to| (path, to)))
        .collect();

    let mut all_paths: Vec<&String> = crcs.keys().chain(has_open.keys()).collect();
    all_paths.sort();
    all_paths.dedup();
    if all_paths.is_empty() {
        println!("*** INFO: All files passed the checksum test and no files are open for edit.");
        return Ok(());
    }

    println!("\nFiles with local modifications:");
    println!(" (!=Checksum fail A=Added D=Deleted M=Modified O=Open R=Renamed)\n");
    for path in &all_paths {
        let open = has_open.get(*path);
        if open.is_some_and(|o| o.action == "move/add") {
            continue;
        }
        let naughty = crcs.contains_key(*path) && open.is_none();
        let n = if naughty { '!' } else { ' ' };

        let mut m = ' ';
        if !Path::new(path.as_str()).exists() && !renamed.contains_key(path) {
            m = 'D';
        }
        if crcs.contains_key(*path) {
            m = 'M';
        }
        let mut r = ' ';
        let mut shown = (*path).clone();
        if let Some(target) = renamed.get(path) {
            r = 'R';
            shown = format!("{path} -> {target}");
            if let Some(record) = crcs.get(*path) {
                // The content now lives at the moved-to path; judge it
                // there.
                let same = o4_pyforce::checksum(Path::new(target.as_str()), &record.size)?
                    .as_deref()
                    == Some(record.checksum.as_str());
                m = if same { ' ' } else { 'M' };
            }
        }
        if open.is_some_and(|o| o.action == "add") {
            m = 'A';
        }
        if m == ' ' && open.is_some() {
            m = 'O';
        }
        println!(" {n}{r}{m}  {shown}");
    }

    if has_open.len() == all_paths.len() {
        let s = if has_open.len() == 1 { "" } else { "s" };
        println!();
        println!(
            "*** INFO: Besides the {} file{s} opened for edit, all files passed the checksum test.",
            has_open.len()
        );
    }
    Ok(())
}

/// `p4 opened` with the moved-to path preserved, keyed by workspace path.
fn opened_details(ctx: &Context) -> Result<BTreeMap<String, OpenInfo>> {
    let prefix = format!("{}/", ctx.depot_root());
    let records = Pyforce::run(["opened", "..."]).context("p4 opened")?;
    let mut out = BTreeMap::new();
    for record in records {
        let Some(depot_file) = record.text("depotFile") else {
            continue;
        };
        let path = o4_pyforce::unescape(&depot_file);
        let Some(path) = path.strip_prefix(&prefix) else {
            continue;
        };
        out.insert(
            path.to_owned(),
            OpenInfo {
                action: record.text("action").unwrap_or_default().into_owned(),
                moved_to: record
                    .text("movedFile")
                    .map(|m| o4_pyforce::unescape(&m))
                    .and_then(|m| m.strip_prefix(&prefix).map(str::to_owned)),
            },
        );
    }
    Ok(out)
}
