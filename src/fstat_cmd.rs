//! `o4 fstat`: stream fstat records for a depot directory.
//!
//! The source stage of every pipeline. Forward mode streams the merge
//! iterator for `(previous, changelist]`, optionally thinning through
//! `--drop`/`--keep` path lists. Reverse mode (`previous > changelist`)
//! enumerates what should exist at the target, synthesizes delete records
//! for files added in between, and replays the target stream.
//!
//! The merge iterator must always be run dry — even when a `--keep` list is
//! exhausted early — or the new cache file is lost and the next sync
//! repeats the server work.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Result, bail};
use o4_fstat::cache;
use o4_fstat::record::Revision;
use o4_fstat::server::FstatServer;
use o4_fstat::{FstatMerge, FstatRecord, MergeOptions};
use tracing::{debug, info};

use crate::config::O4Config;
use crate::context::Context;

/// Checksum for `--add` dummy records; recognizably fake, never matches
/// content.
const ADDED_CHECKSUM: &str = "DEADFACEDEADFACEDEADFACEDEADFACE";

#[derive(Clone, Debug, Default)]
pub struct FstatOptions {
    pub changelist: u64,
    /// Emit only changes after this changelist (`--changed`).
    pub previous: Option<u64>,
    /// File listing paths to exclude.
    pub drop: Option<PathBuf>,
    /// File listing the only paths to include.
    pub keep: Option<PathBuf>,
    /// Paths to emit dummy entries for (unsubmitted renames).
    pub add: Vec<String>,
    /// Format string printed after the stream; `{actual_cl}` and
    /// `{changelist}` interpolate.
    pub report: Option<String>,
    /// Only build the cache file; no streaming.
    pub quiet: bool,
    /// Reverse sync: sync every file, not just the keep set.
    pub force: bool,
    pub verbose: bool,
}

pub fn run(
    ctx: &Context,
    config: &O4Config,
    opts: &FstatOptions,
    out: &mut dyn Write,
) -> Result<Option<u64>> {
    let o4_dir = PathBuf::from(".o4");
    let changelist = opts.changelist;
    let mut previous = opts.previous.unwrap_or(0);
    debug!(changelist, previous, "o4 fstat");
    if previous != 0 && previous == changelist {
        return Ok(Some(changelist));
    }

    let new_merge = |to_cl: u64, from_cl: u64| {
        FstatMerge::new(MergeOptions {
            depot_path: ctx.depot_path.clone(),
            to_cl,
            from_cl,
            o4_dir: o4_dir.clone(),
            server: config.fstat_server().map(FstatServer::new),
        })
    };

    if opts.quiet {
        if opts.drop.is_some() || opts.keep.is_some() {
            bail!("quiet fstat does not support --drop or --keep");
        }
        let actual = new_merge(changelist, previous).drain()?;
        if let Some(cl) = actual {
            info!(cache = %format!("{}/{cl}.fstat.gz", o4_dir.display()), "created fstat cache");
        }
        write_report(opts, out, actual, changelist)?;
        return Ok(actual);
    }

    let mut drop_set = read_path_list(&opts.drop)?;
    let mut keep_set = read_path_list(&opts.keep)?;
    for fname in &opts.add {
        let dummy = FstatRecord {
            changelist,
            path: fname.clone(),
            revision: Revision::UseCl,
            size: Default::default(),
            checksum: ADDED_CHECKSUM.to_owned(),
        };
        writeln!(out, "{}", dummy.encode())?;
    }

    if previous > changelist {
        // Reverse sync: anything added in (changelist, previous] has to go.
        let mut past_paths: HashSet<String> = HashSet::new();
        let mut past = new_merge(changelist, 0);
        for record in &mut past {
            past_paths.insert(record?.path);
        }

        let drop = drop_set.get_or_insert_with(HashSet::new);
        let keep = keep_set.get_or_insert_with(HashSet::new);
        let mut added = new_merge(previous, changelist);
        for record in &mut added {
            let record = record?;
            if !past_paths.contains(&record.path) {
                writeln!(
                    out,
                    "{}",
                    FstatRecord::delete(changelist, record.path.clone()).encode()
                )?;
                if opts.force {
                    drop.insert(record.path);
                }
            } else if !opts.force {
                keep.insert(record.path);
            }
        }
        previous = 0;
    }

    // A path in both lists is dropped: the drop list is the open-file list,
    // and open files must never reach the sync.
    if let (Some(drop), Some(keep)) = (&drop_set, &mut keep_set) {
        keep.retain(|p| !drop.contains(p));
    }
    let mut drop_set = drop_set.filter(|s| !s.is_empty());
    let mut keep_set = keep_set.filter(|s| !s.is_empty());

    let mut n_records: u64 = 0;
    let mut n_deleted: u64 = 0;
    let mut merge = new_merge(changelist, previous);
    while let Some(record) = merge.next() {
        let record = record?;
        n_records += 1;
        if record.is_delete() {
            n_deleted += 1;
        }
        if let Some(drop) = &mut drop_set {
            if drop.remove(&record.path) {
                continue;
            }
        }
        if let Some(keep) = &mut keep_set {
            if !keep.remove(&record.path) {
                continue;
            }
            if keep.is_empty() {
                writeln!(out, "{}", record.encode())?;
                // The keep list is satisfied; run the iterator dry so the
                // cache still gets written.
                merge.drain()?;
                break;
            }
        }
        writeln!(out, "{}", record.encode())?;
    }
    merge.drain()?;

    let actual = cache::find_nearest(&o4_dir, changelist).map(|(cl, _)| cl);
    if opts.verbose {
        eprintln!("# fstat records: {n_records} ({n_deleted} deletes)");
    }
    write_report(opts, out, actual, changelist)?;
    Ok(actual)
}

fn write_report(
    opts: &FstatOptions,
    out: &mut dyn Write,
    actual: Option<u64>,
    changelist: u64,
) -> Result<()> {
    if let Some(fmt) = &opts.report {
        let actual = actual.unwrap_or(0);
        let line = fmt
            .replace("{actual_cl}", &actual.to_string())
            .replace("{changelist}", &changelist.to_string());
        writeln!(out, "{line}")?;
    }
    Ok(())
}

fn read_path_list(path: &Option<PathBuf>) -> Result<Option<HashSet<String>>> {
    match path {
        None => Ok(None),
        Some(path) => {
            let content = fs::read_to_string(path)?;
            Ok(Some(content.lines().map(str::to_owned).collect()))
        }
    }
}
