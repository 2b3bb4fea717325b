//! `o4 sync`: the orchestrator.
//!
//! A sync composes the fstat merge, filters, dispatchers, and p4 operator
//! stages into a sequence of in-process pipelines:
//!
//! 1. Preflight — the clientspec must be "vanilla" (every View mapping
//!    shares one prefix), and an already-synced directory exits early.
//! 2. Opened files — synced, resolved `-am`, and reverted when the file no
//!    longer exists; the open list then excludes them from the main passes.
//! 3. Delete pass — records whose file should be gone but is not.
//! 4. Content pass — every remaining mismatch, seeded from a local
//!    directory when one is given, with a checksum-verify / `sync -f`
//!    retry loop: p4 occasionally reports success on files that still fail
//!    verification, and re-issuing the forced sync clears it.
//! 5. Post-verify — the server's have-list is reconciled with local state
//!    (`sync -k`), unless `--quick`.
//! 6. Publish — the `.o4/changelist` marker, unless the incomplete flag
//!    was raised.
//!
//! A sync to an older changelist (reverse sync) is the same machinery with
//! synthetic delete records for files added in the intervening range.

use std::collections::BTreeSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use o4_fstat::cache;
use o4_pyforce::Pyforce;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::O4Config;
use crate::context::{self, Context};
use crate::filter::{FilterMode, FilterStage, Predicate};
use crate::fstat_cmd::{self, FstatOptions};
use crate::gatling::{ChildCommand, DispatchOptions, Mode};
use crate::pipeline::Pipeline;
use crate::pyforce_cmd::{self, PyforceOptions};
use crate::{fail, gatling, havelist};

#[derive(Clone, Debug, Default)]
pub struct SyncOptions {
    pub changelist: u64,
    pub seed: Option<PathBuf>,
    pub seed_move: bool,
    /// Skip the post-sync have-list verification.
    pub quick: bool,
    /// Verify and sync every file, not just changes since the last sync.
    pub force: bool,
    /// Leave files opened for edit alone entirely.
    pub skip_opened: bool,
    pub verbose: bool,
}

const GATLING_QUOTA: usize = 256 * 1024;
const MANIFOLD_QUOTA: usize = 10 * 1024 * 1024;

/// Builds the recurring stage shapes of a sync against one context.
struct Stages {
    ctx: Context,
    config: O4Config,
    o4bin: PathBuf,
    /// `pyforce -q` in the verify loop: seeded syncs skip re-verification.
    quiet_pyforce: bool,
}

impl Stages {
    fn o4(&self, args: &[&str]) -> ChildCommand {
        let mut cmd = ChildCommand::new(
            self.o4bin.clone(),
            args.iter().map(|a| (*a).to_owned()).collect(),
        );
        cmd.envs = self.ctx.export();
        cmd
    }

    fn fstat(&self, p: &mut Pipeline, opts: FstatOptions) {
        let name = match opts.previous {
            Some(prev) => format!("o4 fstat ...@{} --changed {prev}", opts.changelist),
            None => format!("o4 fstat ...@{}", opts.changelist),
        };
        let ctx = self.ctx.clone();
        let config = self.config.clone();
        p.stage(name, move |_, mut out| {
            fstat_cmd::run(&ctx, &config, &opts, &mut *out)?;
            Ok(())
        });
    }

    fn filter(
        &self,
        p: &mut Pipeline,
        name: impl Into<String>,
        mode: FilterMode,
        predicates: Vec<(Predicate, bool)>,
    ) {
        let ctx = self.ctx.clone();
        p.stage(name, move |mut input, mut out| {
            FilterStage::new(ctx, mode, predicates)?.run(&mut *input, &mut *out)
        });
    }

    /// `o4 keep --case` on case-insensitive filesystems; nothing elsewhere.
    fn keep_case(&self, p: &mut Pipeline) {
        if cfg!(target_os = "macos") {
            self.filter(
                p,
                "o4 keep --case",
                FilterMode::Keep,
                vec![(Predicate::Case, false)],
            );
        }
    }

    fn dispatch(&self, p: &mut Pipeline, opts: DispatchOptions, cmd: ChildCommand) {
        let mode = match opts.mode {
            Mode::Gatling => "gatling",
            Mode::Manifold => "manifold",
        };
        let name = format!("{mode} {}", cmd.display());
        p.stage(name, move |mut input, out| {
            gatling::distribute(&opts, &cmd, &mut *input, out)?;
            Ok(())
        });
    }

    /// The checksum thinner: a manifold of `o4 drop --checksum` children.
    fn drop_checksum(&self, p: &mut Pipeline) {
        self.dispatch(
            p,
            DispatchOptions::new(Mode::Manifold).max_bytes(MANIFOLD_QUOTA),
            self.o4(&["drop", "--checksum"]),
        );
    }

    /// A gatling of `o4 pyforce <p4 command>` children. `quiet` children
    /// perform their p4 work but emit nothing downstream.
    fn pyforce_gatling(&self, p: &mut Pipeline, no_rev: bool, quiet: bool, p4args: &[&str]) {
        let mut args: Vec<&str> = vec!["pyforce"];
        if quiet {
            args.push("-q");
        }
        if no_rev {
            args.push("--no-rev");
        }
        args.push("--");
        args.extend(p4args);
        self.dispatch(
            p,
            DispatchOptions::new(Mode::Gatling).max_bytes(GATLING_QUOTA),
            self.o4(&args),
        );
    }

    /// One in-process p4 operator stage (no fan-out).
    fn pyforce_inline(&self, p: &mut Pipeline, p4args: &[&str]) {
        let ctx = self.ctx.clone();
        let opts = PyforceOptions {
            p4args: p4args.iter().map(|a| (*a).to_owned()).collect(),
            ..Default::default()
        };
        let name = format!("o4 pyforce {}", p4args.join(" "));
        p.stage(name, move |mut input, mut out| {
            pyforce_cmd::run(&ctx, &opts, &mut *input, &mut *out)
        });
    }

    fn havelist_drop(&self, p: &mut Pipeline) {
        let ctx = self.ctx.clone();
        p.stage("o4 drop --havelist", move |mut input, mut out| {
            havelist::run(&ctx, &mut *input, &mut *out)
        });
    }

    fn fail(&self, p: &mut Pipeline) {
        p.fail_sink("o4 fail", |mut input, _| fail::run(&mut *input));
    }

    /// The seed-or-checksum head of a sync pass, and the sync+verify+retry
    /// tail shared by both passes.
    fn syncit_and_retry(&self, p: &mut Pipeline, opts: &SyncOptions, force_flag: bool) {
        match &opts.seed {
            Some(seed) => {
                let mut args: Vec<String> =
                    vec!["seed-from".to_owned(), seed.display().to_string()];
                if let Some(fstat) = seed_fstat(seed) {
                    args.push("--fstat".to_owned());
                    args.push(fstat.display().to_string());
                }
                if opts.seed_move {
                    args.push("--move".to_owned());
                }
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                self.dispatch(
                    p,
                    DispatchOptions::new(Mode::Manifold),
                    self.o4(&arg_refs),
                );
                self.keep_case(p);
            }
            None => {
                // Pre-thin: drop records whose content is already right.
                self.drop_checksum(p);
                self.keep_case(p);
                let sync: &[&str] = if force_flag { &["sync", "-f"] } else { &["sync"] };
                self.pyforce_gatling(p, false, self.quiet_pyforce, sync);
                self.drop_checksum(p);
            }
        }
        // Verification retries: two more forced rounds before giving up.
        for _ in 0..2 {
            self.pyforce_gatling(p, false, self.quiet_pyforce, &["sync", "-f"]);
            self.drop_checksum(p);
        }
        self.fail(p);
    }
}

pub fn run(ctx: &Context, config: &O4Config, opts: &SyncOptions) -> Result<()> {
    let o4_dir = Path::new(".o4");
    let changelist = opts.changelist;

    if !config.allow_nonflat_clientspec() && !context::clientspec_is_vanilla()? {
        bail!(
            "o4 does not support a clientspec that maps a depot path to a \
             non-matching local path. If you do not need such a mapping, \
             remove it and sync again; until then use p4/p4v to sync."
        );
    }

    let previous_cl = cache::synced_changelist(o4_dir).unwrap_or(0);
    info!(changelist, previous_cl, force = opts.force, "o4 sync");
    if previous_cl == changelist && !opts.force {
        println!(
            "*** INFO: {} is already synced to {changelist}, use -f to force a full verification.",
            std::env::current_dir()?.display()
        );
        return Ok(());
    }
    cache::clear_synced_changelist(o4_dir)?;
    cache::clear_incomplete(o4_dir)?;

    let stages = Stages {
        ctx: ctx.clone(),
        config: config.clone(),
        o4bin: context::o4_binary()?,
        quiet_pyforce: opts.seed.is_some(),
    };

    // Incremental unless forced or never fully synced.
    let changed = if previous_cl != 0 && !opts.force {
        Some(previous_cl)
    } else {
        None
    };
    let fstat_opts = |extra: &dyn Fn(&mut FstatOptions)| {
        let mut f = FstatOptions {
            changelist,
            previous: changed,
            force: opts.force,
            verbose: opts.verbose,
            ..Default::default()
        };
        extra(&mut f);
        f
    };

    // --- Opened files ---
    let opened = context::opened_files(ctx.depot_root())?;
    let mut open_list: Option<NamedTempFile> = None;
    if opened.is_empty() {
        println!("*** INFO: There are no opened files.");
    } else {
        std::fs::create_dir_all(o4_dir)?;
        let mut listing = NamedTempFile::new_in(o4_dir)?;
        let mut move_adds: Vec<String> = Vec::new();
        let mut move_deletes: Vec<String> = Vec::new();
        println!("*** INFO: Opened for edit in {}:", ctx.depot_root());
        for (i, (path, action)) in opened.iter().enumerate() {
            writeln!(listing, "{path}")?;
            match action.as_str() {
                "move/add" => move_adds.push(path.clone()),
                "move/delete" => move_deletes.push(path.clone()),
                _ => {}
            }
            if i < 10 {
                println!("*** INFO: --keeping {path}");
            }
        }
        if opened.len() > 10 {
            println!("          (and {} more)", opened.len() - 10);
        }
        listing.flush()?;
        let listing_path = listing.path().to_owned();
        open_list = Some(listing);

        if opts.skip_opened {
            println!("*** INFO: Not syncing {} files opened for edit.", opened.len());
        } else {
            let deleted_set: BTreeSet<String> = move_deletes.iter().cloned().collect();
            let drop_deleted = |s: &Stages, p: &mut Pipeline| {
                if !deleted_set.is_empty() {
                    s.filter(
                        p,
                        "o4 drop --deleted …",
                        FilterMode::Drop,
                        vec![(Predicate::Deleted(deleted_set.clone()), false)],
                    );
                }
            };

            let mut p = Pipeline::new();
            stages.fstat(
                &mut p,
                fstat_opts(&|f| {
                    f.keep = Some(listing_path.clone());
                    f.add = move_adds.clone();
                }),
            );
            stages.pyforce_gatling(&mut p, false, false, &["sync"]);
            // Resolve before reverting so files unresolved for other
            // reasons get their chance.
            stages.pyforce_gatling(&mut p, true, false, &["resolve", "-am"]);
            drop_deleted(&stages, &mut p);
            stages.filter(
                &mut p,
                "o4 drop --existence",
                FilterMode::Drop,
                vec![(Predicate::Existence, false)],
            );
            stages.pyforce_gatling(&mut p, true, false, &["revert"]);
            drop_deleted(&stages, &mut p);
            stages.filter(
                &mut p,
                "o4 drop --existence",
                FilterMode::Drop,
                vec![(Predicate::Existence, false)],
            );
            stages.fail(&mut p);
            announce(&p);
            p.run().context("syncing files opened for edit")?;
        }
    }
    let drop_list = open_list.as_ref().map(|f| f.path().to_owned());

    // --- Delete pass: records that should be gone but still exist ---
    let mut p = Pipeline::new();
    stages.fstat(
        &mut p,
        fstat_opts(&|f| f.drop = drop_list.clone()),
    );
    stages.filter(
        &mut p,
        "o4 drop --not-deletes --existence",
        FilterMode::Drop,
        vec![(Predicate::Deletes, true), (Predicate::Existence, false)],
    );
    stages.syncit_and_retry(&mut p, opts, opts.force);
    announce(&p);
    p.run().context("delete pass")?;

    // --- Seed flush: align the have-list without transferring data ---
    if opts.seed.is_some() && previous_cl == 0 {
        println!("*** INFO: Flushing to changelist {changelist}, please do not interrupt");
        let results =
            Pyforce::run(["-q", "sync", "-k", &format!("...@{changelist}")]).context("p4 sync -k")?;
        debug!(records = results.len(), "flush complete");
    }

    // --- Content pass: every remaining non-delete record ---
    let mut p = Pipeline::new();
    stages.fstat(
        &mut p,
        fstat_opts(&|f| f.drop = drop_list.clone()),
    );
    stages.filter(
        &mut p,
        "o4 drop --deletes",
        FilterMode::Drop,
        vec![(Predicate::Deletes, false)],
    );
    stages.syncit_and_retry(&mut p, opts, opts.force);
    announce(&p);
    p.run().context("content pass")?;

    // --- Post-verify: reconcile the server's have-list ---
    if opts.seed.is_some() || !opts.quick {
        println!("*** INFO: Sync is now locally complete, verifying server havelist.");
        let mut p = Pipeline::new();
        stages.fstat(
            &mut p,
            fstat_opts(&|f| f.drop = drop_list.clone()),
        );
        stages.havelist_drop(&mut p);
        stages.keep_case(&mut p);
        if changed.is_some() {
            // Incremental: few records expected; one operator is cheaper
            // than a pool.
            stages.pyforce_inline(&mut p, &["sync", "-k"]);
        } else {
            let cmd = stages.o4(&["pyforce", "--", "sync", "-k"]);
            stages.dispatch(
                &mut p,
                DispatchOptions::new(Mode::Gatling)
                    .max_bytes(GATLING_QUOTA)
                    .max_procs(4),
                cmd,
            );
        }
        stages.havelist_drop(&mut p);
        stages.fail(&mut p);
        announce(&p);
        p.run().context("havelist verification")?;
    }

    // --- Publish ---
    let actual_cl = cache::find_nearest(o4_dir, changelist).map(|(cl, _)| cl);
    if cache::is_incomplete(o4_dir) {
        println!(
            "*** WARNING: Sync finished with warnings; {} not updated.",
            o4_dir.join(cache::SYNCED_CL_FILE).display()
        );
        cache::clear_incomplete(o4_dir)?;
    } else if let Some(actual_cl) = actual_cl {
        cache::write_synced_changelist(o4_dir, actual_cl)?;
    }

    if let Some(actual_cl) = actual_cl {
        if actual_cl != changelist {
            println!("*** INFO: Changelist {changelist} does not affect this directory.");
            println!("          Synced to {actual_cl} (the closest previous change that does).");
        }
        if previous_cl == actual_cl && !opts.force {
            println!(
                "*** INFO: {} is already synced to {actual_cl}, use -f to force a full verification.",
                std::env::current_dir()?.display()
            );
        }
    }

    maybe_prune(o4_dir, config)?;
    Ok(())
}

fn announce(p: &Pipeline) {
    println!(
        "*** INFO: [{}] {}",
        std::env::current_dir().unwrap_or_default().display(),
        p.description()
    );
}

/// The seed's own fstat cache, if it has one and nothing under the seed is
/// opened for edit (an open file makes the cache a lie).
fn seed_fstat(seed: &Path) -> Option<PathBuf> {
    let seed_str = seed.display().to_string();
    match Pyforce::run(["opened", &format!("{seed_str}/...")]) {
        Ok(records) if !records.is_empty() => return None,
        Err(_) => return None,
        Ok(_) => {}
    }
    cache::find_nearest(&seed.join(".o4"), 10_000_000_000).map(|(_, path)| path)
}

/// Thin the cache when the directory outgrows its configured ceiling.
fn maybe_prune(o4_dir: &Path, config: &O4Config) -> Result<()> {
    let Some(ceiling) = config.maximum_dir_size() else {
        return Ok(());
    };
    let used: u64 = std::fs::read_dir(o4_dir)?
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum();
    if used > ceiling {
        let removed =
            cache::prune_archive_cache(o4_dir)? + cache::prune_fstat_cache(o4_dir)?;
        info!(used, ceiling, removed, "pruned cache directory");
    }
    Ok(())
}
