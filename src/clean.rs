//! `o4 clean`: scrub a workspace back to a pristine changelist.
//!
//! Everything except `.o4/` is moved aside into `.o4/cleaning/`, files
//! opened for edit are rescued back, and a forced sync runs with the set-
//! aside tree as a move-seed — so untouched files simply move home instead
//! of being re-fetched. What remains in the set-aside tree afterwards is
//! the dirt: saved under `.o4/cleaned/` for inspection, or discarded.

use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use o4_fstat::cache;

use crate::config::O4Config;
use crate::context::{self, Context};
use crate::sync::{self, SyncOptions};

#[derive(Clone, Debug, Default)]
pub struct CleanOptions {
    /// Explicit `@cl` from the command line, when given.
    pub changelist: Option<u64>,
    pub quick: bool,
    /// Continue a previously interrupted clean.
    pub resume: bool,
    /// Delete the dirt instead of saving it under `.o4/cleaned`.
    pub discard: bool,
}

pub fn run(ctx: &Context, config: &O4Config, opts: &CleanOptions) -> Result<()> {
    let target = std::env::current_dir()?;
    let source = target.join(".o4/cleaning");
    let cleaned = target.join(".o4/cleaned");

    if rm_empty_dirs(&cleaned)? > 0 {
        bail!(
            "unhandled files still exist from a previous clean run; \
             delete (if unwanted) or move files from {} back into {}",
            cleaned.display(),
            target.display()
        );
    }
    if source.exists() && !opts.resume {
        bail!("previous clean was interrupted; use --resume");
    }

    let changelist = resolve_changelist(ctx, opts, &source)?;

    if opts.resume {
        if !source.exists() {
            bail!("cannot resume cleaning; {} does not exist", source.display());
        }
    } else {
        fs::create_dir_all(&source)?;
        move_except(&target, &source, ".o4")?;

        // Files opened for edit keep their local content; move them back
        // before the sync pass.
        let opened = context::opened_files(ctx.depot_root())?;
        let rescued: Vec<&String> = opened
            .iter()
            .filter(|(_, action)| !action.contains("delete"))
            .map(|(path, _)| path)
            .collect();
        println!("*** INFO: Not cleaning {} files opened for edit.", rescued.len());
        for path in rescued {
            let from = source.join(path);
            if !from.exists() {
                continue;
            }
            let to = target.join(path);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&from, &to)
                .with_context(|| format!("rescuing opened file {path}"))?;
        }
    }

    let mut ctx = ctx.clone();
    ctx.changelist = changelist;
    sync::run(
        &ctx,
        config,
        &SyncOptions {
            changelist,
            seed: Some(source.clone()),
            seed_move: true,
            quick: opts.quick,
            force: true,
            skip_opened: true,
            verbose: false,
        },
    )?;

    if opts.discard {
        fs::remove_dir_all(&source)?;
        return Ok(());
    }
    if cleaned.exists() {
        fs::remove_dir_all(&cleaned)?;
    }
    fs::rename(&source, &cleaned)?;
    let nested_o4 = cleaned.join(".o4");
    if nested_o4.exists() {
        fs::remove_dir_all(&nested_o4)?;
    }
    let leftover = rm_empty_dirs(&cleaned)?;
    eprintln!("*** INFO: Directory is clean @{changelist}");
    if leftover > 0 {
        eprintln!("          {leftover} dirty files remain under {}", cleaned.display());
    } else {
        eprintln!("          Congratulations! No dirty files left over.");
    }
    Ok(())
}

/// The changelist to clean to: explicit `@cl`, the current marker, the
/// interrupted run's marker, or head.
fn resolve_changelist(ctx: &Context, opts: &CleanOptions, source: &Path) -> Result<u64> {
    if let Some(cl) = opts.changelist {
        return Ok(cl);
    }
    if let Some(cl) = cache::synced_changelist(Path::new(".o4")) {
        return Ok(cl);
    }
    if opts.resume {
        if let Some(cl) = cache::synced_changelist(&source.join(".o4")) {
            return Ok(cl);
        }
    }
    crate::head::resolve_single(&ctx.client_root, ctx.depot_root())
}

fn move_except(from: &Path, to: &Path, but_not: &str) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == but_not {
            continue;
        }
        fs::rename(entry.path(), to.join(&name))
            .with_context(|| format!("setting aside {}", entry.path().display()))?;
    }
    Ok(())
}

/// Remove all directories that contain only directories, bottom-up. Returns
/// how many non-directory files remain below `root`.
fn rm_empty_dirs(root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }
    fn sweep(dir: &Path, files: &mut usize) -> Result<bool> {
        let mut empty = true;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && !path.is_symlink() {
                if sweep(&path, files)? {
                    fs::remove_dir(&path)?;
                } else {
                    empty = false;
                }
            } else {
                *files += 1;
                empty = false;
            }
        }
        Ok(empty)
    }
    let mut files = 0;
    sweep(root, &mut files)?;
    Ok(files)
}
