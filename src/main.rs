use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::{Args, Parser, Subcommand};

use o4::clean::{self, CleanOptions};
use o4::config::O4Config;
use o4::context::{self, Context};
use o4::fail;
use o4::filter::{FilterMode, FilterStage, Predicate};
use o4::fstat_cmd::{self, FstatOptions};
use o4::havelist;
use o4::head;
use o4::pyforce_cmd::{self, PyforceOptions};
use o4::seed::{self, SeedOptions};
use o4::status::{self, StatusOptions};
use o4::sync::{self, SyncOptions};
use o4::telemetry;

/// High-throughput Perforce workspace synchronizer
///
/// o4 brings a depot directory to a requested changelist much faster than
/// `p4 sync`, verifying content checksums on the way and keeping a local
/// fstat cache under `.o4/` so repeated syncs skip the server. The common
/// entry point is `o4 sync`; the other subcommands are the pipeline stages
/// a sync composes, exposed for scripting and diagnosis.
#[derive(Parser)]
#[command(name = "o4")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'o4 <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync/verify a depot directory
    ///
    /// The path may carry an explicit target as `<path>@<changelist>`;
    /// without one the most recent server change is used. A directory path
    /// implies a trailing `/...`.
    Sync(SyncArgs),

    /// Verify the workspace against its fstat records, like `git status`
    Status(StatusArgs),

    /// Scrub a directory back to a pristine changelist
    ///
    /// Everything not belonging at the changelist is set aside under
    /// `.o4/cleaned/` (or deleted with --discard); files opened for edit
    /// are left alone.
    Clean(CleanArgs),

    /// Stream fstat records for a depot path
    Fstat(FstatArgs),

    /// Forward records that satisfy every filter
    Keep(FilterArgs),

    /// Forward records that satisfy none of the filters
    Drop(DropArgs),

    /// Forward records that satisfy at least one filter
    #[command(name = "keep-any")]
    KeepAny(FilterArgs),

    /// Run a p4 command over the records on stdin
    Pyforce(PyforceArgs),

    /// Copy matching files from a seed directory instead of the server
    #[command(name = "seed-from")]
    SeedFrom(SeedArgs),

    /// Resolve and cache the head changelist for depot paths
    Head(HeadArgs),

    /// Terminal pipeline sink: report and reject leftover records
    Fail,

    /// Display version information
    Version(VersionArgs),
}

#[derive(Args)]
struct SyncArgs {
    /// Depot or local directory, optionally with @<changelist>
    path: String,

    /// Be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// Skip the post-sync havelist verification
    #[arg(short = 'q')]
    quick: bool,

    /// Force every file to be verified and synced
    #[arg(short = 'f')]
    force: bool,

    /// Do not sync files opened for edit (spelled `+o`)
    #[arg(long)]
    skip_opened: bool,

    /// Seed the sync with files from a local directory
    #[arg(short = 's', value_name = "seed")]
    seed: Option<PathBuf>,

    /// Move files out of the seed rather than copying them
    #[arg(long = "move", requires = "seed")]
    move_seed: bool,
}

#[derive(Args)]
struct StatusArgs {
    /// Depot or local directory, optionally with @<changelist>
    path: String,

    /// Check all files, including deleted ones
    #[arg(short = 'f')]
    check_all: bool,

    /// Faster check covering only the top fifth of the changelist range
    #[arg(short = 'q')]
    quick: bool,
}

#[derive(Args)]
struct CleanArgs {
    /// Depot or local directory, optionally with @<changelist>
    path: String,

    /// Skip the post-sync havelist verification
    #[arg(short = 'q')]
    quick: bool,

    /// Resume an interrupted clean
    #[arg(long)]
    resume: bool,

    /// Delete files that should not exist instead of saving them
    #[arg(long)]
    discard: bool,
}

#[derive(Args)]
struct FstatArgs {
    /// Depot or local directories, optionally with @<changelist>
    #[arg(required = true)]
    paths: Vec<String>,

    /// Only build the cache file, stream nothing
    #[arg(short = 'q')]
    quiet: bool,

    /// Reverse sync: cover every file, not just the keep set
    #[arg(short = 'f')]
    force: bool,

    /// Print record statistics on stderr
    #[arg(short = 'v')]
    verbose: bool,

    /// Only output records changed after this changelist
    #[arg(long, value_name = "previous")]
    changed: Option<u64>,

    /// Exclude paths listed in this file
    #[arg(long, value_name = "fname")]
    drop: Option<PathBuf>,

    /// Limit output to paths listed in this file
    #[arg(long, value_name = "fname")]
    keep: Option<PathBuf>,

    /// Emit a dummy entry for this path (unsubmitted renames)
    #[arg(long, value_name = "fname")]
    add: Vec<String>,

    /// Print this report after the stream; {actual_cl} interpolates
    #[arg(long, value_name = "fmt")]
    report: Option<String>,
}

#[derive(Args, Clone)]
struct FilterArgs {
    /// Match files whose on-disk path case agrees with the record
    #[arg(long)]
    case: bool,
    /// Opposite of --case
    #[arg(long)]
    not_case: bool,

    /// Match files open for edit
    #[arg(long)]
    open: bool,
    /// Opposite of --open
    #[arg(long)]
    not_open: bool,

    /// Match files whose presence on disk agrees with the record
    #[arg(long)]
    existence: bool,
    /// Opposite of --existence
    #[arg(long)]
    not_existence: bool,

    /// Match files with the correct checksum
    #[arg(long)]
    checksum: bool,
    /// Opposite of --checksum
    #[arg(long)]
    not_checksum: bool,

    /// Match delete records
    #[arg(long)]
    deletes: bool,
    /// Opposite of --deletes
    #[arg(long)]
    not_deletes: bool,

    /// Match the named file when it does not exist on disk
    #[arg(long, value_name = "fname")]
    deleted: Vec<String>,
}

#[derive(Args)]
struct DropArgs {
    #[command(flatten)]
    filters: FilterArgs,

    /// Drop records the server's have-list already agrees with
    #[arg(long)]
    havelist: bool,
}

#[derive(Args)]
struct PyforceArgs {
    /// Perform the p4 work but emit no records downstream
    #[arg(short = 'q')]
    quiet: bool,

    /// Send bare paths without a #rev/@cl selector
    #[arg(long)]
    no_rev: bool,

    /// Trace every p4 response
    #[arg(long)]
    debug: bool,

    /// The p4 command and its arguments (after --)
    #[arg(last = true, required = true)]
    p4args: Vec<String>,
}

#[derive(Args)]
struct SeedArgs {
    /// The seed directory
    dir: PathBuf,

    /// The seed's fstat cache file, when trustworthy
    #[arg(long, value_name = "fstat")]
    fstat: Option<PathBuf>,

    /// Move files out of the seed rather than copying them
    #[arg(long = "move")]
    move_files: bool,
}

#[derive(Args)]
struct HeadArgs {
    #[arg(required = true)]
    paths: Vec<String>,
}

#[derive(Args)]
struct VersionArgs {
    /// Exit nonzero if this o4 is older than maj.min.patch
    #[arg(long, value_name = "compare")]
    at_least: Option<String>,
}

fn main() {
    telemetry::init();
    let argv = preprocess_argv(std::env::args().collect());
    let cli = Cli::parse_from(argv);
    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            if is_broken_pipe(&e) {
                eprintln!("*** ERROR: broken pipe");
            } else {
                eprintln!("*** ERROR: {e:#}");
            }
            1
        }
    };
    std::process::exit(code);
}

/// Pre-clap argv fixups: the historical `+o` spelling, configured default
/// arguments after the subcommand word, and an implied `--` for pyforce
/// (p4's flags would otherwise read as unknown o4 options).
fn preprocess_argv(mut argv: Vec<String>) -> Vec<String> {
    for arg in argv.iter_mut() {
        if arg == "+o" {
            *arg = "--skip-opened".to_owned();
        }
    }
    let Some(sub_at) = argv.iter().skip(1).position(|a| !a.starts_with('-')) else {
        return argv;
    };
    let sub_at = sub_at + 1;
    let subcommand = argv[sub_at].clone();

    let config = O4Config::load();
    let extra = config.cmdline_args(&subcommand);
    argv.splice(sub_at + 1..sub_at + 1, extra);

    if subcommand == "pyforce" && !argv.iter().any(|a| a == "--") {
        let mut insert_at = sub_at + 1;
        while argv
            .get(insert_at)
            .is_some_and(|a| matches!(a.as_str(), "-q" | "--no-rev" | "--debug"))
        {
            insert_at += 1;
        }
        argv.insert(insert_at, "--".to_owned());
    }
    argv
}

fn is_broken_pipe(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::BrokenPipe)
    })
}

fn run(cli: Cli) -> Result<()> {
    let config = O4Config::load();
    match cli.command {
        Commands::Sync(args) => {
            // The seed is relative to where the user ran o4, not to the
            // workspace we are about to enter.
            let seed = args.seed.as_ref().map(|s| absolutize(s));
            let ws = enter_workspace(&args.path)?;
            let changelist = resolve_target(&ws)?;
            let ctx = ws.context(changelist);
            sync::run(
                &ctx,
                &config,
                &SyncOptions {
                    changelist,
                    seed,
                    seed_move: args.move_seed,
                    quick: args.quick,
                    force: args.force,
                    skip_opened: args.skip_opened,
                    verbose: args.verbose,
                },
            )
        }
        Commands::Status(args) => {
            let ws = enter_workspace(&args.path)?;
            let head_cl = resolve_target(&ws)?;
            let ctx = ws.context(head_cl);
            status::run(
                &ctx,
                &config,
                &StatusOptions {
                    head: head_cl,
                    check_all: args.check_all,
                    quick: args.quick,
                },
            )
        }
        Commands::Clean(args) => {
            let ws = enter_workspace(&args.path)?;
            let ctx = ws.context(ws.explicit_cl.unwrap_or(0));
            clean::run(
                &ctx,
                &config,
                &CleanOptions {
                    changelist: ws.explicit_cl,
                    quick: args.quick,
                    resume: args.resume,
                    discard: args.discard,
                },
            )
        }
        Commands::Fstat(args) => run_fstat(&config, args),
        Commands::Keep(args) => run_filter(FilterMode::Keep, &args),
        Commands::Drop(args) => {
            if args.havelist {
                let ctx = Context::from_env()?;
                let stdin = std::io::stdin();
                let stdout = std::io::stdout();
                havelist::run(&ctx, &mut stdin.lock(), &mut stdout.lock())
            } else {
                run_filter(FilterMode::Drop, &args.filters)
            }
        }
        Commands::KeepAny(args) => run_filter(FilterMode::KeepAny, &args),
        Commands::Pyforce(args) => {
            let ctx = Context::from_env()?;
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            pyforce_cmd::run(
                &ctx,
                &PyforceOptions {
                    no_revision: args.no_rev,
                    debug: args.debug,
                    quiet: args.quiet,
                    p4args: args.p4args,
                },
                &mut stdin.lock(),
                &mut stdout.lock(),
            )
        }
        Commands::SeedFrom(args) => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            seed::run(
                &SeedOptions {
                    dir: args.dir,
                    fstat: args.fstat,
                    move_files: args.move_files,
                },
                &mut stdin.lock(),
                &mut stdout.lock(),
            )
        }
        Commands::Head(args) => {
            let client_root = context::client_root()?;
            let depots: Vec<String> = args
                .paths
                .iter()
                .map(|p| depot_abs_path(p, &client_root))
                .collect::<Result<_>>()?;
            head::run(&client_root, &depots)?;
            Ok(())
        }
        Commands::Fail => {
            let stdin = std::io::stdin();
            fail::run(&mut stdin.lock())
        }
        Commands::Version(args) => run_version(&args),
    }
}

fn run_filter(mode: FilterMode, args: &FilterArgs) -> Result<()> {
    let mut predicates: Vec<(Predicate, bool)> = Vec::new();
    // This order mirrors cost: cheap record-only tests first, checksums and
    // server lookups last.
    for (flag, predicate, invert) in [
        (args.deletes, Predicate::Deletes, false),
        (args.not_deletes, Predicate::Deletes, true),
        (args.existence, Predicate::Existence, false),
        (args.not_existence, Predicate::Existence, true),
        (args.checksum, Predicate::Checksum, false),
        (args.not_checksum, Predicate::Checksum, true),
        (args.case, Predicate::Case, false),
        (args.not_case, Predicate::Case, true),
        (args.open, Predicate::Open, false),
        (args.not_open, Predicate::Open, true),
    ] {
        if flag {
            predicates.push((predicate, invert));
        }
    }
    if !args.deleted.is_empty() {
        let names: BTreeSet<String> = args.deleted.iter().cloned().collect();
        predicates.push((Predicate::Deleted(names), false));
    }
    let ctx = Context::from_env()?;
    let mut stage = FilterStage::new(ctx, mode, predicates)?;
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    stage.run(&mut stdin.lock(), &mut stdout.lock())
}

fn run_fstat(config: &O4Config, args: FstatArgs) -> Result<()> {
    // Resolve every path before the first chdir; later arguments may be
    // relative to where the user started.
    let client_root = context::client_root()?;
    let parsed: Vec<(String, Option<u64>)> = args
        .paths
        .iter()
        .map(|arg| {
            let (path, cl) = split_changelist(arg);
            depot_abs_path(&path, &client_root).map(|depot| (depot, cl))
        })
        .collect::<Result<_>>()?;

    for (depot, explicit_cl) in parsed {
        let ws = Workspace {
            depot_root: depot,
            client_root: client_root.clone(),
            explicit_cl,
        };
        ws.enter()?;
        let changelist = resolve_target(&ws)?;
        let ctx = ws.context(changelist);
        let stdout = std::io::stdout();
        fstat_cmd::run(
            &ctx,
            config,
            &FstatOptions {
                changelist,
                previous: args.changed,
                drop: args.drop.clone(),
                keep: args.keep.clone(),
                add: args.add.clone(),
                report: args.report.clone(),
                quiet: args.quiet,
                force: args.force,
                verbose: args.verbose,
            },
            &mut stdout.lock(),
        )?;
    }
    Ok(())
}

fn run_version(args: &VersionArgs) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    match &args.at_least {
        None => {
            println!("o4 {version}");
            Ok(())
        }
        Some(required) => {
            let current = parse_version(version)
                .ok_or_else(|| anyhow::anyhow!("unparseable build version {version}"))?;
            let wanted = parse_version(required)
                .with_context(|| format!("unparseable version {required}"))?;
            if current < wanted {
                bail!("o4 {version} is older than {required}; please update");
            }
            Ok(())
        }
    }
}

fn parse_version(v: &str) -> Option<(u64, u64, u64)> {
    let mut parts = v.split('.').map(|p| p.parse::<u64>().ok());
    let major = parts.next().flatten()?;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

/// A workspace directory selected on the command line, before any p4
/// target resolution.
struct Workspace {
    /// `//depot/dir` form, no trailing `/...`.
    depot_root: String,
    client_root: PathBuf,
    explicit_cl: Option<u64>,
}

impl Workspace {
    fn enter(&self) -> Result<()> {
        let target = self.client_root.join(self.depot_root.trim_start_matches('/'));
        fs::create_dir_all(target.join(".o4"))?;
        std::env::set_current_dir(&target)
            .with_context(|| format!("entering {}", target.display()))?;
        Ok(())
    }

    fn context(&self, changelist: u64) -> Context {
        Context {
            depot_path: format!("{}/...", self.depot_root),
            client_root: self.client_root.clone(),
            client_path: self
                .client_root
                .join(self.depot_root.trim_start_matches('/'))
                .display()
                .to_string(),
            changelist,
        }
    }
}

/// Parse the path argument, enter the directory, prepare `.o4/`.
fn enter_workspace(arg: &str) -> Result<Workspace> {
    let client_root = context::client_root()?;
    let (path, explicit_cl) = split_changelist(arg);
    let depot_root = depot_abs_path(&path, &client_root)?;
    let ws = Workspace {
        depot_root,
        client_root,
        explicit_cl,
    };
    ws.enter()?;
    Ok(ws)
}

/// The sync target: `$O4HEAD`, or the server's head change, clamped to any
/// explicit `@cl` the user gave.
fn resolve_target(ws: &Workspace) -> Result<u64> {
    let head_cl = head::resolve_single(&ws.client_root, &ws.depot_root)?;
    match ws.explicit_cl {
        Some(cl) if cl > head_cl => {
            eprintln!(
                "*** INFO: Latest change on {} is less than {cl}. Syncing to {head_cl} instead.",
                ws.depot_root
            );
            Ok(head_cl)
        }
        Some(cl) => Ok(cl),
        None => Ok(head_cl),
    }
}

/// Split an optional `@<changelist>` suffix. A bare `@cl` means the
/// current directory at that changelist.
fn split_changelist(arg: &str) -> (String, Option<u64>) {
    match arg.rsplit_once('@') {
        Some((path, cl)) => match cl.parse::<u64>() {
            Ok(cl) => {
                let path = if path.is_empty() { "." } else { path };
                (path.to_owned(), Some(cl))
            }
            Err(_) => {
                eprintln!("*** WARNING: Could not parse @-revision, ignored.");
                (arg.to_owned(), None)
            }
        },
        None => (arg.to_owned(), None),
    }
}

/// Normalize a path argument to its `//depot/dir` form: depot syntax is
/// taken as-is; a local path must lie under the client root.
fn depot_abs_path(path: &str, client_root: &Path) -> Result<String> {
    let trimmed = path.replace("...", "");
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.starts_with("//") {
        return Ok(trimmed.to_owned());
    }
    let abs = absolutize(Path::new(expand_user(trimmed).as_ref()));
    match abs.strip_prefix(client_root) {
        Ok(rel) => Ok(format!("//{}", rel.display())),
        Err(_) => bail!(
            "{} is not under the client root {}",
            abs.display(),
            client_root.display()
        ),
    }
}

fn expand_user(path: &str) -> std::borrow::Cow<'_, str> {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}").into();
        }
    }
    path.into()
}

/// Lexical absolutization: no symlink resolution, just cwd-joining and
/// `.`/`..` folding (matching how the depot path arithmetic expects paths
/// to look).
fn absolutize(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_owned()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };
    let mut out = PathBuf::new();
    for part in joined.components() {
        match part {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
