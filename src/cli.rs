//! `clap`-derived CLI surface: one subcommand per verb, translating parsed
//! arguments into calls against the working-copy engines and mapping
//! `Result<_, RepoError>` to process exit codes. Verbs this crate has no
//! special handling for (`log`, `push`, `fetch`, `branch`, `remote`, `tag`)
//! are passed straight through to the `git` binary, the way a porcelain
//! built on top of a full object store usually defers to it for anything it
//! doesn't need to intercept.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use clap::{Parser, Subcommand};
use git2::Repository;
use tracing::info;

use crate::config::{self, WorkingCopyConfig, WorkingCopyScheme};
use crate::error::{RepoError, Result};
use crate::gpkg::Gpkg;
use crate::repo as repo_facade;
use crate::workingcopy;

#[derive(Parser)]
#[command(name = "georepo", about = "Version-controlled store for geospatial datasets")]
pub struct Cli {
    /// Path to the repository (the object store, not the working copy).
    #[arg(long, global = true, default_value = ".")]
    pub repo: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Materialize (or update) the working copy at a given revision.
    Checkout {
        #[arg(short = 'b')]
        branch: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long = "working-copy")]
        working_copy: Option<PathBuf>,
        #[arg(long)]
        layer: Option<String>,
        #[arg(long, default_value = "GPKG")]
        format: String,
        refish: Option<String>,
    },
    /// Commit the working copy's pending edits.
    Commit {
        #[arg(short = 'm')]
        message: String,
    },
    /// Show the working-copy diff against the checked-out tree.
    Diff,
    /// Summarize pending edits.
    Status,
    /// Merge another commit into the current branch.
    Merge {
        #[arg(long)]
        ff: bool,
        #[arg(long = "no-ff")]
        no_ff: bool,
        #[arg(long = "ff-only")]
        ff_only: bool,
        commit: String,
    },
    /// Fetch and merge from a remote.
    Pull {
        remote: Option<String>,
        refspec: Vec<String>,
    },
    /// Discard pending edits, restoring the checked-out tree's contents.
    Reset,
    /// Show a commit.
    Show,
    /// Check (and optionally repair) a layer's integrity.
    Fsck {
        #[arg(long)]
        reset_layer: bool,
        #[arg(long)]
        layer: Option<String>,
        git_args: Vec<String>,
    },
    /// Point the repository's working-copy config at a new path.
    WorkingcopySetPath { path: String },
    /// Clone a remote repository.
    Clone { url: String, dir: Option<String> },
    /// Pass-throughs: forwarded to `git` verbatim.
    Log { args: Vec<String> },
    Push { args: Vec<String> },
    Fetch { args: Vec<String> },
    Branch { args: Vec<String> },
    Remote { args: Vec<String> },
    Tag { args: Vec<String> },
}

/// Forward a verb straight to the `git` binary. By default this replaces
/// the current process image (`exec`), matching the original tool's
/// `os.execvp` default so the real `git` exit code and signal behavior
/// reach the caller unchanged; setting `_SNOWDROP_NO_EXEC` switches to a
/// captured subprocess run instead, for testing.
fn pass_through(repo: &Path, verb: &str, args: &[String]) -> Result<()> {
    if std::env::var_os("_SNOWDROP_NO_EXEC").is_some() {
        let output = ProcessCommand::new("git")
            .arg(verb)
            .args(args)
            .current_dir(repo)
            .output()
            .map_err(RepoError::Io)?;
        use std::io::Write;
        let _ = std::io::stdout().write_all(&output.stdout);
        let _ = std::io::stderr().write_all(&output.stderr);
        if !output.status.success() {
            std::process::exit(output.status.code().unwrap_or(1));
        }
        return Ok(());
    }

    let err = ProcessCommand::new("git").arg(verb).args(args).current_dir(repo).exec();
    Err(RepoError::Io(err))
}

fn open_working_copy(cfg: &WorkingCopyConfig) -> Result<Gpkg> {
    match cfg.scheme {
        WorkingCopyScheme::Gpkg => Gpkg::open(&cfg.path),
        WorkingCopyScheme::Postgresql => Err(RepoError::Unsupported(
            "postgresql working copies are not implemented".to_string(),
        )),
    }
}

/// Resolve which layer a command applies to: the explicit `--layer`, or, if
/// the working copy has exactly one layer, that one.
fn resolve_layer(gpkg: &Gpkg, requested: Option<&str>) -> Result<String> {
    if let Some(layer) = requested {
        return Ok(layer.to_string());
    }
    let layers = gpkg.list_layers()?;
    match layers.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(RepoError::Message("working copy has no layers".to_string())),
        _ => Err(RepoError::Message(
            "working copy has more than one layer; pass --layer".to_string(),
        )),
    }
}

/// Run a parsed CLI invocation, returning the process exit code.
pub fn run(cli: Cli) -> i32 {
    match run_command(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    }
}

fn run_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Checkout {
            branch,
            force,
            working_copy,
            layer,
            format: _,
            refish,
        } => cmd_checkout(&cli.repo, branch.as_deref(), *force, working_copy.as_deref(), layer.as_deref(), refish.as_deref()),
        Command::Commit { message } => cmd_commit(&cli.repo, message),
        Command::Diff => cmd_diff(&cli.repo),
        Command::Status => cmd_status(&cli.repo),
        Command::Fsck {
            reset_layer,
            layer,
            git_args: _,
        } => cmd_fsck(&cli.repo, layer.as_deref(), *reset_layer),
        Command::WorkingcopySetPath { path } => cmd_workingcopy_set_path(&cli.repo, path),
        Command::Clone { url, dir } => cmd_clone(url, dir.as_deref()),
        Command::Merge { ff, no_ff, ff_only, commit } => {
            let mut args = Vec::new();
            if *ff {
                args.push("--ff".to_string());
            }
            if *no_ff {
                args.push("--no-ff".to_string());
            }
            if *ff_only {
                args.push("--ff-only".to_string());
            }
            args.push(commit.clone());
            pass_through(&cli.repo, "merge", &args)
        }
        Command::Pull { remote, refspec } => {
            let mut args = Vec::new();
            if let Some(remote) = remote {
                args.push(remote.clone());
            }
            args.extend(refspec.iter().cloned());
            pass_through(&cli.repo, "pull", &args)
        }
        Command::Reset => cmd_reset(&cli.repo),
        Command::Show => pass_through(&cli.repo, "show", &[]),
        Command::Log { args } => pass_through(&cli.repo, "log", args),
        Command::Push { args } => pass_through(&cli.repo, "push", args),
        Command::Fetch { args } => pass_through(&cli.repo, "fetch", args),
        Command::Branch { args } => pass_through(&cli.repo, "branch", args),
        Command::Remote { args } => pass_through(&cli.repo, "remote", args),
        Command::Tag { args } => pass_through(&cli.repo, "tag", args),
    }
}

fn resolve_target_commit<'repo>(repo: &'repo Repository, refish: Option<&str>) -> Result<git2::Commit<'repo>> {
    match refish {
        None => repo_facade::head_commit(repo),
        Some(refish) => {
            let object = repo.revparse_single(refish)?;
            Ok(object.peel_to_commit()?)
        }
    }
}

fn cmd_checkout(
    repo_path: &Path,
    branch: Option<&str>,
    force: bool,
    working_copy: Option<&Path>,
    layer: Option<&str>,
    refish: Option<&str>,
) -> Result<()> {
    let repo = repo_facade::discover(repo_path)?;
    let target_commit = resolve_target_commit(&repo, refish)?;
    let target_tree = target_commit.tree()?;
    let target_oid = target_tree.id();

    let cfg = config::read_working_copy_config(&repo)?;
    let wc_path = working_copy
        .map(Path::to_path_buf)
        .or_else(|| cfg.as_ref().map(|c| PathBuf::from(&c.path)));

    match (cfg, wc_path) {
        (Some(cfg), Some(path)) if path.exists() => {
            let layer = layer
                .or(cfg.legacy_layer.as_deref())
                .ok_or_else(|| RepoError::Message("--layer is required".to_string()))?;
            let mut gpkg = Gpkg::open(&path)?;
            let specs = crate::gpkg::get_column_specs(gpkg.connection(), layer)?;
            let base_tree = repo_facade::head_tree(&repo)?;
            workingcopy::checkout_update(
                gpkg.connection_mut(),
                &repo,
                layer,
                &specs.primary_key,
                &specs.other_columns,
                &base_tree,
                &target_tree,
                target_oid,
                force,
            )?;
            info!(layer, "working copy updated");
        }
        (cfg, Some(path)) => {
            let layer = layer
                .or(cfg.as_ref().and_then(|c| c.legacy_layer.as_deref()))
                .ok_or_else(|| RepoError::Message("--layer is required for a new checkout".to_string()))?;
            workingcopy::checkout_new(&path, &repo, &target_tree, target_oid, layer)?;
            config::write_working_copy_config(&repo, "gpkg", &path.to_string_lossy())?;
            info!(layer, path = %path.display(), "new working copy created");
        }
        (_, None) => {
            return Err(RepoError::MissingWorkingCopy);
        }
    }

    if let Some(branch) = branch {
        let branch_ref = format!("refs/heads/{branch}");
        if repo.find_reference(&branch_ref).is_err() {
            repo.branch(branch, &target_commit, false)?;
        }
        repo.set_head(&branch_ref)?;
    } else if refish.is_some() {
        repo.set_head_detached(target_commit.id())?;
    }
    Ok(())
}

/// Discard pending edits in the working copy, restoring it to the tree it
/// is currently checked out against. Unlike `git reset`, this never touches
/// `HEAD` or the object store — it only reverts the GeoPackage side tables
/// and user table via the same force-checkout/revert path `checkout --force`
/// uses, which honors delete-before-update ordering and leaves every
/// `__kxg_map` row at `state = 0`.
fn cmd_reset(repo_path: &Path) -> Result<()> {
    let repo = repo_facade::discover(repo_path)?;
    let cfg = config::read_working_copy_config(&repo)?.ok_or(RepoError::MissingWorkingCopy)?;
    let mut gpkg = open_working_copy(&cfg)?;
    let layer = resolve_layer(&gpkg, cfg.legacy_layer.as_deref())?;
    let specs = crate::gpkg::get_column_specs(gpkg.connection(), &layer)?;
    let head_tree = repo_facade::head_tree(&repo)?;
    let head_oid = head_tree.id();

    workingcopy::checkout_update(
        gpkg.connection_mut(),
        &repo,
        &layer,
        &specs.primary_key,
        &specs.other_columns,
        &head_tree,
        &head_tree,
        head_oid,
        true,
    )?;
    info!(layer, "working copy reset");
    Ok(())
}

fn cmd_commit(repo_path: &Path, message: &str) -> Result<()> {
    let repo = repo_facade::discover(repo_path)?;
    let cfg = config::read_working_copy_config(&repo)?.ok_or(RepoError::MissingWorkingCopy)?;
    let mut gpkg = open_working_copy(&cfg)?;
    let layer = resolve_layer(&gpkg, cfg.legacy_layer.as_deref())?;
    let specs = crate::gpkg::get_column_specs(gpkg.connection(), &layer)?;

    let commit_oid = workingcopy::commit(
        gpkg.connection_mut(),
        &repo,
        &layer,
        &specs.primary_key,
        &specs.other_columns,
        message,
    )?;
    info!(commit = %commit_oid, "committed");
    Ok(())
}

fn cmd_diff(repo_path: &Path) -> Result<()> {
    let repo = repo_facade::discover(repo_path)?;
    let cfg = config::read_working_copy_config(&repo)?.ok_or(RepoError::MissingWorkingCopy)?;
    let gpkg = open_working_copy(&cfg)?;
    let layer = resolve_layer(&gpkg, cfg.legacy_layer.as_deref())?;
    let specs = crate::gpkg::get_column_specs(gpkg.connection(), &layer)?;
    let head_tree = repo_facade::head_tree(&repo)?;

    let changes = workingcopy::working_copy_diff(
        gpkg.connection(),
        &repo,
        &head_tree,
        &layer,
        &specs.primary_key,
        &specs.other_columns,
    )?;
    for change in &changes {
        match change {
            workingcopy::FeatureChange::Insert { new, .. } => println!("+ {new:?}"),
            workingcopy::FeatureChange::Update { old, new, .. } => println!("~ {old:?} -> {new:?}"),
            workingcopy::FeatureChange::Delete { old, .. } => println!("- {old:?}"),
        }
    }
    Ok(())
}

fn cmd_status(repo_path: &Path) -> Result<()> {
    let repo = repo_facade::discover(repo_path)?;
    let cfg = config::read_working_copy_config(&repo)?.ok_or(RepoError::MissingWorkingCopy)?;
    let gpkg = open_working_copy(&cfg)?;
    let layer = resolve_layer(&gpkg, cfg.legacy_layer.as_deref())?;
    let specs = crate::gpkg::get_column_specs(gpkg.connection(), &layer)?;
    let head_tree = repo_facade::head_tree(&repo)?;

    let changes = workingcopy::working_copy_diff(
        gpkg.connection(),
        &repo,
        &head_tree,
        &layer,
        &specs.primary_key,
        &specs.other_columns,
    )?;
    let (mut inserts, mut updates, mut deletes) = (0, 0, 0);
    for change in &changes {
        match change {
            workingcopy::FeatureChange::Insert { .. } => inserts += 1,
            workingcopy::FeatureChange::Update { .. } => updates += 1,
            workingcopy::FeatureChange::Delete { .. } => deletes += 1,
        }
    }
    println!("{layer}: {inserts} inserts, {updates} updates, {deletes} deletes");
    Ok(())
}

fn cmd_fsck(repo_path: &Path, layer: Option<&str>, reset_layer: bool) -> Result<()> {
    let repo = repo_facade::discover(repo_path)?;
    let cfg = config::read_working_copy_config(&repo)?.ok_or(RepoError::MissingWorkingCopy)?;
    let mut gpkg = open_working_copy(&cfg)?;
    let layer = resolve_layer(&gpkg, layer.or(cfg.legacy_layer.as_deref()))?;
    let specs = crate::gpkg::get_column_specs(gpkg.connection(), &layer)?;

    if reset_layer {
        workingcopy::reset_layer(gpkg.connection_mut(), &repo, &layer)?;
        info!(layer, "layer reset");
        return Ok(());
    }

    let report = workingcopy::fsck(gpkg.connection(), &repo, &layer, &specs.primary_key, &specs.other_columns)?;
    if report.is_clean() {
        println!("{layer}: ok");
        return Ok(());
    }
    if let Some((expected, found)) = &report.tree_mismatch {
        println!("{layer}: tree mismatch (expected {expected}, found {found}); try `checkout --force`");
    }
    if let Some((rows, live)) = &report.row_count_mismatch {
        println!("{layer}: row count mismatch ({rows} in table, {live} live in __kxg_map)");
    }
    for fk in &report.index_mismatch {
        println!("{layer}: index mismatch for feature {fk}");
    }
    for (fk, column) in &report.column_mismatches {
        println!("{layer}: column mismatch for feature {fk}, column {column}");
    }
    Err(RepoError::Message(format!("{layer}: fsck found inconsistencies")))
}

fn cmd_workingcopy_set_path(repo_path: &Path, path: &str) -> Result<()> {
    let repo = repo_facade::discover(repo_path)?;
    config::write_working_copy_config(&repo, "gpkg", path)?;
    info!(path, "working-copy path updated");
    Ok(())
}

fn cmd_clone(url: &str, dir: Option<&str>) -> Result<()> {
    let mut args = vec![url.to_string()];
    if let Some(dir) = dir {
        args.push(dir.to_string());
    }
    pass_through(Path::new("."), "clone", &args)
}
