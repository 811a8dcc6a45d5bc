use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    env, fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use bibmeta::action::{CleanupError, Decision, RenameConfirmation};
use bibmeta::cleanup::CleanupRule;
use bibmeta::core::{BibDatabase, EntryId};
use bibmeta::parser::load_metadata;
use bibmeta::storage::{FsRenamer, load_database, load_settings, save_database, store_settings};
use bibmeta::{
    CleanupJob, CleanupPreset, CleanupUi, UndoLedger, render_metadata, serialize_metadata,
};
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(
    name = "bibmeta",
    about = "Bibliography metadata and entry cleanup tooling",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the metadata of database files as comment blocks.
    Meta(MetaArgs),

    /// Extract and decode metadata comment blocks from .bib files.
    ParseMeta(ParseMetaArgs),

    /// Clean up entries of a database.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
struct MetaArgs {
    /// Database files (.json) or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit the serialized key/value map as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ParseMetaArgs {
    /// .bib files or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CleanupArgs {
    /// Database file (.json) to clean up.
    database: PathBuf,
    /// Cleanup settings file; created or updated after the run.
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Rules to run instead of the stored preset (repeatable).
    #[arg(long = "rule")]
    rules: Vec<String>,
    /// Citation keys of the entries to clean; defaults to every entry.
    #[arg(long = "entry")]
    entries: Vec<String>,
    /// Write the cleaned database back to its file.
    #[arg(long)]
    in_place: bool,
    /// Answer yes to confirmation prompts.
    #[arg(long)]
    yes: bool,
    /// Emit the cleanup report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Meta(args) => handle_meta(args),
        Commands::ParseMeta(args) => handle_parse_meta(args),
        Commands::Cleanup(args) => handle_cleanup(args),
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = env::var("BIBMETA_LOG")
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).without_time())
        .with(filter)
        .init();
}

fn handle_meta(args: MetaArgs) -> Result<()> {
    let MetaArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs, "json")?;
    if expanded.is_empty() {
        anyhow::bail!("no database files found in the provided inputs");
    }

    let mut serialized = Vec::new();
    for path in expanded {
        let (db, issues) = load_database(&path)?;
        for issue in &issues {
            warn!(path = %path.display(), "{issue}");
        }
        serialized.push((path, serialize_metadata(&db.metadata)));
    }

    if json {
        let payload: BTreeMap<String, &BTreeMap<String, String>> = serialized
            .iter()
            .map(|(path, map)| (path.display().to_string(), map))
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    for (idx, (path, map)) in serialized.iter().enumerate() {
        if serialized.len() > 1 {
            println!("== {} ==", path.display());
        }
        print!("{}", render_metadata(map));
        if serialized.len() > 1 && idx + 1 < serialized.len() {
            println!();
        }
    }
    Ok(())
}

fn handle_parse_meta(args: ParseMetaArgs) -> Result<()> {
    let ParseMetaArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs, "bib")?;
    if expanded.is_empty() {
        anyhow::bail!("no .bib files found in the provided inputs");
    }

    #[derive(serde::Serialize)]
    struct JsonOutput {
        path: String,
        metadata: BTreeMap<String, String>,
        skipped: Vec<String>,
    }

    let mut parsed = Vec::new();
    for path in expanded {
        debug!(path = %path.display(), "reading metadata");
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
        let load = load_metadata(&text).with_context(|| format!("parsing {:?}", path))?;
        for issue in &load.issues {
            warn!(path = %path.display(), "{issue}");
        }
        parsed.push((path, load));
    }

    if json {
        let payload: Vec<JsonOutput> = parsed
            .iter()
            .map(|(path, load)| JsonOutput {
                path: path.display().to_string(),
                metadata: serialize_metadata(&load.metadata),
                skipped: load.issues.iter().map(|i| i.to_string()).collect(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (path, load) in &parsed {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", load.metadata);
        }
    }
    Ok(())
}

fn handle_cleanup(args: CleanupArgs) -> Result<()> {
    let CleanupArgs {
        database,
        settings: settings_path,
        rules,
        entries,
        in_place,
        yes,
        json,
    } = args;

    let settings = match &settings_path {
        Some(path) => load_settings(path)?,
        None => Default::default(),
    };
    let (db, issues) = load_database(&database)?;
    for issue in &issues {
        warn!(path = %database.display(), "{issue}");
    }
    let selection = select_entries(&db, &entries)?;
    let preset_override = if rules.is_empty() {
        None
    } else {
        Some(preset_from_rules(&settings.preset, &rules)?)
    };

    let job = CleanupJob {
        database: db,
        selection,
        settings,
        ledger: UndoLedger::new(),
        ui: ConsoleUi {
            preset_override,
            assume_yes: yes,
        },
        renamer: Box::new(FsRenamer),
        database_dir: database.parent().map(Path::to_path_buf),
    };
    let outcome = job
        .spawn()
        .join()
        .map_err(|_| anyhow!("cleanup worker panicked"))?;

    let report = match outcome.result {
        Ok(report) => report,
        Err(CleanupError::UserCancelled) | Err(CleanupError::NothingSelected) => {
            if let Some(path) = &settings_path {
                store_settings(path, &outcome.settings)?;
            }
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    if in_place {
        save_database(&database, &outcome.database)?;
        info!(path = %database.display(), "database written");
    }
    if let Some(path) = &settings_path {
        store_settings(path, &outcome.settings)?;
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "cleaned {} of {} entries ({} failed renames)",
            report.modified_entries, report.selected, report.unsuccessful_renames
        );
    }
    Ok(())
}

fn select_entries(db: &BibDatabase, keys: &[String]) -> Result<Vec<EntryId>> {
    if keys.is_empty() {
        return Ok(db.entries.iter().map(|e| e.id).collect());
    }
    keys.iter()
        .map(|key| {
            db.entry_by_key(key)
                .map(|e| e.id)
                .ok_or_else(|| anyhow!("no entry with citation key {key:?}"))
        })
        .collect()
}

fn preset_from_rules(base: &CleanupPreset, rules: &[String]) -> Result<CleanupPreset> {
    let mut preset = CleanupPreset {
        rules: BTreeSet::new(),
        ..base.clone()
    };
    preset.formatters.enabled = false;
    for raw in rules {
        let rule: CleanupRule = raw.parse()?;
        preset.enable(rule, true);
    }
    Ok(preset)
}

/* ------------------------------ Console UI ------------------------------ */

struct ConsoleUi {
    preset_override: Option<CleanupPreset>,
    assume_yes: bool,
}

impl CleanupUi for ConsoleUi {
    fn inform_nothing_selected(&mut self) {
        eprintln!("No entries selected");
    }

    fn block(&mut self) {
        debug!("editing blocked while the cleanup runs");
    }

    fn unblock(&mut self) {
        debug!("editing unblocked");
    }

    fn output(&mut self, message: &str) {
        eprintln!("{message}");
    }

    fn choose_preset(&mut self, current: &CleanupPreset) -> Decision<CleanupPreset> {
        Decision::Proceed(self.preset_override.clone().unwrap_or_else(|| current.clone()))
    }

    fn confirm_file_renames(&mut self) -> RenameConfirmation {
        if self.assume_yes {
            return RenameConfirmation {
                proceed: true,
                ask_again: true,
            };
        }
        eprint!("Rename linked files to match the filename pattern? [y/N/a(lways)] ");
        io::stderr().flush().ok();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return RenameConfirmation {
                proceed: false,
                ask_again: true,
            };
        }
        parse_confirmation(&answer)
    }

    fn report_failed_renames(&mut self, count: usize) {
        eprintln!("Unable to rename {count} linked file(s)");
    }
}

fn parse_confirmation(answer: &str) -> RenameConfirmation {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => RenameConfirmation {
            proceed: true,
            ask_again: true,
        },
        "a" | "always" => RenameConfirmation {
            proceed: true,
            ask_again: false,
        },
        _ => RenameConfirmation {
            proceed: false,
            ask_again: true,
        },
    }
}

/* ------------------------------- Inputs ------------------------------- */

fn expand_inputs(paths: &[PathBuf], extension: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = %canonical.display(), "scanning directory");
            for file in collect_files(&canonical, extension)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if has_extension(&canonical, extension) {
                if visited.insert(canonical.clone()) {
                    out.push(canonical);
                }
            } else {
                anyhow::bail!("{:?} is not a .{} file", canonical, extension);
            }
        }
    }
    Ok(out)
}

fn collect_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, extension, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(
    path: &Path,
    extension: &str,
    out: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), extension, out, visited)?;
        }
    } else if metadata.is_file() && has_extension(&canonical, extension) {
        out.push(canonical);
    }
    Ok(())
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}
