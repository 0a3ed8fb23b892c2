//! drive-import: Google Drive to Wagtail image importer
//!
//! Usage:
//!   drive-import import --file <id> --folder <id>    Review duplicates and import
//!   drive-import duplicates --file <id>              Only show duplicates
//!   drive-import edit <edit_action> <drive_id> --field title=...
//!   drive-import delete <delete_action>
//!   drive-import config show|set|path
//!   drive-import about

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use drive_image_import::providers::{GoogleDriveSource, RefreshingToken};
use drive_image_import::{
    aggregate_progress, visible_jobs, DuplicateResolver, EditOutcome, ImportConfig, ImportJob,
    ImportWorkflow, JobPhase, JobStore, PickedItem, PostImportEditor, RemoteFileDescriptor,
    ResolutionAction, StaticToken, TokenSource, WagtailHost,
};

#[derive(Parser)]
#[command(
    name = "drive-import",
    about = "Import images from Google Drive into a Wagtail media library",
    version,
    long_about = "Picks images (or whole folders) from Google Drive, checks the Wagtail site for\nduplicates, lets you choose replace/keep/cancel per duplicate, then imports one file at a time."
)]
struct Cli {
    /// Config file (default: <config_dir>/drive-image-import/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    host: HostArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the host settings in the config file
#[derive(Args)]
struct HostArgs {
    /// Wagtail site URL
    #[arg(long, global = true)]
    host_url: Option<String>,
    /// CSRF token of the admin session
    #[arg(long, global = true, env = "WAGTAIL_CSRF_TOKEN", hide_env_values = true)]
    csrf_token: Option<String>,
    /// Cookie header of the admin session
    #[arg(long, global = true, env = "WAGTAIL_SESSION_COOKIE", hide_env_values = true)]
    session_cookie: Option<String>,
}

/// What to import and how to authorize against Drive
#[derive(Args)]
struct SelectionArgs {
    /// Drive file id (repeatable)
    #[arg(long = "file", value_name = "ID")]
    files: Vec<String>,
    /// Drive folder id; its images are imported (repeatable)
    #[arg(long = "folder", value_name = "ID")]
    folders: Vec<String>,
    /// OAuth access token for Drive
    #[arg(long, env = "DRIVE_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,
    /// OAuth refresh token; stored for later runs
    #[arg(long, env = "DRIVE_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Review duplicates and import the selection
    Import {
        #[command(flatten)]
        selection: SelectionArgs,
        /// Target collection id
        #[arg(long)]
        collection: Option<u64>,
        /// Action for every duplicate
        #[arg(long, value_name = "ACTION")]
        on_duplicate: Option<ResolutionAction>,
        /// Action for one duplicate, e.g. --set 1AbC=keep (repeatable)
        #[arg(long = "set", value_name = "ID=ACTION", value_parser = parse_action_override)]
        overrides: Vec<(String, ResolutionAction)>,
        /// Do not ask anything
        #[arg(short, long)]
        yes: bool,
    },
    /// Look up duplicates without importing
    Duplicates {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Submit an imported image's edit form
    Edit {
        /// edit_action URL from the import response
        endpoint: String,
        /// Drive id of the imported file
        drive_id: String,
        /// Form field, e.g. --field title=Sunset (repeatable)
        #[arg(long = "field", value_name = "NAME=VALUE", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Delete an imported image
    Delete {
        /// delete_action URL from the import response
        endpoint: String,
    },
    /// Show or change the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Version and dependency information
    About,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the current config (secrets masked)
    Show,
    /// Print the config file location
    Path,
    /// Update settings and save
    Set {
        #[arg(long)]
        import_path: Option<String>,
        #[arg(long)]
        duplicate_review_path: Option<String>,
        #[arg(long)]
        collection_id: Option<u64>,
        #[arg(long)]
        drive_api_base: Option<String>,
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long)]
        client_secret: Option<String>,
        #[arg(long)]
        folder_page_size: Option<u32>,
    },
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    let (name, value) = s.split_once('=').ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    if name.is_empty() {
        return Err(format!("empty field name in '{}'", s));
    }
    Ok((name.to_string(), value.to_string()))
}

fn parse_action_override(s: &str) -> Result<(String, ResolutionAction), String> {
    let (id, action) = parse_field(s)?;
    Ok((id, action.parse()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(ImportConfig::default_path);
    let mut config = ImportConfig::load(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    apply_host_overrides(&mut config, &cli.host);

    match cli.command {
        Commands::Import { selection, collection, on_duplicate, overrides, yes } => {
            if let Some(collection) = collection {
                config.collection_id = collection;
            }
            import(&config, &selection, on_duplicate, &overrides, yes).await
        }
        Commands::Duplicates { selection } => duplicates(&config, &selection).await,
        Commands::Edit { endpoint, drive_id, fields } => {
            let editor = standalone_editor(&config, ImportJob::imported(drive_id, Some(endpoint), None))?;
            report_followup(editor.submit_edit(0, &fields).await?);
            Ok(())
        }
        Commands::Delete { endpoint } => {
            let editor = standalone_editor(&config, ImportJob::imported("", None, Some(endpoint)))?;
            report_followup(editor.delete(0).await?);
            Ok(())
        }
        Commands::Config { command } => config_command(config, &config_path, command),
        Commands::About => {
            about();
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn apply_host_overrides(config: &mut ImportConfig, host: &HostArgs) {
    if let Some(ref url) = host.host_url {
        config.host_url = url.clone();
    }
    if let Some(ref token) = host.csrf_token {
        config.csrf_token = token.clone();
    }
    if let Some(ref cookie) = host.session_cookie {
        config.session_cookie = Some(cookie.clone());
    }
}

fn token_source(config: &ImportConfig, selection: &SelectionArgs) -> Result<Arc<dyn TokenSource>> {
    if let Some(ref token) = selection.access_token {
        return Ok(Arc::new(StaticToken::new(token.clone())));
    }
    let Some(oauth) = config.oauth_config() else {
        bail!("no Drive credentials: pass --access-token or configure client_id for token refresh");
    };
    let token_path = RefreshingToken::default_token_path()?;
    let source = match selection.refresh_token {
        Some(ref refresh) => RefreshingToken::with_refresh_token(oauth, token_path, refresh)?,
        None => RefreshingToken::new(oauth, token_path),
    };
    Ok(Arc::new(source))
}

async fn catalog(
    config: &ImportConfig,
    selection: &SelectionArgs,
    drive: &GoogleDriveSource,
    tokens: &dyn TokenSource,
) -> Result<Vec<RemoteFileDescriptor>> {
    let picked: Vec<PickedItem> = selection
        .folders
        .iter()
        .map(PickedItem::folder)
        .chain(selection.files.iter().map(PickedItem::file))
        .collect();
    if picked.is_empty() {
        bail!("nothing selected: pass --file and/or --folder");
    }
    let token = tokens.access_token().await.context("could not get a Drive access token")?;
    let catalog = drive.build_catalog(&picked, &token).await;
    if catalog.is_empty() {
        bail!("no images found in the selection");
    }
    info!("{} image(s) selected on {}", catalog.len(), config.drive_api_base);
    Ok(catalog)
}

fn print_duplicates(resolver: &DuplicateResolver) {
    let rows = resolver.duplicate_rows();
    println!("{} of {} file(s) already exist in Wagtail:", rows.len(), resolver.catalog().len());
    for row in rows {
        let existing_id = row
            .existing
            .existing_asset_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "  {:<8} {} -> #{} \"{}\" (added {})",
            row.action, row.file.name, existing_id, row.existing.existing_title, row.existing.existing_created_at
        );
    }
}

async fn duplicates(config: &ImportConfig, selection: &SelectionArgs) -> Result<()> {
    let host = WagtailHost::new(config.host_config()?);
    let drive = GoogleDriveSource::new(config.drive_config());
    let tokens = token_source(config, selection)?;
    let catalog = catalog(config, selection, &drive, tokens.as_ref()).await?;

    let mut resolver = DuplicateResolver::new(catalog);
    resolver.lookup(&host).await.context("duplicate lookup failed")?;
    if resolver.is_reviewing() {
        print_duplicates(&resolver);
    } else {
        println!("No duplicates among {} file(s).", resolver.catalog().len());
    }
    Ok(())
}

async fn import(
    config: &ImportConfig,
    selection: &SelectionArgs,
    on_duplicate: Option<ResolutionAction>,
    overrides: &[(String, ResolutionAction)],
    yes: bool,
) -> Result<()> {
    let host = Arc::new(WagtailHost::new(config.host_config()?));
    let drive = Arc::new(GoogleDriveSource::new(config.drive_config()));
    let tokens = token_source(config, selection)?;
    let catalog = catalog(config, selection, &drive, tokens.as_ref()).await?;

    let mut workflow = ImportWorkflow::new(catalog, drive, tokens, host, config.collection_id);
    workflow
        .lookup_duplicates()
        .await
        .context("duplicate lookup failed; nothing was imported")?;

    if workflow.resolver().is_reviewing() {
        let resolver = workflow.resolver_mut();
        if let Some(action) = on_duplicate {
            resolver.set_all_actions(action)?;
        }
        for (id, action) in overrides {
            resolver.set_action(id, *action)?;
        }
        print_duplicates(resolver);
        if !yes && !confirm("Continue with these actions? [y/N] ").await? {
            println!("Nothing imported.");
            return Ok(());
        }
        resolver.confirm()?;
    }

    let run = workflow.start()?;
    if run.store().is_empty() {
        println!("Every file was cancelled; nothing to import.");
        return Ok(());
    }

    let shutdown = run.engine.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing the current file and stopping");
            shutdown.cancel();
        }
    });

    let progress = spawn_progress(run.store().clone());
    let engine = run.engine.clone();
    let summary = tokio::spawn(async move { engine.run().await }).await?;
    progress.finish(&run.store().snapshot());

    println!(
        "Imported {} of {} file(s): {} failed, {} need attention, {} not started.",
        summary.finished, summary.total, summary.failed, summary.flagged, summary.pending
    );
    review_results(&run.editor, run.store(), yes).await
}

/// One bar per job plus an overall bar, redrawn from store snapshots
struct ProgressView {
    _multi: MultiProgress,
    bars: Vec<ProgressBar>,
    overall: ProgressBar,
    task: tokio::task::JoinHandle<()>,
}

fn spawn_progress(store: JobStore) -> ProgressView {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:>4} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());

    let jobs = store.snapshot();
    let bars: Vec<ProgressBar> = jobs
        .iter()
        .enumerate()
        .map(|(index, _)| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(style.clone());
            bar.set_prefix(format!("#{}", index + 1));
            bar
        })
        .collect();
    let overall = multi.add(ProgressBar::new(100));
    overall.set_style(style);
    overall.set_prefix("all");
    render(&bars, &overall, &jobs);

    let mut rx = store.subscribe();
    let task = {
        let bars = bars.clone();
        let overall = overall.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let jobs = rx.borrow_and_update().clone();
                render(&bars, &overall, &jobs);
            }
        })
    };
    ProgressView { _multi: multi, bars, overall, task }
}

impl ProgressView {
    fn finish(self, jobs: &[ImportJob]) {
        self.task.abort();
        render(&self.bars, &self.overall, jobs);
        for bar in &self.bars {
            bar.finish();
        }
        self.overall.finish();
    }
}

fn render(bars: &[ProgressBar], overall: &ProgressBar, jobs: &[ImportJob]) {
    for (bar, job) in bars.iter().zip(jobs) {
        bar.set_position(job.progress as u64);
        bar.set_message(format!("{} {}", job.name, phase_label(job)));
    }
    if let Some(percent) = aggregate_progress(jobs) {
        overall.set_position(percent as u64);
    }
}

fn phase_label(job: &ImportJob) -> String {
    match (job.phase, job.error_message.as_deref()) {
        (JobPhase::Pending, _) => "(waiting)".to_string(),
        (JobPhase::Downloading, _) => "(downloading)".to_string(),
        (JobPhase::Uploading, _) => "(uploading)".to_string(),
        (JobPhase::AwaitingEdit, _) => "(saving)".to_string(),
        (JobPhase::Finished, None) => "(done)".to_string(),
        (JobPhase::Finished, Some(message)) => format!("(needs attention: {})", message),
        (JobPhase::Failed, message) => format!("({})", message.unwrap_or("failed")),
    }
}

async fn prompt(question: String) -> Result<String> {
    let line = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        print!("{}", question);
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line.trim().to_string())
    })
    .await??;
    Ok(line)
}

async fn confirm(question: &str) -> Result<bool> {
    let answer = prompt(question.to_string()).await?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// List jobs that need a follow-up and, unless `yes`, offer edit/delete
async fn review_results(editor: &PostImportEditor, store: &JobStore, yes: bool) -> Result<()> {
    let jobs = store.snapshot();
    for (index, job) in visible_jobs(&jobs) {
        match job.phase {
            JobPhase::Failed => {
                println!("  #{} {}: {}", index + 1, job.name, job.error_message.as_deref().unwrap_or("failed"))
            }
            JobPhase::Finished if job.is_flagged() => println!(
                "  #{} {}: {} (edit: {})",
                index + 1,
                job.name,
                job.error_message.as_deref().unwrap_or_default(),
                job.edit_endpoint.as_deref().unwrap_or("-")
            ),
            _ => {}
        }
    }
    if yes {
        return Ok(());
    }

    loop {
        let flagged: Vec<(usize, ImportJob)> = editor
            .editable_jobs()
            .into_iter()
            .filter(|(_, job)| job.is_flagged())
            .collect();
        let Some((index, job)) = flagged.into_iter().next() else {
            return Ok(());
        };

        let question = format!(
            "#{} {} needs attention ({}). [e]dit, [d]elete, [s]kip all? ",
            index + 1,
            job.name,
            job.error_message.as_deref().unwrap_or_default()
        );
        let result = match prompt(question).await?.as_str() {
            "e" | "edit" => {
                let line = prompt("Fields (name=value, separated by ';'): ".to_string()).await?;
                let fields = line
                    .split(';')
                    .filter(|f| !f.trim().is_empty())
                    .map(|f| parse_field(f.trim()))
                    .collect::<Result<Vec<_>, String>>()
                    .map_err(anyhow::Error::msg)?;
                editor.submit_edit(index, &fields).await
            }
            "d" | "delete" => editor.delete(index).await,
            _ => return Ok(()),
        };
        match result {
            Ok(outcome) => report_followup(outcome),
            // The job keeps the failure message; ask again
            Err(e) => eprintln!("  {}", e),
        }
    }
}

fn standalone_editor(config: &ImportConfig, job: ImportJob) -> Result<PostImportEditor> {
    let host = Arc::new(WagtailHost::new(config.host_config()?));
    Ok(PostImportEditor::new(JobStore::new(vec![job]), host))
}

fn report_followup(outcome: EditOutcome) {
    match outcome {
        EditOutcome::Settled => println!("Saved."),
        EditOutcome::Rejected(message) => println!("Wagtail rejected the change: {}", message),
    }
}

fn config_command(mut config: ImportConfig, path: &std::path::Path, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Show => {
            let mut shown = config.clone();
            mask(&mut shown.csrf_token);
            if let Some(ref mut cookie) = shown.session_cookie {
                mask(cookie);
            }
            if let Some(ref mut secret) = shown.client_secret {
                mask(secret);
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
        ConfigCommand::Set {
            import_path,
            duplicate_review_path,
            collection_id,
            drive_api_base,
            client_id,
            client_secret,
            folder_page_size,
        } => {
            if let Some(v) = import_path {
                config.import_path = v;
            }
            if let Some(v) = duplicate_review_path {
                config.duplicate_review_path = v;
            }
            if let Some(v) = collection_id {
                config.collection_id = v;
            }
            if let Some(v) = drive_api_base {
                config.drive_api_base = v;
            }
            if client_id.is_some() {
                config.client_id = client_id;
            }
            if client_secret.is_some() {
                config.client_secret = client_secret;
            }
            if let Some(v) = folder_page_size {
                config.folder_page_size = v;
            }
            if !config.host_url.is_empty() {
                config.host_config()?;
            }
            config.save(path)?;
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}

fn mask(secret: &mut String) {
    if !secret.is_empty() {
        *secret = "********".to_string();
    }
}

fn about() {
    println!("drive-import {}", env!("CARGO_PKG_VERSION"));
    println!("rustc {}", env!("RUSTC_VERSION"));
    let deps = [
        ("tokio", env!("DEP_VERSION_TOKIO")),
        ("reqwest", env!("DEP_VERSION_REQWEST")),
        ("serde", env!("DEP_VERSION_SERDE")),
        ("serde_json", env!("DEP_VERSION_SERDE_JSON")),
        ("oauth2", env!("DEP_VERSION_OAUTH2")),
        ("secrecy", env!("DEP_VERSION_SECRECY")),
        ("tracing", env!("DEP_VERSION_TRACING")),
        ("thiserror", env!("DEP_VERSION_THISERROR")),
        ("clap", env!("DEP_VERSION_CLAP")),
        ("indicatif", env!("DEP_VERSION_INDICATIF")),
    ];
    for (name, version) in deps {
        println!("  {:<12} {}", name, version);
    }
}
