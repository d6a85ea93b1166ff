//! CLI parsing and orchestration. Parses args, builds the comick.io source and the pipeline, runs
//! or restores, prints the summary, and maps errors to exit codes.

use crate::catalog::CatalogError;
use crate::config::{self, Config};
use crate::download::{PageState, RetryPolicy, DEFAULT_DOWNLOAD_WORKERS};
use crate::imaging::DEFAULT_PROCESS_WORKERS;
use crate::model::{ChapterNumber, EpubLayout, OutputFormat};
use crate::pipeline::{Pipeline, PipelineError, PipelineSettings, Progress, RunSummary};
use crate::selector::normalize_groups;
use crate::source::{slug_from_url, ComickSource, ImageFetcher, PoliteClient, SourceError};
use crate::state::{RequestedParameters, RunState, StateError, DEFAULT_LANGUAGE};
use crate::workspace::Workspace;
use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Source(#[from] SourceError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    Incomplete(String),

    #[error("Interrupted. Run the same command again to resume.")]
    Cancelled,
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) => 1,
            CliRunError::Source(e) => match e {
                SourceError::InvalidUrl { .. }
                | SourceError::UnsupportedHost { .. }
                | SourceError::InvalidCookies { .. } => 1,
                _ => 2,
            },
            CliRunError::Pipeline(e) => match e {
                PipelineError::Catalog(CatalogError::CatalogUnavailable { .. }) => 2,
                PipelineError::State(StateError::Io { .. })
                | PipelineError::Download(_)
                | PipelineError::Workspace { .. }
                | PipelineError::Output { .. } => 3,
                PipelineError::State(_)
                | PipelineError::Filter(_)
                | PipelineError::InvalidParameter { .. }
                | PipelineError::NothingSelected { .. } => 1,
            },
            CliRunError::Incomplete(_) => 3,
            CliRunError::Cancelled => 130,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "comicdl")]
#[command(about = "Download a comic from comick.io and write EPUB, PDF, or CBZ")]
#[command(
    after_help = "Config file keys (output_dir, workspace_dir, user_agent, request_delay_ms, timeout_secs, retry_count, retry_backoff_ms, download_workers, process_workers) live in ./comicdl.toml or the user config directory.\nAn interrupted run resumes when the same command is run again."
)]
pub struct Args {
    /// Comic page URL, e.g. https://comick.io/comic/<slug>.
    pub comic_url: String,

    /// Cookie string sent with every request (`name=value; name2=value2`).
    #[arg(long)]
    pub cookies: Option<String>,

    /// Preferred scanlation group. Repeatable; each value may be comma-separated. Earlier wins.
    #[arg(long = "group", value_name = "GROUP")]
    pub groups: Vec<String>,

    /// Among preferred groups, pick the most upvoted version instead of the first listed group.
    #[arg(long)]
    pub mix_by_upvote: bool,

    /// Skip partial chapters such as 12.5.
    #[arg(long)]
    pub no_partials: bool,

    /// Chapters to download: `all`, or a list like `1-10,12,15.5` (default all).
    #[arg(long)]
    pub chapters: Option<String>,

    /// Chapter language code (default en).
    #[arg(long)]
    pub language: Option<String>,

    /// Output format: pdf, epub, cbz, or none (default epub).
    #[arg(long, value_parser = parse_format)]
    pub format: Option<OutputFormat>,

    /// EPUB layout: page or vertical (default vertical).
    #[arg(long, value_parser = parse_layout)]
    pub epub_layout: Option<EpubLayout>,

    /// Target page width in pixels (default depends on format).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub width: Option<u32>,

    /// Page shape as W:H or a height/width number; pages are restacked to it. Ignored for PDF.
    #[arg(long)]
    pub aspect_ratio: Option<String>,

    /// JPEG quality 1-100 (default 85).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub quality: Option<u8>,

    /// Final resize percentage 1-100 (default 100).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub scaling: Option<u8>,

    /// Split output every N chapters (`5ch`) or by size (`400MB`).
    #[arg(long)]
    pub split: Option<String>,

    /// Repackage a previous run from its workspace without downloading or reprocessing.
    #[arg(long)]
    pub restore_parameters: bool,

    /// Also copy the downloaded images to <output>/<Title>/Chapter_<n>/.
    #[arg(long, conflicts_with = "no_keep_images")]
    pub keep_images: bool,

    /// Turn off a saved --keep-images.
    #[arg(long)]
    pub no_keep_images: bool,

    /// Write one output file per chapter.
    #[arg(long, conflicts_with = "no_keep_chapters")]
    pub keep_chapters: bool,

    /// Turn off a saved --keep-chapters.
    #[arg(long)]
    pub no_keep_chapters: bool,

    /// Keep the workspace after a successful run.
    #[arg(long)]
    pub no_cleanup: bool,

    /// Debug logging for this tool; disables the progress bar.
    #[arg(short, long)]
    pub verbose: bool,

    /// Trace logging; disables the progress bar.
    #[arg(short, long)]
    pub debug: bool,
}

fn parse_format(s: &str) -> Result<OutputFormat, String> {
    match s.to_lowercase().as_str() {
        "pdf" => Ok(OutputFormat::Pdf),
        "epub" => Ok(OutputFormat::Epub),
        "cbz" => Ok(OutputFormat::Cbz),
        "none" => Ok(OutputFormat::None),
        _ => Err(format!(
            "Invalid --format value: '{}'. Use pdf, epub, cbz, or none.",
            s
        )),
    }
}

fn parse_layout(s: &str) -> Result<EpubLayout, String> {
    match s.to_lowercase().as_str() {
        "page" => Ok(EpubLayout::Page),
        "vertical" => Ok(EpubLayout::Vertical),
        _ => Err(format!(
            "Invalid --epub-layout value: '{}'. Use page or vertical.",
            s
        )),
    }
}

fn flag(set: bool) -> Option<bool> {
    set.then_some(true)
}

/// `--x` / `--no-x` pair: explicit on, explicit off, or inherit.
fn switch(on: bool, off: bool) -> Option<bool> {
    if off {
        Some(false)
    } else {
        flag(on)
    }
}

/// Only values given on the command line; everything else is inherited or defaulted later.
pub fn requested_parameters(args: &Args) -> RequestedParameters {
    let groups = normalize_groups(&args.groups);
    RequestedParameters {
        comic_id: None,
        format: args.format,
        layout: args.epub_layout,
        width: args.width,
        aspect_ratio: args.aspect_ratio.as_deref().map(|r| r.trim().to_string()),
        quality: args.quality,
        scaling: args.scaling,
        split: args.split.clone(),
        chapter_filter: args.chapters.clone(),
        groups: (!groups.is_empty()).then_some(groups),
        mix_by_upvote: flag(args.mix_by_upvote),
        no_partials: flag(args.no_partials),
        keep_images: switch(args.keep_images, args.no_keep_images),
        keep_chapters: switch(args.keep_chapters, args.no_keep_chapters),
        language: args.language.clone(),
    }
}

fn pipeline_settings(config: Option<&Config>, no_cleanup: bool) -> PipelineSettings {
    let mut retry = RetryPolicy::default();
    if let Some(c) = config {
        if let Some(n) = c.retry_count {
            retry.max_attempts = n.max(1);
        }
        if let Some(ms) = &c.retry_backoff_ms {
            retry.backoff = ms.iter().copied().map(Duration::from_millis).collect();
        }
    }
    PipelineSettings {
        output_dir: config
            .and_then(|c| c.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from("comics")),
        workspace_dir: config
            .and_then(|c| c.workspace_dir.clone())
            .unwrap_or_else(|| PathBuf::from(".")),
        download_workers: config
            .and_then(|c| c.download_workers)
            .unwrap_or(DEFAULT_DOWNLOAD_WORKERS),
        process_workers: config
            .and_then(|c| c.process_workers)
            .unwrap_or(DEFAULT_PROCESS_WORKERS),
        retry,
        no_cleanup,
    }
}

fn build_client(config: Option<&Config>, cookies: Option<&str>) -> Result<PoliteClient, SourceError> {
    let mut builder = PoliteClient::builder();
    if let Some(c) = config {
        if let Some(ua) = &c.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        if let Some(ms) = c.request_delay_ms {
            builder = builder.delay_ms(ms);
        }
        if let Some(secs) = c.timeout_secs {
            builder = builder.timeout_secs(secs);
        }
        if let Some(n) = c.retry_count {
            builder = builder.retry_count(n);
        }
        if let Some(ms) = &c.retry_backoff_ms {
            builder = builder.retry_backoff_ms(ms.clone());
        }
    }
    if let Some(cookies) = cookies {
        builder = builder.cookies(cookies);
    }
    builder.build()
}

/// Language for the chapter list: explicit flag, else the saved run's, else the default.
fn effective_language(args: &Args, workspace: &Workspace) -> String {
    if let Some(lang) = &args.language {
        return lang.clone();
    }
    RunState::load(&workspace.state_path())
        .map(|s| s.params.language)
        .unwrap_or_else(|_| DEFAULT_LANGUAGE.to_string())
}

/// Page progress bar, one per chapter.
struct BarProgress {
    bar: Option<ProgressBar>,
}

impl BarProgress {
    fn new() -> Self {
        Self { bar: None }
    }
}

impl Progress for BarProgress {
    fn chapter_started(&mut self, chapter: &ChapterNumber, pages: usize) {
        let bar = ProgressBar::with_draw_target(Some(pages as u64), ProgressDrawTarget::stderr());
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
                .progress_chars("█▉▊▋▌▍▎▏ "),
        );
        bar.set_message(format!("Chapter {}", chapter));
        bar.enable_steady_tick(Duration::from_millis(80));
        self.bar = Some(bar);
    }

    fn page(&mut self, _chapter: &ChapterNumber, _index: u32, state: PageState) {
        if let Some(bar) = &self.bar {
            if matches!(state, PageState::Complete | PageState::PermanentFailure) {
                bar.inc(1);
            }
        }
    }

    fn chapter_finished(&mut self, _chapter: &ChapterNumber) {
        if let Some(bar) = self.bar.take() {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

struct Quiet;

impl Progress for Quiet {}

fn install_interrupt_handler() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            // Second Ctrl-C: give up immediately.
            std::process::exit(130);
        }
        eprintln!("\nInterrupt received; finishing in-flight pages. Press Ctrl-C again to quit now.");
    }) {
        warn!(error = %e, "could not install Ctrl-C handler");
    }
    cancel
}

fn print_summary(summary: &RunSummary) {
    for unit in &summary.produced {
        if unit.reused {
            eprintln!("Up to date {}", unit.path.display());
        } else {
            eprintln!("Wrote {}", unit.path.display());
        }
    }
    if !summary.kept_images.is_empty() {
        eprintln!("Kept images for {} chapter(s)", summary.kept_images.len());
    }
    for skipped in &summary.skipped {
        eprintln!("Skipped chapter {}: {}", skipped.chapter, skipped.reason);
    }
    if !summary.failed_pages.is_empty() {
        eprintln!("{} page(s) could not be downloaded", summary.failed_pages.len());
    }
    if !summary.decode_failures.is_empty() {
        let list: Vec<String> = summary
            .decode_failures
            .iter()
            .map(|(c, i)| format!("{}#{}", c, i))
            .collect();
        eprintln!("Dropped undecodable pages: {}", list.join(", "));
    }
    for unit in &summary.failed_units {
        eprintln!("Failed to write {}: {}", unit.file, unit.error);
    }
    if !summary.workspace_removed {
        eprintln!("Workspace kept at {}", summary.workspace.display());
    }
}

/// Entry point for the CLI. Returns the run summary on success; Err with exit code and message on
/// failure.
pub fn run(args: &Args) -> Result<RunSummary, CliRunError> {
    let slug = slug_from_url(&args.comic_url)?;
    let config = config::load_config().map_err(CliRunError::InvalidInput)?;
    let settings = pipeline_settings(config.as_ref(), args.no_cleanup);
    let workspace = Workspace::for_slug(&settings.workspace_dir, &slug);
    let requested = requested_parameters(args);

    let cancel = install_interrupt_handler();
    let mut bar = BarProgress::new();
    let mut quiet = Quiet;
    let progress: &mut dyn Progress = if args.verbose || args.debug {
        &mut quiet
    } else {
        &mut bar
    };
    let mut pipeline = Pipeline::new(&settings, &cancel, progress);

    let summary = if args.restore_parameters {
        pipeline.restore(&workspace, &requested)?
    } else {
        let client = build_client(config.as_ref(), args.cookies.as_deref())?;
        let fetcher = ImageFetcher::new(client.http());
        let language = effective_language(args, &workspace);
        let mut source = ComickSource::new(client, &args.comic_url, &language)?;
        pipeline.run(&workspace, &mut source, &fetcher, &requested)?
    };
    info!(
        produced = summary.produced.len(),
        skipped = summary.skipped.len(),
        "finished"
    );
    print_summary(&summary);

    if summary.cancelled {
        return Err(CliRunError::Cancelled);
    }
    if !summary.is_success() {
        let delivered = summary.delivered();
        let missing: Vec<String> = summary
            .selected
            .iter()
            .filter(|c| !delivered.contains(*c))
            .map(ToString::to_string)
            .collect();
        let mut msg = String::from("Run incomplete.");
        if !missing.is_empty() {
            msg.push_str(&format!(" Missing chapters: {}.", missing.join(", ")));
        }
        if !summary.failed_units.is_empty() {
            msg.push_str(&format!(" {} output file(s) failed.", summary.failed_units.len()));
        }
        msg.push_str(" Run the same command again to retry.");
        return Err(CliRunError::Incomplete(msg));
    }
    Ok(summary)
}
