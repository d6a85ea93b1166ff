//! Run controller: drives catalog, selection, downloads, image processing and assembly for one
//! comic, owns the [RunState], and produces the final [RunSummary].
//!
//! Downloads run chapter by chapter on this thread (each chapter fanned out to the download
//! pool). A finished chapter is queued to a separate bounded pool of processing threads while the
//! next chapter downloads. Only this thread writes the run state.

use crate::assemble::{sanitize_filename, BookAssembler, ChapterPages, SplitPolicy};
use crate::catalog::{CatalogError, ChapterCatalog, MetadataSource};
use crate::download::{
    ByteFetcher, DownloadCoordinator, DownloadError, PageState, RetryPolicy,
    DEFAULT_DOWNLOAD_WORKERS,
};
use crate::imaging::{
    self, parse_aspect_ratio, ChapterImages, ImagingError, ProcessingParams,
    DEFAULT_PROCESS_WORKERS,
};
use crate::model::{ChapterNumber, OutputFormat, PageRef};
use crate::selector::{self, ChapterFilter, FilterSyntaxError, SelectionCriteria, SelectionDiagnostic};
use crate::state::{
    merge, MergeMode, OutputRecord, PageStatus, RequestedParameters, RunParameters, RunState,
    StateError,
};
use crate::workspace::{sniff_image_ext, write_atomic, Workspace};
use crossbeam_channel::{bounded, unbounded};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failures that abort a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Filter(#[from] FilterSyntaxError),

    #[error("{reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("No chapters matched '{filter}'.")]
    NothingSelected { filter: String },

    #[error("Cannot prepare workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write to output directory {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Settings that come from configuration rather than the persisted run parameters.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub output_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub download_workers: usize,
    pub process_workers: usize,
    pub retry: RetryPolicy,
    pub no_cleanup: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("comics"),
            workspace_dir: PathBuf::from("."),
            download_workers: DEFAULT_DOWNLOAD_WORKERS,
            process_workers: DEFAULT_PROCESS_WORKERS,
            retry: RetryPolicy::default(),
            no_cleanup: false,
        }
    }
}

/// Receives progress events on the controller thread.
pub trait Progress {
    fn chapter_started(&mut self, _chapter: &ChapterNumber, _pages: usize) {}
    fn page(&mut self, _chapter: &ChapterNumber, _index: u32, _state: PageState) {}
    fn chapter_finished(&mut self, _chapter: &ChapterNumber) {}
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl Progress for NoProgress {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoVersion,
    NoPages,
    PagesFailed(usize),
    Undecodable,
    ProcessingFailed(String),
    NotProcessed,
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoVersion => write!(f, "no version available"),
            SkipReason::NoPages => write!(f, "version lists no pages"),
            SkipReason::PagesFailed(n) => write!(f, "{} page(s) could not be downloaded", n),
            SkipReason::Undecodable => write!(f, "no page could be decoded"),
            SkipReason::ProcessingFailed(e) => write!(f, "processing failed: {}", e),
            SkipReason::NotProcessed => write!(f, "no processed pages in the workspace"),
            SkipReason::Cancelled => write!(f, "run was cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChapter {
    pub chapter: ChapterNumber,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducedUnit {
    pub path: PathBuf,
    pub record: OutputRecord,
    /// Already present from an earlier run; not rewritten.
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUnit {
    pub file: String,
    pub error: String,
}

/// Outcome of a run or restore.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub title: String,
    pub format: OutputFormat,
    pub selected: Vec<ChapterNumber>,
    pub produced: Vec<ProducedUnit>,
    pub skipped: Vec<SkippedChapter>,
    pub failed_pages: Vec<(ChapterNumber, u32)>,
    pub decode_failures: Vec<(ChapterNumber, u32)>,
    pub failed_units: Vec<FailedUnit>,
    /// Chapters whose raw images were copied out (`keep_images`).
    pub kept_images: BTreeSet<ChapterNumber>,
    pub cancelled: bool,
    pub workspace: PathBuf,
    pub workspace_removed: bool,
}

impl RunSummary {
    fn new(state: &RunState, workspace: &Workspace) -> Self {
        Self {
            title: state.comic.title.clone(),
            format: state.params.format,
            selected: Vec::new(),
            produced: Vec::new(),
            skipped: Vec::new(),
            failed_pages: Vec::new(),
            decode_failures: Vec::new(),
            failed_units: Vec::new(),
            kept_images: BTreeSet::new(),
            cancelled: false,
            workspace: workspace.root().to_path_buf(),
            workspace_removed: false,
        }
    }

    fn skip(&mut self, chapter: &ChapterNumber, reason: SkipReason) {
        if self.skipped.iter().any(|s| &s.chapter == chapter) {
            return;
        }
        warn!(chapter = %chapter, "skipping chapter: {}", reason);
        self.skipped.push(SkippedChapter {
            chapter: chapter.clone(),
            reason,
        });
    }

    /// Selected chapters that made it into at least one output.
    pub fn delivered(&self) -> BTreeSet<ChapterNumber> {
        if self.format == OutputFormat::None {
            return self.kept_images.clone();
        }
        self.produced
            .iter()
            .flat_map(|u| u.record.chapters.iter().cloned())
            .collect()
    }

    /// False if cancelled, any unit failed, or any selected chapter is missing from every output.
    pub fn is_success(&self) -> bool {
        if self.cancelled || !self.failed_units.is_empty() {
            return false;
        }
        let delivered = self.delivered();
        self.selected.iter().all(|c| delivered.contains(c))
    }
}

/// Everything derived from the run parameters that can be invalid.
struct RunPlan {
    split: SplitPolicy,
    processing: ProcessingParams,
    criteria: SelectionCriteria,
}

impl RunPlan {
    fn from_params(params: &RunParameters) -> Result<Self, PipelineError> {
        let split = SplitPolicy::parse(params.split.as_deref()).map_err(|reason| {
            PipelineError::InvalidParameter {
                name: "split",
                reason,
            }
        })?;
        let aspect_ratio = match (&params.aspect_ratio, params.format) {
            (_, OutputFormat::Pdf) | (None, _) => None,
            (Some(r), _) => Some(parse_aspect_ratio(r).map_err(|reason| {
                PipelineError::InvalidParameter {
                    name: "aspect_ratio",
                    reason,
                }
            })?),
        };
        let criteria = SelectionCriteria {
            filter: ChapterFilter::parse(&params.chapter_filter)?,
            no_partials: params.no_partials,
            preferred_groups: params.groups.clone(),
            mix_by_upvote: params.mix_by_upvote,
        };
        Ok(Self {
            split,
            processing: ProcessingParams {
                width: params.width,
                aspect_ratio,
                quality: params.quality,
                scaling: params.scaling,
            },
            criteria,
        })
    }
}

struct ProcessJob {
    chapter: ChapterNumber,
    raw_pages: Vec<(u32, PathBuf)>,
}

type ProcessResult = (ChapterNumber, Result<ChapterImages, ImagingError>);

pub struct Pipeline<'a> {
    settings: &'a PipelineSettings,
    cancel: &'a AtomicBool,
    progress: &'a mut dyn Progress,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        settings: &'a PipelineSettings,
        cancel: &'a AtomicBool,
        progress: &'a mut dyn Progress,
    ) -> Self {
        Self {
            settings,
            cancel,
            progress,
        }
    }

    /// Fresh or resumed run: fetch what is missing, process it, assemble the outputs.
    pub fn run<S, F>(
        &mut self,
        workspace: &Workspace,
        source: &mut S,
        fetcher: &F,
        requested: &RequestedParameters,
    ) -> Result<RunSummary, PipelineError>
    where
        S: MetadataSource + ?Sized,
        F: ByteFetcher + ?Sized,
    {
        let comic = source.comic()?;
        let mut req = requested.clone();
        req.comic_id = Some(comic.id.clone());

        let state_path = workspace.state_path();
        let mut state = if state_path.is_file() {
            let mut state = RunState::load(&state_path)?;
            state.params = merge(&state.params, &req, MergeMode::Resume, workspace.root())?;
            info!(workspace = %workspace.root().display(), "resuming saved run");
            state.comic = comic;
            state
        } else {
            RunState::new(RunParameters::resolve(&comic.id, &req), comic)
        };
        state.comic.language = state.params.language.clone();
        let plan = RunPlan::from_params(&state.params)?;

        workspace
            .create()
            .map_err(|e| PipelineError::Workspace {
                path: workspace.root().to_path_buf(),
                source: e,
            })?;
        let shape = state.params.page_shape();
        let reshaped = state.adopt_page_shape(shape);
        if !reshaped.is_empty() {
            info!(chapters = reshaped.len(), "page shape changed; processing again");
        }
        let dropped = state.forget_missing_processed(workspace.root());
        if !dropped.is_empty() {
            debug!(chapters = ?dropped, "processed pages missing; will process again");
        }
        let mut summary = RunSummary::new(&state, workspace);

        let catalog = ChapterCatalog::from_versions(source.chapter_versions(&state.comic)?);
        info!(chapters = catalog.len(), "catalog built");
        let selection = selector::select(&catalog, &plan.criteria);
        for diagnostic in &selection.diagnostics {
            match diagnostic {
                SelectionDiagnostic::NoVersionAvailable { chapter } => {
                    summary.selected.push(chapter.clone());
                    summary.skip(chapter, SkipReason::NoVersion);
                }
            }
        }
        if selection.picks.is_empty() {
            return Err(PipelineError::NothingSelected {
                filter: state.params.chapter_filter.clone(),
            });
        }
        summary
            .selected
            .extend(selection.picks.iter().map(|p| p.chapter.clone()));
        summary.selected.sort();
        state.record_selection(&selection.picks);
        state.save(&state_path)?;

        // Resolve every locator before the first download so catalog failures abort cleanly.
        let mut pending: Vec<(ChapterNumber, Vec<PageRef>)> = Vec::new();
        for pick in &selection.picks {
            if state.is_processed(&pick.chapter) {
                debug!(chapter = %pick.chapter, "already processed");
                continue;
            }
            let pages = source.page_locators(&pick.version)?;
            pending.push((pick.chapter.clone(), pages));
        }

        let coordinator = DownloadCoordinator::new(
            fetcher,
            workspace,
            self.settings.retry.clone(),
            self.settings.download_workers,
            self.cancel,
        );
        self.fetch_cover(&coordinator, &mut state, workspace)?;
        self.download_and_process(&coordinator, &mut state, workspace, &plan, &pending, &mut summary)?;

        if summary.cancelled || self.cancel.load(Ordering::SeqCst) {
            summary.cancelled = true;
            for (chapter, _) in &pending {
                if !state.is_processed(chapter) {
                    summary.skip(chapter, SkipReason::Cancelled);
                }
            }
            warn!("run cancelled; progress saved for resume");
        } else {
            let selected = summary.selected.clone();
            self.assemble(&mut state, workspace, &selected, plan.split, &mut summary)?;
            if state.params.keep_images {
                self.keep_images(&state, workspace, &selected, &mut summary)?;
            }
        }
        state.save(&state_path)?;
        self.cleanup(workspace, &mut summary);
        Ok(summary)
    }

    /// Reassemble from a previous run's processed pages. No network, no image processing.
    pub fn restore(
        &mut self,
        workspace: &Workspace,
        requested: &RequestedParameters,
    ) -> Result<RunSummary, PipelineError> {
        let state_path = workspace.state_path();
        let mut state = RunState::load(&state_path)?;
        state.params = merge(&state.params, requested, MergeMode::Restore, workspace.root())?;
        let plan = RunPlan::from_params(&state.params)?;
        info!(
            format = %state.params.format,
            workspace = %workspace.root().display(),
            "restoring saved run"
        );
        let dropped = state.forget_missing_processed(workspace.root());
        if !dropped.is_empty() {
            warn!(chapters = ?dropped, "processed pages missing from workspace");
        }

        let mut summary = RunSummary::new(&state, workspace);
        summary.selected = state.chapters.keys().cloned().collect();
        let selected = summary.selected.clone();
        self.assemble(&mut state, workspace, &selected, plan.split, &mut summary)?;
        if state.params.keep_images {
            self.keep_images(&state, workspace, &selected, &mut summary)?;
        }
        state.save(&state_path)?;
        self.cleanup(workspace, &mut summary);
        Ok(summary)
    }

    fn fetch_cover<F: ByteFetcher + ?Sized>(
        &self,
        coordinator: &DownloadCoordinator<'_, F>,
        state: &mut RunState,
        workspace: &Workspace,
    ) -> Result<(), PipelineError> {
        let Some(url) = state.comic.cover_url.clone() else {
            return Ok(());
        };
        let path = workspace.cover_path();
        if state.cover == Some(PageStatus::Complete) && path.is_file() {
            return Ok(());
        }
        state.cover = match coordinator.fetch_to(&url, &path) {
            Ok(()) => Some(PageStatus::Complete),
            Err(e) => {
                warn!(error = %e, "cover could not be fetched; continuing without it");
                Some(PageStatus::Failed)
            }
        };
        state.save(&workspace.state_path())?;
        Ok(())
    }

    fn download_and_process<F: ByteFetcher + ?Sized>(
        &mut self,
        coordinator: &DownloadCoordinator<'_, F>,
        state: &mut RunState,
        workspace: &Workspace,
        plan: &RunPlan,
        pending: &[(ChapterNumber, Vec<PageRef>)],
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        if pending.is_empty() {
            return Ok(());
        }
        let workers = self.settings.process_workers.max(1);
        let params = plan.processing;
        let cancel = self.cancel;
        let progress = &mut *self.progress;

        std::thread::scope(|scope| -> Result<(), PipelineError> {
            let (job_tx, job_rx) = bounded::<ProcessJob>(workers);
            let (done_tx, done_rx) = unbounded::<ProcessResult>();
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for job in job_rx.iter() {
                        let result =
                            imaging::process_chapter(workspace, &job.chapter, &job.raw_pages, &params);
                        let _ = done_tx.send((job.chapter, result));
                    }
                });
            }
            drop(job_rx);
            drop(done_tx);

            for (chapter, pages) in pending {
                if cancel.load(Ordering::SeqCst) {
                    summary.cancelled = true;
                    break;
                }
                if pages.is_empty() {
                    summary.skip(chapter, SkipReason::NoPages);
                    continue;
                }
                progress.chapter_started(chapter, pages.len());
                let download = coordinator.download_chapter(state, chapter, pages, &mut |index, page_state| {
                    progress.page(chapter, index, page_state)
                })?;
                progress.chapter_finished(chapter);
                if download.cancelled {
                    summary.cancelled = true;
                    break;
                }
                if !download.failed_pages.is_empty() {
                    summary
                        .failed_pages
                        .extend(download.failed_pages.iter().map(|i| (chapter.clone(), *i)));
                    summary.skip(chapter, SkipReason::PagesFailed(download.failed_pages.len()));
                    continue;
                }
                let job = ProcessJob {
                    chapter: chapter.clone(),
                    raw_pages: download.pages,
                };
                if job_tx.send(job).is_err() {
                    summary.skip(
                        chapter,
                        SkipReason::ProcessingFailed("processing pool stopped".to_string()),
                    );
                }
                while let Ok((done, result)) = done_rx.try_recv() {
                    record_processing(state, workspace, done, result, summary)?;
                }
            }
            drop(job_tx);
            for (done, result) in done_rx.iter() {
                record_processing(state, workspace, done, result, summary)?;
            }
            Ok(())
        })
    }

    fn assemble(
        &self,
        state: &mut RunState,
        workspace: &Workspace,
        selected: &[ChapterNumber],
        split: SplitPolicy,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let mut chapters = Vec::new();
        for number in selected {
            match state.processed_pages(workspace.root(), number) {
                Some(pages) if !pages.is_empty() => chapters.push(ChapterPages {
                    chapter: number.clone(),
                    group: state
                        .chapters
                        .get(number)
                        .map(|c| c.version.clone())
                        .unwrap_or_default(),
                    pages,
                }),
                _ => summary.skip(number, SkipReason::NotProcessed),
            }
        }
        let format = state.params.format;
        if format == OutputFormat::None {
            return Ok(());
        }
        if chapters.is_empty() {
            warn!("nothing to assemble");
            return Ok(());
        }

        let out_dir = &self.settings.output_dir;
        std::fs::create_dir_all(out_dir).map_err(|e| PipelineError::Output {
            path: out_dir.clone(),
            source: e,
        })?;
        let cover = load_cover(state, workspace);
        let comic = state.comic.clone();
        let groups = state.params.groups.clone();
        let assembler = BookAssembler {
            comic: &comic,
            format,
            layout: state.params.layout,
            split,
            keep_chapters: state.params.keep_chapters,
            preferred_groups: &groups,
            output_dir: out_dir,
            cover: cover.as_deref(),
        };
        let units = assembler.plan(&chapters);
        info!(units = units.len(), format = %format, "assembling");
        for unit in units {
            let target = assembler.target_path(&unit);
            let record = OutputRecord {
                file: unit.file_name.clone(),
                format,
                first: unit.first.clone(),
                last: unit.last.clone(),
                chapters: chapters[unit.chapters.clone()]
                    .iter()
                    .map(|c| c.chapter.clone())
                    .collect(),
            };
            let already = state
                .find_output(&unit.file_name, format)
                .map_or(false, |o| o.chapters == record.chapters);
            if already && target.is_file() {
                info!(file = %unit.file_name, "already assembled");
                summary.produced.push(ProducedUnit {
                    path: target,
                    record,
                    reused: true,
                });
                continue;
            }
            match assembler.write(&unit, &chapters) {
                Ok(path) => {
                    state.record_output(record.clone());
                    state.save(&workspace.state_path())?;
                    summary.produced.push(ProducedUnit {
                        path,
                        record,
                        reused: false,
                    });
                }
                Err(e) => {
                    warn!(file = %unit.file_name, error = %e, "output unit failed");
                    summary.failed_units.push(FailedUnit {
                        file: unit.file_name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Copy downloaded pages to `<output>/<Title>/Chapter_<n>/`.
    fn keep_images(
        &self,
        state: &RunState,
        workspace: &Workspace,
        selected: &[ChapterNumber],
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let base = self
            .settings
            .output_dir
            .join(sanitize_filename(&state.comic.title));
        for number in selected {
            let Some(chapter) = state.chapters.get(number) else {
                continue;
            };
            let dir = base.join(format!("Chapter_{}", number));
            let mut copied = 0;
            let mut missing = 0;
            for (&index, status) in &chapter.pages {
                if *status != PageStatus::Complete {
                    missing += 1;
                    continue;
                }
                let bytes = match std::fs::read(workspace.raw_page_path(number, index)) {
                    Ok(b) => b,
                    Err(_) => {
                        missing += 1;
                        continue;
                    }
                };
                let path = dir.join(format!("{:04}.{}", index, sniff_image_ext(&bytes)));
                write_atomic(&path, &bytes).map_err(|e| PipelineError::Output {
                    path: path.clone(),
                    source: e,
                })?;
                copied += 1;
            }
            if copied > 0 {
                debug!(chapter = %number, copied, "kept raw images");
                if missing == 0 && !summary.skipped.iter().any(|s| &s.chapter == number) {
                    summary.kept_images.insert(number.clone());
                }
            }
        }
        if !summary.kept_images.is_empty() {
            info!(dir = %base.display(), chapters = summary.kept_images.len(), "raw images kept");
        }
        Ok(())
    }

    /// Remove the workspace unless asked to keep it or the run can still be resumed.
    fn cleanup(&self, workspace: &Workspace, summary: &mut RunSummary) {
        if self.settings.no_cleanup || !summary.is_success() {
            info!(workspace = %workspace.root().display(), "workspace kept");
            return;
        }
        match workspace.remove() {
            Ok(()) => summary.workspace_removed = true,
            Err(e) => warn!(
                workspace = %workspace.root().display(),
                error = %e,
                "could not remove workspace"
            ),
        }
    }
}

fn record_processing(
    state: &mut RunState,
    workspace: &Workspace,
    chapter: ChapterNumber,
    result: Result<ChapterImages, ImagingError>,
    summary: &mut RunSummary,
) -> Result<(), PipelineError> {
    let images = match result {
        Ok(images) => images,
        Err(e) => {
            summary.skip(&chapter, SkipReason::ProcessingFailed(e.to_string()));
            return Ok(());
        }
    };
    summary.decode_failures.extend(
        images
            .decode_failures
            .iter()
            .map(|f| (f.chapter.clone(), f.index)),
    );
    if images.pages.is_empty() {
        summary.skip(&chapter, SkipReason::Undecodable);
        return Ok(());
    }
    state.record_processed(
        workspace.root(),
        &chapter,
        &images.pages,
        images.decode_failures.iter().map(|f| f.index).collect(),
    );
    state.save(&workspace.state_path())?;
    debug!(chapter = %chapter, pages = images.pages.len(), "recorded processed chapter");
    Ok(())
}

/// Cover as JPEG, if one was fetched and decodes.
fn load_cover(state: &RunState, workspace: &Workspace) -> Option<Vec<u8>> {
    if state.cover != Some(PageStatus::Complete) {
        return None;
    }
    let path = workspace.cover_path();
    let bytes = std::fs::read(&path).ok()?;
    match imaging::encode_cover(&bytes) {
        Ok(jpeg) => Some(jpeg),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cover could not be decoded; skipping it");
            None
        }
    }
}

/// Workspace for a comic URL slug under the configured workspace directory.
pub fn workspace_for(settings: &PipelineSettings, slug: &str) -> Workspace {
    Workspace::for_slug(&settings.workspace_dir, slug)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::sample_comic;
    use crate::state::PageShape;
    use crate::testutil::{FakeFetcher, FakeSource};
    use std::error::Error;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn settings(root: &Path) -> PipelineSettings {
        PipelineSettings {
            output_dir: root.join("comics"),
            workspace_dir: root.join("work"),
            download_workers: 2,
            process_workers: 2,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: vec![Duration::ZERO],
            },
            no_cleanup: false,
        }
    }

    fn requested(format: OutputFormat) -> RequestedParameters {
        RequestedParameters {
            format: Some(format),
            width: Some(160),
            ..RequestedParameters::default()
        }
    }

    fn run(
        settings: &PipelineSettings,
        source: &mut FakeSource,
        fetcher: &FakeFetcher,
        cancel: &AtomicBool,
        req: &RequestedParameters,
    ) -> Result<RunSummary, PipelineError> {
        let mut quiet = NoProgress;
        let workspace = workspace_for(settings, "test-comic");
        Pipeline::new(settings, cancel, &mut quiet).run(&workspace, source, fetcher, req)
    }

    #[test]
    fn fresh_run_produces_epub_and_removes_workspace() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let mut source = FakeSource::with_chapters(sample_comic(), 3, 2);
        let fetcher = FakeFetcher::new();
        let cancel = AtomicBool::new(false);
        let summary = run(&settings, &mut source, &fetcher, &cancel, &requested(OutputFormat::Epub))?;

        assert!(summary.is_success(), "{:?}", summary);
        assert_eq!(summary.produced.len(), 1);
        assert_eq!(
            summary.produced[0].path,
            settings.output_dir.join("Test_Comic_Ch_1-3.epub")
        );
        assert!(summary.produced[0].path.is_file());
        assert_eq!(fetcher.calls(), 6);
        assert!(summary.workspace_removed);
        assert!(!workspace_for(&settings, "test-comic").exists());
        Ok(())
    }

    #[test]
    fn resumed_run_matches_uninterrupted_output() -> Result<(), Box<dyn Error>> {
        let baseline_dir = tempfile::tempdir()?;
        let baseline_settings = settings(baseline_dir.path());
        let mut source = FakeSource::with_chapters(sample_comic(), 3, 4);
        let baseline = run(
            &baseline_settings,
            &mut source,
            &FakeFetcher::new(),
            &AtomicBool::new(false),
            &requested(OutputFormat::Epub),
        )?;
        let expected = std::fs::read(&baseline.produced[0].path)?;

        let dir = tempfile::tempdir()?;
        let mut settings = settings(dir.path());
        settings.download_workers = 1;
        let flag = Arc::new(AtomicBool::new(false));
        let interrupted_fetcher = FakeFetcher::new().cancel_after(3, flag.clone());
        let mut source = FakeSource::with_chapters(sample_comic(), 3, 4);
        let first = run(
            &settings,
            &mut source,
            &interrupted_fetcher,
            &flag,
            &requested(OutputFormat::Epub),
        )?;
        assert!(first.cancelled);
        assert!(!first.is_success());
        assert!(first.produced.is_empty());
        let workspace = workspace_for(&settings, "test-comic");
        assert!(workspace.exists());
        let saved = RunState::load(&workspace.state_path())?;
        let complete = saved
            .chapters
            .values()
            .flat_map(|c| c.pages.values())
            .filter(|s| **s == PageStatus::Complete)
            .count();
        assert_eq!(complete, 3);

        let fetcher = FakeFetcher::new();
        let second = run(
            &settings,
            &mut source,
            &fetcher,
            &AtomicBool::new(false),
            &requested(OutputFormat::Epub),
        )?;
        assert!(second.is_success());
        assert_eq!(fetcher.calls(), 12 - complete);
        assert_eq!(std::fs::read(&second.produced[0].path)?, expected);
        Ok(())
    }

    #[test]
    fn restore_reassembles_without_fetching_or_processing() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let mut settings = settings(dir.path());
        settings.no_cleanup = true;
        let mut source = FakeSource::with_chapters(sample_comic(), 2, 2);
        let fetcher = FakeFetcher::new();
        let cancel = AtomicBool::new(false);
        run(&settings, &mut source, &fetcher, &cancel, &requested(OutputFormat::Epub))?;

        // Without raw pages, any processing attempt would have nothing to work from.
        let workspace = workspace_for(&settings, "test-comic");
        for n in [1.0, 2.0] {
            std::fs::remove_dir_all(workspace.chapter_dir(&ChapterNumber::from_value(n)).join("raw"))?;
        }

        let mut quiet = NoProgress;
        let summary = Pipeline::new(&settings, &cancel, &mut quiet)
            .restore(&workspace, &requested(OutputFormat::Pdf))?;
        assert!(summary.is_success(), "{:?}", summary);
        assert_eq!(summary.format, OutputFormat::Pdf);
        assert_eq!(summary.produced.len(), 1);
        let pdf = &summary.produced[0].path;
        assert_eq!(pdf.extension().and_then(|e| e.to_str()), Some("pdf"));
        let doc = lopdf::Document::load(pdf)?;
        assert!(!doc.get_pages().is_empty());
        assert!(settings.output_dir.join("Test_Comic_Ch_1-2.epub").is_file());
        assert_eq!(fetcher.calls(), 4);

        let saved = RunState::load(&workspace.state_path())?;
        assert_eq!(saved.params.format, OutputFormat::Pdf);
        assert!(saved.find_output("Test_Comic_Ch_1-2.pdf", OutputFormat::Pdf).is_some());
        Ok(())
    }

    #[test]
    fn restore_without_saved_state_names_the_file() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let workspace = workspace_for(&settings, "never-run");
        let cancel = AtomicBool::new(false);
        let mut quiet = NoProgress;
        let err = Pipeline::new(&settings, &cancel, &mut quiet)
            .restore(&workspace, &requested(OutputFormat::Pdf))
            .unwrap_err();
        match err {
            PipelineError::State(StateError::Missing { path }) => {
                assert_eq!(path, workspace.state_path())
            }
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn restore_rejects_processing_changes() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let mut settings = settings(dir.path());
        settings.no_cleanup = true;
        let mut source = FakeSource::with_chapters(sample_comic(), 1, 1);
        let cancel = AtomicBool::new(false);
        run(&settings, &mut source, &FakeFetcher::new(), &cancel, &requested(OutputFormat::Cbz))?;

        let mut req = requested(OutputFormat::Pdf);
        req.width = Some(640);
        let mut quiet = NoProgress;
        let err = Pipeline::new(&settings, &cancel, &mut quiet)
            .restore(&workspace_for(&settings, "test-comic"), &req)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::State(StateError::NonOverridable { .. })
        ));
        Ok(())
    }

    #[test]
    fn catalog_unavailable_aborts_before_downloads() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let mut source = FakeSource::with_chapters(sample_comic(), 2, 2);
        source.unavailable = true;
        let fetcher = FakeFetcher::new();
        let err = run(
            &settings,
            &mut source,
            &fetcher,
            &AtomicBool::new(false),
            &requested(OutputFormat::Epub),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Catalog(_)));
        assert_eq!(fetcher.calls(), 0);
        assert!(!workspace_for(&settings, "test-comic").exists());
        Ok(())
    }

    #[test]
    fn split_by_chapter_count_names_each_part() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let mut source = FakeSource::with_chapters(sample_comic(), 12, 1);
        let mut req = requested(OutputFormat::Cbz);
        req.split = Some("5ch".to_string());
        let summary = run(&settings, &mut source, &FakeFetcher::new(), &AtomicBool::new(false), &req)?;

        assert!(summary.is_success());
        let names: Vec<String> = summary
            .produced
            .iter()
            .map(|u| u.record.file.clone())
            .collect();
        assert_eq!(
            names,
            vec![
                "Test_Comic_Ch_1-5.cbz",
                "Test_Comic_Ch_6-10.cbz",
                "Test_Comic_Ch_11-12.cbz"
            ]
        );
        for unit in &summary.produced {
            assert!(unit.path.is_file());
        }
        Ok(())
    }

    #[test]
    fn failed_page_skips_chapter_and_keeps_workspace() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let mut source = FakeSource::with_chapters(sample_comic(), 2, 2);
        let fetcher = FakeFetcher::new().missing("v2/1");
        let summary = run(
            &settings,
            &mut source,
            &fetcher,
            &AtomicBool::new(false),
            &requested(OutputFormat::Cbz),
        )?;

        assert!(!summary.is_success());
        assert_eq!(
            summary.failed_pages,
            vec![(ChapterNumber::from_value(2.0), 1)]
        );
        assert!(summary
            .skipped
            .iter()
            .any(|s| s.chapter == ChapterNumber::from_value(2.0)
                && s.reason == SkipReason::PagesFailed(1)));
        assert_eq!(summary.produced.len(), 1);
        assert_eq!(summary.produced[0].record.file, "Test_Comic_Ch_1-1.cbz");
        assert!(workspace_for(&settings, "test-comic").exists());
        Ok(())
    }

    #[test]
    fn undecodable_page_is_dropped_and_chapter_still_delivered() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let mut source = FakeSource::with_chapters(sample_comic(), 1, 3);
        let fetcher = FakeFetcher::new().corrupt("v1/2");
        let summary = run(
            &settings,
            &mut source,
            &fetcher,
            &AtomicBool::new(false),
            &requested(OutputFormat::Pdf),
        )?;

        assert!(summary.is_success(), "{:?}", summary);
        assert!(summary.skipped.is_empty());
        assert_eq!(
            summary.decode_failures,
            vec![(ChapterNumber::from_value(1.0), 2)]
        );
        assert_eq!(summary.produced.len(), 1);
        let doc = lopdf::Document::load(&summary.produced[0].path)?;
        assert_eq!(doc.get_pages().len(), 2);
        Ok(())
    }

    #[test]
    fn resume_with_other_page_shape_processes_again() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let mut settings = settings(dir.path());
        settings.no_cleanup = true;
        let mut source = FakeSource::with_chapters(sample_comic(), 2, 2);
        let cancel = AtomicBool::new(false);
        run(&settings, &mut source, &FakeFetcher::new(), &cancel, &requested(OutputFormat::Epub))?;
        let workspace = workspace_for(&settings, "test-comic");
        let saved = RunState::load(&workspace.state_path())?;
        assert_eq!(saved.page_shape, Some(PageShape::Ratio("4:3".to_string())));

        let fetcher = FakeFetcher::new();
        let summary = run(&settings, &mut source, &fetcher, &cancel, &requested(OutputFormat::Pdf))?;
        assert!(summary.is_success(), "{:?}", summary);
        assert_eq!(fetcher.calls(), 0);
        let doc = lopdf::Document::load(&summary.produced[0].path)?;
        assert_eq!(doc.get_pages().len(), 4);

        let saved = RunState::load(&workspace.state_path())?;
        assert_eq!(saved.page_shape, Some(PageShape::Fit));
        for chapter in saved.chapters.values() {
            assert_eq!(chapter.processed.as_ref().map(Vec::len), Some(2));
        }
        Ok(())
    }

    #[test]
    fn format_none_keeps_raw_images() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let mut source = FakeSource::with_chapters(sample_comic(), 1, 2);
        let summary = run(
            &settings,
            &mut source,
            &FakeFetcher::new(),
            &AtomicBool::new(false),
            &requested(OutputFormat::None),
        )?;

        assert!(summary.is_success(), "{:?}", summary);
        assert!(summary.produced.is_empty());
        let kept = settings.output_dir.join("Test_Comic").join("Chapter_1");
        assert!(kept.join("0001.png").is_file());
        assert!(kept.join("0002.png").is_file());
        Ok(())
    }

    #[test]
    fn resume_with_changed_filter_is_rejected() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let mut settings = settings(dir.path());
        settings.no_cleanup = true;
        let mut source = FakeSource::with_chapters(sample_comic(), 2, 1);
        let cancel = AtomicBool::new(false);
        run(&settings, &mut source, &FakeFetcher::new(), &cancel, &requested(OutputFormat::Cbz))?;

        let mut req = requested(OutputFormat::Cbz);
        req.chapter_filter = Some("1".to_string());
        let err = run(&settings, &mut source, &FakeFetcher::new(), &cancel, &req).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::State(StateError::ConfigurationChanged { .. })
        ));
        Ok(())
    }

    #[test]
    fn invalid_split_is_reported_before_network() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let mut source = FakeSource::with_chapters(sample_comic(), 1, 1);
        let fetcher = FakeFetcher::new();
        let mut req = requested(OutputFormat::Cbz);
        req.split = Some("0ch".to_string());
        let err = run(&settings, &mut source, &fetcher, &AtomicBool::new(false), &req).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidParameter { name: "split", .. }
        ));
        assert_eq!(fetcher.calls(), 0);
        Ok(())
    }
}
