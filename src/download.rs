//! Resumable page downloads for the selected chapters.
//!
//! Pages of one chapter are fetched by a bounded pool of scoped worker threads fed from a
//! crossbeam channel. Outcomes flow back to the calling thread, which is the only writer of
//! [RunState] and persists it after every page.

use crate::model::{ChapterNumber, PageRef};
use crate::state::{PageStatus, RunState, StateError};
use crate::workspace::{write_atomic, Workspace};
use crossbeam_channel::{unbounded, Sender};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_DOWNLOAD_WORKERS: usize = 4;

/// Failure to fetch one locator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Worth retrying: any transport error, HTTP 429 or 5xx.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Not worth retrying (e.g. 404 on every URL variant).
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

/// Fetches raw bytes for a page locator. Shared by all download workers.
pub trait ByteFetcher: Sync {
    fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    State(#[from] StateError),
}

/// Bounded attempts with increasing backoff between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per page, including the first.
    pub max_attempts: u32,
    /// Delay after the n-th failed attempt; the last value is reused.
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let i = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(i)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }
}

/// In-memory lifecycle of one page during a download pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Pending,
    Fetching,
    /// Transient failure after this many attempts; will be retried.
    Failed(u32),
    Complete,
    PermanentFailure,
}

/// Result of downloading one chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterDownload {
    pub chapter: ChapterNumber,
    /// Raw page files in page order, for every page that is complete.
    pub pages: Vec<(u32, PathBuf)>,
    pub failed_pages: Vec<u32>,
    /// Pages fetched over the network in this pass.
    pub fetched: usize,
    /// Pages already present from an earlier run.
    pub skipped: usize,
    pub cancelled: bool,
}

impl ChapterDownload {
    /// Every page is present on disk.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed_pages.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Job {
    index: u32,
    locator: String,
    path: PathBuf,
    budget: u32,
}

#[derive(Debug)]
enum Outcome {
    Started(u32),
    Retrying { index: u32, attempts: u32, error: String },
    Done(u32),
    Failed { index: u32, error: String },
    /// Cancelled before or between attempts; status unchanged.
    Abandoned(u32),
}

/// Drives page downloads for one run.
pub struct DownloadCoordinator<'a, F: ByteFetcher + ?Sized> {
    fetcher: &'a F,
    workspace: &'a Workspace,
    policy: RetryPolicy,
    workers: usize,
    cancel: &'a AtomicBool,
}

impl<'a, F: ByteFetcher + ?Sized> DownloadCoordinator<'a, F> {
    pub fn new(
        fetcher: &'a F,
        workspace: &'a Workspace,
        policy: RetryPolicy,
        workers: usize,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            fetcher,
            workspace,
            policy,
            workers: workers.max(1),
            cancel,
        }
    }

    /// Ensure every page of `chapter` is on disk. Pages already complete (status and file) are
    /// skipped; pages that failed in an earlier run get a single attempt.
    ///
    /// `on_page` is called on this thread for every page state change.
    pub fn download_chapter(
        &self,
        state: &mut RunState,
        chapter: &ChapterNumber,
        pages: &[PageRef],
        on_page: &mut dyn FnMut(u32, PageState),
    ) -> Result<ChapterDownload, DownloadError> {
        let state_path = self.workspace.state_path();
        let mut states: BTreeMap<u32, PageState> = BTreeMap::new();
        let mut jobs = Vec::new();
        let mut skipped = 0;
        for page in pages {
            let path = self.workspace.raw_page_path(chapter, page.index);
            let previous = state.page_status(chapter, page.index);
            if previous == Some(PageStatus::Complete) && path.is_file() {
                states.insert(page.index, PageState::Complete);
                skipped += 1;
                on_page(page.index, PageState::Complete);
                continue;
            }
            let budget = if previous == Some(PageStatus::Failed) {
                1
            } else {
                self.policy.max_attempts.max(1)
            };
            states.insert(page.index, PageState::Pending);
            jobs.push(Job {
                index: page.index,
                locator: page.locator.clone(),
                path,
                budget,
            });
        }

        let mut fetched = 0;
        if !jobs.is_empty() {
            debug!(chapter = %chapter, queued = jobs.len(), skipped, "downloading pages");
            let (job_tx, job_rx) = unbounded::<Job>();
            let (out_tx, out_rx) = unbounded::<Outcome>();
            for job in jobs {
                let _ = job_tx.send(job);
            }
            drop(job_tx);

            std::thread::scope(|scope| -> Result<(), DownloadError> {
                for _ in 0..self.workers {
                    let job_rx = job_rx.clone();
                    let out_tx = out_tx.clone();
                    let fetcher = self.fetcher;
                    let policy = &self.policy;
                    let cancel = self.cancel;
                    scope.spawn(move || {
                        for job in job_rx.iter() {
                            run_job(fetcher, policy, cancel, &job, &out_tx);
                        }
                    });
                }
                drop(out_tx);

                let persist = |state: &RunState| -> Result<(), DownloadError> {
                    state.save(&state_path).map_err(|e| {
                        // Stop the workers picking up more work; the run is about to abort.
                        while job_rx.try_recv().is_ok() {}
                        DownloadError::from(e)
                    })
                };

                for outcome in out_rx.iter() {
                    match outcome {
                        Outcome::Started(index) => {
                            states.insert(index, PageState::Fetching);
                            on_page(index, PageState::Fetching);
                        }
                        Outcome::Retrying {
                            index,
                            attempts,
                            error,
                        } => {
                            debug!(chapter = %chapter, page = index, attempts, %error, "retrying page");
                            states.insert(index, PageState::Failed(attempts));
                            on_page(index, PageState::Failed(attempts));
                        }
                        Outcome::Done(index) => {
                            fetched += 1;
                            states.insert(index, PageState::Complete);
                            state.set_page_status(chapter, index, PageStatus::Complete);
                            persist(state)?;
                            on_page(index, PageState::Complete);
                        }
                        Outcome::Failed { index, error } => {
                            warn!(chapter = %chapter, page = index, %error, "page failed");
                            states.insert(index, PageState::PermanentFailure);
                            state.set_page_status(chapter, index, PageStatus::Failed);
                            persist(state)?;
                            on_page(index, PageState::PermanentFailure);
                        }
                        Outcome::Abandoned(index) => {
                            states.insert(index, PageState::Pending);
                        }
                    }
                }
                Ok(())
            })?;
        }

        let cancelled = states
            .values()
            .any(|s| matches!(s, PageState::Pending | PageState::Fetching | PageState::Failed(_)));
        let failed_pages: Vec<u32> = states
            .iter()
            .filter(|(_, s)| **s == PageState::PermanentFailure)
            .map(|(i, _)| *i)
            .collect();
        let done: Vec<(u32, PathBuf)> = states
            .iter()
            .filter(|(_, s)| **s == PageState::Complete)
            .map(|(i, _)| (*i, self.workspace.raw_page_path(chapter, *i)))
            .collect();
        if !failed_pages.is_empty() {
            warn!(chapter = %chapter, failed = ?failed_pages, "chapter has pages that could not be downloaded");
        } else if !cancelled {
            info!(chapter = %chapter, fetched, skipped, "chapter downloaded");
        }
        Ok(ChapterDownload {
            chapter: chapter.clone(),
            pages: done,
            failed_pages,
            fetched,
            skipped,
            cancelled,
        })
    }

    /// Single attempt (the fetcher's own URL fallbacks still apply), written atomically to `path`.
    pub fn fetch_to(&self, locator: &str, path: &Path) -> Result<(), FetchError> {
        let bytes = self.fetcher.fetch(locator)?;
        write_atomic(path, &bytes)
            .map_err(|e| FetchError::Permanent(format!("cannot write {}: {}", path.display(), e)))
    }
}

fn run_job<F: ByteFetcher + ?Sized>(
    fetcher: &F,
    policy: &RetryPolicy,
    cancel: &AtomicBool,
    job: &Job,
    out: &Sender<Outcome>,
) {
    if cancel.load(Ordering::SeqCst) {
        let _ = out.send(Outcome::Abandoned(job.index));
        return;
    }
    let _ = out.send(Outcome::Started(job.index));
    let mut attempts = 0;
    loop {
        attempts += 1;
        let error = match fetcher.fetch(&job.locator) {
            Ok(bytes) => {
                let outcome = match write_atomic(&job.path, &bytes) {
                    Ok(()) => Outcome::Done(job.index),
                    Err(e) => Outcome::Failed {
                        index: job.index,
                        error: format!("cannot write {}: {}", job.path.display(), e),
                    },
                };
                let _ = out.send(outcome);
                return;
            }
            Err(FetchError::Permanent(msg)) => {
                let _ = out.send(Outcome::Failed {
                    index: job.index,
                    error: msg,
                });
                return;
            }
            Err(FetchError::Transient(msg)) => msg,
        };
        if attempts >= job.budget {
            let _ = out.send(Outcome::Failed {
                index: job.index,
                error: format!("gave up after {} attempt(s): {}", attempts, error),
            });
            return;
        }
        let _ = out.send(Outcome::Retrying {
            index: job.index,
            attempts,
            error,
        });
        std::thread::sleep(policy.delay_after(attempts));
        if cancel.load(Ordering::SeqCst) {
            let _ = out.send(Outcome::Abandoned(job.index));
            return;
        }
    }
}
