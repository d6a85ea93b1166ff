//! In-memory metadata source and byte fetcher used by unit tests.

use crate::catalog::{CatalogError, MetadataSource};
use crate::download::{ByteFetcher, FetchError};
use crate::model::{ChapterNumber, ChapterVersion, Comic, PageRef};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Deterministic PNG for a locator. Height varies with the locator so recombination has work to do.
pub(crate) fn page_png(locator: &str) -> Vec<u8> {
    let seed: u32 = locator.bytes().map(u32::from).sum();
    let width = 40;
    let height = 30 + seed % 41;
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (seed % 251) as u8,
            ((x * 6) % 256) as u8,
            ((y * 3 + seed) % 256) as u8,
        ])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("png encode");
    out
}

#[derive(Default)]
pub(crate) struct FakeFetcher {
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    transient: HashMap<String, usize>,
    missing: HashSet<String>,
    corrupt: HashSet<String>,
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
}

impl FakeFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The first `times` fetches of `locator` fail transiently.
    pub(crate) fn transient_failures(mut self, locator: &str, times: usize) -> Self {
        self.transient.insert(locator.to_string(), times);
        self
    }

    /// `locator` always fails permanently.
    pub(crate) fn missing(mut self, locator: &str) -> Self {
        self.missing.insert(locator.to_string());
        self
    }

    /// `locator` returns bytes that are not an image.
    pub(crate) fn corrupt(mut self, locator: &str) -> Self {
        self.corrupt.insert(locator.to_string());
        self
    }

    /// Raise `flag` once `n` fetches have succeeded.
    pub(crate) fn cancel_after(mut self, n: usize, flag: Arc<AtomicBool>) -> Self {
        self.cancel_after = Some((n, flag));
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_for(&self, locator: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.get(locator).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl ByteFetcher for FakeFetcher {
    fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let n = {
            let mut calls = self.calls.lock().expect("calls lock");
            let entry = calls.entry(locator.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        if self.missing.contains(locator) {
            return Err(FetchError::Permanent(format!("404 for {}", locator)));
        }
        if let Some(times) = self.transient.get(locator) {
            if n <= *times {
                return Err(FetchError::Transient(format!("503 for {}", locator)));
            }
        }
        if let Some((after, flag)) = &self.cancel_after {
            if total >= *after {
                flag.store(true, Ordering::SeqCst);
            }
        }
        if self.corrupt.contains(locator) {
            return Ok(b"definitely not an image".to_vec());
        }
        Ok(page_png(locator))
    }
}

/// Metadata source backed by a fixed list of versions. Page locators are `<version id>/<index>`.
pub(crate) struct FakeSource {
    pub(crate) comic: Comic,
    pub(crate) versions: Vec<ChapterVersion>,
    pub(crate) pages_per_chapter: u32,
    pub(crate) unavailable: bool,
    pub(crate) locator_calls: usize,
}

impl FakeSource {
    /// Chapters `1..=chapters`, one version each from group "G".
    pub(crate) fn with_chapters(comic: Comic, chapters: u32, pages_per_chapter: u32) -> Self {
        let versions = (1..=chapters)
            .map(|n| ChapterVersion {
                id: format!("v{}", n),
                chapter: ChapterNumber::from_value(f64::from(n)),
                groups: vec!["G".to_string()],
                upvotes: 1,
                pages: Vec::new(),
            })
            .collect();
        Self {
            comic,
            versions,
            pages_per_chapter,
            unavailable: false,
            locator_calls: 0,
        }
    }
}

impl MetadataSource for FakeSource {
    fn comic(&mut self) -> Result<Comic, CatalogError> {
        if self.unavailable {
            return Err(CatalogError::unavailable("fake source is down"));
        }
        Ok(self.comic.clone())
    }

    fn chapter_versions(&mut self, _comic: &Comic) -> Result<Vec<ChapterVersion>, CatalogError> {
        Ok(self.versions.clone())
    }

    fn page_locators(&mut self, version: &ChapterVersion) -> Result<Vec<PageRef>, CatalogError> {
        self.locator_calls += 1;
        Ok((1..=self.pages_per_chapter)
            .map(|i| PageRef {
                index: i,
                locator: format!("{}/{}", version.id, i),
            })
            .collect())
    }
}
