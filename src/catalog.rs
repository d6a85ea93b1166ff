//! Resolved view of the chapters a comic offers, and the metadata source trait that feeds it.

use crate::model::{Chapter, ChapterNumber, ChapterVersion, Comic, PageRef};
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure to obtain catalog data. Aborts the run before any download starts.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog unavailable: {reason}")]
    CatalogUnavailable {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl CatalogError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        CatalogError::CatalogUnavailable {
            reason: reason.into(),
            source: None,
        }
    }
}

/// Trait implemented by metadata sources (comick.io, or a fake in tests).
pub trait MetadataSource {
    /// Identity and descriptive metadata for the comic this source was opened on.
    fn comic(&mut self) -> Result<Comic, CatalogError>;

    /// Every release of every chapter in the comic's language, in catalog order. `pages` left empty.
    fn chapter_versions(&mut self, comic: &Comic) -> Result<Vec<ChapterVersion>, CatalogError>;

    /// Ordered page references of one release.
    fn page_locators(&mut self, version: &ChapterVersion) -> Result<Vec<PageRef>, CatalogError>;
}

/// Chapters of one comic, ascending by number, each with its versions in catalog order.
#[derive(Debug, Clone, Default)]
pub struct ChapterCatalog {
    chapters: BTreeMap<ChapterNumber, Chapter>,
}

impl ChapterCatalog {
    /// Group versions by chapter number. Versions keep the order they were listed in.
    ///
    /// A listing without a release id still registers its chapter, but nothing can be
    /// fetched for it, so a chapter listed only that way ends up with no versions.
    pub fn from_versions(versions: Vec<ChapterVersion>) -> Self {
        let mut chapters: BTreeMap<ChapterNumber, Chapter> = BTreeMap::new();
        for version in versions {
            let chapter = chapters
                .entry(version.chapter.clone())
                .or_insert_with(|| Chapter {
                    number: version.chapter.clone(),
                    versions: Vec::new(),
                });
            if !version.id.trim().is_empty() {
                chapter.versions.push(version);
            }
        }
        Self { chapters }
    }

    pub fn get(&self, number: &ChapterNumber) -> Option<&Chapter> {
        self.chapters.get(number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chapter> {
        self.chapters.values()
    }

    pub fn numbers(&self) -> impl Iterator<Item = &ChapterNumber> {
        self.chapters.keys()
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}
