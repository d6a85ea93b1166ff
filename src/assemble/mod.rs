//! Book assembly: packages processed pages into EPUB, PDF, or CBZ output units, applying split
//! boundaries and naming.
//!
//! Every unit is written to `<name>.part` and renamed into place once the writer has finished,
//! so a failed or interrupted unit never leaves a truncated file under its final name.

pub mod cbz;
pub mod epub;
pub mod pdf;

use crate::model::{ChapterNumber, Comic, EpubLayout, OutputFormat, ProcessedPage};
use crate::workspace::part_path;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the container writers. A failed unit is recorded; the remaining units still run.
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("Cannot create output file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot read processed page {path}: {source}")]
    ReadPage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to write PDF: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Output unit has no pages.")]
    EmptyUnit,

    #[error("Format 'none' produces no container.")]
    NoContainer,
}

/// Structural container kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerVariant {
    /// One page per screen: EPUB `page` layout, PDF.
    FixedPage,
    /// Continuous vertical scroll: EPUB `vertical` layout.
    Scrolling,
    /// Ordered image files plus metadata: CBZ.
    Archive,
}

impl ContainerVariant {
    pub fn for_output(format: OutputFormat, layout: EpubLayout) -> Option<Self> {
        match (format, layout) {
            (OutputFormat::Epub, EpubLayout::Page) | (OutputFormat::Pdf, _) => {
                Some(ContainerVariant::FixedPage)
            }
            (OutputFormat::Epub, EpubLayout::Vertical) => Some(ContainerVariant::Scrolling),
            (OutputFormat::Cbz, _) => Some(ContainerVariant::Archive),
            (OutputFormat::None, _) => None,
        }
    }
}

/// How output is divided into units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Everything in one unit.
    None,
    /// A new unit every N chapters.
    Chapters(usize),
    /// Chapters accumulate until the next one would push the unit past this many bytes.
    Bytes(u64),
}

impl SplitPolicy {
    /// Parse `<N>ch` or a size such as `400MB`, `1.5G`, `800k` (1024-based). `None` for no split.
    pub fn parse(value: Option<&str>) -> Result<Self, String> {
        let raw = match value.map(str::trim) {
            None => return Ok(SplitPolicy::None),
            Some(s) => s,
        };
        let bad = || {
            format!(
                "Invalid --split value '{}'. Use a chapter count like 10ch or a size like 400MB.",
                raw
            )
        };
        let s = raw.to_ascii_uppercase();
        if let Some(n) = s.strip_suffix("CH") {
            let n: usize = n.trim().parse().map_err(|_| bad())?;
            if n == 0 {
                return Err(bad());
            }
            return Ok(SplitPolicy::Chapters(n));
        }
        let s = s.strip_suffix('B').unwrap_or(&s);
        let (number, multiplier) = match s.chars().last() {
            Some('K') => (&s[..s.len() - 1], 1u64 << 10),
            Some('M') => (&s[..s.len() - 1], 1u64 << 20),
            Some('G') => (&s[..s.len() - 1], 1u64 << 30),
            Some('T') => (&s[..s.len() - 1], 1u64 << 40),
            _ => (s, 1u64),
        };
        let number = number.trim();
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(bad());
        }
        let value: f64 = number.parse().map_err(|_| bad())?;
        let bytes = (value * multiplier as f64) as u64;
        if bytes == 0 {
            return Err(bad());
        }
        Ok(SplitPolicy::Bytes(bytes))
    }
}

/// Processed pages of one chapter, ready for assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterPages {
    pub chapter: ChapterNumber,
    /// Group credit of the version these pages came from.
    pub group: String,
    pub pages: Vec<ProcessedPage>,
}

impl ChapterPages {
    pub fn byte_len(&self) -> u64 {
        self.pages.iter().map(|p| p.byte_len).sum()
    }
}

/// Split `chapters` (ascending) into unit ranges. Boundaries only fall between chapters.
pub fn plan_units(
    chapters: &[ChapterPages],
    policy: SplitPolicy,
    keep_chapters: bool,
) -> Vec<Range<usize>> {
    if chapters.is_empty() {
        return Vec::new();
    }
    if keep_chapters {
        return (0..chapters.len()).map(|i| i..i + 1).collect();
    }
    match policy {
        SplitPolicy::None => vec![0..chapters.len()],
        SplitPolicy::Chapters(n) => (0..chapters.len())
            .step_by(n.max(1))
            .map(|start| start..(start + n).min(chapters.len()))
            .collect(),
        SplitPolicy::Bytes(budget) => {
            let mut units = Vec::new();
            let mut start = 0;
            let mut size = 0u64;
            for (i, ch) in chapters.iter().enumerate() {
                let len = ch.byte_len();
                if i > start && size + len > budget {
                    units.push(start..i);
                    start = i;
                    size = 0;
                }
                size += len;
            }
            units.push(start..chapters.len());
            units
        }
    }
}

/// Remove `\/*?:"<>|` and turn spaces into underscores.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}

/// `<Title>[_<Groups>]` stem shared by all units of a run.
pub fn base_name(title: &str, preferred_groups: &[String]) -> String {
    let mut base = sanitize_filename(title.trim());
    if base.is_empty() {
        base = "comic".to_string();
    }
    if !preferred_groups.is_empty() {
        base.push('_');
        base.push_str(&sanitize_filename(&preferred_groups.join("_")));
    }
    base
}

/// `Ch_<first>-<last>`. Per-chapter units (`keep_chapters`) are named `Ch_<n>`; a split part
/// holding one chapter keeps the range form, e.g. `Ch_3-3`.
pub fn range_suffix(first: &ChapterNumber, last: &ChapterNumber, per_chapter: bool) -> String {
    if per_chapter && first == last {
        format!("Ch_{}", first)
    } else {
        format!("Ch_{}-{}", first, last)
    }
}

/// One planned output file.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUnit {
    pub file_name: String,
    /// Title written into the container's metadata.
    pub title: String,
    pub first: ChapterNumber,
    pub last: ChapterNumber,
    /// Indices into the chapter list handed to [BookAssembler::plan].
    pub chapters: Range<usize>,
}

/// Everything a container writer needs for one unit.
#[derive(Debug, Clone, Copy)]
pub struct Book<'a> {
    pub comic: &'a Comic,
    pub title: &'a str,
    pub chapters: &'a [ChapterPages],
    /// Cover as JPEG, if one was fetched.
    pub cover: Option<&'a [u8]>,
}

impl<'a> Book<'a> {
    pub fn pages(&self) -> impl Iterator<Item = &'a ProcessedPage> {
        self.chapters.iter().flat_map(|c| c.pages.iter())
    }

    pub fn page_count(&self) -> usize {
        self.chapters.iter().map(|c| c.pages.len()).sum()
    }

    /// Distinct group credits, in chapter order.
    pub fn groups(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for ch in self.chapters {
            if !ch.group.is_empty() && !out.contains(&ch.group) {
                out.push(ch.group.clone());
            }
        }
        out
    }
}

pub struct BookAssembler<'a> {
    pub comic: &'a Comic,
    pub format: OutputFormat,
    pub layout: EpubLayout,
    pub split: SplitPolicy,
    pub keep_chapters: bool,
    pub preferred_groups: &'a [String],
    pub output_dir: &'a Path,
    pub cover: Option<&'a [u8]>,
}

impl BookAssembler<'_> {
    pub fn plan(&self, chapters: &[ChapterPages]) -> Vec<PlannedUnit> {
        let ranges = plan_units(chapters, self.split, self.keep_chapters);
        let single = ranges.len() == 1;
        let base = base_name(&self.comic.title, self.preferred_groups);
        ranges
            .into_iter()
            .map(|range| {
                let first = chapters[range.start].chapter.clone();
                let last = chapters[range.end - 1].chapter.clone();
                let suffix = range_suffix(&first, &last, self.keep_chapters);
                let title = if single {
                    self.comic.title.clone()
                } else {
                    format!("{} ({})", self.comic.title, suffix)
                };
                PlannedUnit {
                    file_name: format!("{}_{}.{}", base, suffix, self.format.extension()),
                    title,
                    first,
                    last,
                    chapters: range,
                }
            })
            .collect()
    }

    pub fn target_path(&self, unit: &PlannedUnit) -> PathBuf {
        self.output_dir.join(&unit.file_name)
    }

    /// Write one unit. On failure the partial file is removed.
    pub fn write(
        &self,
        unit: &PlannedUnit,
        chapters: &[ChapterPages],
    ) -> Result<PathBuf, AssembleError> {
        let book = Book {
            comic: self.comic,
            title: &unit.title,
            chapters: &chapters[unit.chapters.clone()],
            cover: self.cover,
        };
        let variant = ContainerVariant::for_output(self.format, self.layout)
            .ok_or(AssembleError::NoContainer)?;
        if book.page_count() == 0 {
            return Err(AssembleError::EmptyUnit);
        }
        let target = self.target_path(unit);
        let part = part_path(&target);
        debug!(file = %unit.file_name, pages = book.page_count(), "writing unit");
        let result = self.write_container(&part, &book, variant).and_then(|()| {
            std::fs::rename(&part, &target).map_err(AssembleError::from)
        });
        if let Err(e) = result {
            let _ = std::fs::remove_file(&part);
            return Err(e);
        }
        info!(path = %target.display(), "wrote {}", self.format);
        Ok(target)
    }

    fn write_container(
        &self,
        path: &Path,
        book: &Book<'_>,
        variant: ContainerVariant,
    ) -> Result<(), AssembleError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path).map_err(|e| AssembleError::CreateFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut out = std::io::BufWriter::new(file);
        match variant {
            ContainerVariant::Archive => cbz::write_cbz(&mut out, book)?,
            ContainerVariant::FixedPage if self.format == OutputFormat::Pdf => {
                pdf::write_pdf(&mut out, book)?
            }
            ContainerVariant::FixedPage => epub::write_epub(&mut out, book, EpubLayout::Page)?,
            ContainerVariant::Scrolling => epub::write_epub(&mut out, book, EpubLayout::Vertical)?,
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Read a processed page's payload, naming the file on failure.
pub(crate) fn read_page(page: &ProcessedPage) -> Result<Vec<u8>, AssembleError> {
    page.read_bytes().map_err(|e| AssembleError::ReadPage {
        path: page.path.clone(),
        source: e,
    })
}

/// Fixed timestamp for archive entries, so identical input gives identical archives.
pub(crate) fn fixed_zip_time() -> zip::DateTime {
    zip::DateTime::default()
}

pub(crate) fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
