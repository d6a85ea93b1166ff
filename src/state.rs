//! Persisted run state (`run_params.json`): run parameters plus per-chapter, per-page progress.
//!
//! The state is owned by the pipeline and saved with an atomic replace after every durable step,
//! so a crash or Ctrl-C loses at most the pages that were in flight.

use crate::model::{ChapterNumber, Comic, EpubLayout, OutputFormat, ProcessedPage};
use crate::selector::Pick;
use crate::workspace::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_QUALITY: u8 = 85;
pub const DEFAULT_SCALING: u8 = 100;
pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_CHAPTER_FILTER: &str = "all";

/// Fields that may differ from the saved run; everything else is fixed once persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverridableField {
    Format,
    Layout,
    Split,
    KeepChapters,
    KeepImages,
}

pub const OVERRIDABLE_FIELDS: [OverridableField; 5] = [
    OverridableField::Format,
    OverridableField::Layout,
    OverridableField::Split,
    OverridableField::KeepChapters,
    OverridableField::KeepImages,
];

impl OverridableField {
    pub fn name(self) -> &'static str {
        match self {
            OverridableField::Format => "format",
            OverridableField::Layout => "layout",
            OverridableField::Split => "split",
            OverridableField::KeepChapters => "keep_chapters",
            OverridableField::KeepImages => "keep_images",
        }
    }

    /// Take this field from `req` if it was given. Returns whether `params` changed.
    fn apply(self, params: &mut RunParameters, req: &RequestedParameters) -> bool {
        match self {
            OverridableField::Format => replace_with(&mut params.format, req.format),
            OverridableField::Layout => replace_with(&mut params.layout, req.layout),
            OverridableField::Split => match &req.split {
                Some(split) => replace_with(&mut params.split, Some(Some(split.clone()))),
                None => false,
            },
            OverridableField::KeepChapters => {
                replace_with(&mut params.keep_chapters, req.keep_chapters)
            }
            OverridableField::KeepImages => replace_with(&mut params.keep_images, req.keep_images),
        }
    }
}

fn replace_with<T: PartialEq>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) if *slot != v => {
            *slot = v;
            true
        }
        _ => false,
    }
}

fn overridable_names() -> String {
    OVERRIDABLE_FIELDS
        .iter()
        .map(|f| f.name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("No saved run state at {path}. Run once without --restore-parameters to download content first.")]
    Missing { path: PathBuf },

    #[error("Could not parse run state {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cannot access run state {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("--restore-parameters can only change {}. Changed: {}", overridable_names(), .fields.join(", "))]
    NonOverridable { fields: Vec<String> },

    #[error("The saved run in {} used different settings for: {}. Remove that directory to start over, or use --restore-parameters to repackage it.", .workspace.display(), .fields.join(", "))]
    ConfigurationChanged {
        fields: Vec<String>,
        workspace: PathBuf,
    },
}

/// Full configuration of one run, after defaults are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub comic_id: String,
    pub format: OutputFormat,
    pub layout: EpubLayout,
    pub width: u32,
    pub aspect_ratio: Option<String>,
    pub quality: u8,
    pub scaling: u8,
    pub split: Option<String>,
    pub chapter_filter: String,
    pub groups: Vec<String>,
    pub mix_by_upvote: bool,
    pub no_partials: bool,
    pub keep_images: bool,
    pub keep_chapters: bool,
    pub language: String,
}

/// Values the user supplied explicitly on this invocation. `None` means "not given".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestedParameters {
    pub comic_id: Option<String>,
    pub format: Option<OutputFormat>,
    pub layout: Option<EpubLayout>,
    pub width: Option<u32>,
    pub aspect_ratio: Option<String>,
    pub quality: Option<u8>,
    pub scaling: Option<u8>,
    pub split: Option<String>,
    pub chapter_filter: Option<String>,
    pub groups: Option<Vec<String>>,
    pub mix_by_upvote: Option<bool>,
    pub no_partials: Option<bool>,
    pub keep_images: Option<bool>,
    pub keep_chapters: Option<bool>,
    pub language: Option<String>,
}

/// Per-format width and aspect ratio used when the user gives none.
pub fn format_defaults(format: OutputFormat, layout: EpubLayout) -> (u32, Option<&'static str>) {
    match (format, layout) {
        (OutputFormat::Epub, EpubLayout::Page) => (1500, Some("2.5")),
        (OutputFormat::Epub, EpubLayout::Vertical) => (2000, Some("4:3")),
        (OutputFormat::Cbz, _) => (1500, Some("2.5")),
        (OutputFormat::Pdf, _) | (OutputFormat::None, _) => (1500, None),
    }
}

impl RunParameters {
    /// Parameters for a fresh run: explicit values win, the rest come from defaults.
    pub fn resolve(comic_id: &str, req: &RequestedParameters) -> Self {
        let format = req.format.unwrap_or(OutputFormat::Epub);
        let layout = req.layout.unwrap_or(EpubLayout::Vertical);
        let (default_width, default_ratio) = format_defaults(format, layout);
        let mut params = Self {
            comic_id: comic_id.to_string(),
            format,
            layout,
            width: req.width.unwrap_or(default_width),
            aspect_ratio: req
                .aspect_ratio
                .clone()
                .or_else(|| default_ratio.map(String::from)),
            quality: req.quality.unwrap_or(DEFAULT_QUALITY),
            scaling: req.scaling.unwrap_or(DEFAULT_SCALING),
            split: req.split.clone(),
            chapter_filter: req
                .chapter_filter
                .clone()
                .unwrap_or_else(|| DEFAULT_CHAPTER_FILTER.to_string()),
            groups: req.groups.clone().unwrap_or_default(),
            mix_by_upvote: req.mix_by_upvote.unwrap_or(false),
            no_partials: req.no_partials.unwrap_or(false),
            keep_images: req.keep_images.unwrap_or(false),
            keep_chapters: req.keep_chapters.unwrap_or(false),
            language: req
                .language
                .clone()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        };
        params.apply_format_rules();
        params
    }

    /// Shape this run's processed pages are cut to. PDF always keeps each page's own shape.
    pub fn page_shape(&self) -> PageShape {
        match (&self.aspect_ratio, self.format) {
            (_, OutputFormat::Pdf) | (None, _) => PageShape::Fit,
            (Some(ratio), _) => PageShape::Ratio(ratio.trim().to_string()),
        }
    }

    fn apply_format_rules(&mut self) {
        if self.format == OutputFormat::None {
            self.keep_images = true;
        }
    }
}

fn check_field<T: PartialEq + ?Sized>(
    out: &mut Vec<String>,
    name: &str,
    requested: Option<&T>,
    persisted: &T,
) {
    if let Some(v) = requested {
        if v != persisted {
            out.push(name.to_string());
        }
    }
}

/// Names of non-overridable fields whose explicit value differs from the persisted one.
pub fn changed_fixed_fields(persisted: &RunParameters, req: &RequestedParameters) -> Vec<String> {
    let mut out = Vec::new();
    check_field(&mut out, "comic_id", req.comic_id.as_deref(), persisted.comic_id.as_str());
    check_field(&mut out, "width", req.width.as_ref(), &persisted.width);
    if let Some(ratio) = &req.aspect_ratio {
        if persisted.aspect_ratio.as_deref() != Some(ratio.trim()) {
            out.push("aspect_ratio".to_string());
        }
    }
    check_field(&mut out, "quality", req.quality.as_ref(), &persisted.quality);
    check_field(&mut out, "scaling", req.scaling.as_ref(), &persisted.scaling);
    check_field(
        &mut out,
        "chapter_filter",
        req.chapter_filter.as_deref().map(str::trim),
        persisted.chapter_filter.trim(),
    );
    check_field(&mut out, "groups", req.groups.as_ref(), &persisted.groups);
    check_field(&mut out, "mix_by_upvote", req.mix_by_upvote.as_ref(), &persisted.mix_by_upvote);
    check_field(&mut out, "no_partials", req.no_partials.as_ref(), &persisted.no_partials);
    check_field(&mut out, "language", req.language.as_deref(), persisted.language.as_str());
    out
}

/// How the persisted parameters are being reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Continue an interrupted run with the network.
    Resume,
    /// `--restore-parameters`: repackage offline.
    Restore,
}

/// Combine persisted parameters with this invocation's explicit values.
///
/// Only the fields in [OVERRIDABLE_FIELDS] are taken from `req`; any other explicit value that
/// differs from the saved run is rejected.
pub fn merge(
    persisted: &RunParameters,
    req: &RequestedParameters,
    mode: MergeMode,
    workspace: &Path,
) -> Result<RunParameters, StateError> {
    let changed = changed_fixed_fields(persisted, req);
    if !changed.is_empty() {
        return Err(match mode {
            MergeMode::Restore => StateError::NonOverridable { fields: changed },
            MergeMode::Resume => StateError::ConfigurationChanged {
                fields: changed,
                workspace: workspace.to_path_buf(),
            },
        });
    }
    let mut merged = persisted.clone();
    let overridden: Vec<&str> = OVERRIDABLE_FIELDS
        .iter()
        .filter(|f| f.apply(&mut merged, req))
        .map(|f| f.name())
        .collect();
    if !overridden.is_empty() {
        debug!(fields = ?overridden, ?mode, "overriding saved parameters");
    }
    merged.apply_format_rules();
    Ok(merged)
}

/// Persisted per-item status. An absent entry means pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Complete,
    Failed,
}

/// One processed page as recorded on disk; `file` is relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub file: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
}

/// Progress of one selected chapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterState {
    /// Group credit of the selected version.
    pub version: String,
    pub version_id: String,
    #[serde(default, with = "page_map")]
    pub pages: BTreeMap<u32, PageStatus>,
    /// Set once the chapter has been processed; `None` means not yet processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<Vec<ProcessedRecord>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decode_failures: Vec<u32>,
}

/// Shape of processed pages: each page fitted to the width, or the chapter strip recut into
/// pages of one aspect ratio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageShape {
    Fit,
    Ratio(String),
}

/// One finished output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub file: String,
    pub format: OutputFormat,
    pub first: ChapterNumber,
    pub last: ChapterNumber,
    #[serde(default)]
    pub chapters: Vec<ChapterNumber>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(flatten)]
    pub params: RunParameters,
    pub comic: Comic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<PageStatus>,
    /// Shape every recorded processed page was cut to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_shape: Option<PageShape>,
    #[serde(default)]
    pub outputs: Vec<OutputRecord>,
    #[serde(default)]
    pub chapters: BTreeMap<ChapterNumber, ChapterState>,
}

impl RunState {
    pub fn new(params: RunParameters, comic: Comic) -> Self {
        Self {
            params,
            comic,
            cover: None,
            page_shape: None,
            outputs: Vec::new(),
            chapters: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, StateError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&text).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })?;
        write_atomic(path, &json).map_err(|e| StateError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Record the chosen version of each picked chapter. A chapter whose chosen version changed
    /// since the last run loses its page and processing progress.
    pub fn record_selection(&mut self, picks: &[Pick]) {
        for pick in picks {
            let entry = self.chapters.entry(pick.chapter.clone()).or_default();
            if entry.version_id != pick.version.id {
                *entry = ChapterState {
                    version: pick.version.group_label(),
                    version_id: pick.version.id.clone(),
                    ..ChapterState::default()
                };
            }
        }
    }

    pub fn page_status(&self, chapter: &ChapterNumber, index: u32) -> Option<PageStatus> {
        self.chapters
            .get(chapter)
            .and_then(|c| c.pages.get(&index).copied())
    }

    pub fn set_page_status(&mut self, chapter: &ChapterNumber, index: u32, status: PageStatus) {
        self.chapters
            .entry(chapter.clone())
            .or_default()
            .pages
            .insert(index, status);
    }

    pub fn is_processed(&self, chapter: &ChapterNumber) -> bool {
        self.chapters
            .get(chapter)
            .map_or(false, |c| c.processed.is_some())
    }

    /// Record a chapter's processed pages. Paths are stored relative to `root`.
    pub fn record_processed(
        &mut self,
        root: &Path,
        chapter: &ChapterNumber,
        pages: &[ProcessedPage],
        decode_failures: Vec<u32>,
    ) {
        let records = pages
            .iter()
            .map(|p| ProcessedRecord {
                file: relative_file(root, &p.path),
                width: p.width,
                height: p.height,
                bytes: p.byte_len,
            })
            .collect();
        let entry = self.chapters.entry(chapter.clone()).or_default();
        entry.processed = Some(records);
        entry.decode_failures = decode_failures;
    }

    /// Processed pages of a chapter, or `None` if it was never processed.
    pub fn processed_pages(&self, root: &Path, chapter: &ChapterNumber) -> Option<Vec<ProcessedPage>> {
        let records = self.chapters.get(chapter)?.processed.as_ref()?;
        Some(
            records
                .iter()
                .enumerate()
                .map(|(i, r)| ProcessedPage {
                    chapter: chapter.clone(),
                    index: i as u32 + 1,
                    width: r.width,
                    height: r.height,
                    path: root.join(&r.file),
                    byte_len: r.bytes,
                })
                .collect(),
        )
    }

    /// Drop processing results whose files are gone, so those chapters are processed again.
    pub fn forget_missing_processed(&mut self, root: &Path) -> Vec<ChapterNumber> {
        let mut dropped = Vec::new();
        for (number, chapter) in self.chapters.iter_mut() {
            let missing = chapter
                .processed
                .as_ref()
                .map_or(false, |recs| recs.iter().any(|r| !root.join(&r.file).is_file()));
            if missing {
                chapter.processed = None;
                dropped.push(number.clone());
            }
        }
        dropped
    }

    /// Switch processed pages to `shape`. If they were cut to another shape, every processed
    /// chapter is forgotten so it is processed again; those chapters are returned.
    pub fn adopt_page_shape(&mut self, shape: PageShape) -> Vec<ChapterNumber> {
        let mut dropped = Vec::new();
        if self.page_shape.as_ref().map_or(false, |old| *old != shape) {
            for (number, chapter) in self.chapters.iter_mut() {
                if chapter.processed.take().is_some() {
                    chapter.decode_failures.clear();
                    dropped.push(number.clone());
                }
            }
        }
        self.page_shape = Some(shape);
        dropped
    }

    pub fn find_output(&self, file: &str, format: OutputFormat) -> Option<&OutputRecord> {
        self.outputs
            .iter()
            .find(|o| o.file == file && o.format == format)
    }

    pub fn record_output(&mut self, record: OutputRecord) {
        self.outputs
            .retain(|o| !(o.file == record.file && o.format == record.format));
        self.outputs.push(record);
    }
}

fn relative_file(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Page maps are keyed by 1-based page index, written as JSON object keys (strings).
mod page_map {
    use super::PageStatus;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<u32, PageStatus>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let as_strings: BTreeMap<String, PageStatus> = map
            .iter()
            .map(|(k, v)| (format!("{:04}", k), *v))
            .collect();
        as_strings.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u32, PageStatus>, D::Error> {
        let raw = BTreeMap::<String, PageStatus>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| {
                k.trim()
                    .parse::<u32>()
                    .map(|idx| (idx, v))
                    .map_err(|_| serde::de::Error::custom(format!("invalid page index '{}'", k)))
            })
            .collect()
    }
}
