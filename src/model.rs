//! Canonical data model for a downloaded comic.
//!
//! The source adapter produces `Comic` and `ChapterVersion` values; the selector, downloader,
//! image processor, and assembler all consume these as the single source of truth.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// One comic (series). Created once per run from catalog data and persisted in the run state
/// so a restore can rebuild containers without the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comic {
    /// Stable source identifier (comick `hid`).
    pub id: String,
    /// URL slug; keys the temporary workspace.
    pub slug: String,
    pub title: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artists: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
    #[serde(rename = "coverUrl", default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
}

/// A chapter number. Supports partial chapters (`1.5`); compared and ordered by numeric value.
///
/// Displays (and serializes) in normalized form: `1`, `1.5`, never `1.0` or `01`.
#[derive(Debug, Clone)]
pub struct ChapterNumber {
    value: f64,
    display: String,
}

impl ChapterNumber {
    /// Parse a chapter number as the source or the user writes it. Rejects negative and non-finite values.
    pub fn parse(s: &str) -> Option<Self> {
        let value: f64 = s.trim().parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Self::from_value(value))
    }

    pub fn from_value(value: f64) -> Self {
        // Adding 0.0 folds -0.0 into 0.0 so it never displays as "-0".
        let value = value + 0.0;
        Self {
            value,
            display: format!("{}", value),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// True for whole chapters; false for partials such as `1.5` or `60.1`.
    pub fn is_integer(&self) -> bool {
        self.value.fract() == 0.0
    }

    pub fn as_str(&self) -> &str {
        &self.display
    }
}

impl fmt::Display for ChapterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl PartialEq for ChapterNumber {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for ChapterNumber {}

impl PartialOrd for ChapterNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChapterNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.total_cmp(&other.value)
    }
}

impl Hash for ChapterNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.display.hash(state);
    }
}

impl Serialize for ChapterNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.display)
    }
}

impl<'de> Deserialize<'de> for ChapterNumber {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChapterNumber::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid chapter number '{}'", s)))
    }
}

/// Reference to one page image of a chapter version. `index` is 1-based within the chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub index: u32,
    pub locator: String,
}

/// One contributor group's release of a chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterVersion {
    /// Source identifier of this release (comick chapter `hid`).
    pub id: String,
    pub chapter: ChapterNumber,
    pub groups: Vec<String>,
    pub upvotes: u32,
    /// Ordered page references. Resolved lazily, only for selected versions.
    pub pages: Vec<PageRef>,
}

impl ChapterVersion {
    /// Case-insensitive match against any of this version's group names.
    pub fn matches_group(&self, name: &str) -> bool {
        let name = name.trim();
        self.groups.iter().any(|g| g.trim().eq_ignore_ascii_case(name))
    }

    /// Human-readable group credit, used in logs and persisted state.
    pub fn group_label(&self) -> String {
        if self.groups.is_empty() {
            "No Group".to_string()
        } else {
            self.groups.join(", ")
        }
    }
}

/// A chapter with its competing versions, in catalog order.
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub number: ChapterNumber,
    pub versions: Vec<ChapterVersion>,
}

/// A normalized, output-ready page image. Payload is JPEG, stored in the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPage {
    pub chapter: ChapterNumber,
    /// 1-based position within the chapter's processed sequence.
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub path: PathBuf,
    pub byte_len: u64,
}

impl ProcessedPage {
    /// Read the encoded payload from the workspace.
    pub fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }
}

/// Output container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Pdf,
    Epub,
    Cbz,
    /// No container; raw images are kept instead.
    None,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Epub => "epub",
            OutputFormat::Cbz => "cbz",
            OutputFormat::None => "",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::None => f.write_str("none"),
            other => f.write_str(other.extension()),
        }
    }
}

/// EPUB reading layout: one page per screen, or a continuous vertical scroll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpubLayout {
    Page,
    Vertical,
}
