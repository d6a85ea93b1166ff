//! Per-comic temporary workspace: path layout for run state, raw pages, processed pages, and cover.
//!
//! ```text
//! <workspace_dir>/tmp_<slug>/
//!   run_params.json
//!   cover.raw
//!   ch_<n>/raw/0001.raw
//!   ch_<n>/processed/p_<n>_0001.jpg
//! ```

use crate::model::ChapterNumber;
use std::io;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "run_params.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Workspace for the comic with this URL slug. Nothing is created on disk.
    pub fn for_slug(base: &Path, slug: &str) -> Self {
        Self {
            root: base.join(format!("tmp_{}", safe_component(slug))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn cover_path(&self) -> PathBuf {
        self.root.join("cover.raw")
    }

    pub fn chapter_dir(&self, chapter: &ChapterNumber) -> PathBuf {
        self.root.join(format!("ch_{}", chapter))
    }

    pub fn raw_page_path(&self, chapter: &ChapterNumber, index: u32) -> PathBuf {
        self.chapter_dir(chapter)
            .join("raw")
            .join(format!("{:04}.raw", index))
    }

    pub fn processed_dir(&self, chapter: &ChapterNumber) -> PathBuf {
        self.chapter_dir(chapter).join("processed")
    }

    pub fn processed_page_path(&self, chapter: &ChapterNumber, index: u32) -> PathBuf {
        self.processed_dir(chapter)
            .join(format!("p_{}_{:04}.jpg", chapter, index))
    }

    /// Drop any half-written processed output of a chapter before reprocessing it.
    pub fn clear_processed(&self, chapter: &ChapterNumber) -> io::Result<()> {
        match std::fs::remove_dir_all(self.processed_dir(chapter)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove the whole workspace. Missing workspace is not an error.
    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn safe_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "comic".to_string()
    } else {
        cleaned
    }
}

/// Write to a sibling `.part` file, then rename over the target. Creates parent directories.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = part_path(path);
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        // Some platforms refuse to rename over an existing file.
        if path.exists() {
            std::fs::remove_file(path)?;
            std::fs::rename(&tmp, path)?;
        } else {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
    }
    Ok(())
}

/// `name.ext` -> `name.ext.part`.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// File extension for an image payload, from its magic bytes. `bin` when unknown.
pub fn sniff_image_ext(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "jpg";
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return "png";
    }
    if bytes.starts_with(b"GIF8") {
        return "gif";
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return "webp";
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        let brand = &bytes[8..12];
        if brand == b"avif" || brand == b"avis" {
            return "avif";
        }
    }
    "bin"
}
