//! Page image normalization: width conformance, optional aspect-ratio recombination, scaling,
//! and JPEG compression.
//!
//! Two modes:
//! - **fit**: every source page is resized to the target width on its own.
//! - **recombine**: width-normalized pages are stacked top to bottom and re-sliced into pages of
//!   exactly `floor(width * ratio)` pixels; the leftover at the end becomes a shorter last page.

use crate::model::{ChapterNumber, ProcessedPage};
use crate::workspace::{write_atomic, Workspace};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_PROCESS_WORKERS: usize = 2;

/// A source page could not be read or decoded. Only that page is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot decode page {index} of chapter {chapter}: {reason}")]
pub struct ImageDecodeError {
    pub chapter: ChapterNumber,
    pub index: u32,
    pub reason: String,
}

/// Failure that stops processing of a whole chapter.
#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("Cannot write processed page {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot encode processed page {index} of chapter {chapter}: {source}")]
    Encode {
        chapter: ChapterNumber,
        index: u32,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessingParams {
    pub width: u32,
    /// Height over width of output pages; `None` selects fit mode.
    pub aspect_ratio: Option<f64>,
    pub quality: u8,
    /// Final resize percentage, 1..=100.
    pub scaling: u8,
}

/// Processed pages of one chapter plus the pages that had to be dropped.
#[derive(Debug, Clone, Default)]
pub struct ChapterImages {
    pub pages: Vec<ProcessedPage>,
    pub decode_failures: Vec<ImageDecodeError>,
}

/// Parse `W:H` (ratio H/W) or a bare number taken as H/W directly.
pub fn parse_aspect_ratio(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let ratio = match s.split_once(':') {
        Some((w, h)) => {
            let w: f64 = w.trim().parse().map_err(|_| bad_ratio(s))?;
            let h: f64 = h.trim().parse().map_err(|_| bad_ratio(s))?;
            if w <= 0.0 {
                return Err(bad_ratio(s));
            }
            h / w
        }
        None => s.parse().map_err(|_| bad_ratio(s))?,
    };
    if !ratio.is_finite() || ratio <= 0.0 {
        return Err(bad_ratio(s));
    }
    Ok(ratio)
}

fn bad_ratio(s: &str) -> String {
    format!(
        "Invalid aspect ratio '{}'. Use W:H (e.g. 4:3) or a height/width number (e.g. 2.5).",
        s
    )
}

/// Height of a `w`x`h` image once resized to `target_w` wide.
pub fn normalized_height(w: u32, h: u32, target_w: u32) -> u32 {
    if w == target_w {
        return h;
    }
    ((u64::from(h) * u64::from(target_w)) / u64::from(w.max(1))).max(1) as u32
}

fn scaled(dim: u32, percent: u8) -> u32 {
    ((u64::from(dim) * u64::from(percent)) / 100).max(1) as u32
}

/// Process the raw pages of one chapter, in page order, into the workspace.
pub fn process_chapter(
    workspace: &Workspace,
    chapter: &ChapterNumber,
    raw_pages: &[(u32, PathBuf)],
    params: &ProcessingParams,
) -> Result<ChapterImages, ImagingError> {
    workspace
        .clear_processed(chapter)
        .map_err(|e| ImagingError::Write {
            path: workspace.processed_dir(chapter),
            source: e,
        })?;
    let mut sink = PageSink {
        workspace,
        chapter,
        params,
        pages: Vec::new(),
    };
    let mut decode_failures = Vec::new();
    let target_w = params.width.max(1);
    let mut strip = params
        .aspect_ratio
        .map(|ratio| Strip::new(target_w, ((f64::from(target_w) * ratio).floor() as u32).max(1)));

    for (index, path) in raw_pages {
        let img = match decode_page(path) {
            Ok(img) => img,
            Err(reason) => {
                let err = ImageDecodeError {
                    chapter: chapter.clone(),
                    index: *index,
                    reason,
                };
                warn!("{}", err);
                decode_failures.push(err);
                continue;
            }
        };
        let img = fit_width(img, target_w);
        match strip.as_mut() {
            Some(strip) => {
                for page in strip.push(&img) {
                    sink.emit(page)?;
                }
            }
            None => sink.emit(img)?,
        }
    }
    if let Some(last) = strip.and_then(Strip::finish) {
        sink.emit(last)?;
    }
    debug!(
        chapter = %chapter,
        sources = raw_pages.len(),
        pages = sink.pages.len(),
        "processed chapter"
    );
    Ok(ChapterImages {
        pages: sink.pages,
        decode_failures,
    })
}

const COVER_QUALITY: u8 = 90;

/// Re-encode a fetched cover as RGB JPEG for embedding in containers.
pub fn encode_cover(bytes: &[u8]) -> Result<Vec<u8>, String> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| e.to_string())?
        .to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, COVER_QUALITY)
        .encode(&img, img.width(), img.height(), ExtendedColorType::Rgb8)
        .map_err(|e| e.to_string())?;
    Ok(out)
}

fn decode_page(path: &std::path::Path) -> Result<RgbImage, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let img = image::load_from_memory(&bytes).map_err(|e| e.to_string())?;
    Ok(img.to_rgb8())
}

fn fit_width(img: RgbImage, target_w: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    if w == target_w {
        return img;
    }
    imageops::resize(&img, target_w, normalized_height(w, h, target_w), FilterType::Lanczos3)
}

/// Greedy top-to-bottom page filler for recombine mode.
struct Strip {
    width: u32,
    page_height: u32,
    pieces: Vec<RgbImage>,
    filled: u32,
}

impl Strip {
    fn new(width: u32, page_height: u32) -> Self {
        Self {
            width,
            page_height,
            pieces: Vec::new(),
            filled: 0,
        }
    }

    /// Add one width-normalized image; returns every page completed by it.
    fn push(&mut self, img: &RgbImage) -> Vec<RgbImage> {
        let mut done = Vec::new();
        let mut offset = 0;
        while offset < img.height() {
            let take = (self.page_height - self.filled).min(img.height() - offset);
            self.pieces
                .push(imageops::crop_imm(img, 0, offset, self.width, take).to_image());
            self.filled += take;
            offset += take;
            if self.filled == self.page_height {
                done.push(self.flush());
            }
        }
        done
    }

    /// The leftover shorter page, if anything is buffered.
    fn finish(mut self) -> Option<RgbImage> {
        if self.filled == 0 {
            None
        } else {
            Some(self.flush())
        }
    }

    fn flush(&mut self) -> RgbImage {
        let mut page = RgbImage::new(self.width, self.filled);
        let mut y: i64 = 0;
        for piece in self.pieces.drain(..) {
            imageops::replace(&mut page, &piece, 0, y);
            y += i64::from(piece.height());
        }
        self.filled = 0;
        page
    }
}

struct PageSink<'a> {
    workspace: &'a Workspace,
    chapter: &'a ChapterNumber,
    params: &'a ProcessingParams,
    pages: Vec<ProcessedPage>,
}

impl PageSink<'_> {
    fn emit(&mut self, img: RgbImage) -> Result<(), ImagingError> {
        let index = self.pages.len() as u32 + 1;
        let img = if self.params.scaling < 100 {
            let (w, h) = img.dimensions();
            imageops::resize(
                &img,
                scaled(w, self.params.scaling),
                scaled(h, self.params.scaling),
                FilterType::Lanczos3,
            )
        } else {
            img
        };
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.params.quality.clamp(1, 100))
            .encode(&img, img.width(), img.height(), ExtendedColorType::Rgb8)
            .map_err(|e| ImagingError::Encode {
                chapter: self.chapter.clone(),
                index,
                source: e,
            })?;
        let path = self.workspace.processed_page_path(self.chapter, index);
        write_atomic(&path, &out).map_err(|e| ImagingError::Write {
            path: path.clone(),
            source: e,
        })?;
        self.pages.push(ProcessedPage {
            chapter: self.chapter.clone(),
            index,
            width: img.width(),
            height: img.height(),
            path,
            byte_len: out.len() as u64,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::page_png;
    use std::error::Error;

    fn raw_pages(
        ws: &Workspace,
        chapter: &ChapterNumber,
        locators: &[&str],
    ) -> Result<Vec<(u32, PathBuf)>, Box<dyn Error>> {
        let mut out = Vec::new();
        for (i, loc) in locators.iter().enumerate() {
            let index = i as u32 + 1;
            let path = ws.raw_page_path(chapter, index);
            write_atomic(&path, &page_png(loc))?;
            out.push((index, path));
        }
        Ok(out)
    }

    fn params(aspect_ratio: Option<f64>) -> ProcessingParams {
        ProcessingParams {
            width: 20,
            aspect_ratio,
            quality: 80,
            scaling: 100,
        }
    }

    #[test]
    fn encode_cover_produces_jpeg() -> Result<(), Box<dyn Error>> {
        let jpeg = encode_cover(&page_png("cover"))?;
        assert_eq!(crate::workspace::sniff_image_ext(&jpeg), "jpg");
        assert!(encode_cover(b"garbage").is_err());
        Ok(())
    }

    #[test]
    fn parse_aspect_ratio_forms() {
        assert_eq!(parse_aspect_ratio("4:3"), Ok(0.75));
        assert_eq!(parse_aspect_ratio(" 2.5 "), Ok(2.5));
        assert_eq!(parse_aspect_ratio("1:2"), Ok(2.0));
        for bad in ["", "0", "a:b", "0:3", "4:0", "-1", "4:3:2"] {
            assert!(parse_aspect_ratio(bad).is_err(), "expected error for {:?}", bad);
        }
    }

    #[test]
    fn fit_mode_keeps_each_page_and_its_aspect() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let ws = Workspace::for_slug(dir.path(), "c");
        let ch = ChapterNumber::from_value(1.0);
        let raw = raw_pages(&ws, &ch, &["a/1", "a/2", "a/3"])?;
        let out = process_chapter(&ws, &ch, &raw, &params(None))?;
        assert_eq!(out.pages.len(), 3);
        for (page, (_, src)) in out.pages.iter().zip(&raw) {
            let original = image::load_from_memory(&std::fs::read(src)?)?;
            assert_eq!(page.width, 20);
            assert_eq!(page.height, normalized_height(original.width(), original.height(), 20));
            assert!(page.path.is_file());
        }
        Ok(())
    }

    #[test]
    fn recombine_preserves_total_height() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let ws = Workspace::for_slug(dir.path(), "c");
        let ch = ChapterNumber::from_value(1.0);
        let locators = ["b/1", "b/2", "b/3", "b/4", "b/5"];
        let raw = raw_pages(&ws, &ch, &locators)?;
        let mut expected = 0;
        for (_, path) in &raw {
            let img = image::load_from_memory(&std::fs::read(path)?)?;
            expected += normalized_height(img.width(), img.height(), 20);
        }
        // 20 wide at 1.5 -> 30 px pages.
        let out = process_chapter(&ws, &ch, &raw, &params(Some(1.5)))?;
        let total: u32 = out.pages.iter().map(|p| p.height).sum();
        assert_eq!(total, expected);
        let (last, full) = out.pages.split_last().unwrap();
        assert!(full.iter().all(|p| p.height == 30 && p.width == 20));
        assert!(last.height > 0 && last.height <= 30);
        let indices: Vec<u32> = out.pages.iter().map(|p| p.index).collect();
        assert_eq!(indices, (1..=out.pages.len() as u32).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn corrupt_page_is_dropped_and_reported() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let ws = Workspace::for_slug(dir.path(), "c");
        let ch = ChapterNumber::from_value(2.0);
        let mut raw = raw_pages(&ws, &ch, &["c/1", "c/2"])?;
        let bad = ws.raw_page_path(&ch, 3);
        write_atomic(&bad, b"garbage")?;
        raw.insert(1, (3, bad));
        let out = process_chapter(&ws, &ch, &raw, &params(None))?;
        assert_eq!(out.pages.len(), 2);
        assert_eq!(out.decode_failures.len(), 1);
        assert_eq!(out.decode_failures[0].index, 3);
        Ok(())
    }

    #[test]
    fn processing_is_deterministic() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let ws = Workspace::for_slug(dir.path(), "c");
        let ch = ChapterNumber::from_value(1.0);
        let raw = raw_pages(&ws, &ch, &["d/1", "d/2", "d/3"])?;
        let first = process_chapter(&ws, &ch, &raw, &params(Some(0.75)))?;
        let first_bytes: Vec<Vec<u8>> = first
            .pages
            .iter()
            .map(|p| p.read_bytes())
            .collect::<Result<_, _>>()?;
        let second = process_chapter(&ws, &ch, &raw, &params(Some(0.75)))?;
        let second_bytes: Vec<Vec<u8>> = second
            .pages
            .iter()
            .map(|p| p.read_bytes())
            .collect::<Result<_, _>>()?;
        assert_eq!(first_bytes, second_bytes);
        Ok(())
    }

    #[test]
    fn scaling_shrinks_after_conformance() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let ws = Workspace::for_slug(dir.path(), "c");
        let ch = ChapterNumber::from_value(1.0);
        let raw = raw_pages(&ws, &ch, &["e/1", "e/2", "e/3"])?;
        let p = ProcessingParams {
            scaling: 50,
            ..params(Some(1.5))
        };
        let out = process_chapter(&ws, &ch, &raw, &p)?;
        assert!(out.pages.iter().all(|pg| pg.width == 10));
        assert_eq!(out.pages[0].height, 15);
        Ok(())
    }
}
