//! comick.io adapter. The comic page's embedded `__NEXT_DATA__` JSON and "More Info" table give
//! the comic record; the public API gives the chapter list and each release's page images.

use super::images::IMAGE_HOST;
use super::{PoliteClient, SourceError};
use crate::catalog::{CatalogError, MetadataSource};
use crate::model::{ChapterNumber, ChapterVersion, Comic, PageRef};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const API_BASE: &str = "https://api.comick.io";

/// Parse a CSS selector or return a parse error (avoids panics from Selector::parse).
fn parse_selector(sel: &str) -> Result<Selector, SourceError> {
    Selector::parse(sel).map_err(|e| SourceError::ParseComicPage {
        message: format!("invalid selector {:?}: {}", sel, e),
    })
}

#[derive(Debug, Deserialize)]
struct NextData {
    props: NextProps,
}

#[derive(Debug, Deserialize)]
struct NextProps {
    #[serde(rename = "pageProps")]
    page_props: PageProps,
}

#[derive(Debug, Deserialize)]
struct PageProps {
    comic: Option<NextComic>,
}

#[derive(Debug, Deserialize)]
struct NextComic {
    hid: String,
    title: String,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChapterListResponse {
    #[serde(default)]
    chapters: Vec<ApiChapter>,
}

#[derive(Debug, Deserialize)]
struct ApiChapter {
    #[serde(default)]
    hid: String,
    #[serde(default)]
    chap: Option<String>,
    #[serde(default)]
    up_count: Option<i64>,
    #[serde(default)]
    group_name: Option<Vec<String>>,
    #[serde(default)]
    md_chapters_groups: Vec<ApiChapterGroup>,
}

#[derive(Debug, Deserialize)]
struct ApiChapterGroup {
    #[serde(default)]
    md_groups: Option<ApiGroup>,
}

#[derive(Debug, Deserialize)]
struct ApiGroup {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ChapterResponse {
    chapter: ApiChapterImages,
}

#[derive(Debug, Deserialize)]
struct ApiChapterImages {
    #[serde(default)]
    md_images: Vec<ApiImage>,
}

#[derive(Debug, Deserialize)]
struct ApiImage {
    b2key: String,
}

/// Metadata source for one comick.io comic URL.
pub struct ComickSource {
    client: PoliteClient,
    comic_url: String,
    slug: String,
    language: String,
    api_base: String,
}

impl ComickSource {
    pub fn new(
        client: PoliteClient,
        comic_url: &str,
        language: &str,
    ) -> Result<Self, SourceError> {
        let slug = super::slug_from_url(comic_url)?;
        Ok(Self {
            client,
            comic_url: comic_url.to_string(),
            slug,
            language: language.to_string(),
            api_base: API_BASE.to_string(),
        })
    }

    fn fetch_comic(&mut self) -> Result<Comic, SourceError> {
        let html = self.client.get_text(&self.comic_url)?;
        let mut comic = parse_comic_page(&html, &self.slug)?;
        comic.language = self.language.clone();
        info!(title = %comic.title, hid = %comic.id, "found comic");
        Ok(comic)
    }

    fn fetch_versions(&mut self, comic: &Comic) -> Result<Vec<ChapterVersion>, SourceError> {
        let mut versions = Vec::new();
        let mut page = 1u32;
        loop {
            let url = format!(
                "{}/comic/{}/chapters?lang={}&page={}",
                self.api_base, comic.id, self.language, page
            );
            debug!(page, "fetching chapter list page");
            let response: ChapterListResponse = self.client.get_json(&url)?;
            if response.chapters.is_empty() {
                break;
            }
            versions.extend(response.chapters.into_iter().filter_map(to_version));
            page += 1;
        }
        info!(versions = versions.len(), "chapter list fetched");
        Ok(versions)
    }

    fn fetch_pages(&mut self, version: &ChapterVersion) -> Result<Vec<PageRef>, SourceError> {
        let url = format!("{}/chapter/{}", self.api_base, version.id);
        let response: ChapterResponse = self.client.get_json(&url)?;
        Ok(response
            .chapter
            .md_images
            .into_iter()
            .enumerate()
            .map(|(i, img)| PageRef {
                index: i as u32 + 1,
                locator: format!("{}/{}", IMAGE_HOST, img.b2key),
            })
            .collect())
    }
}

impl MetadataSource for ComickSource {
    fn comic(&mut self) -> Result<Comic, CatalogError> {
        Ok(self.fetch_comic()?)
    }

    fn chapter_versions(&mut self, comic: &Comic) -> Result<Vec<ChapterVersion>, CatalogError> {
        Ok(self.fetch_versions(comic)?)
    }

    fn page_locators(&mut self, version: &ChapterVersion) -> Result<Vec<PageRef>, CatalogError> {
        Ok(self.fetch_pages(version)?)
    }
}

/// Convert an API chapter entry, dropping ones without a usable chapter number.
fn to_version(ch: ApiChapter) -> Option<ChapterVersion> {
    let raw = ch.chap.as_deref()?;
    let Some(number) = ChapterNumber::parse(raw) else {
        debug!(chap = raw, "skipping chapter with invalid number");
        return None;
    };
    let mut groups: Vec<String> = ch
        .md_chapters_groups
        .into_iter()
        .filter_map(|g| g.md_groups.map(|g| g.title.trim().to_string()))
        .filter(|t| !t.is_empty())
        .collect();
    if groups.is_empty() {
        groups = ch
            .group_name
            .unwrap_or_default()
            .into_iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .take(1)
            .collect();
    }
    Some(ChapterVersion {
        id: ch.hid,
        chapter: number,
        groups,
        upvotes: ch.up_count.unwrap_or(0).clamp(0, i64::from(u32::MAX)) as u32,
        pages: Vec::new(),
    })
}

/// Build the comic record from the comic page HTML. Language is left empty for the caller.
pub(crate) fn parse_comic_page(html: &str, url_slug: &str) -> Result<Comic, SourceError> {
    let doc = Html::parse_document(html);
    let next_sel = parse_selector("script#__NEXT_DATA__")?;
    let raw = doc
        .select(&next_sel)
        .next()
        .map(|e| e.text().collect::<String>())
        .ok_or_else(|| SourceError::ParseComicPage {
            message: "cannot locate __NEXT_DATA__".to_string(),
        })?;
    let data: NextData =
        serde_json::from_str(raw.trim()).map_err(|e| SourceError::ParseComicPage {
            message: format!("__NEXT_DATA__ is not the expected JSON: {}", e),
        })?;
    let next = data
        .props
        .page_props
        .comic
        .ok_or_else(|| SourceError::ParseComicPage {
            message: "__NEXT_DATA__ has no comic record".to_string(),
        })?;

    let cover_sel = parse_selector(r#"meta[property="og:image"]"#)?;
    let cover_url = doc
        .select(&cover_sel)
        .next()
        .and_then(|e| e.value().attr("content").map(String::from))
        .filter(|s| !s.trim().is_empty());

    let info = more_info(&doc)?;
    let field = |keys: &[&str]| -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for key in keys {
            for v in info.get(*key).into_iter().flatten() {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
        }
        out
    };

    Ok(Comic {
        id: next.hid,
        slug: next.slug.unwrap_or_else(|| url_slug.to_string()),
        title: next.title.trim().to_string(),
        language: String::new(),
        description: next
            .desc
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
        authors: field(&["authors", "author"]),
        artists: field(&["artists", "artist"]),
        genres: field(&["genres", "theme", "format"]),
        cover_url,
    })
}

/// Rows of the "More Info" table: lower-cased label without colon → link texts.
fn more_info(doc: &Html) -> Result<BTreeMap<String, Vec<String>>, SourceError> {
    let h3_sel = parse_selector("h3")?;
    let row_sel = parse_selector("tr")?;
    let cell_sel = parse_selector("td")?;
    let link_sel = parse_selector("a")?;
    let mut out = BTreeMap::new();

    let Some(header) = doc
        .select(&h3_sel)
        .find(|h| h.text().collect::<String>().contains("More Info"))
    else {
        return Ok(out);
    };
    let Some(table) = header
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "table")
    else {
        return Ok(out);
    };
    for row in table.select(&row_sel) {
        let cells: Vec<ElementRef> = row.select(&cell_sel).collect();
        if cells.len() != 2 {
            continue;
        }
        let key = cells[0]
            .text()
            .collect::<String>()
            .trim()
            .replace(':', "")
            .to_lowercase();
        let values: Vec<String> = cells[1]
            .select(&link_sel)
            .map(|a| a.text().collect::<String>().trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if !key.is_empty() && !values.is_empty() {
            out.insert(key, values);
        }
    }
    Ok(out)
}
