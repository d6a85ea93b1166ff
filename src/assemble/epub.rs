//! EPUB 3 writer for image books: one fixed-layout XHTML page per image, nav.xhtml listing
//! chapter starts, optional cover.

use super::{fixed_zip_time, read_page, xml_escape, AssembleError, Book};
use crate::model::EpubLayout;
use std::io::{Seek, Write};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const MIMETYPE: &[u8] = b"application/epub+zip";
const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"EPUB/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";
const EPUB_PREFIX: &str = "EPUB/";
/// Pinned so rebuilding the same unit produces the same bytes.
const MODIFIED: &str = "2000-01-01T00:00:00Z";
const DEFAULT_VIEWPORT: (u32, u32) = (1200, 1920);

const STYLE_CSS: &str = r#"@charset "UTF-8";
body, html { padding: 0; margin: 0; height: 100%; width: 100%; text-align: center; }
svg, img { max-width: 100vw; max-height: 100vh; object-fit: contain; display: block; margin: auto; }
"#;

const NAV_STYLE_CSS: &str = r#"html, body { height: 100%; margin: 0; padding: 0; }
body {
    font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, Helvetica, Arial, sans-serif;
    background-color: #fff; color: #000;
    padding: 2em;
    box-sizing: border-box;
    text-align: left;
    column-count: 3;
    column-gap: 2em;
}
h1 { text-align: center; column-span: all; margin-top: 0; }
ol { list-style-type: none; padding: 0; margin: 0; }
li { padding: 0.1em 0; break-inside: avoid-column; }
a { text-decoration: none; color: #005a9c; }
"#;

/// Write `book` as an EPUB 3 archive.
///
/// Pages are pre-paginated; `layout` only changes `rendition:flow` (`paginated` for page mode,
/// `scrolled-continuous` for vertical). The viewport is the first page's pixel size.
pub fn write_epub<W: Write + Seek>(
    out: W,
    book: &Book<'_>,
    layout: EpubLayout,
) -> Result<(), AssembleError> {
    let mut zip = ZipWriter::new(out);

    let options_stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(fixed_zip_time())
        .unix_permissions(0o644);
    let options_deflate = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(fixed_zip_time())
        .unix_permissions(0o644);

    // mimetype must be the first entry, uncompressed
    zip.start_file("mimetype", options_stored)?;
    zip.write_all(MIMETYPE)?;

    zip.start_file("META-INF/container.xml", options_deflate)?;
    zip.write_all(CONTAINER_XML)?;

    let viewport = book
        .pages()
        .next()
        .map(|p| (p.width, p.height))
        .unwrap_or(DEFAULT_VIEWPORT);
    let viewport_meta = format!(
        r#"<meta name="viewport" content="width={}, height={}"/>"#,
        viewport.0, viewport.1
    );

    write_opf(book, layout, &mut zip, options_deflate)?;
    write_nav(book, &mut zip, options_deflate)?;

    zip.start_file(format!("{}style.css", EPUB_PREFIX), options_deflate)?;
    zip.write_all(STYLE_CSS.as_bytes())?;
    zip.start_file(format!("{}nav_style.css", EPUB_PREFIX), options_deflate)?;
    zip.write_all(NAV_STYLE_CSS.as_bytes())?;

    if let Some(cover) = book.cover {
        let xhtml = page_xhtml("Cover", "images/cover.jpg", "Cover", &viewport_meta, None);
        zip.start_file(format!("{}cover.xhtml", EPUB_PREFIX), options_deflate)?;
        zip.write_all(xhtml.as_bytes())?;
        // JPEG does not deflate usefully
        zip.start_file(format!("{}images/cover.jpg", EPUB_PREFIX), options_stored)?;
        zip.write_all(cover)?;
    }

    let title = xml_escape(book.title);
    for (i, page) in book.pages().enumerate() {
        let data = read_page(page)?;
        let img = format!("images/img_{}.jpg", i);
        let xhtml = page_xhtml(
            &format!("{} - Page {}", title, i + 1),
            &img,
            &format!("Page {}", i + 1),
            &viewport_meta,
            Some(&book.comic.language),
        );
        zip.start_file(format!("{}page_{}.xhtml", EPUB_PREFIX, i), options_deflate)?;
        zip.write_all(xhtml.as_bytes())?;
        zip.start_file(format!("{}{}", EPUB_PREFIX, img), options_stored)?;
        zip.write_all(&data)?;
    }

    zip.finish()?;
    Ok(())
}

fn page_xhtml(
    title: &str,
    src: &str,
    alt: &str,
    viewport_meta: &str,
    lang: Option<&str>,
) -> String {
    let lang_attr = lang
        .map(|l| format!(r#" lang="{}""#, xml_escape(l)))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops"{lang}>
<head>
  <meta charset="utf-8"/>
  <title>{title}</title>
  {viewport}
  <link rel="stylesheet" type="text/css" href="style.css"/>
</head>
<body>
  <img src="{src}" alt="{alt}"/>
</body>
</html>
"#,
        lang = lang_attr,
        title = title,
        viewport = viewport_meta,
        src = src,
        alt = alt
    )
}

/// Index of the first page of each chapter within the book's flat page list.
fn chapter_starts(book: &Book<'_>) -> Vec<(String, usize)> {
    let mut starts = Vec::new();
    let mut offset = 0;
    for ch in book.chapters {
        if !ch.pages.is_empty() {
            starts.push((format!("Chapter {}", ch.chapter), offset));
        }
        offset += ch.pages.len();
    }
    starts
}

fn write_opf(
    book: &Book<'_>,
    layout: EpubLayout,
    zip: &mut ZipWriter<impl Write + Seek>,
    options: SimpleFileOptions,
) -> Result<(), AssembleError> {
    let comic = book.comic;
    let mut metadata = vec![
        format!(
            r#"<dc:identifier id="bookid">comick-{}</dc:identifier>"#,
            xml_escape(&comic.id)
        ),
        format!("<dc:title>{}</dc:title>", xml_escape(book.title)),
        format!("<dc:language>{}</dc:language>", xml_escape(&comic.language)),
        format!(r#"<meta property="dcterms:modified">{}</meta>"#, MODIFIED),
    ];
    for author in &comic.authors {
        metadata.push(format!("<dc:creator>{}</dc:creator>", xml_escape(author)));
    }
    for artist in &comic.artists {
        metadata.push(format!("<dc:contributor>{}</dc:contributor>", xml_escape(artist)));
    }
    for group in book.groups() {
        metadata.push(format!("<dc:publisher>{}</dc:publisher>", xml_escape(&group)));
    }
    if let Some(desc) = comic.description.as_deref().filter(|d| !d.trim().is_empty()) {
        metadata.push(format!("<dc:description>{}</dc:description>", xml_escape(desc)));
    }
    for genre in &comic.genres {
        metadata.push(format!("<dc:subject>{}</dc:subject>", xml_escape(genre)));
    }
    let flow = match layout {
        EpubLayout::Vertical => "scrolled-continuous",
        EpubLayout::Page => "paginated",
    };
    metadata.push(r#"<meta property="rendition:layout">pre-paginated</meta>"#.to_string());
    metadata.push(r#"<meta property="rendition:spread">none</meta>"#.to_string());
    metadata.push(format!(r#"<meta property="rendition:flow">{}</meta>"#, flow));

    let mut manifest = vec![
        r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>"#
            .to_string(),
        r#"<item id="css" href="style.css" media-type="text/css"/>"#.to_string(),
        r#"<item id="nav_css" href="nav_style.css" media-type="text/css"/>"#.to_string(),
    ];
    let mut spine = Vec::new();
    if book.cover.is_some() {
        metadata.push(r#"<meta name="cover" content="cover-image"/>"#.to_string());
        manifest.push(
            r#"<item id="cover-image" href="images/cover.jpg" media-type="image/jpeg" properties="cover-image"/>"#
                .to_string(),
        );
        manifest.push(
            r#"<item id="cover" href="cover.xhtml" media-type="application/xhtml+xml"/>"#
                .to_string(),
        );
        spine.push(r#"<itemref idref="cover"/>"#.to_string());
    }
    for i in 0..book.page_count() {
        manifest.push(format!(
            r#"<item id="img_{i}" href="images/img_{i}.jpg" media-type="image/jpeg"/>"#,
            i = i
        ));
        manifest.push(format!(
            r#"<item id="page_{i}" href="page_{i}.xhtml" media-type="application/xhtml+xml"/>"#,
            i = i
        ));
        spine.push(format!(r#"<itemref idref="page_{}"/>"#, i));
    }

    let opf = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="bookid" version="3.0" prefix="rendition: http://www.idpf.org/vocab/rendition/#">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:dcterms="http://purl.org/dc/terms/" xmlns:opf="http://www.idpf.org/2007/opf">
    {metadata}
  </metadata>
  <manifest>
    {manifest}
  </manifest>
  <spine>
    {spine}
  </spine>
</package>
"#,
        metadata = metadata.join("\n    "),
        manifest = manifest.join("\n    "),
        spine = spine.join("\n    "),
    );
    zip.start_file(format!("{}content.opf", EPUB_PREFIX), options)?;
    zip.write_all(opf.as_bytes())?;
    Ok(())
}

fn write_nav(
    book: &Book<'_>,
    zip: &mut ZipWriter<impl Write + Seek>,
    options: SimpleFileOptions,
) -> Result<(), AssembleError> {
    let mut links = String::new();
    for (label, page) in chapter_starts(book) {
        links.push_str(&format!(
            "      <li><a href=\"page_{}.xhtml\">{}</a></li>\n",
            page,
            xml_escape(&label)
        ));
    }
    let nav = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head>
  <title>Table of Contents</title>
  <link rel="stylesheet" type="text/css" href="nav_style.css"/>
</head>
<body>
  <nav epub:type="toc">
    <h1>Table of Contents</h1>
    <ol>
{}    </ol>
  </nav>
</body>
</html>
"#,
        links
    );
    zip.start_file(format!("{}nav.xhtml", EPUB_PREFIX), options)?;
    zip.write_all(nav.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::tests::jpeg_chapters;
    use crate::state::tests::sample_comic;
    use std::error::Error;
    use std::io::{Cursor, Read};
    use zip::read::ZipArchive;

    fn entry(zip: &mut ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Result<String, Box<dyn Error>> {
        let mut s = String::new();
        zip.by_name(name)?.read_to_string(&mut s)?;
        Ok(s)
    }

    #[test]
    fn write_epub_produces_page_per_image_with_mimetype_first() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let comic = sample_comic();
        let chapters = jpeg_chapters(dir.path(), 2, 3)?;
        let book = Book {
            comic: &comic,
            title: "Test Comic",
            chapters: &chapters,
            cover: None,
        };
        let mut buf = Cursor::new(Vec::new());
        write_epub(&mut buf, &book, EpubLayout::Page)?;

        let mut zip = ZipArchive::new(Cursor::new(buf.into_inner()))?;
        assert_eq!(zip.by_index(0)?.name(), "mimetype");
        let names: Vec<String> = zip.file_names().map(String::from).collect();
        assert!(names.contains(&"META-INF/container.xml".to_string()));
        assert!(names.contains(&"EPUB/content.opf".to_string()));
        assert!(names.contains(&"EPUB/nav.xhtml".to_string()));
        assert!(names.contains(&"EPUB/style.css".to_string()));
        assert!(names.contains(&"EPUB/page_5.xhtml".to_string()));
        assert!(names.contains(&"EPUB/images/img_5.jpg".to_string()));
        assert!(!names.contains(&"EPUB/page_6.xhtml".to_string()));
        assert!(!names.contains(&"EPUB/cover.xhtml".to_string()));

        let opf = entry(&mut zip, "EPUB/content.opf")?;
        assert!(opf.contains("comick-hid1"));
        assert!(opf.contains("<dc:creator>Author</dc:creator>"));
        assert!(opf.contains("<dc:publisher>GroupA</dc:publisher>"));
        assert!(opf.contains(r#"<meta property="rendition:flow">paginated</meta>"#));

        let nav = entry(&mut zip, "EPUB/nav.xhtml")?;
        assert!(nav.contains(r#"<a href="page_0.xhtml">Chapter 1</a>"#));
        assert!(nav.contains(r#"<a href="page_3.xhtml">Chapter 2</a>"#));

        let page = entry(&mut zip, "EPUB/page_0.xhtml")?;
        assert!(page.contains(r#"content="width=16, height=24""#));
        Ok(())
    }

    #[test]
    fn vertical_layout_scrolls_and_cover_is_marked() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let comic = sample_comic();
        let chapters = jpeg_chapters(dir.path(), 1, 1)?;
        let cover = chapters[0].pages[0].read_bytes()?;
        let book = Book {
            comic: &comic,
            title: "Test Comic",
            chapters: &chapters,
            cover: Some(&cover),
        };
        let mut buf = Cursor::new(Vec::new());
        write_epub(&mut buf, &book, EpubLayout::Vertical)?;

        let mut zip = ZipArchive::new(Cursor::new(buf.into_inner()))?;
        assert!(zip.by_name("EPUB/images/cover.jpg").is_ok());
        let opf = entry(&mut zip, "EPUB/content.opf")?;
        assert!(opf.contains(r#"properties="cover-image""#));
        assert!(opf.contains("scrolled-continuous"));
        assert!(opf.contains(r#"<itemref idref="cover"/>"#));
        Ok(())
    }

    #[test]
    fn same_input_gives_identical_archive() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let comic = sample_comic();
        let chapters = jpeg_chapters(dir.path(), 1, 2)?;
        let book = Book {
            comic: &comic,
            title: "Test Comic",
            chapters: &chapters,
            cover: None,
        };
        let mut a = Cursor::new(Vec::new());
        let mut b = Cursor::new(Vec::new());
        write_epub(&mut a, &book, EpubLayout::Page)?;
        write_epub(&mut b, &book, EpubLayout::Page)?;
        assert_eq!(a.into_inner(), b.into_inner());
        Ok(())
    }
}
