//! CBZ writer: pages as `0000.jpg`, `0001.jpg`, ... followed by `ComicInfo.xml`. A cover, when
//! present, takes `0000.jpg` and the pages follow it.

use super::{fixed_zip_time, read_page, xml_escape, AssembleError, Book};
use std::io::{Seek, Write};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub fn write_cbz<W: Write + Seek>(out: W, book: &Book<'_>) -> Result<(), AssembleError> {
    let mut zip = ZipWriter::new(out);
    let options_stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .last_modified_time(fixed_zip_time())
        .unix_permissions(0o644);
    let options_deflate = options_stored.compression_method(zip::CompressionMethod::Deflated);

    let mut index = 0usize;
    if let Some(cover) = book.cover {
        zip.start_file(format!("{:04}.jpg", index), options_stored)?;
        zip.write_all(cover)?;
        index += 1;
    }
    for page in book.pages() {
        let data = read_page(page)?;
        zip.start_file(format!("{:04}.jpg", index), options_stored)?;
        zip.write_all(&data)?;
        index += 1;
    }

    zip.start_file("ComicInfo.xml", options_deflate)?;
    zip.write_all(comic_info_xml(book).as_bytes())?;
    zip.finish()?;
    Ok(())
}

/// ComicRack metadata. Publisher and ScanInformation both carry the unit's scanlation groups.
pub fn comic_info_xml(book: &Book<'_>) -> String {
    let comic = book.comic;
    let groups = book.groups().join(", ");
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<ComicInfo xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <Title>{title}</Title>
  <Series>{series}</Series>
  <Summary>{summary}</Summary>
  <Writer>{writer}</Writer>
  <Penciller>{penciller}</Penciller>
  <Publisher>{groups}</Publisher>
  <Genre>{genre}</Genre>
  <LanguageISO>{lang}</LanguageISO>
  <PageCount>{pages}</PageCount>
  <ScanInformation>{groups}</ScanInformation>
</ComicInfo>
"#,
        title = xml_escape(book.title),
        series = xml_escape(&comic.title),
        summary = xml_escape(comic.description.as_deref().unwrap_or("")),
        writer = xml_escape(&comic.authors.join(", ")),
        penciller = xml_escape(&comic.artists.join(", ")),
        groups = xml_escape(&groups),
        genre = xml_escape(&comic.genres.join(", ")),
        lang = xml_escape(&comic.language),
        pages = book.page_count(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::tests::jpeg_chapters;
    use crate::state::tests::sample_comic;
    use std::error::Error;
    use std::io::{Cursor, Read};
    use zip::read::ZipArchive;

    #[test]
    fn write_cbz_orders_pages_and_appends_comic_info() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let comic = sample_comic();
        let chapters = jpeg_chapters(dir.path(), 2, 2)?;
        let book = Book {
            comic: &comic,
            title: "Test Comic (Ch_1-2)",
            chapters: &chapters,
            cover: None,
        };
        let mut buf = Cursor::new(Vec::new());
        write_cbz(&mut buf, &book)?;

        let mut zip = ZipArchive::new(Cursor::new(buf.into_inner()))?;
        let names: Vec<String> = zip.file_names().map(String::from).collect();
        assert_eq!(
            names,
            vec!["0000.jpg", "0001.jpg", "0002.jpg", "0003.jpg", "ComicInfo.xml"]
        );

        let mut third = Vec::new();
        zip.by_name("0002.jpg")?.read_to_end(&mut third)?;
        assert_eq!(third, chapters[1].pages[0].read_bytes()?);

        let mut xml = String::new();
        zip.by_name("ComicInfo.xml")?.read_to_string(&mut xml)?;
        assert!(xml.contains("<Title>Test Comic (Ch_1-2)</Title>"));
        assert!(xml.contains("<Series>Test Comic</Series>"));
        assert!(xml.contains("<PageCount>4</PageCount>"));
        assert!(xml.contains("<ScanInformation>GroupA</ScanInformation>"));
        assert!(xml.contains("<Genre>Action</Genre>"));
        Ok(())
    }

    #[test]
    fn cover_comes_first() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let comic = sample_comic();
        let chapters = jpeg_chapters(dir.path(), 1, 1)?;
        let cover = b"cover-bytes".to_vec();
        let book = Book {
            comic: &comic,
            title: "Test Comic",
            chapters: &chapters,
            cover: Some(&cover),
        };
        let mut buf = Cursor::new(Vec::new());
        write_cbz(&mut buf, &book)?;

        let mut zip = ZipArchive::new(Cursor::new(buf.into_inner()))?;
        let mut first = Vec::new();
        zip.by_name("0000.jpg")?.read_to_end(&mut first)?;
        assert_eq!(first, cover);
        assert!(zip.by_name("0001.jpg").is_ok());
        Ok(())
    }

    #[test]
    fn comic_info_escapes_markup() {
        let mut comic = sample_comic();
        comic.description = Some("Tom & <Jerry>".to_string());
        let book = Book {
            comic: &comic,
            title: "A",
            chapters: &[],
            cover: None,
        };
        let xml = comic_info_xml(&book);
        assert!(xml.contains("<Summary>Tom &amp; &lt;Jerry&gt;</Summary>"));
        assert!(xml.contains("<PageCount>0</PageCount>"));
    }
}
