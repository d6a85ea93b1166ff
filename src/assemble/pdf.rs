//! PDF writer. Each page embeds the processed JPEG unchanged as a DCTDecode image XObject, on a
//! page whose MediaBox matches the image's pixel size.

use super::{read_page, AssembleError, Book};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream, StringFormat};
use std::io::Write;

pub fn write_pdf<W: Write>(out: &mut W, book: &Book<'_>) -> Result<(), AssembleError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(book.page_count());

    for page in book.pages() {
        let data = read_page(page)?;
        let (w, h) = (i64::from(page.width), i64::from(page.height));
        let image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w,
                "Height" => h,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            data,
        )
        .with_compression(false);
        let image_id = doc.add_object(image);

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![w.into(), 0.into(), 0.into(), h.into(), 0.into(), 0.into()],
                ),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), w.into(), h.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        kids.push(page_id.into());
    }
    if kids.is_empty() {
        return Err(AssembleError::EmptyUnit);
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Title" => text_string(book.title),
        "Author" => text_string(&book.comic.authors.join(", ")),
        "Subject" => text_string(&book.comic.genres.join(", ")),
        "Producer" => text_string(concat!("comicdl ", env!("CARGO_PKG_VERSION"))),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);

    doc.save_to(out)?;
    Ok(())
}

/// PDF text string: literal for ASCII, UTF-16BE with BOM otherwise.
fn text_string(s: &str) -> Object {
    if s.is_ascii() {
        return Object::string_literal(s);
    }
    let mut bytes = vec![0xFE, 0xFF];
    for unit in s.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    Object::String(bytes, StringFormat::Hexadecimal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::tests::jpeg_chapters;
    use crate::state::tests::sample_comic;
    use std::error::Error;

    #[test]
    fn write_pdf_one_page_per_image_with_info() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let comic = sample_comic();
        let chapters = jpeg_chapters(dir.path(), 2, 2)?;
        let book = Book {
            comic: &comic,
            title: "Test Comic",
            chapters: &chapters,
            cover: None,
        };
        let mut bytes = Vec::new();
        write_pdf(&mut bytes, &book)?;

        let doc = Document::load_mem(&bytes)?;
        let pages = doc.get_pages();
        assert_eq!(pages.len(), 4);

        let first = doc.get_object(pages[&1])?.as_dict()?;
        let media_box = first.get(b"MediaBox")?.as_array()?;
        assert_eq!(media_box[2].as_i64()?, 16);
        assert_eq!(media_box[3].as_i64()?, 24);

        let info_id = doc.trailer.get(b"Info")?.as_reference()?;
        let info = doc.get_object(info_id)?.as_dict()?;
        assert_eq!(info.get(b"Title")?.as_str()?, b"Test Comic");
        assert_eq!(info.get(b"Author")?.as_str()?, b"Author");
        Ok(())
    }

    #[test]
    fn empty_book_is_rejected() {
        let comic = sample_comic();
        let book = Book {
            comic: &comic,
            title: "Empty",
            chapters: &[],
            cover: None,
        };
        let mut bytes = Vec::new();
        assert!(matches!(
            write_pdf(&mut bytes, &book),
            Err(AssembleError::EmptyUnit)
        ));
    }

    #[test]
    fn non_ascii_titles_use_utf16() {
        match text_string("ワンピース") {
            Object::String(bytes, StringFormat::Hexadecimal) => {
                assert_eq!(&bytes[..2], &[0xFE, 0xFF]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
