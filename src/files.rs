use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use tracing::debug;

/// Byte cap applied to plain-text files before they are handed to a model.
pub const TEXT_CAP_BYTES: usize = 100 * 1024;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rs", "js", "ts", "jsx", "tsx", "py", "go", "java", "c", "h", "cpp", "hpp",
    "json", "toml", "yaml", "yml", "xml", "html", "css", "sh", "sql", "csv", "log", "ini", "cfg",
];

/// One row in a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_directory: bool,
}

fn sort_entries(entries: &mut [DirEntryInfo]) {
    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// List a directory, directories first, then lexicographic by name.
pub async fn read_dir(path: &str) -> Result<Vec<DirEntryInfo>> {
    let mut reader = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("Failed to read directory {path}"))?;
    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .with_context(|| format!("Failed to enumerate directory {path}"))?
    {
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("Failed to stat entry in {path}"))?;
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_directory: file_type.is_dir(),
        });
    }
    sort_entries(&mut entries);
    Ok(entries)
}

/// A file converted into something a model can consume.
#[derive(Debug, Clone, PartialEq)]
pub enum AiFileContent {
    /// Inline image payload: MIME type plus base64 data.
    Image { mime: String, data: String },
    /// Extracted or raw text. `truncated` marks a plain-text file cut at the
    /// byte cap.
    Text { text: String, truncated: bool },
}

/// Classify a file by extension and convert it for model consumption.
///
/// Images become base64 + MIME; PDF and office documents are reduced to
/// extracted text; allow-listed source/text files are read as UTF-8 with a
/// byte cap. Anything else is rejected.
pub fn read_file_for_ai(path: &Path) -> Result<AiFileContent> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        debug!(path = %path.display(), %mime, size = bytes.len(), "Image prepared for model");
        return Ok(AiFileContent::Image {
            mime,
            data: BASE64.encode(bytes),
        });
    }

    let text = match ext.as_str() {
        "pdf" => pdf_text(path)?,
        "docx" => docx_text(path)?,
        "pptx" => pptx_text(path)?,
        "xlsx" => xlsx_text(path)?,
        _ if TEXT_EXTENSIONS.contains(&ext.as_str()) => return plain_text(path),
        _ => bail!("unsupported file type: {}", path.display()),
    };
    Ok(AiFileContent::Text {
        text,
        truncated: false,
    })
}

fn plain_text(path: &Path) -> Result<AiFileContent> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let truncated = bytes.len() > TEXT_CAP_BYTES;
    let slice = if truncated {
        &bytes[..TEXT_CAP_BYTES]
    } else {
        &bytes[..]
    };
    Ok(AiFileContent::Text {
        text: String::from_utf8_lossy(slice).into_owned(),
        truncated,
    })
}

fn pdf_text(path: &Path) -> Result<String> {
    pdf_extract::extract_text(path)
        .with_context(|| format!("Failed to extract text from {}", path.display()))
}

/// Pull character data out of an office XML part, breaking lines at the
/// closing paragraph tag.
fn xml_text(xml: &str, paragraph_end: &[u8]) -> String {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut out = String::new();
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Text(t)) => {
                if let Ok(text) = t.unescape() {
                    out.push_str(&text);
                }
            }
            Ok(quick_xml::events::Event::End(e)) if e.name().as_ref() == paragraph_end => {
                out.push('\n');
            }
            Ok(quick_xml::events::Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    out
}

fn docx_text(path: &Path) -> Result<String> {
    let file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read archive {}", path.display()))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("No document body in docx archive")?
        .read_to_string(&mut xml)
        .context("Failed to read docx document body")?;
    Ok(xml_text(&xml, b"w:p"))
}

fn pptx_text(path: &Path) -> Result<String> {
    let file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read archive {}", path.display()))?;

    let mut slide_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
        .collect();
    slide_names.sort();

    let mut out = String::new();
    for name in slide_names {
        let mut xml = String::new();
        if archive
            .by_name(&name)
            .ok()
            .and_then(|mut f| f.read_to_string(&mut xml).ok())
            .is_none()
        {
            continue;
        }
        out.push_str(&xml_text(&xml, b"a:p"));
        out.push('\n');
    }
    Ok(out)
}

fn xlsx_text(path: &Path) -> Result<String> {
    use calamine::{open_workbook, Reader, Xlsx};

    let mut workbook: Xlsx<_> = open_workbook(path)
        .with_context(|| format!("Failed to open workbook {}", path.display()))?;
    let mut out = String::new();
    for name in workbook.sheet_names().to_vec() {
        let Ok(range) = workbook.worksheet_range(&name) else {
            continue;
        };
        out.push_str(&format!("# {name}\n"));
        for row in range.rows() {
            let line = row
                .iter()
                .map(|cell| cell.to_string())
                .collect::<Vec<_>>()
                .join("\t");
            out.push_str(&line);
            out.push('\n');
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn entries_sort_directories_first_then_by_name() {
        let mut entries = vec![
            DirEntryInfo {
                name: "zeta.txt".into(),
                is_directory: false,
            },
            DirEntryInfo {
                name: "beta".into(),
                is_directory: true,
            },
            DirEntryInfo {
                name: "alpha.txt".into(),
                is_directory: false,
            },
            DirEntryInfo {
                name: "alpha".into(),
                is_directory: true,
            },
        ];
        sort_entries(&mut entries);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "alpha.txt", "zeta.txt"]);
    }

    #[tokio::test]
    async fn read_dir_lists_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        let entries = read_dir(dir.path().to_str().unwrap()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "sub");
        assert!(entries[0].is_directory);
        assert_eq!(entries[1].name, "a.txt");
    }

    #[tokio::test]
    async fn read_dir_of_missing_path_is_an_error() {
        assert!(read_dir("/definitely/not/a/real/path").await.is_err());
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        fs::write(&path, [0u8; 8]).unwrap();
        assert!(read_file_for_ai(&path).is_err());
    }

    #[test]
    fn images_become_base64_with_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixel.png");
        fs::write(&path, b"ABC").unwrap();

        let AiFileContent::Image { mime, data } = read_file_for_ai(&path).unwrap() else {
            panic!("expected image content");
        };
        assert_eq!(mime, "image/png");
        assert_eq!(data, "QUJD");
    }

    #[test]
    fn text_files_are_capped_with_a_truncation_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let mut file = fs::File::create(&path).unwrap();
        let chunk = [b'x'; 1024];
        for _ in 0..(TEXT_CAP_BYTES / 1024 + 2) {
            file.write_all(&chunk).unwrap();
        }
        drop(file);

        let AiFileContent::Text { text, truncated } = read_file_for_ai(&path).unwrap() else {
            panic!("expected text content");
        };
        assert!(truncated);
        assert_eq!(text.len(), TEXT_CAP_BYTES);
    }

    #[test]
    fn small_text_files_pass_through_untruncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.md");
        fs::write(&path, "# hello\n").unwrap();

        let AiFileContent::Text { text, truncated } = read_file_for_ai(&path).unwrap() else {
            panic!("expected text content");
        };
        assert!(!truncated);
        assert_eq!(text, "# hello\n");
    }

    #[test]
    fn office_xml_text_extraction_breaks_paragraphs() {
        let xml = "<w:document><w:p><w:r><w:t>first</w:t></w:r></w:p>\
                   <w:p><w:r><w:t>second</w:t></w:r></w:p></w:document>";
        let text = xml_text(xml, b"w:p");
        assert_eq!(text, "first\nsecond\n");
    }
}
