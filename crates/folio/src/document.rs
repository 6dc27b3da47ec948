//! EPUB inspection: structural validation and metadata extraction
//!
//! Reads the OCF container directly with `zip`; the OPF package document is
//! scanned with a few anchored regexes rather than a full XML parser.

use crate::error::ItemError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use zip::ZipArchive;

const EPUB_MIMETYPE: &str = "application/epub+zip";
const CONTAINER_PATH: &str = "META-INF/container.xml";
/// Upper bound for container/OPF entries read into memory.
const MAX_XML_ENTRY_BYTES: u64 = 8 * 1024 * 1024;

static ROOTFILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<rootfile\b[^>]*?\bfull-path\s*=\s*["']([^"']+)["']"#).unwrap());
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<dc:title\b[^>]*>(.*?)</dc:title\s*>").unwrap());
static CREATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<dc:creator\b[^>]*>(.*?)</dc:creator\s*>").unwrap());
static SPINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:opf:)?spine\b[^>]*>(.*?)</(?:opf:)?spine\s*>").unwrap());
static ITEMREF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<(?:opf:)?itemref\b").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static NUMERIC_ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").unwrap());

/// Metadata snapshot of one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub file_name: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub chapter_count: u32,
    pub file_size_bytes: u64,
    /// Content digest from discovery. Empty until the scheduler attaches it.
    #[serde(default)]
    pub content_hash: String,
}

impl DocumentMetadata {
    /// File name without its extension.
    pub fn file_stem(&self) -> &str {
        match self.file_name.rfind('.') {
            Some(idx) if idx > 0 => &self.file_name[..idx],
            _ => &self.file_name,
        }
    }

    /// Title if present, otherwise the file stem.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or_else(|| self.file_stem())
    }
}

/// Validates and reads documents. Implementations do blocking I/O.
pub trait DocumentInspector: Send + Sync {
    fn validate(&self, path: &Path) -> Result<(), ItemError>;
    fn extract(&self, path: &Path) -> Result<DocumentMetadata, ItemError>;
}

/// Inspector for EPUB (OCF zip) files
#[derive(Debug, Default, Clone, Copy)]
pub struct EpubInspector;

impl EpubInspector {
    pub fn new() -> Self {
        Self
    }

    fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>, ItemError> {
        let file = File::open(path).map_err(|e| ItemError::UnreadableFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        ZipArchive::new(BufReader::new(file))
            .map_err(|e| ItemError::Validation(format!("not a zip archive: {}", e)))
    }
}

impl DocumentInspector for EpubInspector {
    fn validate(&self, path: &Path) -> Result<(), ItemError> {
        let has_epub_ext = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("epub"))
            .unwrap_or(false);
        if !has_epub_ext {
            return Err(ItemError::Validation("missing .epub extension".to_string()));
        }

        let mut archive = Self::open_archive(path)?;
        let mimetype = read_entry(&mut archive, "mimetype", 1024)
            .map_err(|_| ItemError::Validation("missing mimetype entry".to_string()))?;
        if mimetype.trim() != EPUB_MIMETYPE {
            return Err(ItemError::Validation(format!(
                "unexpected mimetype '{}'",
                mimetype.trim()
            )));
        }
        Ok(())
    }

    fn extract(&self, path: &Path) -> Result<DocumentMetadata, ItemError> {
        let file_size_bytes = std::fs::metadata(path)
            .map_err(|e| ItemError::UnreadableFile {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
            .len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut archive = Self::open_archive(path)
            .map_err(|e| ItemError::Extraction(e.to_string()))?;

        let opf_path = locate_package_document(&mut archive)?;
        let opf = read_entry(&mut archive, &opf_path, MAX_XML_ENTRY_BYTES)
            .map_err(|e| ItemError::Extraction(format!("cannot read {}: {}", opf_path, e)))?;

        let title = first_text(&TITLE_RE, &opf);
        let author = first_text(&CREATOR_RE, &opf);
        let chapter_count = match count_spine_items(&opf) {
            0 => count_content_documents(&archive),
            n => n,
        };

        Ok(DocumentMetadata {
            file_name,
            title,
            author,
            chapter_count,
            file_size_bytes,
            content_hash: String::new(),
        })
    }
}

fn locate_package_document<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<String, ItemError> {
    if let Ok(container) = read_entry(archive, CONTAINER_PATH, MAX_XML_ENTRY_BYTES) {
        if let Some(caps) = ROOTFILE_RE.captures(&container) {
            return Ok(caps[1].to_string());
        }
    }
    // Some producers omit the container; fall back to the first OPF entry.
    archive
        .file_names()
        .filter(|name| name.to_ascii_lowercase().ends_with(".opf"))
        .min()
        .map(str::to_string)
        .ok_or_else(|| ItemError::Extraction("no package document (.opf) found".to_string()))
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
    limit: u64,
) -> std::result::Result<String, String> {
    let entry = archive.by_name(name).map_err(|e| e.to_string())?;
    let mut bytes = Vec::new();
    entry
        .take(limit)
        .read_to_end(&mut bytes)
        .map_err(|e| e.to_string())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn first_text(re: &Regex, xml: &str) -> Option<String> {
    re.captures_iter(xml)
        .filter_map(|caps| {
            let text = decode_entities(&TAG_RE.replace_all(&caps[1], ""));
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            (!text.is_empty()).then_some(text)
        })
        .next()
}

fn count_spine_items(opf: &str) -> u32 {
    SPINE_RE
        .captures(opf)
        .map(|caps| ITEMREF_RE.find_iter(&caps[1]).count() as u32)
        .unwrap_or(0)
}

fn count_content_documents<R: Read + std::io::Seek>(archive: &ZipArchive<R>) -> u32 {
    archive
        .file_names()
        .filter(|name| {
            let lower = name.to_ascii_lowercase();
            lower.ends_with(".xhtml") || lower.ends_with(".html") || lower.ends_with(".htm")
        })
        .count() as u32
}

fn decode_entities(text: &str) -> String {
    let named = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'");
    let numeric = NUMERIC_ENTITY_RE.replace_all(&named, |caps: &regex::Captures<'_>| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });
    // Last, so "&amp;lt;" stays "&lt;".
    numeric.replace("&amp;", "&")
}
