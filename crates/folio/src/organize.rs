//! Moves classified files into the output tree:
//! `<output>/<label>/<reader status>/[<status>] <title> - <author>.epub`.

use crate::classify::ClassificationResult;
use crate::enrichment::EnrichmentData;
use crate::error::ItemError;
use crate::status::StatusResolution;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const MAX_NAME_CHARS: usize = 200;

static UNSAFE_CHARS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap());
static DASH_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-{2,}").unwrap());

/// Make `text` usable as a file name component.
pub fn safe_filename(text: &str) -> String {
    let replaced = UNSAFE_CHARS_RE.replace_all(text, "-");
    let collapsed = DASH_RUN_RE.replace_all(&replaced, "-");
    let spaced = collapsed.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = spaced.trim_matches(|c: char| c == '.' || c == ' ' || c == '-');
    let limited: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
    let limited = limited.trim_end_matches(|c: char| c == '-' || c == ' ' || c == '.');
    if limited.is_empty() {
        "unnamed".to_string()
    } else {
        limited.to_string()
    }
}

/// `[Status] Title - Author.epub`
pub fn destination_file_name(
    result: &ClassificationResult,
    status: &StatusResolution,
    enrichment: Option<&EnrichmentData>,
) -> String {
    let metadata = &result.metadata;
    let title = enrichment
        .and_then(|e| e.canonical_title.as_deref())
        .unwrap_or_else(|| metadata.display_title());
    let author = enrichment
        .and_then(|e| e.author.as_deref())
        .or(metadata.author.as_deref());

    let mut name = format!("[{}] {}", status.status.display_name(), safe_filename(title));
    if let Some(author) = author {
        let author = safe_filename(author);
        if author != "unnamed" {
            name.push_str(" - ");
            name.push_str(&author);
        }
    }
    name.push_str(".epub");
    name
}

pub fn destination_dir(
    output_base: &Path,
    result: &ClassificationResult,
    status: &StatusResolution,
) -> PathBuf {
    output_base
        .join(result.label.display_name())
        .join(status.status.display_name())
}

/// Claim a free path in `dir` for `file_name`, adding `_vN` on collision.
/// The claim is an empty placeholder created with `create_new`, so two
/// workers can never pick the same destination.
pub fn reserve_unique_destination(dir: &Path, file_name: &str) -> io::Result<PathBuf> {
    let (stem, ext) = match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    };
    let mut counter = 0u32;
    loop {
        let candidate = if counter == 0 {
            dir.join(file_name)
        } else {
            dir.join(format!("{}_v{}{}", stem, counter, ext))
        };
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => counter += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Move `src` onto `dst`. Falls back to copy + rename + remove when a plain
/// rename is not possible (e.g. across filesystems).
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }
    let mut tmp_name = dst.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    let copied = fs::copy(src, &tmp).and_then(|_| fs::rename(&tmp, dst));
    if let Err(e) = copied {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::remove_file(src)
}

/// Move one classified file into place. Returns the final path.
pub fn organize(
    source: &Path,
    output_base: &Path,
    result: &ClassificationResult,
    status: &StatusResolution,
    enrichment: Option<&EnrichmentData>,
) -> Result<PathBuf, ItemError> {
    let dir = destination_dir(output_base, result, status);
    fs::create_dir_all(&dir)
        .map_err(|e| ItemError::Organize(format!("cannot create {}: {}", dir.display(), e)))?;

    let file_name = destination_file_name(result, status, enrichment);
    let dest = reserve_unique_destination(&dir, &file_name)
        .map_err(|e| ItemError::Organize(format!("cannot reserve {}: {}", file_name, e)))?;

    if let Err(e) = move_file(source, &dest) {
        let _ = fs::remove_file(&dest);
        return Err(ItemError::Organize(format!(
            "cannot move {} to {}: {}",
            source.display(),
            dest.display(),
            e
        )));
    }
    tracing::info!(from = %source.display(), to = %dest.display(), "Organized file");
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentMetadata;
    use crate::rules::Label;
    use crate::status::ReaderStatus;
    use tempfile::TempDir;

    fn result(title: &str, author: Option<&str>) -> ClassificationResult {
        ClassificationResult {
            label: Label::HumanTranslation,
            confidence: 0.9,
            reasons: vec!["human-keywords".to_string()],
            metadata: DocumentMetadata {
                file_name: "src.epub".to_string(),
                title: Some(title.to_string()),
                author: author.map(str::to_string),
                chapter_count: 10,
                file_size_bytes: 5,
                content_hash: String::new(),
            },
        }
    }

    fn full() -> StatusResolution {
        StatusResolution {
            status: ReaderStatus::Full,
            reason: "test".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("a/b:c?"), "a-b-c");
        assert_eq!(safe_filename("  ..  "), "unnamed");
        assert_eq!(safe_filename("Tiên  Nghịch"), "Tiên Nghịch");
        assert_eq!(safe_filename(&"x".repeat(500)).chars().count(), MAX_NAME_CHARS);
    }

    #[test]
    fn test_destination_name() {
        let name = destination_file_name(&result("Phàm Nhân", Some("Vong Ngữ")), &full(), None);
        assert_eq!(name, "[Full] Phàm Nhân - Vong Ngữ.epub");

        let hint = EnrichmentData {
            canonical_title: Some("Phàm Nhân Tu Tiên".to_string()),
            ..EnrichmentData::default()
        };
        let name = destination_file_name(&result("Phàm Nhân", None), &full(), Some(&hint));
        assert_eq!(name, "[Full] Phàm Nhân Tu Tiên.epub");
    }

    #[test]
    fn test_organize_moves_and_versions_collisions() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let r = result("Book", Some("Author"));

        let mut finals = Vec::new();
        for i in 0..3 {
            let src = dir.path().join(format!("in{}.epub", i));
            std::fs::write(&src, format!("content {}", i)).unwrap();
            finals.push(organize(&src, &out, &r, &full(), None).unwrap());
            assert!(!src.exists());
        }

        let folder = out.join("Human Translation").join("Full");
        assert_eq!(finals[0], folder.join("[Full] Book - Author.epub"));
        assert_eq!(finals[1], folder.join("[Full] Book - Author_v1.epub"));
        assert_eq!(finals[2], folder.join("[Full] Book - Author_v2.epub"));
        assert_eq!(std::fs::read_to_string(&finals[2]).unwrap(), "content 2");
    }

    #[test]
    fn test_missing_source_is_organize_error_and_releases_claim() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let err = organize(&dir.path().join("nope.epub"), &out, &result("B", None), &full(), None)
            .unwrap_err();
        assert!(matches!(err, ItemError::Organize(_)));
        let folder = out.join("Human Translation").join("Full");
        assert_eq!(std::fs::read_dir(folder).unwrap().count(), 0);
    }
}
