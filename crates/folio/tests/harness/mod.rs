//! Test harness for end-to-end pipeline runs
//!
//! Builds a throwaway library (input, output and cache folders under one
//! `TempDir`), writes minimal but valid EPUB containers and provides a
//! scripted enrichment gateway that counts its calls.

#![allow(dead_code)]

use async_trait::async_trait;
use folio::document::DocumentMetadata;
use folio::enrichment::{EnrichmentData, EnrichmentError, EnrichmentGateway};
use folio::rules::{Label, Predicate, Rule};
use folio::FolioConfig;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub struct Library {
    pub dir: TempDir,
}

impl Library {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        std::fs::create_dir_all(dir.path().join("input")).expect("input dir");
        Self { dir }
    }

    pub fn input(&self) -> PathBuf {
        self.dir.path().join("input")
    }

    pub fn output(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.output().join("reports")
    }

    /// Dry-run config with static rules only.
    pub fn config(&self) -> FolioConfig {
        let mut config = FolioConfig::default();
        config.paths.input_folder = self.input();
        config.paths.output_base_folder = self.output();
        config.paths.cache_dir = self.cache_dir();
        config.paths.log_file = self.dir.path().join("logs/folio.log");
        config.features.dry_run = true;
        config.system.max_workers = 4;
        config.system.save_interval = 2;
        config.enrichment.endpoint = "http://127.0.0.1:9/lookup".to_string();
        config
    }

    /// Write a valid EPUB at `input/<relative>`.
    pub fn add_epub(&self, relative: &str, title: &str, author: Option<&str>, chapters: usize) -> PathBuf {
        let path = self.input().join(relative);
        write_epub(&path, title, author, chapters);
        path
    }

    pub fn add_raw(&self, relative: &str, bytes: &[u8]) -> PathBuf {
        let path = self.input().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dir");
        }
        std::fs::write(&path, bytes).expect("write raw file");
        path
    }

    /// Relative path -> bytes for every file under `input/`.
    pub fn snapshot_input(&self) -> BTreeMap<String, Vec<u8>> {
        walkdir::WalkDir::new(self.input())
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e
                    .path()
                    .strip_prefix(self.input())
                    .expect("under input")
                    .to_string_lossy()
                    .replace('\\', "/");
                let bytes = std::fs::read(e.path()).expect("read input");
                (rel, bytes)
            })
            .collect()
    }

    pub fn machine_report(&self) -> Vec<u8> {
        std::fs::read(self.reports_dir().join("MachineReport.csv")).expect("machine report")
    }

    pub fn human_report(&self) -> Vec<u8> {
        std::fs::read(self.reports_dir().join("HumanReport.csv")).expect("human report")
    }

    /// Machine report rows keyed by logical path.
    pub fn machine_rows(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let bytes = self.machine_report();
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().expect("headers").clone();
        reader
            .records()
            .map(|record| {
                let record = record.expect("row");
                let row: BTreeMap<String, String> = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, v)| (h.to_string(), v.to_string()))
                    .collect();
                (row["path"].clone(), row)
            })
            .collect()
    }

    pub fn human_rows(&self) -> Vec<csv::StringRecord> {
        let bytes = self.human_report();
        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        reader.records().map(|r| r.expect("row")).collect()
    }
}

pub fn write_epub(path: &Path, title: &str, author: Option<&str>, chapters: usize) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("parent dir");
    }
    let container = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;
    let creator = author
        .map(|a| format!("    <dc:creator>{}</dc:creator>\n", a))
        .unwrap_or_default();
    let itemrefs: String = (1..=chapters)
        .map(|i| format!("    <itemref idref=\"c{}\"/>\n", i))
        .collect();
    let opf = format!(
        "<?xml version=\"1.0\"?>\n<package xmlns=\"http://www.idpf.org/2007/opf\" version=\"2.0\">\n  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n    <dc:title>{}</dc:title>\n{}  </metadata>\n  <spine toc=\"ncx\">\n{}  </spine>\n</package>",
        title, creator, itemrefs
    );

    let file = File::create(path).expect("create epub");
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, body) in [
        ("mimetype", "application/epub+zip".to_string()),
        ("META-INF/container.xml", container.to_string()),
        ("OEBPS/content.opf", opf),
    ] {
        zip.start_file(name, options).expect("start entry");
        zip.write_all(body.as_bytes()).expect("write entry");
    }
    zip.finish().expect("finish epub");
}

/// Two keyword rules: "dịch" means a human translation, "convert" a machine
/// conversion.
pub fn keyword_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "rule-dich",
            Label::HumanTranslation,
            0.9,
            Predicate::TitleContains {
                keywords: vec!["dịch".to_string()],
            },
        ),
        Rule::new(
            "rule-convert",
            Label::MachineConverted,
            0.8,
            Predicate::TitleContains {
                keywords: vec!["convert".to_string()],
            },
        ),
    ]
}

/// Scripted gateway: answers every lookup the same way and counts calls.
pub struct CountingGateway {
    calls: AtomicUsize,
    response: Result<EnrichmentData, EnrichmentError>,
}

impl CountingGateway {
    pub fn answering(data: EnrichmentData) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response: Ok(data),
        }
    }

    pub fn failing(error: EnrichmentError) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            response: Err(error),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentGateway for CountingGateway {
    fn name(&self) -> &str {
        "counting"
    }

    async fn lookup(&self, _metadata: &DocumentMetadata) -> Result<EnrichmentData, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone()
    }
}

/// Gateway that holds one chosen lookup (1-based) until `release` is called.
/// Every other lookup answers immediately.
pub struct GatedGateway {
    calls: AtomicUsize,
    held_call: usize,
    gate: tokio::sync::Semaphore,
}

impl GatedGateway {
    pub fn holding_call(held_call: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            held_call,
            gate: tokio::sync::Semaphore::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl EnrichmentGateway for GatedGateway {
    fn name(&self) -> &str {
        "gated"
    }

    async fn lookup(&self, _metadata: &DocumentMetadata) -> Result<EnrichmentData, EnrichmentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.held_call {
            let _permit = self.gate.acquire().await.expect("gate open");
        }
        Ok(EnrichmentData::default())
    }
}

/// Non-empty lines in a checkpoint log, 0 when the file does not exist yet.
pub fn checkpoint_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|log| log.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}
