//! OCR pipeline.
//!
//! [`OcrEngine`] is the narrow seam to the recognition backend — the
//! production engine drives the Tesseract CLI with the English model, tests
//! plug in mocks. [`OcrPipeline`] combines recognition with the pure text
//! post-processing in [`filter`] and the text-hash change detector.

pub mod filter;

use std::io::Write;
use std::process::Command;
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Raw recognition output.
#[derive(Debug, Clone, Serialize)]
pub struct OcrOutcome {
    pub text: String,
    /// Mean word confidence in `[0, 100]`.
    pub confidence: f64,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
}

/// Replaceable recognition backend. Synchronous; async callers use
/// `tokio::task::spawn_blocking`.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, png: &[u8]) -> Result<OcrOutcome>;
}

/// Tesseract-backed engine. The engine value is long-lived; each recognition
/// drives one `tesseract` invocation with TSV output for word confidences.
pub struct TesseractEngine {
    language: String,
}

impl TesseractEngine {
    /// Create the engine, verifying the `tesseract` binary is present.
    pub fn new() -> Result<Self> {
        let output = Command::new("tesseract")
            .arg("--version")
            .output()
            .context("tesseract binary not found on PATH")?;
        anyhow::ensure!(output.status.success(), "tesseract --version failed");
        tracing::info!("tesseract OCR engine ready");
        Ok(Self {
            language: "eng".into(),
        })
    }
}

impl OcrEngine for TesseractEngine {
    fn recognize(&self, png: &[u8]) -> Result<OcrOutcome> {
        let start = Instant::now();

        let mut image = tempfile::Builder::new()
            .prefix("ocr-frame-")
            .suffix(".png")
            .tempfile()
            .context("failed to create OCR scratch file")?;
        image.write_all(png).context("failed to write OCR frame")?;
        image.flush()?;

        let output = Command::new("tesseract")
            .arg(image.path())
            .arg("stdout")
            .args(["-l", &self.language, "--psm", "3", "tsv"])
            .output()
            .context("failed to run tesseract")?;
        anyhow::ensure!(
            output.status.success(),
            "tesseract exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );

        let tsv = String::from_utf8_lossy(&output.stdout);
        let (text, confidence) = parse_tsv(&tsv);

        Ok(OcrOutcome {
            text,
            confidence,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Parse Tesseract TSV output into joined text and mean word confidence.
fn parse_tsv(tsv: &str) -> (String, f64) {
    let mut words: Vec<String> = Vec::new();
    let mut conf_sum = 0.0f64;
    let mut conf_count = 0usize;

    for line in tsv.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }
        let conf: f64 = fields[10].parse().unwrap_or(-1.0);
        let word = fields[11].trim();
        if conf < 0.0 || word.is_empty() {
            continue;
        }
        conf_sum += conf;
        conf_count += 1;
        words.push(word.to_string());
    }

    let confidence = if conf_count > 0 {
        conf_sum / conf_count as f64
    } else {
        0.0
    };
    (words.join(" "), confidence)
}

/// Result of a change check.
#[derive(Debug, Clone)]
pub struct TextChange {
    pub is_different: bool,
    pub hash: String,
}

/// SHA-256 change detector over OCR text. The stored hash is updated on every
/// check, whatever the outcome.
#[derive(Default)]
pub struct TextChangeDetector {
    last_hash: Mutex<Option<String>>,
}

impl TextChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, text: &str) -> TextChange {
        let hash = sha256_hex(text);
        let mut last = self.last_hash.lock().expect("hash lock poisoned");
        let is_different = last.as_deref() != Some(hash.as_str());
        *last = Some(hash.clone());
        TextChange { is_different, hash }
    }
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Processed OCR result handed to the observer.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedText {
    pub text: String,
    pub confidence: f64,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u64,
    #[serde(rename = "fileNames")]
    pub file_names: Vec<String>,
    #[serde(rename = "codeSnippets")]
    pub code_snippets: Vec<String>,
}

/// Recognition plus post-processing plus change detection.
pub struct OcrPipeline {
    engine: Box<dyn OcrEngine>,
    detector: TextChangeDetector,
}

impl OcrPipeline {
    pub fn new(engine: Box<dyn OcrEngine>) -> Self {
        Self {
            engine,
            detector: TextChangeDetector::new(),
        }
    }

    /// Recognize and post-process one frame.
    pub fn extract_text(&self, png: &[u8]) -> Result<ExtractedText> {
        let outcome = self.engine.recognize(png)?;
        let processed = filter::postprocess(&outcome.text);
        Ok(ExtractedText {
            text: processed.text,
            confidence: outcome.confidence,
            elapsed_ms: outcome.elapsed_ms,
            file_names: processed.file_names,
            code_snippets: processed.code_snippets,
        })
    }

    /// Hash-compare `text` against the previous frame; always updates state.
    pub fn check_text_changed(&self, text: &str) -> TextChange {
        self.detector.check(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEngine(&'static str);

    impl OcrEngine for FixedEngine {
        fn recognize(&self, _png: &[u8]) -> Result<OcrOutcome> {
            Ok(OcrOutcome {
                text: self.0.to_string(),
                confidence: 88.5,
                elapsed_ms: 3,
            })
        }
    }

    #[test]
    fn detector_flags_changes_and_updates_hash() {
        let detector = TextChangeDetector::new();
        let first = detector.check("hello");
        assert!(first.is_different);

        let same = detector.check("hello");
        assert!(!same.is_different);
        assert_eq!(same.hash, first.hash);

        let changed = detector.check("goodbye");
        assert!(changed.is_different);
        assert_ne!(changed.hash, first.hash);

        // state updated even on the unchanged path: back to "hello" is a change
        let back = detector.check("hello");
        assert!(back.is_different);
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn parse_tsv_joins_words_and_averages_confidence() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t90\thello\n\
                   5\t1\t1\t1\t1\t2\t12\t0\t10\t10\t80\tworld\n";
        let (text, confidence) = parse_tsv(tsv);
        assert_eq!(text, "hello world");
        assert!((confidence - 85.0).abs() < 1e-9);
    }

    #[test]
    fn parse_tsv_empty_output() {
        let (text, confidence) = parse_tsv("header only\n");
        assert_eq!(text, "");
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn pipeline_applies_postprocessing() {
        let pipeline = OcrPipeline::new(Box::new(FixedEngine(
            "[INFO] reading notes.md carefully today",
        )));
        let extracted = pipeline.extract_text(&[]).unwrap();
        assert_eq!(extracted.file_names, vec!["notes.md"]);
        assert!(!extracted.text.contains("[INFO]"));
        assert!((extracted.confidence - 88.5).abs() < 1e-9);
    }
}
