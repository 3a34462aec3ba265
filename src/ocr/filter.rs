//! OCR post-processing.
//!
//! Pure text functions applied to raw OCR output before it is embedded and
//! stored: whitespace/ASCII cleanup, file-name and code-snippet extraction
//! with redaction, log-marker stripping, and the gibberish filter. Every
//! function here is callable independently of the OCR engine.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Result of running the full post-processing pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PostprocessResult {
    /// The cleaned, redacted, gibberish-filtered text.
    pub text: String,
    /// File names extracted (and redacted) from the raw text.
    #[serde(rename = "fileNames")]
    pub file_names: Vec<String>,
    /// Code lines extracted (and redacted) from the raw text.
    #[serde(rename = "codeSnippets")]
    pub code_snippets: Vec<String>,
}

/// Run the full pipeline: clean → extract files/code → redact → cleanup →
/// gibberish filter.
pub fn postprocess(raw: &str) -> PostprocessResult {
    let cleaned = clean_ocr_text(raw);
    let file_names = extract_file_names(&cleaned);
    let code_snippets = extract_code_snippets(&cleaned);

    let mut text = redact(&cleaned, &file_names, &code_snippets);
    text = additional_cleanup(&text);
    text = filter_gibberish(&text);

    PostprocessResult {
        text,
        file_names,
        code_snippets,
    }
}

// ── Step 1: basic cleanup ────────────────────────────────────────────────────

/// Collapse whitespace and strip characters outside printable ASCII.
/// Unicode ellipsis is kept as `...` so truncated filenames stay pairable.
pub fn clean_ocr_text(raw: &str) -> String {
    let ascii: String = raw
        .replace('…', "...")
        .chars()
        .map(|c| {
            if c == '\n' {
                '\n'
            } else if (' '..='~').contains(&c) {
                c
            } else {
                ' '
            }
        })
        .collect();

    // collapse runs of spaces/tabs but keep line structure for code extraction
    ascii
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Step 2: file names ───────────────────────────────────────────────────────

const FILE_EXTENSIONS: &str = "js|ts|jsx|tsx|mjs|py|rs|go|java|c|cpp|h|hpp|css|html|json|md|txt|\
                               pdf|png|jpg|jpeg|gif|svg|webp|csv|xml|yml|yaml|toml|ini|sh|sql|\
                               zip|tar|gz|log|doc|docx|xls|xlsx|ppt|pptx";

static FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\b[A-Za-z0-9_][A-Za-z0-9_.\-]*\.(?:{FILE_EXTENSIONS})\b"
    ))
    .expect("valid regex")
});

/// `<prefix>-...<suffix>.ext` — a filename truncated for display.
static ELLIPSIS_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\b([A-Za-z0-9_][A-Za-z0-9_\-]*)-?\.\.\.([A-Za-z0-9_][A-Za-z0-9_.\-]*\.(?:{FILE_EXTENSIONS}))\b"
    ))
    .expect("valid regex")
});

/// `hyphenated-name March` — document names shown next to a date column.
static HYPHEN_MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b([A-Za-z0-9]+(?:-[A-Za-z0-9]+)+)\s+(?:January|February|March|April|May|June|July|August|September|October|November|December)\b",
    )
    .expect("valid regex")
});

/// Extract file-name candidates from cleaned text: plain `name.ext` hits,
/// reconstructed ellipsis-truncated names, and hyphenated names followed by a
/// month. Case-insensitively deduplicated and validated.
pub fn extract_file_names(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let mut push = |candidate: &str| {
        let key = candidate.to_lowercase();
        if !seen.contains(&key) && is_valid_file_name(candidate) {
            seen.insert(key);
            out.push(candidate.to_string());
        }
    };

    for m in ELLIPSIS_FILE.captures_iter(text) {
        push(&format!("{}-...{}", &m[1], &m[2]));
    }
    for m in FILE_NAME.find_iter(text) {
        push(m.as_str());
    }
    for m in HYPHEN_MONTH.captures_iter(text) {
        push(&m[1]);
    }

    out
}

/// Filename safety predicate: printable, no forbidden punctuation, bounded
/// length, and either carries an extension or is a hyphenated compound.
pub fn is_valid_file_name(candidate: &str) -> bool {
    if candidate.is_empty() || candidate.len() >= 256 {
        return false;
    }
    if candidate.chars().any(|c| c.is_control()) {
        return false;
    }
    const FORBIDDEN: &[char] = &['<', '>', ':', '"', '|', '?', '*', '/', '\\'];
    if candidate.chars().any(|c| FORBIDDEN.contains(&c)) {
        return false;
    }

    let has_extension = FILE_NAME.is_match(candidate);
    let hyphenated = candidate.contains('-')
        && candidate
            .split('-')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric()));
    has_extension || hyphenated
}

// ── Step 3: code snippets ────────────────────────────────────────────────────

const CODE_KEYWORDS: &[&str] = &["export", "import", "function", "const", "let", "var"];

/// Lines whose first token is a code keyword.
pub fn extract_code_snippets(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| {
            line.split_whitespace()
                .next()
                .map(|first| CODE_KEYWORDS.contains(&first))
                .unwrap_or(false)
        })
        .map(|line| line.trim().to_string())
        .collect()
}

// ── Step 4: redaction ────────────────────────────────────────────────────────

/// Remove extracted file names and code lines from the text.
pub fn redact(text: &str, file_names: &[String], code_snippets: &[String]) -> String {
    let mut out: String = text
        .lines()
        .filter(|line| !code_snippets.iter().any(|snippet| line.trim() == snippet))
        .collect::<Vec<_>>()
        .join("\n");

    for name in file_names {
        out = out.replace(name.as_str(), " ");
    }
    out
}

// ── Step 5: marker cleanup ───────────────────────────────────────────────────

static LOG_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[A-Z][A-Z0-9_]*\]").expect("valid regex"));
static BRACKET_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\d{1,2}:\d{2}(?::\d{2})?(?:\s?[AP]M)?\]").expect("valid regex")
});

/// Strip `[TAG]` log markers and bracketed timestamps; collapse whitespace.
/// (Emoji were already dropped by the ASCII filter.)
pub fn additional_cleanup(text: &str) -> String {
    let text = LOG_TAG.replace_all(text, " ");
    let text = BRACKET_TIME.replace_all(&text, " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Step 6: gibberish filter ─────────────────────────────────────────────────

static TIMESTAMP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // ThuFeb19, Sat 4
        r"\b(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun)[A-Za-z]*\s?\d{1,2}\b",
        // 12:01AM, 23:59, 9:05:30 pm
        r"\b\d{1,2}:\d{2}(?::\d{2})?\s?(?:[APap][Mm])?\b",
        // 2026-02-19, 2/19/26
        r"\b\d{4}-\d{2}-\d{2}\b",
        r"\b\d{1,2}/\d{1,2}/\d{2,4}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Words that look consonant-heavy but are real.
const PROTECTED_WORDS: &[&str] = &[
    "by", "my", "gym", "why", "try", "dry", "fly", "sky", "shy", "myth",
    "ok", "id", "px", "js", "ts", "css", "html", "sql", "npm", "git", "src",
    "app", "url", "api", "pdf", "tv", "vs", "mr", "mrs", "dr", "st",
];

const DELIMITER: &str = "---";
const WINDOW: usize = 6;
const WINDOW_NONSENSE_THRESHOLD: usize = 4;

/// Remove OCR noise while preserving timestamps verbatim.
pub fn filter_gibberish(text: &str) -> String {
    // Protect timestamps behind placeholders before any token surgery.
    let mut protected: Vec<String> = Vec::new();
    let mut working = text.to_string();
    for pattern in TIMESTAMP_PATTERNS.iter() {
        loop {
            let Some((range, matched)) = pattern
                .find(&working)
                .map(|m| (m.range(), m.as_str().to_string()))
            else {
                break;
            };
            let placeholder = format!("__TS{}__", protected.len());
            protected.push(matched);
            working.replace_range(range, &placeholder);
        }
    }

    let mut tokens: Vec<String> = working.split_whitespace().map(str::to_string).collect();

    tokens = collapse_single_letter_runs(tokens);
    tokens = replace_punctuation_fragments(tokens);

    // Sliding window: a dense cluster of nonsense marks the whole window.
    let mut marked = vec![false; tokens.len()];
    if tokens.len() >= WINDOW {
        for start in 0..=(tokens.len() - WINDOW) {
            let window = &tokens[start..start + WINDOW];
            let nonsense = window.iter().filter(|t| is_nonsense_token(t)).count();
            if nonsense >= WINDOW_NONSENSE_THRESHOLD {
                for (offset, token) in window.iter().enumerate() {
                    if !is_placeholder(token) && !is_protected(token) {
                        marked[start + offset] = true;
                    }
                }
            }
        }
    }
    let mut filtered: Vec<String> = tokens
        .into_iter()
        .zip(marked)
        .map(|(token, is_marked)| {
            if is_marked {
                DELIMITER.to_string()
            } else {
                token
            }
        })
        .collect();

    // Individual pass: isolated nonsense that survived the window.
    filtered.retain(|token| !is_nonsense_token(token));

    let mut result = filtered.join(" ");

    // Restore timestamps.
    for (index, original) in protected.iter().enumerate() {
        result = result.replace(&format!("__TS{index}__"), original);
    }

    collapse_delimiters(&result)
}

/// Runs of ≥3 single-letter tokens collapse to one delimiter.
fn collapse_single_letter_runs(tokens: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    let mut run: usize = 0;
    for token in tokens {
        let single = token.len() == 1 && token.chars().all(|c| c.is_ascii_alphabetic());
        if single {
            run += 1;
            out.push(token);
        } else {
            if run >= 3 {
                out.truncate(out.len() - run);
                out.push(DELIMITER.to_string());
            }
            run = 0;
            out.push(token);
        }
    }
    if run >= 3 {
        out.truncate(out.len() - run);
        out.push(DELIMITER.to_string());
    }
    out
}

/// Tokens that are mostly punctuation become delimiters.
fn replace_punctuation_fragments(tokens: Vec<String>) -> Vec<String> {
    tokens
        .into_iter()
        .map(|token| {
            if is_placeholder(&token) || token == DELIMITER {
                return token;
            }
            let len = token.chars().count();
            let punct = token
                .chars()
                .filter(|c| c.is_ascii_punctuation() && *c != '_')
                .count();
            if len >= 3 && punct * 2 > len {
                DELIMITER.to_string()
            } else {
                token
            }
        })
        .collect()
}

fn is_placeholder(token: &str) -> bool {
    token.starts_with("__TS") && token.ends_with("__")
}

fn is_protected(token: &str) -> bool {
    PROTECTED_WORDS.contains(&token.to_lowercase().as_str())
}

fn is_vowel(c: char) -> bool {
    matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u')
}

/// A token counts as nonsense when it is not protected and trips any of the
/// consonant-density heuristics. Placeholders, delimiters, and tokens with
/// digits are never nonsense.
fn is_nonsense_token(token: &str) -> bool {
    if is_placeholder(token) || token == DELIMITER || is_protected(token) {
        return false;
    }
    if !token.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }

    let len = token.len();
    let vowels = token.chars().filter(|c| is_vowel(*c)).count();

    if vowels == 0 && len >= 3 {
        return true;
    }
    if len <= 4 && (vowels as f64 / len as f64) < 0.2 {
        return true;
    }
    let leading_consonants = token.chars().take_while(|c| !is_vowel(*c)).count();
    if leading_consonants >= 3 && len <= 5 {
        return true;
    }
    let trailing_consonants = token
        .chars()
        .rev()
        .take_while(|c| !is_vowel(*c))
        .count();
    if trailing_consonants >= 4 {
        return true;
    }
    false
}

/// Collapse neighboring delimiters into one.
fn collapse_delimiters(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for token in text.split_whitespace() {
        if token == DELIMITER && out.last() == Some(&DELIMITER) {
            continue;
        }
        out.push(token);
    }
    out.join(" ")
}
