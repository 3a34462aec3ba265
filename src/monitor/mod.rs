//! Desktop screen observer.
//!
//! A periodic tick loop watches the active desktop: when the focused window
//! changes or enough pixels move, the screen is captured, OCR'd, deduplicated
//! by text hash, embedded, and stored as a `screen_capture` record with
//! application and window-title entities. Desktop access sits behind
//! [`DesktopProbe`] so tests can drive the loop with scripted frames.

pub mod diff;

use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::embedding::cache::CachedEmbedder;
use crate::memory::store::MemoryStore;
use crate::memory::types::{Entity, Record, RecordType};
use crate::ocr::OcrPipeline;

/// OCR text shorter than this is treated as an empty frame.
const MIN_OCR_TEXT_LEN: usize = 10;

/// Captured text is truncated to this many chars before embedding.
const EMBED_TEXT_MAX: usize = 2000;

/// The focused window at tick time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub app_name: String,
    pub title: String,
}

/// Narrow seam to the OS desktop. Synchronous; the monitor calls it through
/// the blocking pool.
pub trait DesktopProbe: Send + Sync {
    /// Milliseconds since the last user input.
    fn idle_ms(&self) -> Result<u64>;
    fn active_window(&self) -> Result<WindowInfo>;
    /// Capture the current screen as PNG bytes.
    fn capture_png(&self) -> Result<Vec<u8>>;
}

/// X11 probe built on the standard desktop tools (`xdotool`, `xprintidle`,
/// `scrot`). Any of them missing surfaces as a tick error, never a crash.
pub struct SystemProbe;

impl DesktopProbe for SystemProbe {
    fn idle_ms(&self) -> Result<u64> {
        let output = Command::new("xprintidle")
            .output()
            .context("xprintidle not found on PATH")?;
        anyhow::ensure!(output.status.success(), "xprintidle failed");
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .context("unparseable xprintidle output")
    }

    fn active_window(&self) -> Result<WindowInfo> {
        let title = run_stdout("xdotool", &["getactivewindow", "getwindowname"])?;
        let app_name = run_stdout("xdotool", &["getactivewindow", "getwindowclassname"])
            .unwrap_or_else(|_| title.clone());
        Ok(WindowInfo { app_name, title })
    }

    fn capture_png(&self) -> Result<Vec<u8>> {
        let file = tempfile::Builder::new()
            .prefix("screen-")
            .suffix(".png")
            .tempfile()
            .context("failed to create capture scratch file")?;
        let status = Command::new("scrot")
            .arg("--overwrite")
            .arg(file.path())
            .status()
            .context("scrot not found on PATH")?;
        anyhow::ensure!(status.success(), "scrot failed");
        std::fs::read(file.path()).context("failed to read captured frame")
    }
}

fn run_stdout(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("{program} not found on PATH"))?;
    anyhow::ensure!(output.status.success(), "{program} failed");
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Tick counters.
#[derive(Debug, Default)]
pub struct MonitorCounters {
    pub captures: AtomicU64,
    pub skips: AtomicU64,
    pub overruns: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub captures: u64,
    pub skips: u64,
    pub overruns: u64,
    pub errors: u64,
}

impl MonitorCounters {
    pub fn snapshot(&self) -> MonitorStats {
        MonitorStats {
            captures: self.captures.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// What one tick did; returned for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A record was stored; carries its id.
    Captured(String),
    /// User idle, nothing attempted.
    Idle,
    /// Same window, pixels within threshold.
    Unchanged,
    /// OCR produced less than the minimum text.
    ShortText,
    /// OCR text hash identical to the previous capture.
    DuplicateText,
    /// A previous tick is still running; this one was dropped.
    Coalesced,
    /// Probe/OCR/embed/store failure; counted, not fatal.
    Error,
}

/// The observer's full mutable state between ticks.
#[derive(Default)]
struct ObserverState {
    last_app_name: Option<String>,
    last_window_title: Option<String>,
    last_screenshot_png: Option<Vec<u8>>,
}

/// The screen observation loop.
pub struct ScreenMonitor {
    probe: Arc<dyn DesktopProbe>,
    ocr: Arc<OcrPipeline>,
    embedder: Arc<CachedEmbedder>,
    store: MemoryStore,
    config: MonitorConfig,
    counters: Arc<MonitorCounters>,
    state: tokio::sync::Mutex<ObserverState>,
}

impl ScreenMonitor {
    pub fn new(
        probe: Arc<dyn DesktopProbe>,
        ocr: Arc<OcrPipeline>,
        embedder: Arc<CachedEmbedder>,
        store: MemoryStore,
        config: MonitorConfig,
    ) -> Self {
        Self {
            probe,
            ocr,
            embedder,
            store,
            config,
            counters: Arc::new(MonitorCounters::default()),
            state: tokio::sync::Mutex::new(ObserverState::default()),
        }
    }

    pub fn counters(&self) -> Arc<MonitorCounters> {
        self.counters.clone()
    }

    /// Run one observation tick. Serialised: a tick arriving while another is
    /// in flight is dropped and counted as an overrun.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(mut state) = self.state.try_lock() else {
            self.counters.overruns.fetch_add(1, Ordering::Relaxed);
            return TickOutcome::Coalesced;
        };

        match self.observe(&mut state).await {
            Ok(outcome) => {
                match &outcome {
                    TickOutcome::Captured(id) => {
                        self.counters.captures.fetch_add(1, Ordering::Relaxed);
                        info!(id = %id, "screen capture stored");
                    }
                    TickOutcome::Idle => {}
                    _ => {
                        self.counters.skips.fetch_add(1, Ordering::Relaxed);
                        debug!(outcome = ?outcome, "tick skipped");
                    }
                }
                outcome
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "screen tick failed");
                TickOutcome::Error
            }
        }
    }

    async fn observe(&self, state: &mut ObserverState) -> Result<TickOutcome> {
        // Idle gate
        let probe = self.probe.clone();
        let idle = tokio::task::spawn_blocking(move || probe.idle_ms()).await??;
        if idle >= self.config.idle_timeout_ms {
            return Ok(TickOutcome::Idle);
        }

        // Active window
        let probe = self.probe.clone();
        let window = tokio::task::spawn_blocking(move || probe.active_window()).await??;

        let title_changed = state.last_app_name.as_deref() != Some(window.app_name.as_str())
            || state.last_window_title.as_deref() != Some(window.title.as_str());
        state.last_app_name = Some(window.app_name.clone());
        state.last_window_title = Some(window.title.clone());

        // Capture
        let probe = self.probe.clone();
        let png = tokio::task::spawn_blocking(move || probe.capture_png()).await??;

        if !title_changed {
            let ratio = match &state.last_screenshot_png {
                Some(previous) => diff::pixel_diff_ratio(previous, &png)?,
                None => 1.0,
            };
            if ratio <= self.config.diff_threshold {
                state.last_screenshot_png = Some(png);
                return Ok(TickOutcome::Unchanged);
            }
        }
        state.last_screenshot_png = Some(png.clone());

        // OCR
        let ocr = self.ocr.clone();
        let extracted =
            tokio::task::spawn_blocking(move || ocr.extract_text(&png)).await??;
        if extracted.text.trim().len() < MIN_OCR_TEXT_LEN {
            return Ok(TickOutcome::ShortText);
        }

        // Text-hash dedup; the stored hash updates regardless of the decision
        let change = self.ocr.check_text_changed(&extracted.text);
        if !change.is_different {
            return Ok(TickOutcome::DuplicateText);
        }

        // Embed app + title + text, truncated
        let combined: String = format!(
            "{} {} {}",
            window.app_name, window.title, extracted.text
        )
        .chars()
        .take(EMBED_TEXT_MAX)
        .collect();
        let embedder = self.embedder.clone();
        let text_for_embed = combined.clone();
        let embedded =
            tokio::task::spawn_blocking(move || embedder.embed(&text_for_embed)).await??;

        // Store
        let now = crate::memory::now_rfc3339();
        let record = Record {
            id: crate::memory::mint_record_id(),
            user_id: self.config.user_id.clone(),
            record_type: RecordType::ScreenCapture,
            source_text: combined,
            metadata: Some(serde_json::json!({
                "appName": window.app_name,
                "windowTitle": window.title,
                "ocrConfidence": extracted.confidence,
                "textHash": change.hash,
            })),
            screenshot: None,
            extracted_text: Some(extracted.text.clone()),
            embedding: Some(embedded.vector.as_ref().clone()),
            created_at: now.clone(),
            updated_at: now,
        };
        let entities = vec![
            Entity::new(&record.id, "application", &window.app_name),
            Entity::new(&record.id, "window-title", &window.title),
        ];

        let store = self.store.clone();
        let record_id = record.id.clone();
        tokio::task::spawn_blocking(move || store.insert(&record, &entities)).await??;

        Ok(TickOutcome::Captured(record_id))
    }

    /// Background loop: one tick per interval, cancellation via the watch
    /// channel. A tick that outlives the interval counts as an overrun (the
    /// interval skips missed fires rather than queueing them).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_millis(self.config.capture_interval_ms.max(100));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // consume the immediate first tick

        info!(interval_ms = self.config.capture_interval_ms, "screen monitor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = Instant::now();
                    self.tick().await;
                    if started.elapsed() > period {
                        self.counters.overruns.fetch_add(1, Ordering::Relaxed);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("screen monitor stopped");
                        return;
                    }
                }
            }
        }
    }
}
