#![forbid(unsafe_code)]

//! Background video downloads.
//!
//! A job is started fire-and-forget, runs on the tokio runtime with the
//! blocking work in `spawn_blocking`, and is observed only through polling.
//! The actual transfer sits behind the [`Fetcher`] trait: either yt-dlp as a
//! subprocess whose text output is scraped for progress and the final path,
//! or a plain HTTP fetch of a direct media URL. Finished jobs are kept for
//! the life of the process so late pollers still get an answer.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Subdirectory of the resolved output directory that receives media files.
pub const VIDEOS_SUBDIR: &str = "videos";

/// Cap on simultaneously running fetches. Keeps a burst of requests from
/// spawning an unbounded number of yt-dlp processes.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 4;

const YTDLP_PROGRAM: &str = "yt-dlp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Downloading,
    Done,
    Error,
    Unknown,
}

/// Point-in-time view of a job. Transitions replace the whole record under
/// the job-map lock, so pollers never observe a half-updated entry.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobSnapshot {
    fn downloading() -> Self {
        Self {
            status: JobStatus::Downloading,
            progress: None,
            path: None,
            error: None,
        }
    }

    pub fn unknown() -> Self {
        Self {
            status: JobStatus::Unknown,
            progress: None,
            path: None,
            error: None,
        }
    }
}

/// Everything a fetch strategy needs to know about one download.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Post URL, handed to yt-dlp and used to derive the fallback filename.
    pub tweet_url: String,
    /// Direct media URL, used when yt-dlp is unavailable.
    pub direct_url: Option<String>,
    /// ISO-8601 timestamp of the post; becomes the filename date prefix.
    pub post_date: String,
    /// Target directory for the media file.
    pub videos_dir: PathBuf,
}

/// Progress signals emitted while a fetch runs.
pub enum FetchEvent {
    Progress(u8),
    Destination(PathBuf),
}

/// A single download strategy. Emits events as they happen and returns the
/// final media path when it is known.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        request: &FetchRequest,
        on_event: &mut dyn FnMut(FetchEvent),
    ) -> Result<Option<PathBuf>>;
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    jobs: Mutex<HashMap<String, JobSnapshot>>,
    limiter: Arc<Semaphore>,
    runtime: Handle,
    program: PathBuf,
    availability: Mutex<Option<bool>>,
}

impl DownloadManager {
    pub fn new(runtime: Handle) -> Self {
        Self::with_program(runtime, PathBuf::from(YTDLP_PROGRAM))
    }

    /// Same as [`DownloadManager::new`] but with an explicit downloader
    /// binary, so tests can substitute a stub.
    pub fn with_program(runtime: Handle, program: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_DOWNLOADS)),
                runtime,
                program,
                availability: Mutex::new(None),
            }),
        }
    }

    /// Whether the external downloader answers `--version`. Probed once and
    /// cached for the process lifetime.
    pub fn ytdlp_available(&self) -> bool {
        ytdlp_available(&self.inner)
    }

    /// Registers the job and launches its background task. Returns
    /// immediately; outcome is visible only via [`DownloadManager::status`].
    pub fn start(&self, job_id: String, request: FetchRequest) {
        self.inner
            .jobs
            .lock()
            .insert(job_id.clone(), JobSnapshot::downloading());

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let permit = inner.limiter.clone().acquire_owned().await;
            let Ok(_permit) = permit else {
                complete_job(&inner, &job_id, Err(anyhow::anyhow!("download queue closed")));
                return;
            };

            let worker_inner = inner.clone();
            let worker_id = job_id.clone();
            let outcome =
                tokio::task::spawn_blocking(move || run_fetch(&worker_inner, &worker_id, request))
                    .await;
            match outcome {
                Ok(result) => complete_job(&inner, &job_id, result),
                Err(err) => complete_job(
                    &inner,
                    &job_id,
                    Err(anyhow::anyhow!("download task failed: {err}")),
                ),
            }
        });
    }

    /// Current snapshot of a job. Ids this process has never seen (including
    /// jobs lost to a restart) report `unknown` rather than an error.
    pub fn status(&self, job_id: &str) -> JobSnapshot {
        self.inner
            .jobs
            .lock()
            .get(job_id)
            .cloned()
            .unwrap_or_else(JobSnapshot::unknown)
    }
}

fn ytdlp_available(inner: &Inner) -> bool {
    let mut cached = inner.availability.lock();
    if let Some(available) = *cached {
        return available;
    }
    let available = probe_program(&inner.program);
    debug!(program = %inner.program.display(), available, "probed external downloader");
    *cached = Some(available);
    available
}

/// Runs `<program> --version`, the cheapest call that proves the tool both
/// exists and starts.
fn probe_program(program: &Path) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn run_fetch(inner: &Arc<Inner>, job_id: &str, request: FetchRequest) -> Result<Option<PathBuf>> {
    let fetcher: Box<dyn Fetcher> = if ytdlp_available(inner) {
        Box::new(YtDlpFetcher {
            program: inner.program.clone(),
        })
    } else if request.direct_url.is_some() {
        Box::new(DirectFetcher)
    } else {
        bail!("yt-dlp is not installed and no direct media URL was provided");
    };

    let mut on_event = |event: FetchEvent| apply_event(inner, job_id, event);
    fetcher.fetch(&request, &mut on_event)
}

fn apply_event(inner: &Inner, job_id: &str, event: FetchEvent) {
    let mut jobs = inner.jobs.lock();
    let Some(job) = jobs.get_mut(job_id) else {
        return;
    };
    let mut next = job.clone();
    match event {
        FetchEvent::Progress(percent) => next.progress = Some(percent.min(100)),
        FetchEvent::Destination(path) => next.path = Some(path.display().to_string()),
    }
    *job = next;
}

fn complete_job(inner: &Inner, job_id: &str, result: Result<Option<PathBuf>>) {
    let mut jobs = inner.jobs.lock();
    let Some(job) = jobs.get_mut(job_id) else {
        return;
    };
    let mut next = job.clone();
    match result {
        Ok(path) => {
            next.status = JobStatus::Done;
            next.progress = Some(100);
            if let Some(path) = path {
                next.path = Some(path.display().to_string());
            }
            next.error = None;
        }
        Err(err) => {
            warn!(job = job_id, error = %err, "download failed");
            next.status = JobStatus::Error;
            next.error = Some(err.to_string());
        }
    }
    *job = next;
}

/// Delegates to yt-dlp and scrapes its line-buffered output for progress
/// percentages and the output path.
struct YtDlpFetcher {
    program: PathBuf,
}

impl Fetcher for YtDlpFetcher {
    fn fetch(
        &self,
        request: &FetchRequest,
        on_event: &mut dyn FnMut(FetchEvent),
    ) -> Result<Option<PathBuf>> {
        fs::create_dir_all(&request.videos_dir).with_context(|| {
            format!("creating videos directory {}", request.videos_dir.display())
        })?;

        let template = request.videos_dir.join(format!(
            "{}%(id)s.%(ext)s",
            date_prefix(&request.post_date)
        ));

        // --newline keeps progress on one line each instead of carriage
        // returns, which is what makes the scraping below possible.
        let mut child = Command::new(&self.program)
            .arg("--newline")
            .arg("--no-playlist")
            .arg("-o")
            .arg(&template)
            .arg(&request.tweet_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", self.program.display()))?;

        // Drain stderr on a side thread so neither pipe can fill and wedge
        // the child.
        let stderr = child.stderr.take();
        let stderr_thread = thread::spawn(move || {
            let mut lines = Vec::new();
            if let Some(stderr) = stderr {
                for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
                    lines.push(line);
                }
            }
            lines
        });

        let stdout = child
            .stdout
            .take()
            .context("yt-dlp stdout was not captured")?;
        let mut destination: Option<PathBuf> = None;
        let mut last_line: Option<String> = None;
        let mut last_error: Option<String> = None;
        for line in BufReader::new(stdout).lines() {
            let line = line.context("reading yt-dlp output")?;
            if let Some(percent) = parse_percent(&line) {
                on_event(FetchEvent::Progress(percent));
            }
            if let Some(path) = detect_destination(&line) {
                destination = Some(path.clone());
                on_event(FetchEvent::Destination(path));
            }
            if !line.trim().is_empty() {
                if line.contains("ERROR") {
                    last_error = Some(line.trim().to_string());
                }
                last_line = Some(line.trim().to_string());
            }
        }

        let stderr_lines = stderr_thread.join().unwrap_or_default();
        for line in &stderr_lines {
            if line.trim().is_empty() {
                continue;
            }
            if line.contains("ERROR") {
                last_error = Some(line.trim().to_string());
            }
            last_line = Some(line.trim().to_string());
        }

        let status = child.wait().context("waiting for yt-dlp")?;
        if !status.success() {
            let message = last_error
                .or(last_line)
                .unwrap_or_else(|| format!("yt-dlp exited with {status}"));
            bail!("{message}");
        }
        Ok(destination)
    }
}

/// Streams a direct media URL straight to disk. No incremental progress is
/// available, so the job jumps from 0 to 100.
struct DirectFetcher;

impl Fetcher for DirectFetcher {
    fn fetch(
        &self,
        request: &FetchRequest,
        on_event: &mut dyn FnMut(FetchEvent),
    ) -> Result<Option<PathBuf>> {
        let Some(url) = request.direct_url.as_deref() else {
            bail!("no direct media URL to fetch");
        };
        fs::create_dir_all(&request.videos_dir).with_context(|| {
            format!("creating videos directory {}", request.videos_dir.display())
        })?;

        on_event(FetchEvent::Progress(0));
        let target = request.videos_dir.join(format!(
            "{}{}.{}",
            date_prefix(&request.post_date),
            source_id(&request.tweet_url),
            url_extension(url)
        ));

        let response = ureq::get(url)
            .call()
            .with_context(|| format!("fetching {url}"))?;
        let mut reader = response.into_reader();
        let mut file = fs::File::create(&target)
            .with_context(|| format!("creating {}", target.display()))?;
        std::io::copy(&mut reader, &mut file)
            .with_context(|| format!("writing {}", target.display()))?;

        on_event(FetchEvent::Destination(target.clone()));
        on_event(FetchEvent::Progress(100));
        Ok(Some(target))
    }
}

/// `2024-01-15T12:34:56.000Z` → `2024.01.15_`; anything that does not start
/// with a plausible `YYYY-MM-DD` yields an empty prefix.
pub fn date_prefix(post_date: &str) -> String {
    let Some(date) = post_date.get(..10) else {
        return String::new();
    };
    let plausible = date.char_indices().all(|(index, ch)| match index {
        4 | 7 => ch == '-',
        _ => ch.is_ascii_digit(),
    });
    if !plausible {
        return String::new();
    }
    format!("{}_", date.replace('-', "."))
}

/// Picks the first whitespace-separated token ending in `%` and parses it,
/// matching lines like `[download]  42.3% of 10.00MiB at 1.00MiB/s`.
fn parse_percent(line: &str) -> Option<u8> {
    for token in line.split_whitespace() {
        if let Some(number) = token.strip_suffix('%') {
            if let Ok(value) = number.parse::<f64>() {
                return Some(value.clamp(0.0, 100.0) as u8);
            }
        }
    }
    None
}

/// Extracts the output path from the markers yt-dlp prints, in priority
/// order: an explicit destination, an already-downloaded notice, or the
/// final merge target. A later marker overrides an earlier one, so the
/// merged file wins over the intermediate streams.
fn detect_destination(line: &str) -> Option<PathBuf> {
    if let Some(rest) = line.split("Destination: ").nth(1) {
        let path = rest.trim();
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    if let Some(before) = line.split(" has already been downloaded").next() {
        if before != line {
            let path = before
                .trim()
                .strip_prefix("[download]")
                .unwrap_or(before)
                .trim();
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
    }
    if let Some(rest) = line.split("Merging formats into ").nth(1) {
        let path = rest.trim().trim_matches('"');
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    None
}

/// Last path segment of the post URL, used to name direct fetches. Query
/// strings and fragments are stripped; an unusable URL falls back to a
/// generic name.
fn source_id(tweet_url: &str) -> String {
    let trimmed = tweet_url
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .trim_end_matches('/');
    let candidate = trimmed.rsplit('/').next().unwrap_or("");
    let cleaned: String = candidate
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
        .collect();
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned
    }
}

/// File extension from a direct media URL's path, defaulting to `mp4`.
fn url_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or("");
    let name = path.rsplit('/').next().unwrap_or("");
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|ch| ch.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "mp4".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn date_prefix_from_iso_datetime() {
        assert_eq!(date_prefix("2024-01-15T12:34:56.000Z"), "2024.01.15_");
    }

    #[test]
    fn date_prefix_from_date_only() {
        assert_eq!(date_prefix("2024-01-15"), "2024.01.15_");
    }

    #[test]
    fn date_prefix_empty_or_garbage_is_empty() {
        assert_eq!(date_prefix(""), "");
        assert_eq!(date_prefix("yesterday"), "");
        assert_eq!(date_prefix("2024/01/15"), "");
        assert_eq!(date_prefix("2024-1-15T00:00:00Z"), "");
    }

    #[test]
    fn parse_percent_from_progress_lines() {
        assert_eq!(
            parse_percent("[download]  42.3% of 10.00MiB at 1.00MiB/s ETA 00:05"),
            Some(42)
        );
        assert_eq!(parse_percent("[download] 100% of 10.00MiB"), Some(100));
        assert_eq!(parse_percent("[info] no progress here"), None);
        assert_eq!(parse_percent("stray % sign"), None);
    }

    #[test]
    fn detect_destination_markers() {
        assert_eq!(
            detect_destination("[download] Destination: /out/2024.01.15_abc.mp4"),
            Some(PathBuf::from("/out/2024.01.15_abc.mp4"))
        );
        assert_eq!(
            detect_destination("[download] /out/abc.mp4 has already been downloaded"),
            Some(PathBuf::from("/out/abc.mp4"))
        );
        assert_eq!(
            detect_destination("[Merger] Merging formats into \"/out/abc.mp4\""),
            Some(PathBuf::from("/out/abc.mp4"))
        );
        assert_eq!(detect_destination("[info] nothing relevant"), None);
    }

    #[test]
    fn source_id_from_post_url() {
        assert_eq!(
            source_id("https://x.com/user/status/17245?s=20"),
            "17245"
        );
        assert_eq!(source_id("https://x.com/user/status/17245/"), "17245");
        assert_eq!(source_id(""), "video");
    }

    #[test]
    fn url_extension_from_direct_url() {
        assert_eq!(url_extension("https://v.example/vid/abc.MP4?tag=1"), "mp4");
        assert_eq!(url_extension("https://v.example/vid/abc"), "mp4");
        assert_eq!(url_extension("https://v.example/clip.webm"), "webm");
    }

    #[cfg(unix)]
    mod jobs {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        fn write_stub(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("yt-dlp-stub.sh");
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        async fn wait_for_terminal(manager: &DownloadManager, id: &str) -> JobSnapshot {
            for _ in 0..200 {
                let snapshot = manager.status(id);
                if snapshot.status == JobStatus::Done || snapshot.status == JobStatus::Error {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("job {id} never reached a terminal state");
        }

        fn request_in(dir: &Path) -> FetchRequest {
            FetchRequest {
                tweet_url: "https://x.com/user/status/42".into(),
                direct_url: None,
                post_date: "2024-01-15T00:00:00Z".into(),
                videos_dir: dir.join(VIDEOS_SUBDIR),
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn successful_job_reports_progress_and_path() {
            let tmp = tempdir().unwrap();
            let stub = write_stub(
                tmp.path(),
                concat!(
                    "if [ \"$1\" = \"--version\" ]; then echo 2024.01.01; exit 0; fi\n",
                    "echo '[download] Destination: /out/2024.01.15_42.mp4'\n",
                    "echo '[download]  50.0% of 4.00MiB'\n",
                    "echo '[download] 100% of 4.00MiB'",
                ),
            );
            let manager = DownloadManager::with_program(Handle::current(), stub);
            manager.start("job-1".into(), request_in(tmp.path()));

            let snapshot = wait_for_terminal(&manager, "job-1").await;
            assert_eq!(snapshot.status, JobStatus::Done);
            assert_eq!(snapshot.progress, Some(100));
            assert_eq!(snapshot.path.as_deref(), Some("/out/2024.01.15_42.mp4"));
            assert!(snapshot.error.is_none());
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn failing_job_surfaces_error_line() {
            let tmp = tempdir().unwrap();
            let stub = write_stub(
                tmp.path(),
                concat!(
                    "if [ \"$1\" = \"--version\" ]; then echo 2024.01.01; exit 0; fi\n",
                    "echo 'ERROR: Unsupported URL' >&2\n",
                    "exit 1",
                ),
            );
            let manager = DownloadManager::with_program(Handle::current(), stub);
            manager.start("job-2".into(), request_in(tmp.path()));

            let snapshot = wait_for_terminal(&manager, "job-2").await;
            assert_eq!(snapshot.status, JobStatus::Error);
            assert!(snapshot.error.unwrap().contains("Unsupported URL"));
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn missing_tool_without_direct_url_errors() {
            let tmp = tempdir().unwrap();
            let manager = DownloadManager::with_program(
                Handle::current(),
                tmp.path().join("no-such-binary"),
            );
            assert!(!manager.ytdlp_available());
            manager.start("job-3".into(), request_in(tmp.path()));

            let snapshot = wait_for_terminal(&manager, "job-3").await;
            assert_eq!(snapshot.status, JobStatus::Error);
            assert!(snapshot.error.unwrap().contains("no direct media URL"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_job_polls_as_unknown() {
        let manager = DownloadManager::new(Handle::current());
        let snapshot = manager.status("never-started");
        assert_eq!(snapshot.status, JobStatus::Unknown);
        assert!(snapshot.progress.is_none());
        assert!(snapshot.path.is_none());
        assert!(snapshot.error.is_none());
    }
}
