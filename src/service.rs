#![forbid(unsafe_code)]

//! The service context shared by both transports, plus the stream-side
//! message dispatch.
//!
//! One [`Service`] is constructed at startup and threaded through every
//! request handler; there is no module-level state. The HTTP daemon calls
//! the typed operations directly (it owns its own status codes); the
//! native-messaging host goes through [`Service::handle_message`], which
//! folds any failure into an in-band `{ok:false, error}` reply so a bad
//! request never kills the framed loop.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tracing::debug;
use uuid::Uuid;

use crate::config::{RuntimeConfig, expand_user};
use crate::download::{DownloadManager, FetchRequest, JobSnapshot, VIDEOS_SUBDIR};
use crate::framing;
use crate::security;
use crate::store::Store;

pub struct Service {
    config: RuntimeConfig,
    store: Store,
    downloads: DownloadManager,
}

impl Service {
    pub fn new(config: RuntimeConfig, runtime: Handle) -> Self {
        let store = Store::new(config.output_dir.clone());
        Self {
            config,
            store,
            downloads: DownloadManager::new(runtime),
        }
    }

    /// Builds a service around an existing download manager, letting callers
    /// (and tests) pick the downloader binary.
    pub fn with_downloads(config: RuntimeConfig, downloads: DownloadManager) -> Self {
        let store = Store::new(config.output_dir.clone());
        Self {
            config,
            store,
            downloads,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    /// Reads the shared secret on demand. Must work even when the output
    /// directory is unreachable, so it deliberately never touches the store.
    pub fn token_info(&self) -> Result<(String, u16)> {
        let token = security::load_token(&self.config.secret_path())?;
        Ok((token, self.config.port))
    }

    /// Dedup-and-append for one batch of records. Returns
    /// `(written, duplicates)`.
    pub fn write_records(&self, requested_dir: &str, records: &[Value]) -> Result<(usize, usize)> {
        let dir = self.store.resolve_dir(requested_dir)?;
        self.store.write_records(&dir, records)
    }

    pub fn write_log(&self, requested_dir: &str, lines: &[String]) -> Result<usize> {
        let dir = self.store.resolve_dir(requested_dir)?;
        self.store.write_log_lines(&dir, lines)
    }

    pub fn write_dump(&self, requested_dir: &str, filename: &str, content: &str) -> Result<PathBuf> {
        let dir = self.store.resolve_dir(requested_dir)?;
        self.store.write_dump(&dir, filename, content)
    }

    /// Writability probe. Resolves the path without the seen-id bootstrap:
    /// the probe must not pay for a scan it does not need.
    pub fn test_path(&self, requested_dir: &str) -> Result<()> {
        let requested = requested_dir.trim();
        let dir = if requested.is_empty() {
            self.store.default_dir().to_path_buf()
        } else {
            expand_user(requested)
        };
        self.store.test_writable(&dir)
    }

    pub fn check_downloader(&self) -> bool {
        self.downloads.ytdlp_available()
    }

    /// Starts a background download and returns its freshly minted job id.
    pub fn start_download(
        &self,
        requested_dir: &str,
        tweet_url: &str,
        direct_url: Option<&str>,
        post_date: &str,
    ) -> Result<String> {
        let dir = self.store.resolve_dir(requested_dir)?;
        let job_id = Uuid::new_v4().to_string();
        let request = FetchRequest {
            tweet_url: tweet_url.to_string(),
            direct_url: direct_url
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
            post_date: post_date.to_string(),
            videos_dir: dir.join(VIDEOS_SUBDIR),
        };
        self.downloads.start(job_id.clone(), request);
        Ok(job_id)
    }

    pub fn download_status(&self, job_id: &str) -> JobSnapshot {
        self.downloads.status(job_id)
    }

    /// Stream-side dispatch: routes one decoded message by its `type` field
    /// and always produces an in-band response.
    pub fn handle_message(&self, message: &Value) -> Value {
        let kind = message.get("type").and_then(Value::as_str).unwrap_or("");
        debug!(kind = if kind.is_empty() { "TWEETS" } else { kind }, "handling message");
        let result = match kind {
            "GET_TOKEN" => self.handle_get_token(),
            "TEST_PATH" => self.handle_test_path(message),
            "DUMP" => self.handle_dump(message),
            "LOG" => self.handle_log(message),
            "CHECK_YTDLP" => Ok(json!({"ok": true, "available": self.check_downloader()})),
            "DOWNLOAD_VIDEO" => self.handle_download_video(message),
            "DOWNLOAD_STATUS" => Ok(self.handle_download_status(message)),
            _ => self.handle_tweets(message),
        };
        result.unwrap_or_else(|err| json!({"ok": false, "error": err.to_string()}))
    }

    fn handle_get_token(&self) -> Result<Value> {
        let (token, port) = self.token_info()?;
        Ok(json!({"ok": true, "token": token, "port": port}))
    }

    fn handle_test_path(&self, message: &Value) -> Result<Value> {
        self.test_path(requested_dir(message))?;
        Ok(json!({"ok": true, "type": "TEST_PATH"}))
    }

    fn handle_dump(&self, message: &Value) -> Result<Value> {
        let filename = str_field(message, "filename").unwrap_or("dump.json");
        let content = str_field(message, "content").unwrap_or("");
        let path = self.write_dump(requested_dir(message), filename, content)?;
        Ok(json!({"ok": true, "path": path.display().to_string()}))
    }

    fn handle_log(&self, message: &Value) -> Result<Value> {
        let lines = string_array(message, "lines");
        let logged = self.write_log(requested_dir(message), &lines)?;
        Ok(json!({"ok": true, "logged": logged}))
    }

    fn handle_tweets(&self, message: &Value) -> Result<Value> {
        let records = message
            .get("tweets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let (count, dupes) = self.write_records(requested_dir(message), &records)?;
        Ok(json!({"ok": true, "count": count, "dupes": dupes}))
    }

    fn handle_download_video(&self, message: &Value) -> Result<Value> {
        let job_id = self.start_download(
            requested_dir(message),
            str_field(message, "tweetUrl").unwrap_or(""),
            str_field(message, "directUrl"),
            str_field(message, "postDate").unwrap_or(""),
        )?;
        Ok(json!({"ok": true, "downloadId": job_id}))
    }

    fn handle_download_status(&self, message: &Value) -> Value {
        let snapshot = self.download_status(str_field(message, "downloadId").unwrap_or(""));
        let mut response = json!({"ok": true});
        if let (Some(response), Ok(Value::Object(fields))) =
            (response.as_object_mut(), serde_json::to_value(&snapshot))
        {
            response.extend(fields);
        }
        response
    }
}

/// The `outputDir` field of a message; empty string when absent.
pub fn requested_dir(message: &Value) -> &str {
    str_field(message, "outputDir").unwrap_or("")
}

fn str_field<'a>(message: &'a Value, key: &str) -> Option<&'a str> {
    message.get(key).and_then(Value::as_str)
}

/// Log lines as strings; non-string entries are serialized rather than
/// dropped, so a buggy extension build still leaves a trace.
pub fn string_array(message: &Value, key: &str) -> Vec<String> {
    message
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .map(|value| match value {
                    Value::String(line) => line.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Runs the framed request/response loop until the peer closes the stream.
/// Handler failures are answered in-band; only transport failures (a
/// malformed frame, a broken pipe) end the loop with an error.
pub fn run_stream_loop<R: Read, W: Write>(
    service: &Service,
    reader: &mut R,
    writer: &mut W,
) -> Result<()> {
    while let Some(message) = framing::read_frame(reader)? {
        let response = service.handle_message(&message);
        framing::write_frame(writer, &response)?;
    }
    Ok(())
}
