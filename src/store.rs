#![forbid(unsafe_code)]

//! Append-only record storage with in-memory deduplication.
//!
//! Records land in one JSON-lines file per local calendar day
//! (`tweets-YYYY-MM-DD.jsonl`). Dedup state is a single id set shared across
//! every output directory used in a session, plus a registry of custom
//! directories whose existing files have already been scanned. One mutex
//! guards the whole thing; file appends happen under the same lock so
//! concurrent HTTP requests cannot interleave writes.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Local;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::config::expand_user;

const RECORD_FILE_PREFIX: &str = "tweets-";
const RECORD_FILE_SUFFIX: &str = ".jsonl";
const LOG_FILE_PREFIX: &str = "debug-";
const LOG_FILE_SUFFIX: &str = ".log";
const WRITE_TEST_FILE: &str = ".xtap-write-test";

pub struct Store {
    default_dir: PathBuf,
    state: Mutex<DedupState>,
}

struct DedupState {
    /// Ids of every record already on disk in any bootstrapped directory,
    /// plus everything written this session.
    seen: HashSet<String>,
    /// Custom directories whose existing files have been scanned. Gates the
    /// one-time bootstrap so repeat use of a directory costs nothing.
    bootstrapped: HashSet<PathBuf>,
    default_loaded: bool,
}

impl Store {
    pub fn new(default_dir: PathBuf) -> Self {
        Self {
            default_dir,
            state: Mutex::new(DedupState {
                seen: HashSet::new(),
                bootstrapped: HashSet::new(),
                default_loaded: false,
            }),
        }
    }

    pub fn default_dir(&self) -> &Path {
        &self.default_dir
    }

    /// Creates the default directory and scans its existing records into the
    /// seen set, once per process. Deferred until the first message that
    /// actually needs storage, so a token-only host session never touches
    /// the filesystem.
    pub fn ensure_default_loaded(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_default_loaded_locked(&mut state)
    }

    fn ensure_default_loaded_locked(&self, state: &mut DedupState) -> Result<()> {
        if state.default_loaded {
            return Ok(());
        }
        fs::create_dir_all(&self.default_dir).with_context(|| {
            format!(
                "creating default output directory {}",
                self.default_dir.display()
            )
        })?;
        let ids = load_seen_ids(&self.default_dir);
        debug!(
            count = ids.len(),
            dir = %self.default_dir.display(),
            "bootstrapped default output directory"
        );
        state.seen.extend(ids);
        state.default_loaded = true;
        Ok(())
    }

    /// Resolves a message's `outputDir` to an absolute directory, creating it
    /// if needed. The first time a custom directory is seen this session its
    /// existing record ids are merged into the seen set; later calls skip
    /// the scan.
    pub fn resolve_dir(&self, requested: &str) -> Result<PathBuf> {
        let mut state = self.state.lock();
        self.ensure_default_loaded_locked(&mut state)?;

        let requested = requested.trim();
        if requested.is_empty() {
            return Ok(self.default_dir.clone());
        }

        let dir = expand_user(requested);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        if dir != self.default_dir && !state.bootstrapped.contains(&dir) {
            let ids = load_seen_ids(&dir);
            debug!(
                count = ids.len(),
                dir = %dir.display(),
                "bootstrapped custom output directory"
            );
            state.seen.extend(ids);
            state.bootstrapped.insert(dir.clone());
        }
        Ok(dir)
    }

    /// Appends records to today's file, skipping ids already seen. Records
    /// flagged `is_article` bypass the dedup check but still register their
    /// id; records without an id are always written. Returns
    /// `(written, duplicates)`.
    pub fn write_records(&self, dir: &Path, records: &[Value]) -> Result<(usize, usize)> {
        let mut state = self.state.lock();
        let path = dir.join(format!(
            "{RECORD_FILE_PREFIX}{}{RECORD_FILE_SUFFIX}",
            today()
        ));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;

        let mut written = 0;
        let mut duplicates = 0;
        for record in records {
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty());
            let exempt = record
                .get("is_article")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            if let Some(id) = id {
                if !exempt && state.seen.contains(id) {
                    duplicates += 1;
                    continue;
                }
                state.seen.insert(id.to_string());
            }

            // serde_json keeps non-ASCII text unescaped, matching the
            // on-disk format the extension's viewers expect.
            serde_json::to_writer(&mut file, record)
                .with_context(|| format!("writing record to {}", path.display()))?;
            file.write_all(b"\n")
                .with_context(|| format!("writing record to {}", path.display()))?;
            written += 1;
        }
        Ok((written, duplicates))
    }

    /// Appends debug lines to today's log file. No dedup, no validation.
    pub fn write_log_lines(&self, dir: &Path, lines: &[String]) -> Result<usize> {
        let _state = self.state.lock();
        let path = dir.join(format!("{LOG_FILE_PREFIX}{}{LOG_FILE_SUFFIX}", today()));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        for line in lines {
            file.write_all(line.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .with_context(|| format!("writing log line to {}", path.display()))?;
        }
        Ok(lines.len())
    }

    /// Overwrites a named diagnostic file with raw content and returns its
    /// path. The filename must be a plain name, not a path.
    pub fn write_dump(&self, dir: &Path, filename: &str, content: &str) -> Result<PathBuf> {
        let name = Path::new(filename);
        let mut components = name.components();
        let valid = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !valid {
            bail!("invalid dump filename: {filename}");
        }

        let _state = self.state.lock();
        let path = dir.join(name);
        fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Probes that `dir` exists (creating it if needed) and is writable by
    /// writing and removing a marker file.
    pub fn test_writable(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        let marker = dir.join(WRITE_TEST_FILE);
        fs::write(&marker, "ok")
            .with_context(|| format!("writing marker file {}", marker.display()))?;
        fs::remove_file(&marker)
            .with_context(|| format!("removing marker file {}", marker.display()))?;
        Ok(())
    }
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Collects record ids from every daily file in `dir`. Malformed lines and
/// records without an id are skipped; a missing or unreadable directory
/// yields an empty set. Deliberately infallible — a corrupt old file must
/// never block new captures.
pub fn load_seen_ids(dir: &Path) -> HashSet<String> {
    let mut seen = HashSet::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return seen;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(RECORD_FILE_PREFIX) || !name.ends_with(RECORD_FILE_SUFFIX) {
            continue;
        }
        let Ok(file) = fs::File::open(entry.path()) else {
            continue;
        };
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(record) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if let Some(id) = record.get("id").and_then(Value::as_str) {
                if !id.is_empty() {
                    seen.insert(id.to_string());
                }
            }
        }
    }
    seen
}
