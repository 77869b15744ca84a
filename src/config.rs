#![forbid(unsafe_code)]

//! Runtime configuration shared by the host and daemon binaries.
//!
//! Everything is resolved from a couple of environment variables plus fixed
//! defaults under the user's home directory; there is no config file. The
//! environment lookup is injectable so tests never touch process globals.

use anyhow::{Result, anyhow};
use std::env;
use std::path::{Path, PathBuf};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The daemon only ever binds loopback; the extension talks to it locally.
pub const BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 17381;

const OUTPUT_DIR_VAR: &str = "XTAP_OUTPUT_DIR";
const PORT_VAR: &str = "XTAP_PORT";
const XTAP_HOME_DIR: &str = ".xtap";
const SECRET_FILE: &str = "secret";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default directory for records, logs, and videos. Messages may point
    /// individual writes elsewhere via `outputDir`.
    pub output_dir: PathBuf,
    /// `~/.xtap` — holds the pre-shared secret written by the installer.
    pub xtap_home: PathBuf,
    /// Port the HTTP daemon listens on (and the port `GET_TOKEN` reports).
    pub port: u16,
}

impl RuntimeConfig {
    pub fn secret_path(&self) -> PathBuf {
        self.xtap_home.join(SECRET_FILE)
    }
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    build_runtime_config(env_var_string)
}

fn build_runtime_config(env_lookup: impl Fn(&str) -> Option<String>) -> Result<RuntimeConfig> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;

    let output_dir = env_lookup(OUTPUT_DIR_VAR)
        .map(|value| expand_user(&value))
        .unwrap_or_else(|| home.join("Downloads").join("xtap"));

    let port = env_lookup(PORT_VAR)
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    Ok(RuntimeConfig {
        output_dir,
        xtap_home: home.join(XTAP_HOME_DIR),
        port,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Expands a leading `~` or `~/` to the user's home directory. Paths without
/// the shorthand (and paths like `~other`) are returned unchanged.
pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    Path::new(path).to_path_buf()
}
