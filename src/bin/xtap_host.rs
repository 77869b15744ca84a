#![forbid(unsafe_code)]

//! xTap native-messaging host.
//!
//! Launched by the browser, which owns both ends of the pipe: framed JSON
//! requests arrive on stdin and framed responses leave on stdout, strictly
//! one at a time. Downloads are the only concurrent work, so a small tokio
//! runtime exists purely to carry them while the loop stays blocking.

use std::io;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use xtap_tools::config::load_runtime_config;
use xtap_tools::security::ensure_not_root;
use xtap_tools::service::{Service, run_stream_loop};

fn main() -> Result<()> {
    // stdout belongs to the framing protocol; all logging goes to stderr,
    // where the browser's native-messaging log collects it.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("XTAP_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    ensure_not_root("xtap_host")?;
    let config = load_runtime_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building download runtime")?;
    let service = Service::new(config, runtime.handle().clone());

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();
    run_stream_loop(&service, &mut reader, &mut writer)
}
