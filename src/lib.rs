#![forbid(unsafe_code)]

//! Shared building blocks for the xTap companion binaries: the
//! native-messaging host (`xtap_host`) and the loopback HTTP daemon
//! (`xtap_daemon`). Both are thin transports over the same record store,
//! message dispatch, and download manager.

pub mod config;
pub mod download;
pub mod framing;
pub mod security;
pub mod service;
pub mod store;
