//! # Hubfile Core Library
//!
//! `hubfile-core` is a peer-to-peer file transfer engine that rides on a
//! hub-routed message bus. Nodes address each other by numeric id and the
//! hub forwards frames between them; this crate adds the file sub-protocol
//! on top.
//!
//! ## Features
//!
//! - **Pull and offer**: fetch a file from a peer, or push one to it
//! - **Resumable**: interrupted downloads continue from their `.part` file
//! - **Integrity-checked**: optional SHA-256 verified before the final rename
//! - **Reorder tolerant**: a bounded buffer absorbs out-of-order data frames
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`digest`] - SHA-256 helpers for whole files and resumed prefixes
//! - [`events`] - Observer events published by the engine
//! - [`local`] - Local directory listing and text previews
//! - [`path`] - Path and name sanitization
//! - [`protocol`] - Control envelope and binary data/ack framing
//! - [`transfer`] - The transfer engine (`FileService`)
//! - [`transport`] - The session/transport interface the engine consumes
//!
//! ## Example
//!
//! ```rust,ignore
//! use hubfile_core::{config::FileConfig, transfer::FileService};
//!
//! let service = FileService::new(transport, FileConfig::default());
//! service.set_identity(7, 1);
//! tokio::spawn(service.clone().run(session_events));
//!
//! service.start_pull(42, "docs", "report.pdf", "", "", true).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod digest;
pub mod error;
pub mod events;
pub mod local;
pub mod path;
pub mod protocol;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sub-protocol number the file service listens on.
pub const SUB_PROTO_FILE: u8 = 5;

/// Default chunk size for data frames (256 KB)
pub const DEFAULT_CHUNK_BYTES: usize = 256 * 1024;

/// Default base directory for served and received files
pub const DEFAULT_BASE_DIR: &str = "./file";

/// Suffix appended to staging files while a download is in flight
pub const PART_SUFFIX: &str = ".part";
