//! Media ingestion and enrichment for a browsable audiovisual library.
//!
//! Files under a media root are discovered, probed for tags and thumbnails,
//! scored for visible faces and recorded in a SQLite catalogue that a
//! separate web front-end reads.

pub mod config;
pub mod db;
pub mod error;
pub mod faces;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod scanner;
pub mod tasks;

pub use config::Config;
pub use db::Catalogue;
pub use error::ProbeError;
pub use pipeline::Pipeline;
