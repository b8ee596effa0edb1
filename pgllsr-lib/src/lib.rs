//! # PostgreSQL Logical Stream Reader
//!
//! A Change Data Capture (CDC) client for PostgreSQL logical replication
//! slots. It drives an external reader process attached to the slot,
//! decodes the framed `decoderbufs` records the reader writes to its
//! standard output, and hands them to the application as typed
//! [`ChangeEvent`]s stamped with their log position.
//!
//! ## Features
//!
//! - Reader process lifecycle with graceful, bounded shutdown
//! - Incremental frame decoding that tolerates arbitrarily chunked reads
//! - Bounded event channel for backpressure against slow consumers
//! - Single-shot completion outcome that separates a requested stop from a failure
//! - Log position codec (`X/YYYYYYYY`) and a persisted resume checkpoint
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pgllsr_lib::{ConnectionConfig, LogPos, Stream};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("postgres");
//!     let mut stream = Stream::new(config, "llsr_slot", "0/243C4C60".parse::<LogPos>()?);
//!     stream.start()?;
//!
//!     while let Some(event) = stream.data().recv().await {
//!         tracing::info!("{} {} at {}", event.operation, event.table_name(), event.position);
//!         if event.position >= LogPos(0x1_0000_0000) {
//!             stream.stop();
//!         }
//!     }
//!
//!     stream.finished().await?;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod env;
pub mod error;
pub mod lsn;
pub mod proto;
pub mod stream;
pub mod types;

pub use checkpoint::{Checkpoint, PositionCheckpoint};
pub use config::{
    validate_slot_name, ConnectionConfig, ConnectionConfigBuilder, ReaderCommand, StreamOptions,
};
pub use decoder::FrameDecoder;
pub use env::{load_config_from_env, AppConfig};
pub use error::CdcError;
pub use lsn::LogPos;
pub use stream::{Stream, StreamState};
pub use types::{ChangeEvent, Column, ColumnValue, Operation};

pub type CdcResult<T> = Result<T, CdcError>;
