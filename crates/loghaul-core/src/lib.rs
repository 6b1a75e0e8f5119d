//! loghaul-core - domain types for the loghaul log shipper
//!
//! This crate holds everything the shipper daemon and the storage drivers
//! share: the log-file addressing scheme, message parsing, file codecs,
//! offset bookkeeping, configuration and retry primitives.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      loghauld (daemon)                   │
//! │  registry, tracker, policy, uploader, consumer loop      │
//! ├──────────────────────────────────────────────────────────┤
//! │                      loghaul-core                        │
//! │  LogFilePath, MessageParser, FileCodec, OffsetStore,     │
//! │  ShipperConfig, retry                                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                      loghaul-storage                     │
//! │  BlobStore (local, memory, s3)                           │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod offset;
pub mod parser;
pub mod path;
pub mod retry;

pub use clock::Clock;
pub use config::ShipperConfig;
pub use error::{Result, ShipperError};
pub use message::{KeyValue, Message, ParsedMessage};
pub use path::{LogFilePath, RenderContext};
