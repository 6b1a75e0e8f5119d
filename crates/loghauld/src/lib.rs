//! loghauld - the loghaul shipper daemon
//!
//! One consumer loop per owned (topic, kafka-partition) pulls batches,
//! derives logical partitions from message content, appends records to
//! local staging files, and hands sealed files to the uploader. Consumed
//! offsets advance in the offset store only after every upload of a flush
//! cycle succeeded, which makes delivery at-least-once with idempotent
//! object names.
//!
//! ```text
//! ┌────────────┐   ┌────────┐   ┌──────────┐   ┌──────────┐
//! │  consumer  │──▶│ parser │──▶│ registry │──▶│ uploader │──▶ blob store
//! │  loop      │   └────────┘   │ (local   │   └────┬─────┘
//! └────────────┘                │  files)  │        ▼
//!                               └──────────┘   offset store
//! ```

pub mod consumer;
pub mod orphan;
pub mod policy;
pub mod registry;
pub mod supervisor;
pub mod tracker;
pub mod uploader;

pub use consumer::{ConsumerLoop, Control, LoopCounters, LoopOutcome, MemorySource, MessageSource};
pub use policy::{CommitPolicy, FlushReason};
pub use registry::{FileRegistry, RegistryEntry};
pub use supervisor::{
    discover_staged_partitions, EmptySourceFactory, PartitionAssignment, SourceFactory, Supervisor,
};
pub use tracker::{LoopState, PartitionTracker};
pub use uploader::{UploadCycle, Uploader};
