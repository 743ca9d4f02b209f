//! # Frontier Worker
//!
//! The hub of a distributed crawl frontier. Crawler processes report what
//! they fetched, a scoring component reports priority changes, and the
//! worker turns both into backend calls and publishes new batches of
//! requests for the crawlers, partitioned so each domain lands on one
//! crawler.
//!
//! ```text
//!  incoming stream ──► IncomingPipeline ──┐
//!                                          ├──► FrontierBackend
//!  scoring stream ───► ScoringPipeline ───┘         │
//!                                                    │ get_next_requests
//!  outgoing lag ─────► BatchGenerator ◄──────────────┘
//!                           │
//!                           ▼
//!                    outgoing stream (keyed by domain)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One generation** - results tagged with an older job id never reach
//!    the backend
//! 2. **Backpressure** - batches only go to partitions whose lag is under
//!    the request ceiling
//! 3. **Stable placement** - a domain maps to the same partition on every
//!    instance
//! 4. **Liveness** - a failing duty is retried within the watchdog interval
//!
//! The [`scheduler`] drives all three duties from a single future, so they
//! never overlap and share worker state without locks.

pub mod backend;
pub mod batch;
pub mod bus;
pub mod codec;
pub mod config;
pub mod control;
pub mod incoming;
pub mod lag;
pub mod memory;
pub mod messages;
pub mod partitioner;
pub mod scheduler;
pub mod scoring;
pub mod stats;
pub mod types;
pub mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::FrontierBackend;
pub use batch::{BatchGenerator, BatchReport, PartitionKey};
pub use bus::{BusError, BusMessage, OffsetFetcher, StreamConsumer, StreamProducer};
pub use codec::{Codec, CodecError, JsonCodec};
pub use config::{BusLocation, Cli, WorkerConfig};
pub use incoming::{IncomingPipeline, IncomingReport};
pub use lag::{LagMonitor, PartitionLags};
pub use messages::FrontierMessage;
pub use partitioner::{Crc32NamePartitioner, FingerprintPartitioner, PartitionError, Partitioner};
pub use scheduler::{
    ControlCommand, Duty, DutySwitches, Lifecycle, Scheduler, SchedulerConfig, SchedulerHandle,
    SchedulerStatus,
};
pub use scoring::{ScoringPipeline, ScoringReport};
pub use stats::WorkerStats;
pub use types::{JobId, Request, Response, ScoreBatch, ScoreUpdate};
pub use worker::{BusClients, FrontierWorker};
