//! # syncit-collab — Collaborative editing session engine
//!
//! Keeps one live, in-memory editing session per open file, fans every
//! change out to all subscribers of that file's topic, and flushes content
//! to persistence when the file is closed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   JSON commands    ┌─────────────┐
//! │  Client(s)  │ ◄────────────────► │ SyncServer  │
//! └─────────────┘     WebSocket      └──────┬──────┘
//!                                           │ open / edit / close
//!                                           ▼
//!                                    ┌─────────────┐      ┌──────────────────┐
//!                                    │   Router    │ ───► │ PersistenceGateway│
//!                                    └──┬───────┬──┘      └──────────────────┘
//!                                       │       │
//!                          ┌────────────┘       └───────────┐
//!                          ▼                                ▼
//!                 ┌─────────────────┐              ┌─────────────┐
//!                 │ SessionRegistry │              │  TopicHub   │
//!                 │ (one per file)  │              │  (fan-out)  │
//!                 └─────────────────┘              └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] — Per-file content buffer with a try-only gate
//! - [`registry`] — Atomic get-or-create map of live sessions
//! - [`protocol`] — Frames, destinations and client/server commands
//! - [`broadcast`] — Per-file topic fan-out
//! - [`router`] — Open / edit / close handling and shutdown flush
//! - [`storage`] — Persistence gateway with memory and RocksDB stores
//! - [`runner`] — Sandboxed code execution
//! - [`server`] — WebSocket transport

pub mod session;
pub mod registry;
pub mod protocol;
pub mod broadcast;
pub mod router;
pub mod storage;
pub mod runner;
pub mod server;

// Re-exports for convenience
pub use session::{FileId, ReplaceOutcome, Session, SessionGate};
pub use registry::SessionRegistry;
pub use protocol::{
    ClientCommand, Destination, EditFrame, EventKind, Frame, FrameError, OpenResponse,
    ServerMessage,
};
pub use broadcast::{Topic, TopicHub, TopicStats};
pub use router::{CloseOutcome, Router, RouterError, ShutdownReport};
pub use storage::{
    FileMetadata, MemoryStore, PersistenceError, PersistenceGateway, RocksStore, StoreConfig,
};
pub use runner::{
    CodeExecutor, CodeRunner, DockerConfig, DockerExecutor, Language, RunError, RunOutput,
    RunRequest,
};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
