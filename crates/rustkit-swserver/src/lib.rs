//! # RustKit Service Worker Server
//!
//! Registration and lifecycle coordinator for service workers in the RustKit
//! browser engine. One [`SwServer`] serves a browsing session: it serializes
//! register/update/unregister jobs per scope, drives workers through
//! install and activate, tracks which clients each worker controls and
//! relays every outcome back to the client process that asked.
//!
//! ## Features
//!
//! - **Jobs**: per-scope FIFO queues; scopes never wait on each other
//! - **Lifecycle**: parsed → installing → installed → activating → activated
//! - **Clients**: controller tracking, `claim()`, `matchAll()`, `ready`
//! - **Idle termination**: workers stop once their origin has no clients
//! - **Persistence**: registrations survive restarts through a store
//!
//! ## Architecture
//!
//! ```text
//! client process ──ClientRequest──▶ ┌──────────────────────────┐ ──ContextCommand──▶ engine
//!        ◀────────ClientMessage──── │ SwServer                 │ ◀──ContextEvent────
//!                                   │   registrations (scope)  │
//!                                   │   ├── by id index        │
//!                                   │   job queues (scope)     │
//!                                   │   workers                │
//!                                   │   ClientRegistry         │
//!                                   └────────────┬─────────────┘
//!                                                │
//!                                        RegistrationStore
//! ```
//!
//! The core is synchronous and single-threaded. [`runtime::spawn`] runs it on
//! a tokio task; [`SwServerPool`] owns every session's coordinator.

pub mod clients;
pub mod config;
pub mod connection;
pub mod error;
pub mod job;
pub mod logging;
pub mod pool;
pub mod registration;
pub mod runtime;
pub mod server;
pub mod store;
pub mod types;
pub mod worker;

pub use clients::{ClientRegistry, RegisteredClient};
pub use config::{LogSettings, SwServerConfig};
pub use connection::{
    ChannelConnection, ChannelContext, ClientMessage, ClientTransport, ContextCommand,
    ContextTransport,
};
pub use error::{ConfigError, ServiceWorkerError, StoreError};
pub use job::{JobData, JobQueue, JobStep, JobType};
pub use logging::{init_logging, server_span, LogConfig, LogFormat};
pub use pool::SwServerPool;
pub use registration::Registration;
pub use runtime::{spawn, ServerCommand, SwServerHandle};
pub use server::{
    ClientRequest, ContextEvent, PersistenceStatus, RunWorkerCallback, ServerNotice, SwServer,
    TerminationMode,
};
pub use store::{JsonFileStore, MemoryStore, RegistrationRecord, RegistrationStore};
pub use types::*;
pub use worker::{Worker, WorkerRunState};
