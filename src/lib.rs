//! Shadow file store.
//!
//! A background context intercepts requests and, when a locally stored
//! response exists for the request identity, serves it instead of the
//! network. Pages create, delete and query those responses over a small
//! correlated message protocol.

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod interceptor;
pub mod logging;
pub mod network;
pub mod page;
pub mod protocol;
pub mod registry;
pub mod worker;

pub use client::{RegisterOptions, Registrar, Registration, ShadowFiles, WorkerState};
pub use error::ClientError;
pub use host::{FetchOutcome, HostHandle, WorkerHost};
pub use page::PageClient;
pub use worker::{BackgroundContext, ShadowWorker};
