//! Remote job runner: launch arbitrary commands on a Linux host, constrain
//! them with cgroup v1 controllers, and tail their output live from any
//! number of clients.
//!
//! The crate is both a library (the job engine: supervisor, cgroup
//! controller, log fan-out, registry) and a binary that serves the engine
//! over mutually-authenticated gRPC. The same binary doubles as the
//! trampoline that re-executes itself to enrol a job into its cgroup
//! before the user command runs.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use jobworker::{CancellationToken, Job};
//!
//! # #[tokio::main]
//! # async fn main() -> jobworker::Result<()> {
//! let job = Arc::new(Job::builder("echo", vec!["hi".into()]).build());
//! job.start()?;
//! job.done().await;
//!
//! let mut out = job.stream_stdout(CancellationToken::new())?;
//! while let Some(chunk) = out.recv().await {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cgroup;
pub mod client;
pub mod config;
pub mod error;
mod hub;
pub mod job;
pub mod limits;
mod logstream;
pub mod reexec;
pub mod registry;
mod replay;
pub mod server;

/// Generated protobuf / gRPC types.
pub mod pb {
    tonic::include_proto!("jobworker.v1");
}

pub use error::{Error, Result};
pub use job::{Job, JobBuilder, JobState, JobStatus};
pub use limits::Limits;
pub use registry::Registry;

/// Re-export the cancel token type for convenience.
pub use tokio_util::sync::CancellationToken;
