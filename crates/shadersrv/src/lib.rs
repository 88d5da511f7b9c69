#![forbid(unsafe_code)]
//! Remote shader-compilation service.
//!
//! Game clients upload shader source plus a compile descriptor over a framed
//! TCP protocol; the server shells out to the platform's shader compiler and
//! returns the deflated binary. A two-level content-addressed cache
//! deduplicates repeat requests and survives restarts through an append-only
//! log; a shader-list store records every permutation clients have ever
//! asked for; overflow load can be forwarded to fallback peers.
//!
//! The interesting pieces:
//! - [`codec::FramedStream`]: length-prefixed frames with the legacy
//!   endian-flag handshake.
//! - [`cache::CompileCache`]: dedup maps, pending-append queue, crash
//!   tolerant load with backup rotation.
//! - [`shaderlist::ShaderListStore`]: validated, deduped permutation lists
//!   with atomic merged saves.
//! - [`jobs::compile`]: cache lookup, fallback forwarding, command
//!   assembly, and the compiler subprocess.
//! - [`server::Server`]: admission-gated accept loop plus the tick worker.

pub mod allowlist;
pub mod cache;
pub mod codec;
pub mod compress;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod error_log;
pub mod hash;
pub mod jobs;
pub mod process;
pub mod protocol;
pub mod server;
pub mod shaderlist;
pub mod status;

pub use config::Config;
pub use error::ServerError;
pub use hash::Fingerprint;
pub use protocol::{JobState, ProtocolVersion};
pub use server::Server;
