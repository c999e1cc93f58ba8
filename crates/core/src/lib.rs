//! `relq-core` — reliable queue building blocks.
//!
//! This crate contains **pure** primitives (no store or runtime concerns):
//! the message package and its codec, the key layout, the error taxonomy and
//! the retry/failure decision.

pub mod error;
pub mod id;
pub mod keys;
pub mod package;
pub mod retry;

pub use error::{CodecError, FailureKind, HandlerError, HandlerResult};
pub use id::PackageId;
pub use keys::{DEFAULT_PREFIX, QueueKeys};
pub use package::Package;
pub use retry::{Disposition, FailureHook, RetryDecider, failure_hook};
