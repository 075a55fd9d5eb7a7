//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.

/// `Lsn` type implements common tasks on Log Sequence Numbers
pub mod lsn;

/// 128-bit tenant and timeline identifiers
pub mod id;

/// Retries with exponential backoff
pub mod backoff;

/// Polling waits with a bounded number of attempts
pub mod wait;

pub mod http;

pub mod logging;

/// Helpers for making file and directory creation crash-safe
pub mod crashsafe;

pub mod fs_ext;
