//! Fstat layer for o4.
//!
//! Everything that touches file *metadata* lives here: the one-line record
//! codec, the per-directory `.o4/` cache store, the merge iterator that
//! combines the remote fstat service, Perforce, and prior caches into a
//! single monotonic stream, and the package lock for shared cache
//! directories.

pub mod cache;
pub mod error;
pub mod lock;
pub mod merge;
pub mod record;
pub mod server;

pub use error::FstatError;
pub use merge::{FstatMerge, MergeOptions};
pub use record::{FstatRecord, Line, PassKind, Revision};
