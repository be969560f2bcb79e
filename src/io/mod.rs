//! Streaming I/O adapters
//!
//! ```text
//!  staging store ──load/fetch──▶ queue ──▶ compute ──▶ queue ──cache──▶ staging store
//!  backend ──ObjectInputStream──▶ queue          queue ──ObjectOutputStream──▶ backend
//! ```

pub mod stream;
pub mod workers;

pub use stream::{ObjectInputStream, ObjectOutputStream};
pub use workers::{
    cache_worker, fetch_worker, load_worker, select_cache_worker, KeyRange,
};
