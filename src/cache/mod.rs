//! Local pokemon cache.
//!
//! Rows are keyed by name and written with insert-or-replace semantics, so
//! repeated upserts of the same pokemon are idempotent. Pages are read back in
//! id order, matching the order in which the remote API lists them.

mod row;
mod storage;

pub use row::PokemonRow;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
