//! Fixed-capacity concurrent hash map shared across processes over a
//! memory-mapped file.
//!
//! All map state (header, hash directory, bucket arena) lives inside a
//! single mapped region, so every process opening the same file sees the
//! same contents. Reads are lock-free; writers serialize per hash chain
//! through a sequence lock embedded in the region; bucket allocation is a
//! wait-free free-list-plus-watermark scheme. Capacity is fixed at
//! creation and the file layout is host-endian (not portable across
//! architectures).
//!
//! ```no_run
//! use std::time::Duration;
//! use shmap::Map;
//!
//! # fn main() -> Result<(), shmap::Error> {
//! let map = Map::create("/dev/shm/example.db", 1024, 15, 16, 0, Duration::from_secs(1))?;
//! let mut value = map.get(b"counter", true)?;
//! value[0] = value[0].wrapping_add(1);
//! # Ok(())
//! # }
//! ```

mod arena;
mod error;
mod layout;
mod lock;
mod map;
mod region;

pub use error::Error;
pub use layout::{MAX_BUCKET_SIZE, MAX_KEY_SIZE, MAX_MAP_CAP, MIN_KEY_SIZE};
pub use map::{Map, ValueRef, DEFAULT_MAX_TRY};
