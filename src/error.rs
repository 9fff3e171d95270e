use std::io;

/// Errors surfaced by map creation and map operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `map_cap` is zero or above [`MAX_MAP_CAP`](crate::MAX_MAP_CAP).
    #[error("map capacity too large or too small")]
    MapCap,

    /// `key_len` is outside the accepted `[MIN_KEY_SIZE - 1, MAX_KEY_SIZE - 1]` range.
    #[error("key too long or too short")]
    KeyLen,

    /// `value_len` would push the bucket stride past [`MAX_BUCKET_SIZE`](crate::MAX_BUCKET_SIZE).
    #[error("value too large or too small")]
    ValLen,

    /// Reopened an existing file whose header geometry does not match the
    /// requested parameters.
    #[error("database size mismatch")]
    DbSize,

    /// Lookup without `add` found no matching key.
    #[error("key not found in map")]
    KeyNot,

    /// The arena is exhausted: no free-list entry and the watermark reached
    /// capacity, with no concurrent mutation left to observe.
    #[error("no more space in map")]
    DbFull,

    /// The per-operation retry budget ran out under contention.
    #[error("cannot finish after too many tries")]
    TryEnd,

    /// Error from the backing file or mapping.
    #[error(transparent)]
    Io(#[from] io::Error),
}
