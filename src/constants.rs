use std::num::NonZeroUsize;

pub const DEFAULT_INDEXER_NAME: &str = "seqidx";

/// Heights of block signatures kept behind a retention boundary.
pub const DEFAULT_SIGNATURE_RETENTION: u32 = 100;

pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_IDENTITY_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(5000) {
    Some(n) => n,
    None => panic!("cache size must be non-zero"),
};

/// Postgres schema holding all indexer relations
pub const SCHEMA_NAME: &str = "idx";
