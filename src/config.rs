use std::env;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::DEFAULT_IDENTITY_CACHE_SIZE;
use crate::constants::DEFAULT_INDEXER_NAME;
use crate::constants::DEFAULT_SIGNATURE_RETENTION;
use crate::constants::DEFAULT_STATEMENT_TIMEOUT_MS;
use crate::error::ConfigError;
use crate::types::Height;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Postgresql connection URI postgresql://[userspec@][hostspec][/dbname][?paramspec]
    pub connection_uri: String,
    /// Upper bound for any single statement, applied to the session at connection time.
    pub statement_timeout: Option<Duration>,
}

impl PostgresConfig {
    pub fn new(uri: &str) -> Self {
        Self {
            connection_uri: uri.to_owned(),
            statement_timeout: Some(Duration::from_millis(DEFAULT_STATEMENT_TIMEOUT_MS)),
        }
    }

    pub fn statement_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            statement_timeout: timeout,
            ..self
        }
    }
}

/// Comparison used by validator rollbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorBoundary {
    /// Remove validators first seen strictly after the given height.
    After,
    /// Remove validators first seen at or after the given height.
    AtOrAfter,
}

impl ValidatorBoundary {
    /// Height to pass to a validator rollback so that validators first seen
    /// at `height` are removed, and only those.
    pub fn argument_for(&self, height: Height) -> Height {
        match self {
            ValidatorBoundary::After => height - 1,
            ValidatorBoundary::AtOrAfter => height,
        }
    }

    /// Whether a validator first seen at `validator_height` is removed by a
    /// rollback with argument `height`.
    pub fn removes(&self, validator_height: Height, height: Height) -> bool {
        match self {
            ValidatorBoundary::After => validator_height > height,
            ValidatorBoundary::AtOrAfter => validator_height >= height,
        }
    }
}

impl FromStr for ValidatorBoundary {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "after" => Ok(ValidatorBoundary::After),
            "at_or_after" => Ok(ValidatorBoundary::AtOrAfter),
            _ => Err(ConfigError::Invalid {
                name: "SEQIDX_VALIDATOR_ROLLBACK",
                value: s.to_owned(),
            }),
        }
    }
}

/// Backend independent storage behaviour.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Number of heights of block signatures kept below a retention boundary.
    pub signature_retention: u32,
    pub validator_rollback: ValidatorBoundary,
    /// Capacity of the address and rollup identity caches.
    pub identity_cache_size: NonZeroUsize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            signature_retention: DEFAULT_SIGNATURE_RETENTION,
            validator_rollback: ValidatorBoundary::After,
            identity_cache_size: DEFAULT_IDENTITY_CACHE_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Name of the chain state row owned by this indexer
    pub name: String,
    pub postgres: PostgresConfig,
    pub store: StoreSettings,
}

impl IndexerConfig {
    /// Read configuration from `SEQIDX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let uri = lookup("SEQIDX_POSTGRES_URI").ok_or(ConfigError::Missing("SEQIDX_POSTGRES_URI"))?;
        tracing::debug!("found SEQIDX_POSTGRES_URI environment variable");

        let name = lookup("SEQIDX_NAME").unwrap_or_else(|| String::from(DEFAULT_INDEXER_NAME));

        let timeout_ms: u64 = parse_or(&lookup, "SEQIDX_STATEMENT_TIMEOUT_MS", DEFAULT_STATEMENT_TIMEOUT_MS)?;
        let statement_timeout = match timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let signature_retention: u32 =
            parse_or(&lookup, "SEQIDX_SIGNATURE_RETENTION", DEFAULT_SIGNATURE_RETENTION)?;

        let validator_rollback = match lookup("SEQIDX_VALIDATOR_ROLLBACK") {
            Some(s) => s.parse()?,
            None => ValidatorBoundary::After,
        };

        let cache_size: usize = parse_or(
            &lookup,
            "SEQIDX_IDENTITY_CACHE",
            DEFAULT_IDENTITY_CACHE_SIZE.get(),
        )?;
        let identity_cache_size = NonZeroUsize::new(cache_size).ok_or(ConfigError::Invalid {
            name: "SEQIDX_IDENTITY_CACHE",
            value: cache_size.to_string(),
        })?;

        Ok(Self {
            name,
            postgres: PostgresConfig::new(&uri).statement_timeout(statement_timeout),
            store: StoreSettings {
                signature_retention,
                validator_rollback,
                identity_cache_size,
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
        let map: HashMap<&'static str, String> =
            pairs.iter().map(|(k, v)| (*k, v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg =
            IndexerConfig::from_lookup(lookup_from(&[("SEQIDX_POSTGRES_URI", "postgresql://x")]))
                .unwrap();
        assert_eq!(cfg.name, DEFAULT_INDEXER_NAME);
        assert_eq!(cfg.postgres.connection_uri, "postgresql://x");
        assert_eq!(
            cfg.postgres.statement_timeout,
            Some(Duration::from_millis(DEFAULT_STATEMENT_TIMEOUT_MS))
        );
        assert_eq!(cfg.store.signature_retention, DEFAULT_SIGNATURE_RETENTION);
        assert_eq!(cfg.store.validator_rollback, ValidatorBoundary::After);
    }

    #[test]
    fn test_missing_uri() {
        let err = IndexerConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SEQIDX_POSTGRES_URI")));
    }

    #[test]
    fn test_overrides() {
        let cfg = IndexerConfig::from_lookup(lookup_from(&[
            ("SEQIDX_POSTGRES_URI", "postgresql://x"),
            ("SEQIDX_NAME", "mainnet"),
            ("SEQIDX_STATEMENT_TIMEOUT_MS", "0"),
            ("SEQIDX_SIGNATURE_RETENTION", "10"),
            ("SEQIDX_VALIDATOR_ROLLBACK", "at_or_after"),
            ("SEQIDX_IDENTITY_CACHE", "16"),
        ]))
        .unwrap();
        assert_eq!(cfg.name, "mainnet");
        assert_eq!(cfg.postgres.statement_timeout, None);
        assert_eq!(cfg.store.signature_retention, 10);
        assert_eq!(cfg.store.validator_rollback, ValidatorBoundary::AtOrAfter);
        assert_eq!(cfg.store.identity_cache_size.get(), 16);
    }

    #[test]
    fn test_invalid_values() {
        let base = ("SEQIDX_POSTGRES_URI", "postgresql://x");
        for (key, value) in [
            ("SEQIDX_VALIDATOR_ROLLBACK", "before"),
            ("SEQIDX_SIGNATURE_RETENTION", "-1"),
            ("SEQIDX_SIGNATURE_RETENTION", "many"),
            ("SEQIDX_IDENTITY_CACHE", "0"),
        ] {
            let err = IndexerConfig::from_lookup(lookup_from(&[base, (key, value)])).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{key}={value}");
        }
    }

    #[test]
    fn test_validator_boundary_argument() {
        // Either way, a validator first seen at the rolled back height goes
        // and one seen just before stays.
        for boundary in [ValidatorBoundary::After, ValidatorBoundary::AtOrAfter] {
            let arg = boundary.argument_for(100);
            assert!(boundary.removes(100, arg));
            assert!(!boundary.removes(99, arg));
        }
    }
}
