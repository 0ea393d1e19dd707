//! Runtime configuration (C7): block size, table name, and AWS endpoint
//! overrides, read from the process environment after `dotenvy::dotenv()`
//! has populated it, per spec §4.7. No config-parsing crate beyond `serde`
//! is introduced; env vars are read directly with `std::env`.

use serde::Deserialize;

use crate::error::Error;
use crate::vfs::DEFAULT_BLOCK_SIZE;

/// `DDBVFS_TABLE` is the only required variable; everything else falls
/// back to a sensible default or the SDK's own credential/region chain.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub block_size: u64,
    pub table_name: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

impl Config {
    /// Loads `.env` (if present) and reads the four variables below.
    /// Missing `DDBVFS_TABLE` is the only fatal condition; everything
    /// else has a default.
    pub fn from_env() -> Result<Self, Error> {
        // Missing `.env` is not an error, only a malformed one.
        let _ = dotenvy::dotenv();

        let block_size = match std::env::var("DDBVFS_BLOCK_SIZE") {
            Ok(v) => v
                .parse()
                .map_err(|_| Error::invalid_item("DDBVFS_BLOCK_SIZE is not a valid integer"))?,
            Err(_) => DEFAULT_BLOCK_SIZE,
        };

        let table_name = std::env::var("DDBVFS_TABLE")
            .map_err(|_| Error::invalid_item("DDBVFS_TABLE is required"))?;

        let region = std::env::var("AWS_REGION").ok();
        let endpoint_url = std::env::var("DDBVFS_ENDPOINT_URL").ok();

        Ok(Config {
            block_size,
            table_name,
            region,
            endpoint_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that touch process env must not run concurrently with each
    // other (env vars are process-global), so they share this lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_table_name_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("DDBVFS_TABLE");
        std::env::remove_var("DDBVFS_BLOCK_SIZE");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn defaults_block_size_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DDBVFS_TABLE", "my-table");
        std::env::remove_var("DDBVFS_BLOCK_SIZE");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cfg.table_name, "my-table");
        std::env::remove_var("DDBVFS_TABLE");
    }

    #[test]
    fn reads_block_size_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DDBVFS_TABLE", "my-table");
        std::env::set_var("DDBVFS_BLOCK_SIZE", "8192");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.block_size, 8192);
        std::env::remove_var("DDBVFS_TABLE");
        std::env::remove_var("DDBVFS_BLOCK_SIZE");
    }
}
