#![allow(async_fn_in_trait)]

use tracing_subscriber::EnvFilter;

use ddbvfs::store::DynamoDbStore;
use ddbvfs::{Config, DdbVfs, Error};

/// Binary entrypoint (C10): loads config, builds the DynamoDB client,
/// registers the VFS, and hands control to the embedding caller.
///
/// This crate is meant to be embedded — the VFS is registered under SQLite's
/// C API and driven through `libsqlite3-sys`/`rusqlite`-style connections
/// opened against `:memory:`-style URIs naming the registered VFS. The binary
/// here only demonstrates registration; it is not a database shell.
#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let mut aws_config_loader = aws_config::from_env();
    if let Some(region) = &config.region {
        aws_config_loader = aws_config_loader.region(aws_config::Region::new(region.clone()));
    }
    let aws_config = aws_config_loader.load().await;

    let mut client_config = aws_sdk_dynamodb::config::Builder::from(&aws_config);
    if let Some(endpoint_url) = &config.endpoint_url {
        client_config = client_config.endpoint_url(endpoint_url.clone());
    }
    let client = aws_sdk_dynamodb::Client::from_conf(client_config.build());

    let store = DynamoDbStore::new(client, config.table_name.clone());
    let vfs = DdbVfs::new(store, config.block_size);
    let name = vfs.name.clone();

    sqlite_vfs::register(&name, vfs, false).map_err(|err| {
        Error::corruption(format!("failed to register ddbvfs VFS {name}: {err}"))
    })?;

    tracing::info!(vfs = %name, table = %config.table_name, "ddbvfs VFS registered");

    Ok(())
}
