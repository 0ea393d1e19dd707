#![allow(async_fn_in_trait)]

pub mod config;
pub mod error;
pub mod handle;
pub mod key;
pub mod lock;
pub mod serialize;
pub mod store;
pub mod vfs;

pub use config::Config;
pub use error::Error;
pub use store::{DynamoDbStore, KvStore};
pub use vfs::DdbVfs;
