pub mod config;
pub mod filter;
pub mod sqlite_store;
pub mod store;
pub mod timeline;
pub mod types;
