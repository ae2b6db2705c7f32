pub mod cache;
pub mod config;
pub mod forecast;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod notify;
pub mod source;
pub mod store;
pub mod verify;
