pub(crate) mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod proxy;
pub mod state;
pub mod stream;
pub mod transport;
