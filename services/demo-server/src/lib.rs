pub mod config;
pub mod transport;
#[cfg(feature = "async-transport")]
pub mod transport_axum;
