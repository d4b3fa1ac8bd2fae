pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod geolocation;
pub mod identity;
pub mod incidents;
pub mod markers;
pub mod model;
pub mod presence;
pub mod session;
pub mod state;
pub mod store;
pub mod stream;
pub mod surface;

#[cfg(test)]
pub mod test_support;
