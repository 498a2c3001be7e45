pub mod config;
pub mod errors;
pub mod model;
pub mod snapshot;
pub mod store;
