pub mod config;
pub mod error;
pub mod expiry;
pub mod worker;
