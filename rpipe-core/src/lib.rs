pub mod chunk;
pub mod config;
pub mod deposit;
pub mod error;
pub mod manifest;
pub mod progress;
pub mod redundancy;
pub mod repair;
pub mod replay;
pub mod scheduler;
pub mod tempstore;
pub mod transport;
pub mod verify;
