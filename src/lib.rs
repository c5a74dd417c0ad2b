pub mod app;
pub mod channels;
pub mod cli;
pub mod error;
pub mod monitor;
pub mod relay;
pub mod server;
pub mod storage;
pub mod supervisor;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
