pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod tickets;
pub mod util;

pub use error::{Error, Result};
