//! A pool of warm sandbox workers.

mod config;
pub use config::*;

mod error;
pub use error::*;

mod sandbox_pool;
pub use sandbox_pool::*;

mod statistics;
pub use statistics::*;

mod worker;
pub use worker::*;
