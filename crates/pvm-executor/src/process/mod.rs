//! Sandbox process lifecycle: spawning, waiting, killing and reaping.

mod error;
pub use error::*;

mod manager;
pub use manager::*;

mod resolver;
pub use resolver::*;
