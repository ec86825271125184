mod error;
mod hex;
mod outcome;

pub use error::*;
pub use hex::*;
pub use outcome::*;
pub use pvm_sandbox::LogArgs;
