//! The ways an [`Executor`](crate::Executor) can run a program.

mod in_process;
pub use in_process::*;

mod pooled;
pub use pooled::*;

mod sandboxed;
pub use sandboxed::*;
