//! Execution mode selection.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags selecting how programs are executed. Fixed when an executor is constructed.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExecutionMode: u8 {
        /// Use the JIT backend instead of the interpreter.
        const JIT = 1 << 0;
        /// Run programs in a separate sandbox process.
        const SANDBOXED = 1 << 1;
    }
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::empty()
    }
}

impl ExecutionMode {
    /// Gets the raw bitmap value, as sent over the wire.
    pub const fn raw(self) -> u8 {
        self.bits()
    }

    /// The mode a sandbox child should run a request with: everything but the sandbox bit.
    pub fn in_process(self) -> Self {
        self.difference(Self::SANDBOXED)
    }
}

/// The execution strategies an executor can be wired with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum ExecutorKind {
    /// Interpret the program in the calling process.
    #[display("in-process interpreter")]
    InProcessInterpreter,
    /// Compile and run the program in the calling process.
    #[display("in-process jit")]
    InProcessJit,
    /// Spawn a fresh sandbox child for every call.
    #[display("sandboxed")]
    Sandboxed,
    /// Route calls to a pool of warm sandbox children.
    #[display("pooled sandboxed")]
    PooledSandboxed,
}

impl ExecutorKind {
    /// Selects the strategy for `mode`. `pooled` only matters when the mode is sandboxed.
    pub const fn select(mode: ExecutionMode, pooled: bool) -> Self {
        if mode.contains(ExecutionMode::SANDBOXED) {
            if pooled {
                Self::PooledSandboxed
            } else {
                Self::Sandboxed
            }
        } else if mode.contains(ExecutionMode::JIT) {
            Self::InProcessJit
        } else {
            Self::InProcessInterpreter
        }
    }
}
