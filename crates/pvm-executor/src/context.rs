//! The host call seam between the VM and the business logic around it.

use auto_impl::auto_impl;

use crate::{gas::OutOfGas, ExitReason, Gas, Registers};

/// A faulting memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryFault {
    /// The access touched the reserved low memory zone.
    #[error("access to reserved memory at {address:#x}")]
    Reserved {
        /// The first faulting address.
        address: u32,
    },
    /// The access touched a page that is not mapped or not writable.
    #[error("page fault at {page:#x}")]
    Page {
        /// Start address of the faulting page.
        page: u32,
    },
}

impl MemoryFault {
    /// The exit reason a program stops with after this fault.
    pub const fn exit_reason(self) -> ExitReason {
        match self {
            Self::Reserved { .. } => ExitReason::TRAP,
            Self::Page { page } => ExitReason::PageFault(page),
        }
    }
}

/// What the VM does after a host call was dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostCallOutcome {
    /// Resume the program at the instruction after the host call.
    Continue,
    /// Stop the program with the given reason.
    Exit(ExitReason),
}

/// The view of a running VM handed to host call dispatchers.
pub trait VmState {
    /// The register file.
    fn registers(&self) -> &Registers;

    /// The register file, mutably.
    fn registers_mut(&mut self) -> &mut Registers;

    /// Reads `length` bytes starting at `address`.
    fn read_memory(&self, address: u32, length: u32) -> Result<Vec<u8>, MemoryFault>;

    /// Writes `data` starting at `address`.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), MemoryFault>;

    /// Gas left in the budget.
    fn gas_remaining(&self) -> Gas;

    /// Charges `amount` gas on behalf of the host call. On failure the budget is drained.
    fn consume_gas(&mut self, amount: u64) -> Result<(), OutOfGas>;

    /// The program counter of the host call instruction.
    fn pc(&self) -> u32;
}

/// Dispatches the host calls a program makes.
///
/// It is invoked synchronously every time the VM executes `ecalli`. Contexts are never sent
/// across the sandbox boundary: executions with a context always run in-process.
#[auto_impl(&mut, Box)]
pub trait InvocationContext: Send {
    /// Handles host call `host_call_index` against the VM `state`.
    fn dispatch(&mut self, host_call_index: u32, state: &mut dyn VmState) -> HostCallOutcome;
}
