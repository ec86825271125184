//! Constants for the PVM executor.
//!
//! It groups the constants by the subsystem that owns them.

/// Constants describing the VM register file and address space.
pub mod vm {
    /// Number of general purpose registers.
    pub const REGISTER_COUNT: usize = 13;

    /// Size of a memory page in bytes.
    pub const PAGE_SIZE: u32 = 1 << 12;
    /// Size of a memory zone. Regions of the address space are aligned to zones.
    pub const ZONE_SIZE: u32 = 1 << 16;
    /// Size of the argument region reserved above the stack.
    pub const INPUT_SIZE: u32 = 1 << 24;

    /// Jumping to this address through `jump_ind` halts the program.
    pub const HALT_ADDRESS: u32 = 0xFFFF_0000;
    /// Jump table entries are addressed in multiples of this alignment.
    pub const JUMP_ALIGNMENT: u32 = 2;

    /// Addresses below this bound always panic when accessed.
    pub const RESERVED_LOW_MEMORY: u32 = ZONE_SIZE;
    /// Start of the read-write heap region.
    pub const HEAP_START: u32 = 2 * ZONE_SIZE;
    /// Number of heap pages mapped for every program.
    pub const HEAP_PAGES: u32 = 16;
    /// Start of the read-only argument region.
    pub const INPUT_START: u32 = u32::MAX - ZONE_SIZE - INPUT_SIZE + 1;
    /// Highest address (exclusive) of the stack. The stack grows down from here.
    pub const STACK_TOP: u32 = u32::MAX - 2 * ZONE_SIZE - INPUT_SIZE + 1;
    /// Number of stack pages mapped for every program.
    pub const STACK_PAGES: u32 = 16;

    /// Register holding the return address when the program starts.
    pub const RA: usize = 0;
    /// Register holding the stack pointer when the program starts.
    pub const SP: usize = 1;
    /// Register holding the argument address on entry and the output address on halt.
    pub const A0: usize = 7;
    /// Register holding the argument length on entry and the output length on halt.
    pub const A1: usize = 8;

    /// Gas charged for each executed instruction.
    pub const INSTRUCTION_GAS: u64 = 1;
}

/// Constants for the host-to-sandbox IPC channel.
pub mod ipc {
    /// Size of the little-endian length prefix in front of every frame.
    pub const LENGTH_PREFIX_SIZE: usize = 4;
    /// Size of the fixed frame header: message type, request id and payload flag.
    pub const FRAME_HEADER_SIZE: usize = 1 + 4 + 1;
    /// Declared frame lengths at or above this ceiling are rejected as malformed.
    pub const MAX_MESSAGE_SIZE: u32 = 100 * 1024 * 1024;
}

/// Constants for sandbox process management.
pub mod process {
    use std::time::Duration;

    /// Name of the sandbox executable.
    pub const SANDBOX_EXECUTABLE: &str = "pvm-sandbox";
    /// Environment variable overriding the sandbox executable location.
    pub const SANDBOX_PATH_ENV: &str = "PVM_SANDBOX_PATH";

    /// Time given to a freshly spawned child to reach its serve loop.
    pub const SPAWN_GRACE: Duration = Duration::from_millis(100);
    /// Time between `SIGTERM` and `SIGKILL` when a child must be torn down.
    pub const TERMINATION_GRACE: Duration = Duration::from_secs(1);
    /// Poll interval used while waiting out the termination grace period.
    pub const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Exit code reported for a child that was terminated by a signal.
    pub const SIGNAL_EXIT_CODE: i32 = -1;
}
