//! Terminal and continuation status of an execution run.

use serde::{Deserialize, Serialize};

/// Why a program stopped with a panic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum PanicReason {
    /// A `trap` instruction, an invalid instruction or an invalid jump.
    #[display("trap")]
    Trap,
}

/// The status an execution ended with.
///
/// Every variant except [`ExitReason::Continued`] ends the run. Faults such as running out of gas
/// are ordinary outcomes and never reported as call failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum ExitReason {
    /// The program may be resumed.
    #[display("continued")]
    Continued,
    /// The program returned normally.
    #[display("halt")]
    Halt,
    /// The program panicked.
    #[display("panic({_0})")]
    Panic(PanicReason),
    /// The gas budget was exhausted.
    #[display("out of gas")]
    OutOfGas,
    /// The program invoked a host call that nobody handled.
    #[display("host call({_0})")]
    HostCall(u32),
    /// The program touched an inaccessible page starting at the given address.
    #[display("page fault({_0:#x})")]
    PageFault(u32),
}

impl ExitReason {
    const TAG_HALT: u64 = 0;
    const TAG_PANIC: u64 = 1;
    const TAG_OUT_OF_GAS: u64 = 2;
    const TAG_HOST_CALL: u64 = 3;
    const TAG_PAGE_FAULT: u64 = 4;
    const TAG_CONTINUED: u64 = 5;

    /// Shorthand for `ExitReason::Panic(PanicReason::Trap)`.
    pub const TRAP: Self = Self::Panic(PanicReason::Trap);

    /// Encodes this reason into its 64-bit wire code.
    ///
    /// The low byte carries the tag, bits 32..64 carry the host call index or fault address.
    pub const fn to_code(self) -> u64 {
        match self {
            Self::Halt => Self::TAG_HALT,
            Self::Panic(PanicReason::Trap) => Self::TAG_PANIC,
            Self::OutOfGas => Self::TAG_OUT_OF_GAS,
            Self::HostCall(index) => Self::TAG_HOST_CALL | ((index as u64) << 32),
            Self::PageFault(address) => Self::TAG_PAGE_FAULT | ((address as u64) << 32),
            Self::Continued => Self::TAG_CONTINUED,
        }
    }

    /// Decodes a wire code produced by [`Self::to_code`].
    ///
    /// Unknown tags decode to a trap, so a corrupted code can never look like success.
    pub const fn from_code(code: u64) -> Self {
        let payload = (code >> 32) as u32;
        match code & 0xFF {
            Self::TAG_HALT => Self::Halt,
            Self::TAG_OUT_OF_GAS => Self::OutOfGas,
            Self::TAG_HOST_CALL => Self::HostCall(payload),
            Self::TAG_PAGE_FAULT => Self::PageFault(payload),
            Self::TAG_CONTINUED => Self::Continued,
            _ => Self::TRAP,
        }
    }

    /// Whether this reason ends the program for good.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Continued | Self::HostCall(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_survives_code() {
        for reason in [
            ExitReason::Halt,
            ExitReason::TRAP,
            ExitReason::OutOfGas,
            ExitReason::HostCall(u32::MAX),
            ExitReason::PageFault(0xFEFF_0000),
            ExitReason::Continued,
        ] {
            assert_eq!(ExitReason::from_code(reason.to_code()), reason);
        }
    }

    #[test]
    fn test_unknown_tag_is_trap() {
        assert_eq!(ExitReason::from_code(0xAB), ExitReason::TRAP);
        assert_eq!(ExitReason::from_code(u64::MAX), ExitReason::TRAP);
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitReason::TRAP.to_string(), "panic(trap)");
        assert_eq!(ExitReason::PageFault(0x20000).to_string(), "page fault(0x20000)");
    }
}
