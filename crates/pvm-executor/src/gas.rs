//! Gas accounting for a single execution.

use serde::{Deserialize, Serialize};

/// An execution budget, measured in gas units.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[serde(transparent)]
pub struct Gas(pub u64);

impl Gas {
    /// No gas at all.
    pub const ZERO: Self = Self(0);

    /// Creates a new amount of gas.
    pub const fn new(amount: u64) -> Self {
        Self(amount)
    }

    /// Returns the raw amount.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Subtracts `rhs`, clamping at zero.
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

/// Error returned when a charge exceeds the remaining gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of gas: requested={requested}, remaining={remaining}")]
pub struct OutOfGas {
    /// The amount that was requested.
    pub requested: u64,
    /// The amount that was left before the charge.
    pub remaining: u64,
}

/// Tracks the gas consumed by one execution.
///
/// The remaining gas only ever decreases. A failed charge drains the meter completely, so an
/// out-of-gas execution always reports its whole budget as used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasMeter {
    limit: Gas,
    remaining: u64,
}

impl GasMeter {
    /// Creates a meter holding the whole `limit`.
    pub const fn new(limit: Gas) -> Self {
        Self { limit, remaining: limit.0 }
    }

    /// The budget this meter was created with.
    pub const fn limit(&self) -> Gas {
        self.limit
    }

    /// Gas that has not been consumed yet.
    pub const fn remaining(&self) -> Gas {
        Gas(self.remaining)
    }

    /// Gas consumed so far. Never exceeds [`Self::limit`].
    pub const fn used(&self) -> Gas {
        Gas(self.limit.0 - self.remaining)
    }

    /// Charges `amount` gas.
    ///
    /// # Returns
    ///
    /// [`OutOfGas`] if `amount` exceeds the remaining gas. The meter is drained in that case.
    pub fn charge(&mut self, amount: u64) -> Result<(), OutOfGas> {
        match self.remaining.checked_sub(amount) {
            Some(remaining) => {
                self.remaining = remaining;
                Ok(())
            }
            None => {
                let remaining = self.remaining;
                self.remaining = 0;
                Err(OutOfGas { requested: amount, remaining })
            }
        }
    }

    /// Consumes everything that is left.
    pub fn drain(&mut self) {
        self.remaining = 0;
    }
}
