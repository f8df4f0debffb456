//! Protocol-wide constants.

/// Smallest monetary unit per coin (1 coin = 10^8 base units).
pub const COIN: u64 = 100_000_000;
