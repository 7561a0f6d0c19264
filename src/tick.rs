//! Virtual time primitives.
//!
//! The fabric measures time in a single monotonic 64-bit counter scaled so
//! that one microsecond of guest time is always an exact integer number of
//! ticks: a fixed integer clock rate chosen so every hardware period divides
//! it evenly, avoiding the rounding error a `Duration`-based clock would
//! accumulate over a long run. CPU-speed-dependent clock domains are a
//! CPU-side concern, not the bus fabric's, so only the single `TIMER_USEC`
//! scale is modeled here.

/// Ticks per virtual microsecond. Kept well above 1 so that sub-microsecond
/// deadlines (PCI bus-master bursts, PIT-class dividers) remain exact
/// integers instead of rounding away.
pub const TIMER_USEC: u64 = 256;

/// A monotonic point in virtual time, in fractional microseconds.
pub type Tick = u64;

/// Convert a whole number of microseconds to ticks.
pub const fn usec(n: u64) -> Tick {
    n * TIMER_USEC
}

/// Convert a whole number of milliseconds to ticks.
pub const fn msec(n: u64) -> Tick {
    usec(n * 1_000)
}
