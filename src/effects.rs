//! The effect enum that replaces re-entrant calls from a device handler
//! back into the CPU or the bus fabric.
//!
//! A device's read/write handler returns a small batch of `Effect`s instead
//! of calling `raise_irq`/`remap` etc. directly; [`crate::system::System`]
//! applies them once the handler has returned, so memory-map flush points
//! and interrupt delivery stay explicit and never happen mid-access.

/// A deferred side effect requested by a device handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// No side effect.
    None,
    /// Raise (assert) the given legacy IRQ line.
    RaiseIrq(u8),
    /// Lower (deassert) the given legacy IRQ line.
    LowerIrq(u8),
    /// Raise NMI.
    RaiseNmi,
    /// Lower NMI.
    LowerNmi,
    /// Raise SMI.
    RaiseSmi,
    /// A memory mapping changed; the CPU's decode cache must be flushed.
    RemapMemory,
}

/// A small buffer of effects a handler can emit during one access.
#[derive(Debug, Clone, Default)]
pub struct EffectQueue(Vec<Effect>);

impl EffectQueue {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, effect: Effect) {
        if effect != Effect::None {
            self.0.push(effect);
        }
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Effect> {
        self.0.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
