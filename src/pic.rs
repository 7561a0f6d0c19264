//! The master/slave 8259 PIC pair.
//!
//! Each [`Pic`] is a standalone ICW/OCW state machine; [`PicPair`] wires two
//! of them together with the cascade convention IBM-compatible boards use
//! (slave cascades through the master's IRQ line 2). Each chip is a plain
//! struct with explicit `read`/`write` entry points rather than a trait
//! object, since there are exactly two of them and they never vary at
//! runtime.

use bitflags::bitflags;
use log::{debug, trace, warn};

const NUM_LINES: u8 = 8;
const CASCADE_LINE: u8 = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct Icw1: u8 {
        const ICW4_NEEDED = 1 << 0;
        const SINGLE      = 1 << 1;
        const LEVEL_TRIG  = 1 << 3;
        const INIT        = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    Icw1Wait,
    Icw2Wait,
    Icw3Wait,
    Icw4Wait,
    Operational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EoiKind {
    NonSpecific,
    Specific(u8),
    RotateNonSpecific,
    RotateSpecific(u8),
    SetPriority(u8),
}

/// A single 8259. `elcr` is an IBM-PC/AT extension (normally absent on the
/// genuine 8259 but universal on PCI-ISA bridges); edge-triggered lines
/// assert once per rising transition of [`Pic::raise`].
#[derive(Debug)]
pub struct Pic {
    irr: u8,
    isr: u8,
    imr: u8,
    elcr: u8,
    vector_base: u8,
    icw1: Icw1,
    state: InitState,
    read_isr: bool,
    auto_eoi: bool,
    rotate_in_auto_eoi: bool,
    priority_rotation: u8,
    /// Lines currently held asserted by their source (for level-triggered
    /// re-assertion after an EOI).
    held: u8,
}

impl Default for Pic {
    fn default() -> Self {
        Self::new()
    }
}

impl Pic {
    pub fn new() -> Self {
        Self {
            irr: 0,
            isr: 0,
            imr: 0xFF,
            elcr: 0,
            vector_base: 0,
            icw1: Icw1::empty(),
            state: InitState::Operational,
            read_isr: false,
            auto_eoi: false,
            rotate_in_auto_eoi: false,
            priority_rotation: 0,
            held: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn level_triggered(&self, line: u8) -> bool {
        self.elcr & (1 << line) != 0
    }

    /// Assert `line`. Level-triggered lines may be asserted repeatedly
    /// without effect until cleared; edge-triggered lines only latch on the
    /// 0->1 transition.
    pub fn raise(&mut self, line: u8) {
        let bit = 1 << line;
        let rising = self.held & bit == 0;
        self.held |= bit;
        if self.level_triggered(line) || rising {
            self.irr |= bit;
            trace!("pic: irq {line} raised (irr={:#04x})", self.irr);
        }
    }

    pub fn clear(&mut self, line: u8) {
        let bit = 1 << line;
        self.held &= !bit;
        if self.level_triggered(line) {
            self.irr &= !bit;
        }
    }

    pub fn set_elcr(&mut self, val: u8) {
        self.elcr = val;
    }

    pub fn auto_eoi(&self) -> bool {
        self.auto_eoi
    }

    pub fn rotate_in_auto_eoi(&self) -> bool {
        self.rotate_in_auto_eoi
    }

    /// Highest-priority unmasked, pending line, respecting `priority_rotation`.
    fn highest_pending(&self) -> Option<u8> {
        let pending = self.irr & !self.imr;
        if pending == 0 {
            return None;
        }
        (0..NUM_LINES)
            .map(|i| (i + self.priority_rotation) % NUM_LINES)
            .find(|line| pending & (1 << line) != 0)
    }

    /// Is any unmasked line pending? (fed into the cascade on the master.)
    pub fn interrupt_pending(&self) -> bool {
        self.highest_pending().is_some()
    }

    /// Acknowledge the highest-priority pending line: sets ISR, clears IRR
    /// (for edge lines; level lines stay latched by `held` until `clear`),
    /// returns `(line, vector)`.
    fn acknowledge(&mut self) -> Option<(u8, u8)> {
        let line = self.highest_pending()?;
        let bit = 1 << line;
        self.irr &= !bit;
        if !self.auto_eoi {
            self.isr |= bit;
        }
        debug!("pic: ack line {line} -> vector {:#04x}", self.vector_base + line);
        Some((line, self.vector_base + line))
    }

    pub fn eoi(&mut self, kind: EoiKind) {
        match kind {
            EoiKind::NonSpecific => {
                if let Some(line) = highest_set_bit(self.isr, self.priority_rotation) {
                    self.isr &= !(1 << line);
                }
            }
            EoiKind::Specific(line) => {
                self.isr &= !(1 << line);
            }
            EoiKind::RotateNonSpecific => {
                if let Some(line) = highest_set_bit(self.isr, self.priority_rotation) {
                    self.isr &= !(1 << line);
                    self.priority_rotation = (line + 1) % NUM_LINES;
                }
            }
            EoiKind::RotateSpecific(line) => {
                self.isr &= !(1 << line);
                self.priority_rotation = (line + 1) % NUM_LINES;
            }
            EoiKind::SetPriority(line) => {
                self.priority_rotation = (line + 1) % NUM_LINES;
            }
        }
    }

    pub fn read(&mut self, port_low: bool) -> u8 {
        if port_low {
            self.imr
        } else if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    pub fn write(&mut self, port_low: bool, val: u8) {
        if !port_low {
            self.write_command(val);
        } else {
            self.write_data(val);
        }
    }

    fn write_command(&mut self, val: u8) {
        if val & 0x10 != 0 {
            // ICW1: begin (re)initialization.
            self.icw1 = Icw1::from_bits_truncate(val);
            self.irr = 0;
            self.isr = 0;
            self.imr = 0;
            self.priority_rotation = 0;
            self.state = InitState::Icw2Wait;
            debug!("pic: icw1 = {val:#04x}, entering init sequence");
            return;
        }
        match val & 0x18 {
            0x00 => {
                // OCW2: EOI / rotate / priority commands.
                let kind = match (val >> 5) & 0x7 {
                    0b001 => EoiKind::NonSpecific,
                    0b011 => EoiKind::Specific(val & 0x7),
                    0b101 => EoiKind::RotateNonSpecific,
                    0b111 => EoiKind::RotateSpecific(val & 0x7),
                    0b110 => EoiKind::SetPriority(val & 0x7),
                    _ => return,
                };
                self.eoi(kind);
            }
            0x08 => {
                // OCW3: read register select (poll mode, bit 2, is unsupported).
                self.read_isr = val & 0x01 != 0 && val & 0x02 != 0;
            }
            _ => {}
        }
    }

    fn write_data(&mut self, val: u8) {
        match self.state {
            InitState::Icw2Wait => {
                self.vector_base = val & 0xF8;
                self.state = InitState::Icw3Wait;
            }
            InitState::Icw3Wait => {
                // Cascade wiring byte; the fabric fixes the master/slave
                // relationship structurally so this value is accepted but
                // not otherwise interpreted.
                self.state = if self.icw1.contains(Icw1::ICW4_NEEDED) {
                    InitState::Icw4Wait
                } else {
                    InitState::Operational
                };
            }
            InitState::Icw4Wait => {
                self.auto_eoi = val & 0x02 != 0;
                self.rotate_in_auto_eoi = val & 0x10 != 0;
                self.state = InitState::Operational;
                debug!("pic: init sequence complete, vector_base={:#04x}", self.vector_base);
            }
            InitState::Icw1Wait | InitState::Operational => {
                self.imr = val;
            }
        }
    }
}

fn highest_set_bit(bits: u8, rotation: u8) -> Option<u8> {
    (0..NUM_LINES)
        .map(|i| (i + rotation) % NUM_LINES)
        .find(|line| bits & (1 << line) != 0)
}

/// Master/slave pair cascaded through the master's line 2, the standard
/// IBM PC/AT wiring.
#[derive(Debug, Default)]
pub struct PicPair {
    pub master: Pic,
    pub slave: Pic,
}

impl PicPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.master.reset();
        self.slave.reset();
    }

    pub fn raise(&mut self, irq: u8) {
        if irq < 8 {
            self.master.raise(irq);
        } else {
            self.slave.raise(irq - 8);
            self.master.raise(CASCADE_LINE);
        }
    }

    pub fn clear(&mut self, irq: u8) {
        if irq < 8 {
            self.master.clear(irq);
        } else {
            self.slave.clear(irq - 8);
            if !self.slave.interrupt_pending() {
                self.master.clear(CASCADE_LINE);
            }
        }
    }

    /// CPU `INTA` cycle: resolve the highest-priority pending line across
    /// both chips and return its final vector.
    pub fn acknowledge(&mut self) -> Option<u8> {
        let (line, vector) = self.master.acknowledge()?;
        if line == CASCADE_LINE {
            match self.slave.acknowledge() {
                Some((_, slave_vector)) => Some(slave_vector),
                None => {
                    warn!("pic: cascade line acked with no pending slave interrupt");
                    Some(vector)
                }
            }
        } else {
            Some(vector)
        }
    }

    pub fn interrupt_pending(&self) -> bool {
        self.master.interrupt_pending()
    }

    pub fn read(&mut self, port: u16) -> u8 {
        let (pic, low) = self.chip_for_port(port);
        pic.read(low)
    }

    pub fn write(&mut self, port: u16, val: u8) {
        let (pic, low) = self.chip_for_port(port);
        pic.write(low, val);
    }

    fn chip_for_port(&mut self, port: u16) -> (&mut Pic, bool) {
        match port {
            0x20 => (&mut self.master, false),
            0x21 => (&mut self.master, true),
            0xA0 => (&mut self.slave, false),
            0xA1 => (&mut self.slave, true),
            _ => unreachable!("PIC ports are registered exactly as {{0x20,0x21,0xA0,0xA1}}"),
        }
    }
}
