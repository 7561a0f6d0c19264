//! PCI bus & configuration space: slot allocation by class, the CF8/CFC
//! "configuration mechanism #1" access pair, BAR size-mask decode, and INTx
//! routing/swizzling across bridges.

use log::{debug, trace, warn};

use crate::arena::{Arena, Handle};

pub const CONFIG_ADDRESS_PORT: u16 = 0xCF8;
pub const CONFIG_DATA_PORT: u16 = 0xCFC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotClass {
    Northbridge,
    Southbridge,
    AgpBridge,
    Ide,
    Normal,
    Agp,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntxPin {
    A,
    B,
    C,
    D,
}

impl IntxPin {
    fn index(self) -> u8 {
        match self {
            IntxPin::A => 0,
            IntxPin::B => 1,
            IntxPin::C => 2,
            IntxPin::D => 3,
        }
    }

    /// Standard PCI-PCI bridge swizzle: `pin = (pin - 1 + device) mod 4 + 1`
    /// expressed zero-based.
    pub fn swizzle(self, device: u8) -> IntxPin {
        from_index((self.index() + device) % 4)
    }
}

fn from_index(i: u8) -> IntxPin {
    match i % 4 {
        0 => IntxPin::A,
        1 => IntxPin::B,
        2 => IntxPin::C,
        _ => IntxPin::D,
    }
}

pub type FunctionHandle = Handle<Function>;

type ConfigRead = Box<dyn FnMut(u8, u8) -> u8>;
type ConfigWrite = Box<dyn FnMut(u8, u8, u8)>;

pub struct Function {
    pub read: ConfigRead,
    pub write: ConfigWrite,
    pub irq_pin: Option<IntxPin>,
    slot: u8,
    function: u8,
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("slot", &self.slot)
            .field("function", &self.function)
            .field("irq_pin", &self.irq_pin)
            .finish()
    }
}

const NUM_SLOTS: usize = 32;

#[derive(Default)]
struct Slot {
    functions: [Option<FunctionHandle>; 8],
}

/// Configuration mechanism #1 plus slot bookkeeping. One bus (bus 0) is
/// modeled, matching the device scope of this fabric; multi-bus topologies
/// would add a `bus` dimension to every lookup here.
pub struct PciBus {
    functions: Arena<Function>,
    slots: [Slot; NUM_SLOTS],
    /// `(slot, pin) -> irq line`, `None` = disabled.
    routing: [[Option<u8>; 4]; NUM_SLOTS],
    /// Per-(slot, pin) assertion counters; the IRQ line follows `count > 0`.
    intx_counters: [[u32; 4]; NUM_SLOTS],
    cfg_address: u32,
}

impl Default for PciBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PciBus {
    pub fn new() -> Self {
        Self {
            functions: Arena::new(),
            slots: std::array::from_fn(|_| Slot::default()),
            routing: [[None; 4]; NUM_SLOTS],
            intx_counters: [[0; 4]; NUM_SLOTS],
            cfg_address: 0,
        }
    }

    /// Place a function in the first free slot matching `class`'s priority
    /// map. `preferred` lists slot indices to try first, for boards with a
    /// fixed southbridge/northbridge slot.
    pub fn add_card(
        &mut self,
        class: SlotClass,
        preferred: &[u8],
        function: u8,
        read: ConfigRead,
        write: ConfigWrite,
        irq_pin: Option<IntxPin>,
    ) -> Option<FunctionHandle> {
        let slot = preferred
            .iter()
            .copied()
            .find(|&s| (s as usize) < NUM_SLOTS && self.slots[s as usize].functions[function as usize].is_none())
            .or_else(|| {
                (0..NUM_SLOTS as u8).find(|&s| self.slots[s as usize].functions[function as usize].is_none())
            })?;

        let handle = self.functions.insert(Function {
            read,
            write,
            irq_pin,
            slot,
            function,
        });
        self.slots[slot as usize].functions[function as usize] = Some(handle);
        debug!("pci: {class:?} placed at slot {slot} function {function}");
        Some(handle)
    }

    /// Undo `add_card`: free the slot/function entry so a later `add_card`
    /// can reuse it. Used when the device owning this function is destroyed.
    pub fn remove_card(&mut self, handle: FunctionHandle) {
        if let Some(function) = self.functions.remove(handle) {
            self.slots[function.slot as usize].functions[function.function as usize] = None;
            debug!("pci: released slot {} function {}", function.slot, function.function);
        }
    }

    pub fn set_irq_routing(&mut self, slot: u8, pin: IntxPin, irq_line: Option<u8>) {
        self.routing[slot as usize][pin.index() as usize] = irq_line;
    }

    /// Assert (`level = true`) or deassert a function's INTx pin. Returns
    /// the routed IRQ line and whether the line's net assertion count
    /// transitioned, so the caller can drive the PIC accordingly.
    pub fn set_irq_level(&mut self, slot: u8, pin: IntxPin, level: bool) -> Option<(u8, bool)> {
        let counter = &mut self.intx_counters[slot as usize][pin.index() as usize];
        let was_asserted = *counter > 0;
        if level {
            *counter += 1;
        } else if *counter > 0 {
            *counter -= 1;
        }
        let now_asserted = *counter > 0;
        let irq = self.routing[slot as usize][pin.index() as usize]?;
        if was_asserted != now_asserted {
            trace!("pci: slot {slot} pin {pin:?} -> irq {irq} level {now_asserted}");
        }
        Some((irq, was_asserted != now_asserted))
    }

    fn function_at(&self, slot: u8, function: u8) -> Option<FunctionHandle> {
        self.slots.get(slot as usize)?.functions[function as usize]
    }

    pub fn write_address(&mut self, val: u32) {
        self.cfg_address = val;
    }

    pub fn read_address(&self) -> u32 {
        self.cfg_address
    }

    fn decode_address(&self) -> Option<(u8, u8, u8, u8)> {
        if self.cfg_address & 0x8000_0000 == 0 {
            return None;
        }
        let bus = ((self.cfg_address >> 16) & 0xFF) as u8;
        let dev = ((self.cfg_address >> 11) & 0x1F) as u8;
        let func = ((self.cfg_address >> 8) & 0x7) as u8;
        let reg = (self.cfg_address & 0xFC) as u8;
        Some((bus, dev, func, reg))
    }

    /// Read `CFC..CFF` with byte-offset adjust for unaligned accesses.
    pub fn read_data(&mut self, byte_offset: u8) -> u8 {
        let Some((bus, dev, func, reg)) = self.decode_address() else {
            return 0xFF;
        };
        if bus != 0 {
            return 0xFF;
        }
        match self.function_at(dev, func) {
            Some(handle) => {
                let f = self.functions.get_mut(handle).unwrap();
                (f.read)(func, reg.wrapping_add(byte_offset))
            }
            None => 0xFF,
        }
    }

    pub fn write_data(&mut self, byte_offset: u8, val: u8) {
        let Some((bus, dev, func, reg)) = self.decode_address() else {
            return;
        };
        if bus != 0 {
            return;
        }
        if let Some(handle) = self.function_at(dev, func) {
            let f = self.functions.get_mut(handle).unwrap();
            (f.write)(func, reg.wrapping_add(byte_offset), val);
        } else {
            warn!("pci: config write to absent function {dev}:{func}");
        }
    }
}

/// Compute the BAR size mask a device's config handler should report when
/// the guest probes size by writing all-ones and reading back.
/// `size` must be a power of two; `io` selects the I/O-space encoding
/// (bit 0 set, bits [1] reserved-zero) vs. memory-space (bit 0 clear).
pub fn bar_size_mask(size: u32, io: bool) -> u32 {
    debug_assert!(size.is_power_of_two());
    let mask = !(size - 1);
    if io {
        (mask & 0xFFFF_FFFC) | 0x1
    } else {
        mask & 0xFFFF_FFF0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn bar_size_mask_for_4k_memory_bar() {
        assert_eq!(bar_size_mask(0x1000, false), 0xFFFF_F000);
    }

    #[test]
    fn bar_size_mask_for_io_bar() {
        assert_eq!(bar_size_mask(0x20, true), 0xFFFF_FFE1);
    }

    #[test]
    fn intx_swizzle_cycles_across_bridge_devices() {
        assert_eq!(IntxPin::A.swizzle(0), IntxPin::A);
        assert_eq!(IntxPin::A.swizzle(1), IntxPin::B);
        assert_eq!(IntxPin::D.swizzle(1), IntxPin::A);
    }

    #[test]
    fn cf8_cfc_round_trips_to_registered_function() {
        let mut bus = PciBus::new();
        let reg_value = Rc::new(RefCell::new(0u8));
        let r = reg_value.clone();
        let w = reg_value.clone();
        bus.add_card(
            SlotClass::Normal,
            &[],
            0,
            Box::new(move |_func, reg| if reg == 0x00 { *r.borrow() } else { 0xFF }),
            Box::new(move |_func, reg, val| {
                if reg == 0x00 {
                    *w.borrow_mut() = val;
                }
            }),
            Some(IntxPin::A),
        );

        bus.write_address(0x8000_0000); // bus 0, dev 0, func 0, reg 0
        bus.write_data(0, 0x42);
        assert_eq!(bus.read_data(0), 0x42);
    }

    #[test]
    fn absent_function_reads_ff_and_drops_writes() {
        let mut bus = PciBus::new();
        bus.write_address(0x8000_0800); // dev 1
        assert_eq!(bus.read_data(0), 0xFF);
        bus.write_data(0, 0xAA); // must not panic
    }

    #[test]
    fn irq_level_follows_assertion_count() {
        let mut bus = PciBus::new();
        bus.set_irq_routing(3, IntxPin::A, Some(11));
        let (irq, changed) = bus.set_irq_level(3, IntxPin::A, true).unwrap();
        assert_eq!(irq, 11);
        assert!(changed);
        let (_, changed) = bus.set_irq_level(3, IntxPin::A, true).unwrap();
        assert!(!changed, "second assertion does not re-trigger edge");
        let (_, changed) = bus.set_irq_level(3, IntxPin::A, false).unwrap();
        assert!(!changed, "one deassertion with refcount 2 stays asserted");
        let (_, changed) = bus.set_irq_level(3, IntxPin::A, false).unwrap();
        assert!(changed, "final deassertion drops the line");
    }
}
