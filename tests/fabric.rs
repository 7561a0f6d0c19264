//! End-to-end scenarios exercising several components together, the way a
//! machine built on this fabric actually drives them.

use std::cell::RefCell;
use std::rc::Rc;

use pc_fabric::device::{Capabilities, DeviceBuilder, DeviceOps, DeviceType};
use pc_fabric::error::SetupResult;
use pc_fabric::io::IoHandlers;
use pc_fabric::memory::{MappingBuilder, MemFlags, PageState};
use pc_fabric::pci::{bar_size_mask, IntxPin, PciBus, SlotClass};
use pc_fabric::pic::PicPair;
use pc_fabric::system::System;
use pc_fabric::timer::TimerWheel;

/// Scenario 1: shadow-RAM toggle. A chipset register (`reg[0x14]`) gates
/// whether writes to the F0000-FFFFF ROM shadow range land in the backing
/// RAM or are dropped; this models the chipset register as an ordinary RAM
/// cell and the shadow window as two overlapping mappings whose relative
/// enablement the register flips.
#[test]
fn shadow_ram_toggle() {
    let mut system = System::new();

    let rom = Rc::new(RefCell::new(vec![0xEAu8; 0x10000]));
    let r = rom.clone();
    system.memory.set_handlers(
        0xF0000,
        0x10000,
        MappingBuilder {
            r8: Some(Box::new(move |addr| r.borrow()[(addr - 0xF0000) as usize])),
            flags: MemFlags::ROM,
            priority: 0,
            ..Default::default()
        },
    );

    let ram = Rc::new(RefCell::new(vec![0u8; 0x10000]));
    let r = ram.clone();
    let w = ram.clone();
    let shadow_handle = system.memory.set_handlers(
        0xF0000,
        0x10000,
        MappingBuilder {
            r8: Some(Box::new(move |addr| r.borrow()[(addr - 0xF0000) as usize])),
            w8: Some(Box::new(move |addr, val| w.borrow_mut()[(addr - 0xF0000) as usize] = val)),
            priority: 10,
            ..Default::default()
        },
    );
    system.memory.disable(shadow_handle);

    assert_eq!(system.read8(0xFFFF0), 0xEA);

    // reg[0x14] |= 0x30: enable shadow read+write.
    system.memory.enable(shadow_handle);
    system.write8(0xFFFF0, 0xAA);
    assert_eq!(system.read8(0xFFFF0), 0xAA);

    // reg[0x14] &= ~0x20: shadow writes disabled, reads still shadowed. The
    // chipset models this by swapping in a read-only registration over the
    // same range rather than tearing down the RAM backing.
    system.memory.remove(shadow_handle);
    let r = ram.clone();
    system.memory.set_handlers(
        0xF0000,
        0x10000,
        MappingBuilder {
            r8: Some(Box::new(move |addr| r.borrow()[(addr - 0xF0000) as usize])),
            priority: 10,
            ..Default::default()
        },
    );
    system.write8(0xFFFF0, 0x55); // no w8 handler registered: dropped
    assert_eq!(system.read8(0xFFFF0), 0xAA);
}

/// Scenario 2: timer ordering. T1 at +100us, T2 at +50us (scheduled after
/// T1), T3 at +100us (scheduled after T2, same deadline as T1). Advancing
/// past all three deadlines must fire T2, T1, T3 in that order.
#[test]
fn timer_ordering() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut wheel = TimerWheel::new();

    let mk = |log: Rc<RefCell<Vec<&'static str>>>, name: &'static str| {
        move |_: &mut TimerWheel| log.borrow_mut().push(name)
    };
    let t1 = wheel.add(mk(log.clone(), "t1"));
    let t2 = wheel.add(mk(log.clone(), "t2"));
    let t3 = wheel.add(mk(log.clone(), "t3"));

    wheel.set_delay(t1, pc_fabric::tick::usec(100));
    wheel.set_delay(t2, pc_fabric::tick::usec(50));
    wheel.set_delay(t3, pc_fabric::tick::usec(100));

    wheel.advance_to_next_deadline(); // fires t2 (deadline 50)
    wheel.advance_to_next_deadline(); // fires t1 then t3 (both deadline 100)

    assert_eq!(*log.borrow(), vec!["t2", "t1", "t3"]);
}

/// Scenario 3: PIC EOI ordering, against the vector base used throughout
/// this crate's own PIC tests.
#[test]
fn pic_eoi_sequence() {
    let mut pair = PicPair::new();
    let base = 0x08u8;

    // ICW1/ICW2/ICW3/ICW4 on the master; slave left uninitialized since no
    // line >= 8 is raised in this scenario.
    pair.write(0x20, 0x11);
    pair.write(0x21, base);
    pair.write(0x21, 0x00);
    pair.write(0x21, 0x01);
    pair.write(0x21, 0xF4); // unmask lines 0, 1, 3

    pair.raise(3);
    pair.raise(1);
    assert_eq!(pair.acknowledge(), Some((base + 1) as u8));
    pair.write(0x20, 0x0B); // OCW3: select ISR on next read
    assert_eq!(pair.read(0x20), 0x02);

    pair.raise(0);
    assert_eq!(pair.acknowledge(), Some((base + 0) as u8));
    assert_eq!(pair.read(0x20), 0x03);

    pair.write(0x20, 0x20); // non-specific EOI
    assert_eq!(pair.read(0x20), 0x02);

    pair.write(0x20, 0x61); // specific EOI, line 1 (0x60 | 1)
    assert_eq!(pair.read(0x20), 0x00);

    assert_eq!(pair.acknowledge(), Some((base + 3) as u8));
}

/// Scenario 4: a PCI BAR's size-probe convention and re-registration of its
/// MMIO window once a real address is programmed. The BAR register and its
/// size-masking are modeled here the way a device's own config handler
/// would implement them; the mapping move itself uses `MemoryMap::set_addr`
/// directly, the same call a real device's handler would make once a full
/// dword write to the BAR completes.
#[test]
fn pci_bar_probe_and_remap() {
    let mut bus = PciBus::new();
    let mut memory = pc_fabric::memory::MemoryMap::new();

    const BAR_SIZE: u32 = 0x1000;
    let bar = Rc::new(RefCell::new(0u32));
    let r = bar.clone();
    let w = bar.clone();
    bus.add_card(
        SlotClass::Normal,
        &[],
        0,
        Box::new(move |_func, reg| {
            if (0x10..0x14).contains(&reg) {
                let masked = *r.borrow() & bar_size_mask(BAR_SIZE, false);
                (masked >> ((reg - 0x10) * 8)) as u8
            } else {
                0xFF
            }
        }),
        Box::new(move |_func, reg, val| {
            if (0x10..0x14).contains(&reg) {
                let shift = (reg - 0x10) * 8;
                let mut v = *w.borrow();
                v &= !(0xFFu32 << shift);
                v |= (val as u32) << shift;
                *w.borrow_mut() = v;
            }
        }),
        Some(IntxPin::A),
    );

    let backing = Rc::new(RefCell::new(vec![0u8; BAR_SIZE as usize]));
    let rb = backing.clone();
    let wb = backing.clone();
    let mapping = memory.set_handlers(
        0,
        BAR_SIZE,
        MappingBuilder {
            r32: Some(Box::new(move |addr| {
                let off = addr as usize & 0xFFC;
                u32::from_le_bytes(rb.borrow()[off..off + 4].try_into().unwrap())
            })),
            w32: Some(Box::new(move |addr, val| {
                let off = addr as usize & 0xFFC;
                wb.borrow_mut()[off..off + 4].copy_from_slice(&val.to_le_bytes());
            })),
            ..Default::default()
        },
    );
    memory.disable(mapping);

    write_config_dword(&mut bus, 0x8000_0010, 0xFFFF_FFFF);
    assert_eq!(read_config_dword(&mut bus, 0x8000_0010), 0xFFFF_F000);

    write_config_dword(&mut bus, 0x8000_0010, 0xD000_0000);
    assert_eq!(read_config_dword(&mut bus, 0x8000_0010), 0xD000_0000);

    let new_base = *bar.borrow() & bar_size_mask(BAR_SIZE, false);
    memory.set_addr(mapping, new_base);
    memory.enable(mapping);

    backing.borrow_mut()[0..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    assert_eq!(memory.read_l(0xD000_0000), 0x1234_5678);
}

fn write_config_dword(bus: &mut PciBus, cfg_address: u32, val: u32) {
    bus.write_address(cfg_address);
    for i in 0..4u8 {
        bus.write_data(i, ((val >> (i * 8)) & 0xFF) as u8);
    }
}

fn read_config_dword(bus: &mut PciBus, cfg_address: u32) -> u32 {
    bus.write_address(cfg_address);
    let mut v = 0u32;
    for i in 0..4u8 {
        v |= (bus.read_data(i) as u32) << (i * 8);
    }
    v
}

/// Scenario 5: programming DMA channel 2 for a 16-beat transfer and
/// confirming terminal count lands exactly on the 16th read.
#[test]
fn dma_transfer_terminal_count() {
    let mut system = System::new();
    system.dma.pages.write(2, 0x01);
    system.dma.slave_8bit.channels[2].mode = 0b01_00_01_00; // single, read, ch 2 bits ignored here
    system.dma.slave_8bit.channels[2].direction = pc_fabric::dma::Direction::Read;
    system.dma.slave_8bit.channels[2].base_addr = 0x2000;
    system.dma.slave_8bit.channels[2].current_addr = 0x2000;
    system.dma.slave_8bit.channels[2].base_count = 0x000F;
    system.dma.slave_8bit.channels[2].current_count = 0x000F;
    system.dma.slave_8bit.channels[2].autoinit = false;
    system.dma.slave_8bit.channels[2].masked = false;
    system.dma.slave_8bit.set_drq(2, true);

    let mut last_tc = false;
    for _ in 0..16 {
        let (_addr, tc) = system.dma.channel_read(2);
        last_tc = tc;
        if tc {
            system.dma.slave_8bit.set_drq(2, false);
        }
    }

    assert!(last_tc, "the 16th read must hit terminal count");
    assert!(system.dma.slave_8bit.channels[2].current_count != 0x000F, "count must have wrapped");
    assert!(!system.dma.slave_8bit.channels[2].request, "request must be cleared once TC is observed");
}

/// Scenario 6: an SMRAM overlay visible only in SMM, overlaid on top of a
/// lower-priority VGA-aperture-style mapping that's visible everywhere.
#[test]
fn smram_overlay_visible_only_in_smm() {
    let mut system = System::new();

    let vga = Rc::new(RefCell::new(vec![0x11u8; 0x10000]));
    let r = vga.clone();
    system.memory.set_handlers(
        0xA0000,
        0x10000,
        MappingBuilder {
            r8: Some(Box::new(move |addr| r.borrow()[(addr - 0xA0000) as usize])),
            priority: 0,
            ..Default::default()
        },
    );

    let smram = Rc::new(RefCell::new(vec![0x22u8; 0x10000]));
    let r = smram.clone();
    system.memory.set_handlers(
        0xA0000,
        0x10000,
        MappingBuilder {
            r8: Some(Box::new(move |addr| r.borrow()[(addr - 0xA0000) as usize])),
            flags: MemFlags::SMRAM,
            priority: 10,
            ..Default::default()
        },
    );

    assert_eq!(system.read8(0xA0000), 0x11, "outside SMM, the VGA aperture answers");

    let mut cpu = pc_fabric::cpu::CpuStub::new(0);
    cpu.in_smm = true;
    system.apply_effects(&mut cpu); // picks up in_smm from the CPU boundary
    assert_eq!(system.read8(0xA0000), 0x22, "inside SMM, SMRAM answers instead");
}

/// An invariant test: `set_state` must preserve the handlers of whatever
/// mapping already covers the range while still reporting the new state.
#[test]
fn set_state_preserves_existing_mapping_handlers() {
    let mut memory = pc_fabric::memory::MemoryMap::new();
    let backing = Rc::new(RefCell::new(vec![0x7u8; 0x1000]));
    let r = backing.clone();
    memory.set_handlers(
        0x1000,
        0x1000,
        MappingBuilder {
            r8: Some(Box::new(move |addr| r.borrow()[(addr - 0x1000) as usize])),
            ..Default::default()
        },
    );

    memory.set_state(0x1000, 0x1000, PageState::CACHEABLE | PageState::SMRAM_OVERLAY);

    assert_eq!(memory.read_b(0x1000), 0x7, "handler is untouched by a state-only change");
    assert_eq!(memory.state_at(0x1000), PageState::CACHEABLE | PageState::SMRAM_OVERLAY);
}

/// `cpu_acknowledge_interrupt` must return the highest-priority unmasked
/// line in `IRR & ~IMR`, and PCI INTx routed to a disabled IRQ must produce
/// no PIC assertion.
#[test]
fn acknowledge_picks_highest_unmasked_and_disabled_routing_is_a_no_op() {
    let mut system = System::new();
    system.pic.write(0x20, 0x11);
    system.pic.write(0x21, 0x08);
    system.pic.write(0x21, 0x00);
    system.pic.write(0x21, 0x01);
    system.pic.write(0x21, 0xFD); // unmask only line 1

    system.pic.raise(3); // masked, must not be acknowledged
    system.pic.raise(1);
    assert_eq!(system.cpu_acknowledge_interrupt(), Some(0x09));

    // PCI INTx routed to a disabled IRQ (no routing entry) never reaches the PIC.
    system.pci.set_irq_routing(5, IntxPin::A, None);
    let result = system.pci.set_irq_level(5, IntxPin::A, true);
    assert_eq!(result, None, "no routing entry means no IRQ line and no PIC side effect");
}

/// A device that registers a timer, a mapping, and an I/O port during
/// `init`, then has all three released automatically by a hard reset.
struct FullDevice {
    seen_reset: Rc<RefCell<bool>>,
}

impl DeviceOps for FullDevice {
    fn init(&mut self, builder: &mut DeviceBuilder) -> SetupResult<()> {
        let t = builder.add_timer(|_| {});
        builder.timers.set_delay(t, pc_fabric::tick::usec(1));
        builder.add_mapping(0x2000, 0x1000, MappingBuilder::default());
        builder.add_io(0x300, 1, IoHandlers::default());
        Ok(())
    }

    fn reset(&mut self, _builder: &mut DeviceBuilder) {
        *self.seen_reset.borrow_mut() = true;
    }
}

const FULL_DEVICE_TYPE: DeviceType = DeviceType {
    internal_name: "full_device",
    name: "Full lifecycle test device",
    capabilities: Capabilities::ISA,
    local: 0,
};

#[test]
fn hard_reset_releases_every_resource_a_device_registered() {
    let mut system = System::new();
    let seen_reset = Rc::new(RefCell::new(false));
    system
        .add_device(FULL_DEVICE_TYPE, None, Box::new(FullDevice { seen_reset: seen_reset.clone() }))
        .unwrap();

    assert_eq!(system.timers.len(), 1);
    assert_eq!(system.read8(0x2000), 0xFF, "empty MappingBuilder still registers open-bus reads");

    system.hard_reset();
    assert_eq!(system.timers.len(), 0, "hard reset must release the device's timer");
    assert_eq!(system.devices.len(), 0);
}

#[test]
fn soft_reset_calls_device_reset_without_releasing_resources() {
    let mut system = System::new();
    let seen_reset = Rc::new(RefCell::new(false));
    system
        .add_device(FULL_DEVICE_TYPE, None, Box::new(FullDevice { seen_reset: seen_reset.clone() }))
        .unwrap();

    system.soft_reset();
    assert!(*seen_reset.borrow());
    assert_eq!(system.devices.len(), 1);
    assert_eq!(system.timers.len(), 1, "soft reset does not tear down registered resources");
}
