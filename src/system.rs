//! The orchestrator: the single top-level value an embedder constructs,
//! owning the memory map, I/O map, PIC pair, DMA pair, PCI bus, timer wheel
//! and device catalogue as plain fields rather than scattering them across
//! global state.

use log::{debug, trace};

use crate::cpu::CpuPort;
use crate::device::{DeviceCatalogue, DeviceHandle, DeviceOps, DeviceType, FabricResources};
use crate::dma::DmaPair;
use crate::effects::{Effect, EffectQueue};
use crate::error::SetupResult;
use crate::io::IoMap;
use crate::memory::MemoryMap;
use crate::pci::PciBus;
use crate::pic::PicPair;
use crate::tick::Tick;
use crate::timer::TimerWheel;

/// Everything the bus fabric owns, minus the CPU itself — `System` is
/// driven by whatever implements [`CpuPort`].
pub struct System {
    pub memory: MemoryMap,
    pub io: IoMap,
    pub pic: PicPair,
    pub dma: DmaPair,
    pub pci: PciBus,
    pub timers: TimerWheel,
    pub devices: DeviceCatalogue,
    effects: EffectQueue,
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

impl System {
    pub fn new() -> Self {
        Self {
            memory: MemoryMap::new(),
            io: IoMap::new(),
            pic: PicPair::new(),
            dma: DmaPair::new(),
            pci: PciBus::new(),
            timers: TimerWheel::new(),
            devices: DeviceCatalogue::new(),
            effects: EffectQueue::new(),
        }
    }

    fn resources(&mut self) -> FabricResources<'_> {
        FabricResources {
            memory: &mut self.memory,
            io: &mut self.io,
            pci: &mut self.pci,
            timers: &mut self.timers,
        }
    }

    /// Construct a device and add it to the catalogue.
    pub fn add_device(
        &mut self,
        device_type: DeviceType,
        parent: Option<DeviceHandle>,
        ops: Box<dyn DeviceOps>,
    ) -> SetupResult<DeviceHandle> {
        let mut resources = self.resources();
        self.devices.construct(device_type, parent, ops, &mut resources)
    }

    /// Hard reset: close every device. The caller is expected
    /// to re-run its machine-construction routine (calling `add_device`
    /// again in the same order) immediately afterward — only it knows the
    /// original device list.
    pub fn hard_reset(&mut self) {
        let mut resources = self.resources();
        self.devices.close_all(&mut resources);
        self.pic.reset();
        self.dma.reset();
    }

    /// Soft reset: `reset()` on every device in construction order, without
    /// tearing anything down.
    pub fn soft_reset(&mut self) {
        let mut resources = self.resources();
        self.devices.soft_reset(&mut resources);
        self.pic.reset();
        self.dma.reset();
    }

    pub fn speed_changed(&mut self, new_hz: u32) {
        debug!("system: speed changed to {new_hz} Hz, notifying {} devices", self.devices.len());
        self.devices.speed_changed(new_hz);
    }

    // ---- Memory-access interface (to CPU) ----

    pub fn read8(&mut self, addr: u32) -> u8 {
        self.memory.read_b(addr)
    }
    pub fn read16(&mut self, addr: u32) -> u16 {
        self.memory.read_w(addr)
    }
    pub fn read32(&mut self, addr: u32) -> u32 {
        self.memory.read_l(addr)
    }
    pub fn write8(&mut self, addr: u32, val: u8) {
        self.memory.write_b(addr, val);
    }
    pub fn write16(&mut self, addr: u32, val: u16) {
        self.memory.write_w(addr, val);
    }
    pub fn write32(&mut self, addr: u32, val: u32) {
        self.memory.write_l(addr, val);
    }

    pub fn in8(&mut self, port: u16) -> u8 {
        self.io.inb(port)
    }
    pub fn in16(&mut self, port: u16) -> u16 {
        self.io.inw(port)
    }
    pub fn in32(&mut self, port: u16) -> u32 {
        self.io.inl(port)
    }
    pub fn out8(&mut self, port: u16, val: u8) {
        self.io.outb(port, val);
    }
    pub fn out16(&mut self, port: u16, val: u16) {
        self.io.outw(port, val);
    }
    pub fn out32(&mut self, port: u16, val: u32) {
        self.io.outl(port, val);
    }

    /// Queue an effect for the next [`Self::apply_effects`] call. Used by
    /// collaborators (e.g. PCI config handlers) that cannot safely call
    /// back into the CPU or PIC while already inside a dispatch.
    pub fn queue_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Apply every queued effect against the CPU and PIC, and flush the
    /// CPU's decode cache if any memory mapping changed. Called at
    /// instruction boundaries by the executor. Also re-syncs the memory
    /// map's SMRAM visibility with the CPU's current `in_smm` state, since
    /// entering/leaving SMM is driven entirely by the CPU and has to be
    /// picked up here before the next access.
    pub fn apply_effects(&mut self, cpu: &mut dyn CpuPort) {
        self.memory.set_in_smm(cpu.in_smm());
        for effect in self.effects.drain() {
            match effect {
                Effect::None => {}
                Effect::RaiseIrq(line) => self.pic.raise(line),
                Effect::LowerIrq(line) => self.pic.clear(line),
                Effect::RaiseNmi => cpu.raise_nmi(),
                Effect::LowerNmi => cpu.lower_nmi(),
                Effect::RaiseSmi => cpu.raise_smi(),
                Effect::RemapMemory => cpu.invalidate_decode_cache(),
            }
        }
        if self.memory.take_flush() {
            cpu.invalidate_decode_cache();
        }
    }

    pub fn cpu_acknowledge_interrupt(&mut self) -> Option<u8> {
        self.pic.acknowledge()
    }

    pub fn tsc(&self) -> Tick {
        self.timers.now()
    }

    /// Advance guest time: deduct `cycles` from the CPU's budget and, once
    /// it goes non-positive, advance the timer wheel to its earliest
    /// pending deadline and fire everything due. Wall time is dictated
    /// entirely by scheduled timers, not by a cycle-to-tick conversion; the
    /// cycle counter only decides *when* to check.
    pub fn step(&mut self, cycles: i64, cpu: &mut dyn CpuPort) {
        if cpu.consume_cycles(cycles) <= 0 {
            trace!("system: cycle budget exhausted, advancing timer wheel past {}", self.timers.now());
            self.timers.advance_to_next_deadline();
            self.apply_effects(cpu);
        }
    }
}
