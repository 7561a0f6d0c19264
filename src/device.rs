//! Device catalogue & orchestrator lifecycle.
//!
//! A [`DeviceCatalogue`] owns every constructed device and, through
//! [`DeviceBuilder`], every timer/mapping/I/O handler/PCI function that
//! device's `init` registered — so destroying a device can clean all of it
//! up without the device having to remember its own resource list.

use bitflags::bitflags;
use log::{debug, info};

use crate::arena::{Arena, Handle};
use crate::error::SetupResult;
use crate::io::{IoHandle, IoHandlers, IoMap};
use crate::memory::{MappingBuilder, MappingHandle, MemoryMap};
use crate::pci::{FunctionHandle, IntxPin, PciBus, SlotClass};
use crate::timer::{TimerHandle, TimerWheel};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u16 {
        const ISA  = 1 << 0;
        const ISA16 = 1 << 1;
        const VLB  = 1 << 2;
        const PCI  = 1 << 3;
        const MCA  = 1 << 4;
        const AT   = 1 << 5;
        const COM  = 1 << 6;
        const LPT  = 1 << 7;
    }
}

/// Static description of a kind of device, independent of any particular
/// instance.
#[derive(Debug, Clone, Copy)]
pub struct DeviceType {
    pub internal_name: &'static str,
    pub name: &'static str,
    pub capabilities: Capabilities,
    pub local: u32,
}

pub type DeviceHandle = Handle<DeviceSlot>;

/// The lifecycle contract every device type implements.
/// `reset` and `speed_changed` have no-op defaults since not every device
/// cares about bus-speed changes, and `reset` is meaningful only for
/// devices with internal state worth re-initializing.
pub trait DeviceOps {
    fn init(&mut self, builder: &mut DeviceBuilder) -> SetupResult<()>;
    fn close(&mut self, builder: &mut DeviceBuilder) {
        let _ = builder;
    }
    fn reset(&mut self, builder: &mut DeviceBuilder) {
        let _ = builder;
    }
    fn available(&self) -> bool {
        true
    }
    fn speed_changed(&mut self, new_hz: u32) {
        let _ = new_hz;
    }
    /// Video-only; everything else ignores it.
    fn force_redraw(&mut self) {}
}

/// Resources a device's `init` registered, tracked so `close` can release
/// them without the device keeping its own bookkeeping.
#[derive(Default)]
pub struct OwnedResources {
    timers: Vec<TimerHandle>,
    mappings: Vec<MappingHandle>,
    io: Vec<IoHandle>,
    pci: Vec<FunctionHandle>,
}

/// Borrowed fabric resources, handed to a device's lifecycle calls. Every
/// `add_*` call is recorded in `owned` so the catalogue can release it on
/// `close` regardless of whether the device itself kept a copy of the handle.
pub struct DeviceBuilder<'a> {
    pub memory: &'a mut MemoryMap,
    pub io: &'a mut IoMap,
    pub pci: &'a mut PciBus,
    pub timers: &'a mut TimerWheel,
    owned: &'a mut OwnedResources,
}

impl<'a> DeviceBuilder<'a> {
    pub fn add_timer(&mut self, callback: impl FnMut(&mut TimerWheel) + 'static) -> TimerHandle {
        let handle = self.timers.add(callback);
        self.owned.timers.push(handle);
        handle
    }

    pub fn add_mapping(&mut self, base: u32, size: u32, mapping: MappingBuilder) -> MappingHandle {
        let handle = self.memory.set_handlers(base, size, mapping);
        self.owned.mappings.push(handle);
        handle
    }

    pub fn add_io(&mut self, port: u16, length: u16, handlers: IoHandlers) -> IoHandle {
        let handle = self.io.set_handler(port, length, handlers);
        self.owned.io.push(handle);
        handle
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_pci_function(
        &mut self,
        class: SlotClass,
        preferred_slots: &[u8],
        function: u8,
        read: Box<dyn FnMut(u8, u8) -> u8>,
        write: Box<dyn FnMut(u8, u8, u8)>,
        irq_pin: Option<IntxPin>,
    ) -> Option<FunctionHandle> {
        let handle = self.pci.add_card(class, preferred_slots, function, read, write, irq_pin)?;
        self.owned.pci.push(handle);
        Some(handle)
    }
}

/// One constructed device: its static type, lifecycle object, and the
/// resources it has registered.
pub struct DeviceSlot {
    pub device_type: DeviceType,
    pub instance_id: u32,
    pub parent: Option<DeviceHandle>,
    ops: Box<dyn DeviceOps>,
    owned: OwnedResources,
}

/// Shared fabric resources a catalogue operation needs to reach into
/// (construction, close, reset all take the same bundle).
pub struct FabricResources<'a> {
    pub memory: &'a mut MemoryMap,
    pub io: &'a mut IoMap,
    pub pci: &'a mut PciBus,
    pub timers: &'a mut TimerWheel,
}

impl<'a> FabricResources<'a> {
    fn builder<'b>(&'b mut self, owned: &'b mut OwnedResources) -> DeviceBuilder<'b> {
        DeviceBuilder {
            memory: self.memory,
            io: self.io,
            pci: self.pci,
            timers: self.timers,
            owned,
        }
    }
}

/// The device catalogue and orchestrator: tracks every constructed device in
/// deterministic construction order and drives hard vs. soft reset and
/// bus-speed-change fan-out across them.
#[derive(Default)]
pub struct DeviceCatalogue {
    devices: Arena<DeviceSlot>,
    construction_order: Vec<DeviceHandle>,
    next_instance_id: u32,
}

impl DeviceCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a device, calling `init`. A failure leaves the catalogue
    /// unchanged; constructor failure aborts machine bring-up.
    pub fn construct(
        &mut self,
        device_type: DeviceType,
        parent: Option<DeviceHandle>,
        mut ops: Box<dyn DeviceOps>,
        resources: &mut FabricResources,
    ) -> SetupResult<DeviceHandle> {
        let instance_id = self.next_instance_id;
        let mut owned = OwnedResources::default();
        {
            let mut builder = resources.builder(&mut owned);
            ops.init(&mut builder)?;
        }
        self.next_instance_id += 1;
        let handle = self.devices.insert(DeviceSlot {
            device_type,
            instance_id,
            parent,
            ops,
            owned,
        });
        self.construction_order.push(handle);
        debug!(
            "device: constructed '{}' (instance {instance_id}) at position {}",
            device_type.internal_name,
            self.construction_order.len() - 1
        );
        Ok(handle)
    }

    /// Hard reset: close every device in reverse construction order,
    /// releasing all resources they registered. Rebuilding the machine from
    /// its definition is the caller's responsibility (`System::hard_reset`),
    /// since only the caller knows the original device list.
    pub fn close_all(&mut self, resources: &mut FabricResources) {
        info!("device: closing {} devices (hard reset)", self.construction_order.len());
        for handle in self.construction_order.drain(..).rev().collect::<Vec<_>>() {
            if let Some(mut slot) = self.devices.remove(handle) {
                let mut builder = resources.builder(&mut slot.owned);
                slot.ops.close(&mut builder);
                release(&mut builder, &slot.owned);
            }
        }
    }

    /// Soft reset: call every device's `reset` in construction order,
    /// without touching resource ownership. Must restore the bus/memory map
    /// to the post-init state without re-allocating device state.
    pub fn soft_reset(&mut self, resources: &mut FabricResources) {
        debug!("device: soft reset ({} devices)", self.construction_order.len());
        for handle in self.construction_order.clone() {
            if let Some(slot) = self.devices.get_mut(handle) {
                let mut builder = resources.builder(&mut slot.owned);
                slot.ops.reset(&mut builder);
            }
        }
    }

    pub fn speed_changed(&mut self, new_hz: u32) {
        for handle in self.construction_order.clone() {
            if let Some(slot) = self.devices.get_mut(handle) {
                slot.ops.speed_changed(new_hz);
            }
        }
    }

    pub fn force_redraw_all(&mut self) {
        for handle in self.construction_order.clone() {
            if let Some(slot) = self.devices.get_mut(handle) {
                slot.ops.force_redraw();
            }
        }
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<&DeviceSlot> {
        self.devices.get(handle)
    }

    pub fn len(&self) -> usize {
        self.construction_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.construction_order.is_empty()
    }
}

fn release(builder: &mut DeviceBuilder, owned: &OwnedResources) {
    for &t in &owned.timers {
        builder.timers.remove(t);
    }
    for &m in &owned.mappings {
        builder.memory.remove(m);
    }
    for &i in &owned.io {
        builder.io.remove_handler(i);
    }
    for &p in &owned.pci {
        builder.pci.remove_card(p);
    }
}
