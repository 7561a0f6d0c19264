//! The memory map: a page-indexed cache of the highest-priority mapping
//! covering each 4 KiB page of a 32-bit physical address space.
//!
//! Handlers are boxed closures rather than raw `fn` pointers, since the
//! fabric's devices are an open set and each needs its own captured state; a
//! device shares that state with its I/O handlers and timers the same way,
//! via `Rc<RefCell<_>>` (see [`crate::timer`]). `exec_ptr` stays a raw
//! pointer: a backing-store fast path for RAM and ROM shadow that bypasses
//! the handler entirely.

use bitflags::bitflags;

use crate::arena::{Arena, Handle};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
const NUM_PAGES: usize = 1 << (32 - PAGE_SHIFT);

pub type MappingHandle = Handle<Mapping>;

bitflags! {
    /// Flags on a [`Mapping`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u32 {
        const EXTERNAL = 1 << 0;
        const ROM      = 1 << 1;
        const SMRAM    = 1 << 2;
        const DISABLED = 1 << 3;
        const SMM_ONLY = 1 << 4;
    }
}

bitflags! {
    /// Per-page chipset bookkeeping. The fabric stores and returns this; it
    /// does not interpret it, leaving shadow-RAM and SMRAM-overlay policy to
    /// the chipset device that programs it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageState: u8 {
        const READ_EXTANY          = 1 << 0;
        const READ_EXTERN_ALIAS    = 1 << 1;
        const WRITE_EXTANY         = 1 << 2;
        const WRITE_EXTERN_ALIAS   = 1 << 3;
        const SMRAM_OVERLAY        = 1 << 4;
        const CACHEABLE            = 1 << 5;
    }
}

type Read8 = Box<dyn FnMut(u32) -> u8>;
type Read16 = Box<dyn FnMut(u32) -> u16>;
type Read32 = Box<dyn FnMut(u32) -> u32>;
type Write8 = Box<dyn FnMut(u32, u8)>;
type Write16 = Box<dyn FnMut(u32, u16)>;
type Write32 = Box<dyn FnMut(u32, u32)>;

/// A range of the physical address space backed by handlers and/or a direct
/// pointer.
pub struct Mapping {
    base: u32,
    size: u32,
    r8: Option<Read8>,
    r16: Option<Read16>,
    r32: Option<Read32>,
    w8: Option<Write8>,
    w16: Option<Write16>,
    w32: Option<Write32>,
    /// Backing pointer for the fast path. Safety: the registrant guarantees
    /// this stays valid for `size` bytes for as long as the mapping is
    /// enabled; `set_exec` is the only way to install one and is `unsafe`
    /// for that reason.
    exec_ptr: Option<*mut u8>,
    flags: MemFlags,
    priority: u8,
    enabled: bool,
    insertion_seq: u64,
}

impl Mapping {
    fn covers(&self, addr: u32) -> bool {
        !self.flags.contains(MemFlags::DISABLED)
            && self.enabled
            && addr >= self.base
            && (addr - self.base) < self.size
    }

    fn visible(&self, in_smm: bool) -> bool {
        if self.flags.contains(MemFlags::SMM_ONLY) && !in_smm {
            return false;
        }
        if self.flags.contains(MemFlags::SMRAM) && !in_smm {
            return false;
        }
        true
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Builder for [`MemoryMap::set_handlers`], to avoid a nine-argument
/// function signature.
#[derive(Default)]
pub struct MappingBuilder {
    pub r8: Option<Read8>,
    pub r16: Option<Read16>,
    pub r32: Option<Read32>,
    pub w8: Option<Write8>,
    pub w16: Option<Write16>,
    pub w32: Option<Write32>,
    pub flags: MemFlags,
    pub priority: u8,
}

pub struct MemoryMap {
    mappings: Arena<Mapping>,
    page_cache: Vec<Option<MappingHandle>>,
    state: Vec<PageState>,
    insertion_counter: u64,
    in_smm: bool,
    needs_flush: bool,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMap {
    pub fn new() -> Self {
        Self {
            mappings: Arena::new(),
            page_cache: vec![None; NUM_PAGES],
            state: vec![PageState::empty(); NUM_PAGES],
            insertion_counter: 0,
            in_smm: false,
            needs_flush: false,
        }
    }

    pub fn set_in_smm(&mut self, in_smm: bool) {
        if self.in_smm != in_smm {
            self.in_smm = in_smm;
            self.recompute_all();
        }
    }

    /// Register a mapping covering `[base, base + size)`. Returns a stable
    /// handle usable with every other method on this type.
    pub fn set_handlers(&mut self, base: u32, size: u32, builder: MappingBuilder) -> MappingHandle {
        let seq = self.next_seq();
        let handle = self.mappings.insert(Mapping {
            base,
            size,
            r8: builder.r8,
            r16: builder.r16,
            r32: builder.r32,
            w8: builder.w8,
            w16: builder.w16,
            w32: builder.w32,
            exec_ptr: None,
            flags: builder.flags,
            priority: builder.priority,
            enabled: true,
            insertion_seq: seq,
        });
        self.recompute_range(base, size);
        handle
    }

    /// Install (or clear) the fast-path backing pointer.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of the mapping's `size`
    /// bytes for as long as it remains installed and the mapping is enabled.
    pub unsafe fn set_exec(&mut self, handle: MappingHandle, ptr: Option<*mut u8>) {
        if let Some(mapping) = self.mappings.get_mut(handle) {
            mapping.exec_ptr = ptr;
        }
    }

    pub fn enable(&mut self, handle: MappingHandle) {
        self.set_enabled(handle, true);
    }

    pub fn disable(&mut self, handle: MappingHandle) {
        self.set_enabled(handle, false);
    }

    fn set_enabled(&mut self, handle: MappingHandle, enabled: bool) {
        let range = match self.mappings.get_mut(handle) {
            Some(m) if m.enabled != enabled => {
                m.enabled = enabled;
                Some((m.base, m.size))
            }
            _ => None,
        };
        if let Some((base, size)) = range {
            self.recompute_range(base, size);
        }
    }

    pub fn set_addr(&mut self, handle: MappingHandle, new_base: u32) {
        let old_range = self.mappings.get(handle).map(|m| (m.base, m.size));
        if let Some((old_base, size)) = old_range {
            if let Some(m) = self.mappings.get_mut(handle) {
                m.base = new_base;
            }
            self.recompute_range(old_base, size);
            self.recompute_range(new_base, size);
        }
    }

    pub fn remove(&mut self, handle: MappingHandle) {
        if let Some(m) = self.mappings.remove(handle) {
            self.recompute_range(m.base, m.size);
        }
    }

    pub fn set_state(&mut self, addr: u32, size: u32, state: PageState) {
        for page in page_range(addr, size) {
            self.state[page as usize] = state;
        }
    }

    pub fn state_at(&self, addr: u32) -> PageState {
        self.state[page_index(addr) as usize]
    }

    /// Consume the pending decode-cache-invalidation signal. Returns whether
    /// the caller must call `CpuPort::invalidate_decode_cache`.
    pub fn take_flush(&mut self) -> bool {
        std::mem::take(&mut self.needs_flush)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.insertion_counter;
        self.insertion_counter += 1;
        seq
    }

    fn recompute_range(&mut self, base: u32, size: u32) {
        for page in page_range(base, size) {
            self.recompute_page(page);
        }
        self.needs_flush = true;
    }

    fn recompute_all(&mut self) {
        for page in 0..NUM_PAGES as u32 {
            self.recompute_page(page);
        }
        self.needs_flush = true;
    }

    fn recompute_page(&mut self, page: u32) {
        let addr = page << PAGE_SHIFT;
        let mut best: Option<(MappingHandle, u8, u64)> = None;
        for (handle, mapping) in self.mappings.iter() {
            if !mapping.covers(addr) || !mapping.visible(self.in_smm) {
                continue;
            }
            let key = (mapping.priority, mapping.insertion_seq);
            let replace = match best {
                None => true,
                Some((_, p, s)) => key >= (p, s),
            };
            if replace {
                best = Some((handle, mapping.priority, mapping.insertion_seq));
            }
        }
        self.page_cache[page as usize] = best.map(|(h, ..)| h);
    }

    fn crosses_page(addr: u32, width: u32) -> bool {
        (addr & (PAGE_SIZE - 1)) + width > PAGE_SIZE
    }

    pub fn read_b(&mut self, addr: u32) -> u8 {
        match self.page_cache[page_index(addr) as usize] {
            Some(handle) => self.dispatch_read_b(handle, addr),
            None => 0xFF,
        }
    }

    pub fn read_w(&mut self, addr: u32) -> u16 {
        if Self::crosses_page(addr, 2) {
            let lo = self.read_b(addr) as u16;
            let hi = self.read_b(addr.wrapping_add(1)) as u16;
            return lo | (hi << 8);
        }
        match self.page_cache[page_index(addr) as usize] {
            Some(handle) => self.dispatch_read_w(handle, addr),
            None => 0xFFFF,
        }
    }

    pub fn read_l(&mut self, addr: u32) -> u32 {
        if Self::crosses_page(addr, 4) {
            let lo = self.read_w(addr) as u32;
            let hi = self.read_w(addr.wrapping_add(2)) as u32;
            return lo | (hi << 16);
        }
        match self.page_cache[page_index(addr) as usize] {
            Some(handle) => self.dispatch_read_l(handle, addr),
            None => 0xFFFF_FFFF,
        }
    }

    pub fn write_b(&mut self, addr: u32, val: u8) {
        if let Some(handle) = self.page_cache[page_index(addr) as usize] {
            self.dispatch_write_b(handle, addr, val);
        }
    }

    pub fn write_w(&mut self, addr: u32, val: u16) {
        if Self::crosses_page(addr, 2) {
            self.write_b(addr, val as u8);
            self.write_b(addr.wrapping_add(1), (val >> 8) as u8);
            return;
        }
        if let Some(handle) = self.page_cache[page_index(addr) as usize] {
            self.dispatch_write_w(handle, addr, val);
        }
    }

    pub fn write_l(&mut self, addr: u32, val: u32) {
        if Self::crosses_page(addr, 4) {
            self.write_w(addr, val as u16);
            self.write_w(addr.wrapping_add(2), (val >> 16) as u16);
            return;
        }
        if let Some(handle) = self.page_cache[page_index(addr) as usize] {
            self.dispatch_write_l(handle, addr, val);
        }
    }

    fn dispatch_read_b(&mut self, handle: MappingHandle, addr: u32) -> u8 {
        let Some(mapping) = self.mappings.get_mut(handle) else {
            return 0xFF;
        };
        if let Some(ptr) = mapping.exec_ptr {
            let offset = (addr - mapping.base) as usize;
            return unsafe { std::ptr::read(ptr.add(offset)) };
        }
        if let Some(r8) = mapping.r8.as_mut() {
            return r8(addr);
        }
        let aligned = addr & !1;
        if let Some(r16) = mapping.r16.as_mut() {
            return (r16(aligned) >> ((addr & 1) * 8)) as u8;
        }
        let aligned4 = addr & !3;
        if let Some(r32) = mapping.r32.as_mut() {
            return (r32(aligned4) >> ((addr & 3) * 8)) as u8;
        }
        0xFF
    }

    fn dispatch_read_w(&mut self, handle: MappingHandle, addr: u32) -> u16 {
        let Some(mapping) = self.mappings.get_mut(handle) else {
            return 0xFFFF;
        };
        if let Some(ptr) = mapping.exec_ptr {
            let offset = (addr - mapping.base) as usize;
            return unsafe { std::ptr::read_unaligned(ptr.add(offset) as *const u16) };
        }
        if let Some(r16) = mapping.r16.as_mut() {
            return r16(addr);
        }
        if let Some(r8) = mapping.r8.as_mut() {
            let lo = r8(addr) as u16;
            let hi = r8(addr.wrapping_add(1)) as u16;
            return lo | (hi << 8);
        }
        let aligned4 = addr & !3;
        if let Some(r32) = mapping.r32.as_mut() {
            return (r32(aligned4) >> ((addr & 3) * 8)) as u16;
        }
        0xFFFF
    }

    fn dispatch_read_l(&mut self, handle: MappingHandle, addr: u32) -> u32 {
        let Some(mapping) = self.mappings.get_mut(handle) else {
            return 0xFFFF_FFFF;
        };
        if let Some(ptr) = mapping.exec_ptr {
            let offset = (addr - mapping.base) as usize;
            return unsafe { std::ptr::read_unaligned(ptr.add(offset) as *const u32) };
        }
        if let Some(r32) = mapping.r32.as_mut() {
            return r32(addr);
        }
        if let Some(r16) = mapping.r16.as_mut() {
            let lo = r16(addr) as u32;
            let hi = r16(addr.wrapping_add(2)) as u32;
            return lo | (hi << 16);
        }
        if let Some(r8) = mapping.r8.as_mut() {
            let b0 = r8(addr) as u32;
            let b1 = r8(addr.wrapping_add(1)) as u32;
            let b2 = r8(addr.wrapping_add(2)) as u32;
            let b3 = r8(addr.wrapping_add(3)) as u32;
            return b0 | (b1 << 8) | (b2 << 16) | (b3 << 24);
        }
        0xFFFF_FFFF
    }

    fn dispatch_write_b(&mut self, handle: MappingHandle, addr: u32, val: u8) {
        let Some(mapping) = self.mappings.get_mut(handle) else {
            return;
        };
        if mapping.flags.contains(MemFlags::ROM) {
            return;
        }
        if let Some(ptr) = mapping.exec_ptr {
            let offset = (addr - mapping.base) as usize;
            unsafe { std::ptr::write(ptr.add(offset), val) };
            return;
        }
        if let Some(w8) = mapping.w8.as_mut() {
            w8(addr, val);
        } else if let Some(w16) = mapping.w16.as_mut() {
            w16(addr & !1, val as u16);
        } else if let Some(w32) = mapping.w32.as_mut() {
            w32(addr & !3, val as u32);
        }
    }

    fn dispatch_write_w(&mut self, handle: MappingHandle, addr: u32, val: u16) {
        let Some(mapping) = self.mappings.get_mut(handle) else {
            return;
        };
        if mapping.flags.contains(MemFlags::ROM) {
            return;
        }
        if let Some(ptr) = mapping.exec_ptr {
            let offset = (addr - mapping.base) as usize;
            unsafe { std::ptr::write_unaligned(ptr.add(offset) as *mut u16, val) };
            return;
        }
        if let Some(w16) = mapping.w16.as_mut() {
            w16(addr, val);
        } else if let Some(w8) = mapping.w8.as_mut() {
            w8(addr, val as u8);
            w8(addr.wrapping_add(1), (val >> 8) as u8);
        } else if let Some(w32) = mapping.w32.as_mut() {
            w32(addr & !3, val as u32);
        }
    }

    fn dispatch_write_l(&mut self, handle: MappingHandle, addr: u32, val: u32) {
        let Some(mapping) = self.mappings.get_mut(handle) else {
            return;
        };
        if mapping.flags.contains(MemFlags::ROM) {
            return;
        }
        if let Some(ptr) = mapping.exec_ptr {
            let offset = (addr - mapping.base) as usize;
            unsafe { std::ptr::write_unaligned(ptr.add(offset) as *mut u32, val) };
            return;
        }
        if let Some(w32) = mapping.w32.as_mut() {
            w32(addr, val);
        } else if let Some(w16) = mapping.w16.as_mut() {
            w16(addr, val as u16);
            w16(addr.wrapping_add(2), (val >> 16) as u16);
        } else if let Some(w8) = mapping.w8.as_mut() {
            w8(addr, val as u8);
            w8(addr.wrapping_add(1), (val >> 8) as u8);
            w8(addr.wrapping_add(2), (val >> 16) as u8);
            w8(addr.wrapping_add(3), (val >> 24) as u8);
        }
    }
}

fn page_index(addr: u32) -> u32 {
    addr >> PAGE_SHIFT
}

fn page_range(base: u32, size: u32) -> std::ops::RangeInclusive<u32> {
    let first = page_index(base);
    let last = page_index(base.saturating_add(size.saturating_sub(1)));
    first..=last
}
