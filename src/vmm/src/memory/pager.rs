use std::sync::Arc;

use tracing::{debug, warn};
use vm_memory::GuestAddress;

use super::chunk::{alloc_host, free_host, Chunk};
use super::{align_up, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::hv::VmHandle;

/// Guest-physical placement of the two boot chunks. The system chunk holds
/// the page tables and every kernel-space structure; the user chunk backs
/// the guest's own memory.
pub const SYSTEM_CHUNK_SIZE: u64 = 16 << 20;
pub const USER_PHYS_OFFSET: u64 = 1 << 30;

/// Area at the start of the system chunk reserved for page-table pages,
/// bump-allocated and never reclaimed. The root PML4 is its first page.
pub const TABLE_AREA_SIZE: u64 = 2 << 20;
const ROOT_PHYS: u64 = 0;

/// Kernel-space guest-virtual addresses are assigned sequentially from the
/// base of the canonical high half.
pub const KERNEL_SPACE_BASE: u64 = 0xffff_8000_0000_0000;

const PT_PRESENT: u64 = 1 << 0;
const PT_WRITE: u64 = 1 << 1;
const PT_USER: u64 = 1 << 2;
const PT_NX: u64 = 1 << 63;
const PT_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

const LEVEL_SHIFTS: [u64; 3] = [39, 30, 21];

bitflags::bitflags! {
    /// Permission bits for a guest page mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const WRITE = 1 << 0;
        const EXEC = 1 << 1;
        const USER = 1 << 2;
    }
}

/// A guest-virtual address is canonical when bits 63:48 replicate bit 47.
pub fn is_canonical(addr: u64) -> bool {
    let upper = addr >> 47;
    upper == 0 || upper == 0x1ffff
}

/// Owns the chunk table and the guest page tables; translates between the
/// three address spaces and installs or removes mappings.
pub struct Pager {
    hv: Arc<dyn VmHandle>,
    chunks: Vec<Chunk>,
    table_bump: u64,
    kernel_next: u64,
    needs_flush: bool,
}

impl Pager {
    /// Creates the system chunk at guest-physical zero and the user chunk at
    /// [`USER_PHYS_OFFSET`], both registered with the hypervisor.
    pub fn new(hv: Arc<dyn VmHandle>, user_size: u64) -> Result<Self> {
        let mut pager = Pager {
            hv,
            chunks: Vec::new(),
            table_bump: ROOT_PHYS + PAGE_SIZE,
            kernel_next: KERNEL_SPACE_BASE,
            needs_flush: false,
        };
        pager.create_chunk(SYSTEM_CHUNK_SIZE, 0)?;
        pager.create_chunk(align_up(user_size), USER_PHYS_OFFSET)?;
        Ok(pager)
    }

    /// Allocates a page-aligned host buffer and registers it as a new
    /// guest-physical slot. Returns the chunk id.
    pub fn create_chunk(&mut self, size: u64, guest_phys: u64) -> Result<usize> {
        let size = align_up(size);
        debug_assert!(self
            .chunks
            .iter()
            .all(|c| guest_phys + size <= c.guest_phys || guest_phys >= c.guest_phys + c.size));
        let host_base = alloc_host(size)?;
        let slot = self.chunks.len() as u32;
        if let Err(e) = self.hv.register_chunk(slot, guest_phys, host_base, size) {
            free_host(host_base, size);
            return Err(e);
        }
        self.chunks.push(Chunk {
            slot,
            host_base,
            guest_phys,
            size,
        });
        Ok(self.chunks.len() - 1)
    }

    pub fn chunk(&self, num: usize) -> Option<&Chunk> {
        self.chunks.get(num)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Replaces a chunk's backing buffer with a fresh zeroed one of
    /// `newsize`, re-registered at the same guest-physical base. All data in
    /// the old buffer is lost and every page-table entry that pointed into
    /// the chunk is invalidated.
    pub fn chunk_remap(&mut self, num: usize, newsize: u64) -> Result<()> {
        let (slot, guest_phys, old_host, old_size) = {
            let chunk = self
                .chunks
                .get(num)
                .ok_or_else(|| Error::Fatal(format!("remap of unknown chunk {num}")))?;
            (chunk.slot, chunk.guest_phys, chunk.host_base, chunk.size)
        };
        self.hv.unregister_chunk(slot, guest_phys, old_host)?;
        self.invalidate_phys_range(guest_phys, old_size);
        free_host(old_host, old_size);

        let newsize = align_up(newsize);
        let new_host = alloc_host(newsize)?;
        self.hv.register_chunk(slot, guest_phys, new_host, newsize)?;
        let chunk = &mut self.chunks[num];
        chunk.host_base = new_host;
        chunk.size = newsize;
        self.needs_flush = true;
        Ok(())
    }

    pub fn host_for_phys(&self, phys: u64) -> Option<u64> {
        self.chunks.iter().find_map(|c| c.host_for_phys(phys))
    }

    pub fn phys_for_host(&self, host: u64) -> Option<u64> {
        self.chunks.iter().find_map(|c| c.phys_for_host(host))
    }

    /// Walks the tables: guest-virtual to host address.
    pub fn host_address(&self, guest: GuestAddress) -> Option<u64> {
        let phys = self.guest_phys(guest)?;
        self.host_for_phys(phys)
    }

    /// Walks the tables: guest-virtual to guest-physical.
    pub fn guest_phys(&self, guest: GuestAddress) -> Option<u64> {
        let addr = guest.0;
        if !is_canonical(addr) {
            return None;
        }
        let mut table = ROOT_PHYS;
        for shift in LEVEL_SHIFTS {
            let entry = self.read_entry(table, (addr >> shift) & 0x1ff)?;
            if entry & PT_PRESENT == 0 {
                return None;
            }
            table = entry & PT_ADDR_MASK;
        }
        let pte = self.read_entry(table, (addr >> 12) & 0x1ff)?;
        if pte & PT_PRESENT == 0 {
            return None;
        }
        Some((pte & PT_ADDR_MASK) | (addr & (PAGE_SIZE - 1)))
    }

    /// Maps one user-accessible page at the caller's guest-virtual address.
    pub fn map_user_page(&mut self, host: u64, guest: GuestAddress, flags: PageFlags) -> Result<()> {
        self.map_page(host, guest.0, flags | PageFlags::USER)
    }

    /// Maps one kernel page, assigning the next free kernel-space address.
    pub fn map_kernel_page(&mut self, host: u64, flags: PageFlags) -> Result<GuestAddress> {
        let guest = self.kernel_next;
        self.map_page(host, guest, flags - PageFlags::USER)?;
        self.kernel_next += PAGE_SIZE;
        Ok(GuestAddress(guest))
    }

    /// Maps `npages` contiguous kernel pages; returns the base address.
    pub fn map_kernel_region(
        &mut self,
        host_base: u64,
        npages: u64,
        flags: PageFlags,
    ) -> Result<GuestAddress> {
        let base = self.kernel_next;
        for i in 0..npages {
            self.map_kernel_page(host_base + i * PAGE_SIZE, flags)?;
        }
        Ok(GuestAddress(base))
    }

    /// Maps `npages` starting at `guest`, backed by contiguous host memory.
    pub fn map_region(
        &mut self,
        host_base: u64,
        guest: GuestAddress,
        npages: u64,
        flags: PageFlags,
    ) -> Result<()> {
        for i in 0..npages {
            self.map_page(host_base + i * PAGE_SIZE, guest.0 + i * PAGE_SIZE, flags)?;
        }
        Ok(())
    }

    /// Rewrites the permission bits of `npages` existing mappings, leaving
    /// the frames in place. Serves `mprotect`.
    pub fn protect_region(
        &mut self,
        guest: GuestAddress,
        npages: u64,
        flags: PageFlags,
    ) -> Result<()> {
        for i in 0..npages {
            let addr = guest.0 + i * PAGE_SIZE;
            let (table, idx) = self
                .walk_to_pte(addr)
                .ok_or(Error::Translation(addr))?;
            let pte = self.read_entry(table, idx).ok_or(Error::Translation(addr))?;
            if pte & PT_PRESENT == 0 {
                return Err(Error::Translation(addr));
            }
            self.write_entry(table, idx, (pte & PT_ADDR_MASK) | pte_bits(flags));
        }
        self.needs_flush = true;
        Ok(())
    }

    /// Clears the final-level entries for `npages`. Intermediate tables are
    /// not reclaimed; the leak is bounded by address space actually used.
    pub fn unmap(&mut self, guest: GuestAddress, npages: u64) -> Result<()> {
        for i in 0..npages {
            let addr = guest.0 + i * PAGE_SIZE;
            if let Some((table, idx)) = self.walk_to_pte(addr) {
                self.write_entry(table, idx, 0);
            }
        }
        self.needs_flush = true;
        Ok(())
    }

    /// True once since the last edit that requires a guest TLB flush.
    pub fn take_flush(&mut self) -> bool {
        std::mem::take(&mut self.needs_flush)
    }

    pub fn dump_page_tables(&self) {
        self.dump_level(ROOT_PHYS, 0, 0);
    }

    fn dump_level(&self, table: u64, level: usize, base: u64) {
        for idx in 0..512u64 {
            let Some(entry) = self.read_entry(table, idx) else {
                continue;
            };
            if entry & PT_PRESENT == 0 {
                continue;
            }
            let shift = 39 - 9 * level as u64;
            let addr = base | (idx << shift);
            if level == 3 {
                debug!(
                    "  pte {:#016x} -> {:#016x} {}{}{}",
                    addr,
                    entry & PT_ADDR_MASK,
                    if entry & PT_WRITE != 0 { "w" } else { "-" },
                    if entry & PT_USER != 0 { "u" } else { "-" },
                    if entry & PT_NX != 0 { "-" } else { "x" },
                );
            } else {
                debug!("table L{} {:#016x} -> {:#016x}", level + 1, addr, entry & PT_ADDR_MASK);
                self.dump_level(entry & PT_ADDR_MASK, level + 1, addr);
            }
        }
    }

    fn map_page(&mut self, host: u64, guest: u64, flags: PageFlags) -> Result<()> {
        if !is_canonical(guest) {
            return Err(Error::Translation(guest));
        }
        debug_assert_eq!(0, host & (PAGE_SIZE - 1));
        debug_assert_eq!(0, guest & (PAGE_SIZE - 1));
        let frame = self
            .phys_for_host(host)
            .ok_or(Error::Translation(guest))?;
        let user = flags.contains(PageFlags::USER);

        let mut table = ROOT_PHYS;
        for shift in LEVEL_SHIFTS {
            table = self.ensure_table(table, (guest >> shift) & 0x1ff, user)?;
        }
        let idx = (guest >> 12) & 0x1ff;
        let pte = frame | pte_bits(flags);
        if let Some(existing) = self.read_entry(table, idx) {
            if existing & PT_PRESENT != 0 {
                if existing & PT_ADDR_MASK != frame {
                    return Err(Error::Conflict(guest));
                }
                if existing == pte {
                    return Ok(());
                }
                warn!(
                    "remapping {:#x} with new permissions ({:#x} -> {:#x})",
                    guest, existing, pte
                );
                self.needs_flush = true;
            }
        }
        self.write_entry(table, idx, pte);
        Ok(())
    }

    /// Returns the child table a walk entry points at, allocating it from
    /// the table area when absent.
    fn ensure_table(&mut self, parent: u64, idx: u64, user: bool) -> Result<u64> {
        let entry = self
            .read_entry(parent, idx)
            .ok_or(Error::Translation(parent))?;
        if entry & PT_PRESENT != 0 {
            let table = entry & PT_ADDR_MASK;
            if user && entry & PT_USER == 0 {
                self.write_entry(parent, idx, entry | PT_USER);
            }
            return Ok(table);
        }
        let table = self.alloc_table()?;
        let mut bits = PT_PRESENT | PT_WRITE;
        if user {
            bits |= PT_USER;
        }
        self.write_entry(parent, idx, table | bits);
        Ok(table)
    }

    fn alloc_table(&mut self) -> Result<u64> {
        if self.table_bump + PAGE_SIZE > TABLE_AREA_SIZE {
            return Err(Error::Resource(
                "allocating a page-table page",
                std::io::Error::from_raw_os_error(libc::ENOMEM),
            ));
        }
        let phys = self.table_bump;
        self.table_bump += PAGE_SIZE;
        let host = self.host_for_phys(phys).expect("table area inside system chunk");
        unsafe {
            std::ptr::write_bytes(host as *mut u8, 0, PAGE_SIZE as usize);
        }
        Ok(phys)
    }

    fn walk_to_pte(&self, guest: u64) -> Option<(u64, u64)> {
        if !is_canonical(guest) {
            return None;
        }
        let mut table = ROOT_PHYS;
        for shift in LEVEL_SHIFTS {
            let entry = self.read_entry(table, (guest >> shift) & 0x1ff)?;
            if entry & PT_PRESENT == 0 {
                return None;
            }
            table = entry & PT_ADDR_MASK;
        }
        Some((table, (guest >> 12) & 0x1ff))
    }

    /// Clears every final-level entry whose frame lies in the given
    /// guest-physical range. Used when a chunk's backing goes away.
    fn invalidate_phys_range(&mut self, phys_base: u64, size: u64) {
        self.invalidate_level(ROOT_PHYS, 0, phys_base, size);
        self.needs_flush = true;
    }

    fn invalidate_level(&mut self, table: u64, level: usize, phys_base: u64, size: u64) {
        for idx in 0..512u64 {
            let Some(entry) = self.read_entry(table, idx) else {
                continue;
            };
            if entry & PT_PRESENT == 0 {
                continue;
            }
            let target = entry & PT_ADDR_MASK;
            if level == 3 {
                if target >= phys_base && target < phys_base + size {
                    self.write_entry(table, idx, 0);
                }
            } else {
                self.invalidate_level(target, level + 1, phys_base, size);
            }
        }
    }

    fn read_entry(&self, table: u64, idx: u64) -> Option<u64> {
        let host = self.host_for_phys(table + idx * 8)?;
        Some(unsafe { (host as *const u64).read() })
    }

    fn write_entry(&mut self, table: u64, idx: u64, value: u64) {
        let host = self
            .host_for_phys(table + idx * 8)
            .expect("page-table pages live in the system chunk");
        unsafe { (host as *mut u64).write(value) }
    }
}

fn pte_bits(flags: PageFlags) -> u64 {
    let mut bits = PT_PRESENT;
    if flags.contains(PageFlags::WRITE) {
        bits |= PT_WRITE;
    }
    if flags.contains(PageFlags::USER) {
        bits |= PT_USER;
    }
    if !flags.contains(PageFlags::EXEC) {
        bits |= PT_NX;
    }
    bits
}
