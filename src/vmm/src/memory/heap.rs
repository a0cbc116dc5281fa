use tracing::{debug, warn};
use vm_memory::GuestAddress;

use super::pager::PageFlags;
use super::region::RegionManager;
use super::{align_down, align_up, PAGE_SIZE};
use crate::syscall::handlers::RegionMapping;

/// Guest-virtual base of the area where unplaced `mmap` requests land.
pub const MMAP_AREA_BASE: u64 = 0x6000_0000_0000;

/// A user-visible mapping installed at the guest's request, serving later
/// `mprotect` and `munmap` lookups.
#[derive(Debug)]
pub struct Mapping {
    pub host_p: u64,
    pub guest_p: u64,
    pub length: u64,
    pub prot: i32,
    pub flags: i32,
    pub fd: i32,
    pub offset: i64,
}

impl Mapping {
    pub fn pages(&self) -> u64 {
        self.length.div_ceil(PAGE_SIZE)
    }

    pub fn contains(&self, guest: u64) -> bool {
        guest >= self.guest_p && guest < self.guest_p + self.length
    }

    pub fn to_descriptor(&self) -> RegionMapping {
        RegionMapping {
            host_p: self.host_p,
            guest_p: self.guest_p,
            length: self.length,
            prot: self.prot,
            flags: self.flags,
            fd: self.fd,
            offset: self.offset,
        }
    }
}

/// Tracks the program break and the list of active mappings. Mapping
/// insertions keep the list sorted and non-overlapping.
pub struct HeapManager {
    brk_start: u64,
    brk: u64,
    brk_mapped_end: u64,
    mappings: Vec<Mapping>,
    next_mmap: u64,
}

impl HeapManager {
    pub fn new() -> Self {
        HeapManager {
            brk_start: 0,
            brk: 0,
            brk_mapped_end: 0,
            mappings: Vec::new(),
            next_mmap: MMAP_AREA_BASE,
        }
    }

    /// Sets the initial break to the page-rounded end of the loaded binary.
    pub fn init_brk(&mut self, start: u64) {
        let start = align_up(start);
        self.brk_start = start;
        self.brk = start;
        self.brk_mapped_end = start;
    }

    pub fn brk_value(&self) -> u64 {
        self.brk
    }

    /// Moves the program break. Refusals (shrink below start, allocation
    /// failure) leave the break unchanged and return it, like the kernel.
    pub fn brk(&mut self, rm: &mut RegionManager, requested: u64) -> u64 {
        if requested < self.brk_start {
            return self.brk;
        }
        if requested > self.brk_mapped_end {
            let guest_base = self.brk_mapped_end;
            let len = align_up(requested) - guest_base;
            let Ok(id) = rm.allocate_region(len, "heap") else {
                return self.brk;
            };
            let host = rm.region(id).host_base();
            if rm
                .pager_mut()
                .map_region(
                    host,
                    GuestAddress(guest_base),
                    len / PAGE_SIZE,
                    PageFlags::USER | PageFlags::WRITE,
                )
                .is_err()
            {
                return self.brk;
            }
            rm.set_guest(id, GuestAddress(guest_base));
            self.brk_mapped_end = guest_base + len;
        }
        self.brk = requested;
        self.brk
    }

    /// Places a mapping described by `desc`, honoring a preselected guest
    /// address. On success `desc` carries the final placement.
    pub fn mmap(
        &mut self,
        rm: &mut RegionManager,
        desc: &mut RegionMapping,
    ) -> Result<u64, i64> {
        if desc.length == 0 {
            return Err(-i64::from(libc::EINVAL));
        }
        let length = align_up(desc.length);
        let guest = if desc.guest_p != 0 {
            align_down(desc.guest_p)
        } else {
            let guest = self.next_mmap;
            self.next_mmap += length + PAGE_SIZE;
            guest
        };
        if self
            .mappings
            .iter()
            .any(|m| guest < m.guest_p + align_up(m.length) && m.guest_p < guest + length)
        {
            return Err(-i64::from(libc::EEXIST));
        }
        let id = rm
            .allocate_region(length, "mmap")
            .map_err(|_| -i64::from(libc::ENOMEM))?;
        let host = rm.region(id).host_base();
        rm.set_guest(id, GuestAddress(guest));
        let mut flags = PageFlags::USER;
        if desc.prot & libc::PROT_WRITE != 0 {
            flags |= PageFlags::WRITE;
        }
        if desc.prot & libc::PROT_EXEC != 0 {
            flags |= PageFlags::EXEC;
        }
        if rm
            .pager_mut()
            .map_region(host, GuestAddress(guest), length / PAGE_SIZE, flags)
            .is_err()
        {
            let _ = rm.free_region(host, length);
            return Err(-i64::from(libc::EINVAL));
        }
        desc.host_p = host;
        desc.guest_p = guest;
        let mapping = Mapping {
            host_p: host,
            guest_p: guest,
            length: desc.length,
            prot: desc.prot,
            flags: desc.flags,
            fd: desc.fd,
            offset: desc.offset,
        };
        let pos = self
            .mappings
            .partition_point(|m| m.guest_p < mapping.guest_p);
        self.mappings.insert(pos, mapping);
        debug!("mmap {:#x}+{:#x} prot {:#x}", guest, desc.length, desc.prot);
        Ok(guest)
    }

    /// Removes a previously recorded mapping. The address must be the start
    /// of a recorded mapping, which is removed whole.
    pub fn munmap(&mut self, rm: &mut RegionManager, guest: u64, length: u64) -> Result<(), i64> {
        let start = align_down(guest);
        let pos = self
            .mappings
            .iter()
            .position(|m| m.guest_p == start)
            .ok_or(-i64::from(libc::EINVAL))?;
        let mapping = self.mappings.remove(pos);
        if align_up(length) < align_up(mapping.length) {
            warn!(
                "munmap of {:#x} shorter than the mapping ({:#x} < {:#x}); removing it whole",
                guest, length, mapping.length
            );
        }
        rm.pager_mut()
            .unmap(GuestAddress(mapping.guest_p), mapping.pages())
            .map_err(|_| -i64::from(libc::EINVAL))?;
        rm.free_region(mapping.host_p, align_up(mapping.length))
            .map_err(|_| -i64::from(libc::EINVAL))?;
        Ok(())
    }

    /// Changes the protection of a recorded mapping.
    pub fn mprotect(
        &mut self,
        rm: &mut RegionManager,
        guest: u64,
        length: u64,
        prot: i32,
    ) -> Result<(), i64> {
        let start = align_down(guest);
        let end = guest + length;
        let mapping = self
            .mappings
            .iter_mut()
            .find(|m| m.contains(start) && end <= m.guest_p + align_up(m.length))
            .ok_or(-i64::from(libc::ENOMEM))?;
        let mut flags = PageFlags::USER;
        if prot & libc::PROT_WRITE != 0 {
            flags |= PageFlags::WRITE;
        }
        if prot & libc::PROT_EXEC != 0 {
            flags |= PageFlags::EXEC;
        }
        rm.pager_mut()
            .protect_region(GuestAddress(start), align_up(end - start) / PAGE_SIZE, flags)
            .map_err(|_| -i64::from(libc::ENOMEM))?;
        if start == mapping.guest_p && align_up(end - start) >= align_up(mapping.length) {
            mapping.prot = prot;
        }
        Ok(())
    }

    pub fn find_mapping(&self, guest: u64) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.contains(guest))
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }
}

impl Default for HeapManager {
    fn default() -> Self {
        Self::new()
    }
}
