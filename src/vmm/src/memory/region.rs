use tracing::debug;
use vm_memory::GuestAddress;

use super::pager::{PageFlags, Pager, SYSTEM_CHUNK_SIZE, TABLE_AREA_SIZE};
use super::{align_up, host_slice, PAGE_SIZE};
use crate::error::{Error, Result};

/// Stable identifier of a region in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionId(pub(crate) usize);

/// A named interval of host memory carved out of a chunk, optionally bound
/// to a guest-virtual base. Either entirely free or entirely owned by one
/// logical use; its host bytes are never shared with another region.
#[derive(Debug)]
pub struct Region {
    host_base: u64,
    guest_base: GuestAddress,
    size: u64,
    tag: &'static str,
    prot: PageFlags,
    free: bool,
}

impl Region {
    pub fn host_base(&self) -> u64 {
        self.host_base
    }

    pub fn guest_base(&self) -> GuestAddress {
        self.guest_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn prot(&self) -> PageFlags {
        self.prot
    }

    pub fn is_free(&self) -> bool {
        self.free
    }

    pub fn contains_host(&self, host: u64) -> bool {
        host >= self.host_base && host < self.host_base + self.size
    }

    pub fn contains_guest(&self, guest: u64) -> bool {
        self.guest_base.0 != 0
            && guest >= self.guest_base.0
            && guest < self.guest_base.0 + self.size
    }

    /// Mutable byte view of the region's host backing.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { host_slice(self.host_base, self.size as usize) }
    }
}

/// First-fit allocator over the free space of all chunks, partitioned into
/// the system chunk (kernel structures) and the user chunks (guest-visible
/// memory). The arena never shrinks; freed entries are zeroed and recycled.
pub struct RegionManager {
    pager: Pager,
    regions: Vec<Region>,
    system_host: std::ops::Range<u64>,
}

impl RegionManager {
    /// Seeds the free lists: the system chunk past the page-table area and
    /// the whole user chunk.
    pub fn new(pager: Pager) -> Self {
        let mut regions = Vec::new();
        let mut system_host = 0..0;
        if let Some(chunk) = pager.chunk(0) {
            system_host = chunk.host_base..chunk.host_base + chunk.size;
            regions.push(Region {
                host_base: chunk.host_base + TABLE_AREA_SIZE,
                guest_base: GuestAddress(0),
                size: SYSTEM_CHUNK_SIZE - TABLE_AREA_SIZE,
                tag: "",
                prot: PageFlags::empty(),
                free: true,
            });
        }
        if let Some(chunk) = pager.chunk(1) {
            regions.push(Region {
                host_base: chunk.host_base,
                guest_base: GuestAddress(0),
                size: chunk.size,
                tag: "",
                prot: PageFlags::empty(),
                free: true,
            });
        }
        RegionManager {
            pager,
            regions,
            system_host,
        }
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut Pager {
        &mut self.pager
    }

    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id.0]
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut Region {
        &mut self.regions[id.0]
    }

    pub fn set_guest(&mut self, id: RegionId, guest: GuestAddress) {
        self.regions[id.0].guest_base = guest;
    }

    pub fn set_prot(&mut self, id: RegionId, prot: PageFlags) {
        self.regions[id.0].prot = prot;
    }

    /// Carves a used region backed by the user chunks; guest-visible memory
    /// (binary, stack, heap, mappings) comes from here.
    pub fn allocate_region(&mut self, size: u64, tag: &'static str) -> Result<RegionId> {
        self.allocate(size, tag, false)
    }

    /// Carves a used region backed by the system chunk, for kernel-space
    /// structures (descriptor tables, kernel stacks, trampolines).
    pub fn allocate_system_region(&mut self, size: u64, tag: &'static str) -> Result<RegionId> {
        self.allocate(size, tag, true)
    }

    /// First-fit with a page-granular `slice_begin`: the head of the first
    /// free region large enough becomes the allocation, the free region
    /// shrinks forward.
    fn allocate(&mut self, size: u64, tag: &'static str, system: bool) -> Result<RegionId> {
        let size = align_up(size);
        let pos = self
            .regions
            .iter()
            .position(|r| {
                r.free && r.size >= size && self.system_host.contains(&r.host_base) == system
            })
            .ok_or_else(|| {
                Error::Resource(
                    "allocating a region",
                    std::io::Error::from_raw_os_error(libc::ENOMEM),
                )
            })?;
        if self.regions[pos].size == size {
            let region = &mut self.regions[pos];
            region.free = false;
            region.tag = tag;
            region.guest_base = GuestAddress(0);
            debug!("region {:#x}+{:#x} [{}]", region.host_base, size, tag);
            return Ok(RegionId(pos));
        }
        // slice the head off the free region, shrinking it forward
        let host_base = self.regions[pos].host_base;
        self.regions[pos].host_base += size;
        self.regions[pos].size -= size;
        self.regions.push(Region {
            host_base,
            guest_base: GuestAddress(0),
            size,
            tag,
            prot: PageFlags::empty(),
            free: false,
        });
        debug!("region {:#x}+{:#x} [{}]", host_base, size, tag);
        Ok(RegionId(self.regions.len() - 1))
    }

    /// Returns a region to the free pool, zeroing its bytes. The interval
    /// must exactly match a live region.
    pub fn free_region(&mut self, host_base: u64, size: u64) -> Result<()> {
        let size = align_up(size);
        let region = self
            .regions
            .iter_mut()
            .find(|r| !r.free && r.host_base == host_base && r.size == size)
            .ok_or(Error::Translation(host_base))?;
        unsafe {
            std::ptr::write_bytes(host_base as *mut u8, 0, size as usize);
        }
        region.free = true;
        region.tag = "";
        region.guest_base = GuestAddress(0);
        region.prot = PageFlags::empty();
        Ok(())
    }

    pub fn find_region_by_host(&self, host: u64) -> Option<RegionId> {
        self.regions
            .iter()
            .position(|r| !r.free && r.contains_host(host))
            .map(RegionId)
    }

    pub fn find_region_by_guest(&self, guest: u64) -> Option<RegionId> {
        self.regions
            .iter()
            .position(|r| !r.free && r.contains_guest(guest))
            .map(RegionId)
    }

    pub fn dump_regions(&self) {
        for region in &self.regions {
            debug!(
                "{}REGION host {:#016x} guest {:#016x} size {:#x} [{}]",
                if region.free { "FREE " } else { "" },
                region.host_base,
                region.guest_base.0,
                region.size,
                region.tag,
            );
        }
    }
}
