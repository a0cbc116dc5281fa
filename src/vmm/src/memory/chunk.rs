use crate::error::{Error, Result};

/// A contiguous page-aligned host buffer registered with the hypervisor as
/// one guest-physical memory slot. Chunks never overlap in guest-physical
/// space; the pager owns the table of them.
#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    pub slot: u32,
    pub host_base: u64,
    pub guest_phys: u64,
    pub size: u64,
}

impl Chunk {
    pub fn contains_phys(&self, phys: u64) -> bool {
        phys >= self.guest_phys && phys < self.guest_phys + self.size
    }

    pub fn contains_host(&self, host: u64) -> bool {
        host >= self.host_base && host < self.host_base + self.size
    }

    pub fn host_for_phys(&self, phys: u64) -> Option<u64> {
        self.contains_phys(phys)
            .then(|| self.host_base + (phys - self.guest_phys))
    }

    pub fn phys_for_host(&self, host: u64) -> Option<u64> {
        self.contains_host(host)
            .then(|| self.guest_phys + (host - self.host_base))
    }
}

/// Anonymous, zeroed, page-aligned host backing for a chunk.
pub(crate) fn alloc_host(size: u64) -> Result<u64> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size as usize,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::os("allocating chunk memory"));
    }
    Ok(ptr as u64)
}

pub(crate) fn free_host(host: u64, size: u64) {
    unsafe {
        libc::munmap(host as *mut libc::c_void, size as usize);
    }
}
