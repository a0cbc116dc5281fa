use std::path::Path;

use tracing::debug;
use vm_memory::GuestAddress;

use crate::error::{Error, Result};
use crate::memory::{align_up, PageFlags, RegionId, RegionManager, PAGE_SIZE};

/// Where a flat binary lands in the guest address space.
#[derive(Debug, Clone, Copy)]
pub enum FlatKind {
    /// Kernel space, execute-only; the pager assigns the address.
    Kernel,
    /// User space at a fixed address, executable.
    User { guest_addr: u64 },
}

/// A position-independent trampoline blob copied verbatim into a region and
/// mapped executable.
#[derive(Debug, Clone, Copy)]
pub struct Flat {
    pub region: RegionId,
    pub guest_addr: u64,
    pub size: u64,
}

pub fn load(rm: &mut RegionManager, path: &Path, kind: FlatKind) -> Result<Flat> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Resource("reading a trampoline blob", e))?;
    if data.is_empty() {
        return Err(Error::Format(format!(
            "{}: empty trampoline blob",
            path.display()
        )));
    }

    let size = align_up(data.len() as u64);
    let id = match kind {
        FlatKind::Kernel => rm.allocate_system_region(size, "flat")?,
        FlatKind::User { .. } => rm.allocate_region(size, "flat")?,
    };
    rm.region_mut(id).bytes_mut()[..data.len()].copy_from_slice(&data);
    let host = rm.region(id).host_base();

    let guest_addr = match kind {
        FlatKind::Kernel => {
            let base = rm
                .pager_mut()
                .map_kernel_region(host, size / PAGE_SIZE, PageFlags::EXEC)?;
            base.0
        }
        FlatKind::User { guest_addr } => {
            rm.pager_mut().map_region(
                host,
                GuestAddress(guest_addr),
                size / PAGE_SIZE,
                PageFlags::USER | PageFlags::EXEC,
            )?;
            guest_addr
        }
    };
    rm.set_guest(id, GuestAddress(guest_addr));
    debug!("flat {} at {:#x}+{:#x}", path.display(), guest_addr, size);

    Ok(Flat {
        region: id,
        guest_addr,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::fake::FakeHypervisor;
    use crate::hv::Hypervisor;
    use crate::memory::pager::KERNEL_SPACE_BASE;
    use crate::memory::Pager;
    use vmm_sys_util::tempfile::TempFile;

    fn test_rm() -> RegionManager {
        let hv = FakeHypervisor::new();
        let vm = hv.create_vm().unwrap();
        RegionManager::new(Pager::new(vm, 16 << 20).unwrap())
    }

    #[test]
    fn kernel_flat_lands_in_kernel_space() {
        use std::io::Write;
        let mut rm = test_rm();
        let file = TempFile::new().unwrap();
        file.as_file().write_all(&[0xf4, 0xc3]).unwrap();
        let flat = load(&mut rm, file.as_path(), FlatKind::Kernel).unwrap();
        assert!(flat.guest_addr >= KERNEL_SPACE_BASE);
        let host = rm
            .pager()
            .host_address(GuestAddress(flat.guest_addr))
            .unwrap();
        assert_eq!([0xf4, 0xc3], unsafe { *(host as *const [u8; 2]) });
    }

    #[test]
    fn empty_blob_is_a_format_error() {
        let mut rm = test_rm();
        let file = TempFile::new().unwrap();
        assert!(matches!(
            load(&mut rm, file.as_path(), FlatKind::Kernel),
            Err(Error::Format(_))
        ));
    }
}
