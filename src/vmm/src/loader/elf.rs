use std::path::Path;

use goblin::elf::header::{EM_X86_64, ET_EXEC};
use goblin::elf::program_header::{PF_W, PF_X, PT_LOAD, PT_PHDR};
use goblin::elf::Elf;
use tracing::debug;
use vm_memory::GuestAddress;

use crate::error::{Error, Result};
use crate::memory::{align_up, PageFlags, RegionManager, PAGE_SIZE};

/// What the environment builder needs to know about a loaded binary.
#[derive(Debug, Clone, Copy)]
pub struct LoadedElf {
    pub entry: u64,
    pub phdr_addr: u64,
    pub phent: u64,
    pub phnum: u64,
    /// Page-rounded end of the highest segment; the initial program break.
    pub brk_start: u64,
}

/// Parses a static ELF64 and places every loadable segment in guest memory
/// with the segment's own r/w/x permissions, zero-filling the BSS tail.
pub fn load(rm: &mut RegionManager, path: &Path) -> Result<LoadedElf> {
    let data =
        std::fs::read(path).map_err(|e| Error::Resource("reading the guest binary", e))?;
    let elf = Elf::parse(&data)
        .map_err(|e| Error::Format(format!("{}: {}", path.display(), e)))?;

    if !elf.is_64 {
        return Err(Error::Format(format!(
            "{}: not a 64-bit ELF",
            path.display()
        )));
    }
    if elf.header.e_machine != EM_X86_64 {
        return Err(Error::Format(format!(
            "{}: not an x86-64 binary",
            path.display()
        )));
    }
    if elf.interpreter.is_some() {
        return Err(Error::Unsupported(format!(
            "{}: dynamically linked (program interpreter present)",
            path.display()
        )));
    }
    if elf.header.e_type != ET_EXEC {
        return Err(Error::Unsupported(format!(
            "{}: not a static executable",
            path.display()
        )));
    }

    let mut max_end = 0u64;
    let mut phdr_addr = None;
    let mut first_load = None;
    for ph in &elf.program_headers {
        if ph.p_type == PT_PHDR {
            phdr_addr = Some(ph.p_vaddr);
        }
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        if first_load.is_none() {
            first_load = Some(ph.p_vaddr);
        }

        let page_off = ph.p_vaddr & (PAGE_SIZE - 1);
        let guest_base = ph.p_vaddr - page_off;
        let size = align_up(page_off + ph.p_memsz);

        let file_end = ph
            .p_offset
            .checked_add(ph.p_filesz)
            .filter(|end| *end <= data.len() as u64)
            .ok_or_else(|| {
                Error::Format(format!("{}: segment outside the file", path.display()))
            })?;

        let id = rm.allocate_region(size, "elf")?;
        rm.set_guest(id, GuestAddress(guest_base));
        let bytes = rm.region_mut(id).bytes_mut();
        bytes[page_off as usize..(page_off + ph.p_filesz) as usize]
            .copy_from_slice(&data[ph.p_offset as usize..file_end as usize]);
        // the BSS tail past p_filesz stays zero: regions come out of the
        // free pool zeroed

        let mut flags = PageFlags::USER;
        if ph.p_flags & PF_W != 0 {
            flags |= PageFlags::WRITE;
        }
        if ph.p_flags & PF_X != 0 {
            flags |= PageFlags::EXEC;
        }
        rm.set_prot(id, flags);
        let host = rm.region(id).host_base();
        rm.pager_mut()
            .map_region(host, GuestAddress(guest_base), size / PAGE_SIZE, flags)?;
        debug!(
            "elf segment {:#x}+{:#x} ({}{}{})",
            guest_base,
            size,
            "r",
            if ph.p_flags & PF_W != 0 { "w" } else { "-" },
            if ph.p_flags & PF_X != 0 { "x" } else { "-" },
        );
        max_end = max_end.max(guest_base + size);
    }

    let Some(first_load) = first_load else {
        return Err(Error::Format(format!(
            "{}: no loadable segments",
            path.display()
        )));
    };

    Ok(LoadedElf {
        entry: elf.entry,
        phdr_addr: phdr_addr.unwrap_or(first_load + elf.header.e_phoff),
        phent: u64::from(elf.header.e_phentsize),
        phnum: u64::from(elf.header.e_phnum),
        brk_start: max_end,
    })
}


#[cfg(test)]
mod tests {
    use super::testutil::make_static_elf;
    use super::*;
    use crate::hv::fake::FakeHypervisor;
    use crate::hv::Hypervisor;
    use crate::memory::Pager;
    use vmm_sys_util::tempfile::TempFile;

    fn test_rm() -> RegionManager {
        let hv = FakeHypervisor::new();
        let vm = hv.create_vm().unwrap();
        RegionManager::new(Pager::new(vm, 16 << 20).unwrap())
    }

    fn write_temp(bytes: &[u8]) -> TempFile {
        use std::io::Write;
        let file = TempFile::new().unwrap();
        file.as_file().write_all(bytes).unwrap();
        file
    }

    #[test]
    fn loads_segments_and_reports_layout() {
        let mut rm = test_rm();
        let code = [0xcc, 0x90, 0x90, 0xc3];
        let file = write_temp(&make_static_elf(&code, 0x40_1000));
        let elf = load(&mut rm, file.as_path()).unwrap();
        assert_eq!(0x40_1000, elf.entry);
        assert_eq!(0x40_2000, elf.brk_start);
        assert_eq!(56, elf.phent);
        assert_eq!(1, elf.phnum);
        let host = rm
            .pager()
            .host_address(GuestAddress(0x40_1000))
            .unwrap();
        assert_eq!(code, unsafe { *(host as *const [u8; 4]) });
        // BSS tail is zero
        let tail = rm
            .pager()
            .host_address(GuestAddress(0x40_1000 + code.len() as u64))
            .unwrap();
        assert_eq!(0, unsafe { *(tail as *const u8) });
    }

    #[test]
    fn rejects_non_elf_input() {
        let mut rm = test_rm();
        let file = write_temp(b"#!/bin/sh\necho no\n");
        assert!(matches!(
            load(&mut rm, file.as_path()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn rejects_dynamic_executables() {
        let mut rm = test_rm();
        let mut image = make_static_elf(&[0xc3], 0x40_1000);
        image[16] = 3; // e_type = ET_DYN
        let file = write_temp(&image);
        assert!(matches!(
            load(&mut rm, file.as_path()),
            Err(Error::Unsupported(_))
        ));
    }
}
