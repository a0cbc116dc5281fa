//! Builds the System V AMD64 initial process stack: argc, argv and envp
//! pointer vectors, the auxiliary vector, the string pool and the AT_RANDOM
//! bytes, all inside one dedicated region whose top is the stack top.

use tracing::debug;
use vm_memory::GuestAddress;

use crate::error::Result;
use crate::loader::elf::LoadedElf;
use crate::memory::{align_up, PageFlags, RegionId, RegionManager, PAGE_SIZE};

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_ENTRY: u64 = 9;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;
pub const AT_GID: u64 = 13;
pub const AT_EGID: u64 = 14;
pub const AT_SECURE: u64 = 23;
pub const AT_RANDOM: u64 = 25;

/// The composed environment block. The region doubles as the first stack
/// region: pushes below `initial_rsp` stay inside it until it runs out,
/// after which the stack expands.
#[derive(Debug, Clone, Copy)]
pub struct Environment {
    pub region: RegionId,
    pub region_base: u64,
    pub initial_rsp: u64,
}

pub fn build(
    rm: &mut RegionManager,
    elf: &LoadedElf,
    argv: &[String],
    envp: &[String],
    stack_top: u64,
) -> Result<Environment> {
    let strings_len: u64 = argv
        .iter()
        .chain(envp.iter())
        .map(|s| s.len() as u64 + 1)
        .sum();
    let auxv_pairs = 12u64;
    let vectors_len = 8 * (1 + argv.len() as u64 + 1 + envp.len() as u64 + 1) + 16 * auxv_pairs;
    let total = vectors_len + 16 + strings_len + 16; // alignment slack
    let region_size = align_up(total).max(PAGE_SIZE);
    let region_base = stack_top - region_size;

    let id = rm.allocate_region(region_size, "environ")?;
    rm.set_guest(id, GuestAddress(region_base));
    let host_base = rm.region(id).host_base();
    rm.pager_mut().map_region(
        host_base,
        GuestAddress(region_base),
        region_size / PAGE_SIZE,
        PageFlags::USER | PageFlags::WRITE,
    )?;

    // all writes go through the region's contiguous host backing
    let write = |guest: u64, bytes: &[u8]| {
        debug_assert!(guest >= region_base && guest + bytes.len() as u64 <= stack_top);
        let off = (guest - region_base) as usize;
        let dst = unsafe {
            std::slice::from_raw_parts_mut(host_base as *mut u8, region_size as usize)
        };
        dst[off..off + bytes.len()].copy_from_slice(bytes);
    };

    // string pool at the very top
    let mut cursor = stack_top - strings_len;
    let mut pointers = Vec::with_capacity(argv.len() + envp.len());
    for s in argv.iter().chain(envp.iter()) {
        write(cursor, s.as_bytes());
        write(cursor + s.len() as u64, &[0]);
        pointers.push(cursor);
        cursor += s.len() as u64 + 1;
    }
    let (argv_ptrs, envp_ptrs) = pointers.split_at(argv.len());

    // 16 random bytes for AT_RANDOM, 16-byte aligned below the strings
    let random_guest = (stack_top - strings_len - 16) & !15;
    let random: [u8; 16] = rand::random();
    write(random_guest, &random);

    // vectors below that, with rsp itself 16-byte aligned
    let rsp = (random_guest - vectors_len) & !15;
    let mut slot = rsp;
    let mut push = |value: u64| {
        write(slot, &value.to_le_bytes());
        slot += 8;
    };
    push(argv.len() as u64);
    for &p in argv_ptrs {
        push(p);
    }
    push(0);
    for &p in envp_ptrs {
        push(p);
    }
    push(0);
    let (uid, euid, gid, egid) = unsafe {
        (
            libc::getuid(),
            libc::geteuid(),
            libc::getgid(),
            libc::getegid(),
        )
    };
    for (key, value) in [
        (AT_PHDR, elf.phdr_addr),
        (AT_PHENT, elf.phent),
        (AT_PHNUM, elf.phnum),
        (AT_PAGESZ, PAGE_SIZE),
        (AT_ENTRY, elf.entry),
        (AT_RANDOM, random_guest),
        (AT_UID, u64::from(uid)),
        (AT_EUID, u64::from(euid)),
        (AT_GID, u64::from(gid)),
        (AT_EGID, u64::from(egid)),
        (AT_SECURE, 0),
        (AT_NULL, 0),
    ] {
        push(key);
        push(value);
    }

    debug!(
        "environment at {:#x}, rsp {:#x}, {} args, {} vars",
        region_base,
        rsp,
        argv.len(),
        envp.len()
    );
    Ok(Environment {
        region: id,
        region_base,
        initial_rsp: rsp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::fake::FakeHypervisor;
    use crate::hv::Hypervisor;
    use crate::memory::stack::STACK_TOP;
    use crate::memory::{AddressSpace, Pager};

    fn test_mem() -> AddressSpace {
        let hv = FakeHypervisor::new();
        let vm = hv.create_vm().unwrap();
        AddressSpace::new(RegionManager::new(Pager::new(vm, 16 << 20).unwrap()))
    }

    fn test_elf() -> LoadedElf {
        LoadedElf {
            entry: 0x40_1000,
            phdr_addr: 0x40_0040,
            phent: 56,
            phnum: 3,
            brk_start: 0x40_2000,
        }
    }

    #[test]
    fn stack_layout_follows_the_abi() {
        let mut mem = test_mem();
        let argv = vec!["prog".to_string(), "arg1".to_string()];
        let envp = vec!["TERM=dumb".to_string()];
        let env = build(&mut mem.rm, &test_elf(), &argv, &envp, STACK_TOP).unwrap();

        assert_eq!(0, env.initial_rsp % 16);
        assert_eq!(2, mem.read_u64(env.initial_rsp).unwrap());

        // argv pointers, NULL-terminated, pointing at the right strings
        let argv0 = mem.read_u64(env.initial_rsp + 8).unwrap();
        let argv1 = mem.read_u64(env.initial_rsp + 16).unwrap();
        assert_eq!(0, mem.read_u64(env.initial_rsp + 24).unwrap());
        let mut buf = [0u8; 5];
        mem.read_bytes(argv0, &mut buf).unwrap();
        assert_eq!(b"prog\0", &buf);
        let mut buf = [0u8; 4];
        mem.read_bytes(argv1, &mut buf).unwrap();
        assert_eq!(b"arg1", &buf);

        // envp vector, NULL-terminated
        let envp0 = mem.read_u64(env.initial_rsp + 32).unwrap();
        assert_eq!(0, mem.read_u64(env.initial_rsp + 40).unwrap());
        let mut buf = [0u8; 9];
        mem.read_bytes(envp0, &mut buf).unwrap();
        assert_eq!(b"TERM=dumb", &buf);

        // every pointer refers into the environment region
        for ptr in [argv0, argv1, envp0] {
            assert!(ptr >= env.region_base && ptr < STACK_TOP);
        }
    }

    #[test]
    fn auxv_is_complete_and_terminated() {
        let mut mem = test_mem();
        let elf = test_elf();
        let env = build(
            &mut mem.rm,
            &elf,
            &["p".to_string()],
            &[],
            STACK_TOP,
        )
        .unwrap();

        // auxv starts after argc, argv[0], NULL, envp NULL
        let mut addr = env.initial_rsp + 8 * 4;
        let mut seen = std::collections::HashMap::new();
        loop {
            let key = mem.read_u64(addr).unwrap();
            let value = mem.read_u64(addr + 8).unwrap();
            seen.insert(key, value);
            if key == AT_NULL {
                break;
            }
            addr += 16;
        }
        assert_eq!(Some(&elf.entry), seen.get(&AT_ENTRY));
        assert_eq!(Some(&elf.phdr_addr), seen.get(&AT_PHDR));
        assert_eq!(Some(&56), seen.get(&AT_PHENT));
        assert_eq!(Some(&3), seen.get(&AT_PHNUM));
        assert_eq!(Some(&PAGE_SIZE), seen.get(&AT_PAGESZ));
        let random = seen[&AT_RANDOM];
        assert_eq!(0, random % 16);
        assert!(mem.translate_buf(random, 16).is_some());
    }
}
