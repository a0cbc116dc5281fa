//! End-to-end scenarios driven through the scripted hypervisor double: the
//! fake plays the guest side of the trampoline conventions, the monitor
//! above the capability interface runs unmodified.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use vmm::hv::fake::FakeHypervisor;
use vmm::hv::VmExit;
use vmm::syscall::{RegionMapping, SyscallHandlers};
use vmm::{Vm, VmConfig};

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

/// A throwaway resource directory holding stand-in trampoline blobs.
fn resource_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "elkrun-test-{}-{}",
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    for name in ["isr", "entry", "signal"] {
        // hlt; jmp $ — the fake never executes these
        std::fs::write(dir.join(name), [0xf4u8, 0xeb, 0xfe]).unwrap();
    }
    dir
}

/// A minimal static ELF64 with one RX segment at `vaddr`.
fn make_static_elf(code: &[u8], vaddr: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&0x3eu16.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&64u64.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&56u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    out.extend_from_slice(&5u32.to_le_bytes()); // R|X
    out.extend_from_slice(&0x1000u64.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes());
    out.extend_from_slice(&(code.len() as u64).to_le_bytes());
    out.extend_from_slice(&(code.len() as u64).to_le_bytes());
    out.extend_from_slice(&0x1000u64.to_le_bytes());
    out.resize(0x1000, 0);
    out.extend_from_slice(code);
    out
}

const ENTRY: u64 = 0x40_1000;

struct Harness {
    hv: FakeHypervisor,
    vm: Vm,
    dir: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn boot(handlers: SyscallHandlers) -> Harness {
    let dir = resource_dir();
    let binary = dir.join("guest");
    std::fs::write(&binary, make_static_elf(&[0x0f, 0x05, 0xf4], ENTRY)).unwrap();

    let hv = FakeHypervisor::new();
    let config = VmConfig {
        resource_dir: dir.clone(),
        user_memory: 32 << 20,
        ..Default::default()
    };
    let mut vm = Vm::new(&hv, &config, handlers, Default::default()).unwrap();
    vm.load_binary(
        &binary,
        &["guest".to_string()],
        &["PATH=/bin".to_string()],
    )
    .unwrap();
    Harness { hv, vm, dir }
}

/// Host addresses the script steps need to play the trampoline's part.
struct GuestView {
    kstack_top: u64,
    kstack_host: u64,
}

fn guest_view(h: &Harness) -> GuestView {
    let kstack_top = h.vm.vcpu(0).stack.kernel_top().0;
    let mem = h.vm.memory().lock().unwrap();
    let kstack_host = mem.translate(kstack_top - 8).unwrap();
    GuestView {
        kstack_top,
        kstack_host,
    }
}

/// Queues a script step that enters the monitor the way the SYSCALL entry
/// trampoline would: number pushed on the kernel stack, args in registers.
fn stage_syscall(h: &Harness, view: &GuestView, nr: i64, args: [u64; 6]) {
    let ktop = view.kstack_top;
    let slot = view.kstack_host;
    let state = h.hv.vcpu_state(0);
    state.lock().unwrap().script.push_back(Box::new(move |s| {
        unsafe { (slot as *mut u64).write(nr as u64) };
        s.regs.rax = 1;
        s.regs.rsp = ktop - 8;
        s.regs.rdi = args[0];
        s.regs.rsi = args[1];
        s.regs.rdx = args[2];
        s.regs.r10 = args[3];
        s.regs.r8 = args[4];
        s.regs.r9 = args[5];
        VmExit::Hlt
    }));
}

#[test]
fn hello_world_reaches_the_host_fd() {
    static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    fn capture(_fd: i32, buf: *const libc::c_void, count: usize) -> i64 {
        let bytes = unsafe { std::slice::from_raw_parts(buf as *const u8, count) };
        CAPTURED.lock().unwrap().extend_from_slice(bytes);
        count as i64
    }

    let mut h = boot(SyscallHandlers {
        write: Some(capture),
        ..Default::default()
    });
    let view = guest_view(&h);

    // plant the message in mapped guest stack memory below rsp
    let msg_guest = h.vm.vcpu(0).regs().rsp - 1024;
    h.vm.memory()
        .lock()
        .unwrap()
        .write_bytes(msg_guest, b"hello world\n")
        .unwrap();

    stage_syscall(&h, &view, libc::SYS_write, [1, msg_guest, 12, 0, 0, 0]);
    stage_syscall(&h, &view, libc::SYS_exit_group, [0, 0, 0, 0, 0, 0]);

    assert_eq!(0, h.vm.run().unwrap());
    assert_eq!(b"hello world\n".to_vec(), *CAPTURED.lock().unwrap());
}

#[test]
fn exit_status_propagates() {
    let mut h = boot(SyscallHandlers::default());
    let view = guest_view(&h);
    stage_syscall(&h, &view, libc::SYS_exit_group, [17, 0, 0, 0, 0, 0]);
    assert_eq!(17, h.vm.run().unwrap());
}

#[test]
fn stack_probe_grows_exactly_one_region() {
    let mut h = boot(SyscallHandlers::default());
    let view = guest_view(&h);

    let bottom = h.vm.vcpu(0).stack.bottom();
    let probe = bottom - 0x10000;
    assert_eq!(1, h.vm.vcpu(0).stack.region_count());

    // the guest writes at [rsp] after sub rsp, 0x10000: page fault; the IDT
    // stub pushes (vector, error code) and HLTs with rax = 2
    let ktop = view.kstack_top;
    let slot_vec = view.kstack_host;
    let state = h.hv.vcpu_state(0);
    state.lock().unwrap().script.push_back(Box::new(move |s| {
        unsafe {
            (slot_vec as *mut u64).write(6); // error code, pushed first
            ((slot_vec - 8) as *mut u64).write(14); // vector on top
        }
        s.regs.rsp = ktop - 16;
        s.regs.rax = 2;
        s.sregs.cr2 = probe;
        VmExit::Hlt
    }));
    stage_syscall(&h, &view, libc::SYS_exit_group, [0, 0, 0, 0, 0, 0]);

    assert_eq!(0, h.vm.run().unwrap());
    assert_eq!(2, h.vm.vcpu(0).stack.region_count());

    // the probed byte is now backed and writable through the pager
    let mut mem = h.vm.memory().lock().unwrap();
    mem.write_bytes(probe, &[0x5a]).unwrap();
    let mut byte = [0u8];
    mem.read_bytes(probe, &mut byte).unwrap();
    assert_eq!(0x5a, byte[0]);
}

#[test]
fn bad_pointer_write_returns_efault_and_writes_nothing() {
    static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());
    fn capture(_fd: i32, buf: *const libc::c_void, count: usize) -> i64 {
        let bytes = unsafe { std::slice::from_raw_parts(buf as *const u8, count) };
        CAPTURED.lock().unwrap().extend_from_slice(bytes);
        count as i64
    }

    let mut h = boot(SyscallHandlers {
        write: Some(capture),
        ..Default::default()
    });
    let view = guest_view(&h);

    stage_syscall(&h, &view, libc::SYS_write, [1, 0, 1, 0, 0, 0]);
    // the guest observes the result in rax at SYSRET, then exits with it
    let ktop = view.kstack_top;
    let slot = view.kstack_host;
    let expected = -i64::from(libc::EFAULT) as u64;
    let state = h.hv.vcpu_state(0);
    state.lock().unwrap().script.push_back(Box::new(move |s| {
        assert_eq!(expected, s.regs.rax);
        unsafe { (slot as *mut u64).write(libc::SYS_exit_group as u64) };
        s.regs.rax = 1;
        s.regs.rsp = ktop - 8;
        s.regs.rdi = 0;
        VmExit::Hlt
    }));

    assert_eq!(0, h.vm.run().unwrap());
    assert!(CAPTURED.lock().unwrap().is_empty());
}

#[test]
fn mmap_intercept_places_and_munmap_removes() {
    static PLACED: AtomicU64 = AtomicU64::new(0);
    fn force(desc: &mut RegionMapping) -> i64 {
        desc.guest_p = 0x4000_0000;
        0
    }
    fn observe(desc: &mut RegionMapping) -> i64 {
        PLACED.store(desc.guest_p, Ordering::SeqCst);
        0
    }

    let mut h = boot(SyscallHandlers {
        mmap_before: Some(force),
        mmap_after: Some(observe),
        ..Default::default()
    });
    let view = guest_view(&h);

    stage_syscall(
        &h,
        &view,
        libc::SYS_mmap,
        [
            0,
            8192,
            (libc::PROT_READ | libc::PROT_WRITE) as u64,
            (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
            u64::MAX,
            0,
        ],
    );
    stage_syscall(&h, &view, libc::SYS_exit_group, [0, 0, 0, 0, 0, 0]);
    assert_eq!(0, h.vm.run().unwrap());
    assert_eq!(0x4000_0000, PLACED.load(Ordering::SeqCst));

    {
        // readable and writable from the guest side
        let mut mem = h.vm.memory().lock().unwrap();
        mem.write_bytes(0x4000_0000, b"mapped").unwrap();
        assert!(mem.translate_buf(0x4000_0000, 8192).is_some());
    }

    // a fresh run: munmap it
    let state = h.hv.vcpu_state(0);
    state.lock().unwrap().script.clear();
    stage_syscall(
        &h,
        &view,
        libc::SYS_munmap,
        [0x4000_0000, 8192, 0, 0, 0, 0],
    );
    stage_syscall(&h, &view, libc::SYS_exit_group, [0, 0, 0, 0, 0, 0]);
    assert_eq!(0, h.vm.run().unwrap());

    let mem = h.vm.memory().lock().unwrap();
    assert!(mem.translate(0x4000_0000).is_none());
}

#[test]
fn chunk_remap_discards_contents_and_translations() {
    let mut h = boot(SyscallHandlers::default());

    let old = h.vm.chunk(1).unwrap();
    // the loaded binary lives in the user chunk and translates now
    assert!(h
        .vm
        .memory()
        .lock()
        .unwrap()
        .translate(ENTRY)
        .is_some());

    h.vm.chunk_remap(1, 2 * old.size).unwrap();

    let new = h.vm.chunk(1).unwrap();
    assert_eq!(old.guest_phys, new.guest_phys);
    assert_eq!(2 * old.size, new.size);
    assert!(h
        .vm
        .memory()
        .lock()
        .unwrap()
        .translate(ENTRY)
        .is_none());

    // the hypervisor slot was re-registered with the new backing
    let slots = h.hv.vm_state();
    let slots = slots.lock().unwrap();
    let slot = slots.slots.get(&new.slot).unwrap();
    assert_eq!(new.host_base, slot.host_addr);
    assert_eq!(2 * old.size, slot.size);
}

#[test]
fn breakpoint_fires_once_and_byte_restores() {
    static HITS: AtomicU32 = AtomicU32::new(0);
    static LAST_RIP: AtomicU64 = AtomicU64::new(0);
    fn on_bp(rip: u64) -> i32 {
        HITS.fetch_add(1, Ordering::SeqCst);
        LAST_RIP.store(rip, Ordering::SeqCst);
        0
    }

    let mut h = boot(SyscallHandlers {
        bp_callback: Some(on_bp),
        ..Default::default()
    });
    let view = guest_view(&h);

    let entry_host = h.vm.memory().lock().unwrap().translate(ENTRY).unwrap();
    let original = unsafe { (entry_host as *const u8).read() };

    {
        let mut dbg = vmm::debug::Debugger::new(&mut h.vm);
        dbg.insert_sw_bp(ENTRY).unwrap();
    }
    assert_eq!(0xcc, unsafe { (entry_host as *const u8).read() });

    // the guest hits the breakpoint at the entry point, then the monitor
    // continues and the guest exits
    let state = h.hv.vcpu_state(0);
    state
        .lock()
        .unwrap()
        .script
        .push_back(Box::new(move |_| VmExit::Debug { pc: ENTRY }));
    stage_syscall(&h, &view, libc::SYS_exit_group, [0, 0, 0, 0, 0, 0]);
    assert_eq!(0, h.vm.run().unwrap());
    assert_eq!(1, HITS.load(Ordering::SeqCst));
    assert_eq!(ENTRY, LAST_RIP.load(Ordering::SeqCst));

    {
        let mut dbg = vmm::debug::Debugger::new(&mut h.vm);
        dbg.remove_sw_bp(ENTRY).unwrap();
    }
    assert_eq!(original, unsafe { (entry_host as *const u8).read() });

    // a re-run executes normally
    stage_syscall(&h, &view, libc::SYS_exit_group, [3, 0, 0, 0, 0, 0]);
    assert_eq!(3, h.vm.run().unwrap());
    assert_eq!(1, HITS.load(Ordering::SeqCst));
}

#[test]
fn debugger_reads_and_writes_guest_memory() {
    let mut h = boot(SyscallHandlers::default());
    let mut dbg = vmm::debug::Debugger::new(&mut h.vm);
    dbg.write_memory(ENTRY + 0x100, b"patched").unwrap();
    assert_eq!(b"patched".to_vec(), dbg.read_memory(ENTRY + 0x100, 7).unwrap());
    let mut regs = dbg.read_registers();
    assert_eq!(ENTRY, regs.rip);
    regs.r15 = 0x1234;
    dbg.write_registers(regs);
    assert_eq!(0x1234, h.vm.vcpu(0).regs().r15);
}
