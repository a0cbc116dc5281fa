//! The top-level VM owner: builds the guest (chunks, page tables, GDT, IDT,
//! TSS, trampolines), loads the binary and its environment, and drives the
//! run loop that classifies every VM exit.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arch::x86_64 as x86;
use kvm_bindings::kvm_segment;
use tracing::{debug, warn};
use vm_memory::{ByteValued, GuestAddress};

use crate::debug::{breakpoint_hit, dump_state};
use crate::env;
use crate::error::{Error, Result};
use crate::hv::{Hypervisor, VmExit};
use crate::interrupt;
use crate::loader::elf;
use crate::loader::flat::{self, FlatKind};
use crate::memory::{
    align_up, AddressSpace, Chunk, GuestStack, PageFlags, Pager, RegionManager, PAGE_SIZE,
};
use crate::signal::SignalTable;
use crate::syscall::{self, HypercallHandlers, HypercallKind, Outcome, SyscallHandlers};
use crate::vcpu::Vcpu;

/// Hypercall type codes the trampolines place in `rax` before HLT.
const HYPERCALL_SYSCALL: u64 = 1;
const HYPERCALL_INTERRUPT: u64 = 2;
const HYPERCALL_DEBUG: u64 = 3;

/// The ISR stubs in the `isr` flat are laid out 32 bytes apart, one per
/// vector.
const ISR_STUB_STRIDE: u64 = 32;

/// Fixed user-space home of the signal-return trampoline.
const SIGNAL_FLAT_ADDR: u64 = 0x7000_0000_0000;

pub struct VmConfig {
    pub vcpu_count: u8,
    pub user_memory: u64,
    /// Directory holding the `isr`, `entry` and `signal` trampoline blobs.
    pub resource_dir: PathBuf,
    /// Lowest address the stack may grow down to.
    pub stack_floor: u64,
    pub debug: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            vcpu_count: 1,
            user_memory: 256 << 20,
            resource_dir: PathBuf::from("/usr/share/elkrun"),
            stack_floor: 0x1000,
            debug: false,
        }
    }
}

/// What one dispatcher iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Resumed,
    Breakpoint(u64),
    Exited(i32),
}

pub struct Vm {
    mem: Arc<Mutex<AddressSpace>>,
    vcpus: Vec<Vcpu>,
    handlers: SyscallHandlers,
    hyp_handlers: HypercallHandlers,
    signals: Arc<Mutex<SignalTable>>,
    entry: u64,
    debug: bool,
}

impl Vm {
    /// Builds a VM with its privileged machinery in place but no binary
    /// loaded: chunks, page tables, per-VCPU stacks, GDT/IDT/TSS and the
    /// three trampolines.
    pub fn new(
        hv: &dyn Hypervisor,
        config: &VmConfig,
        handlers: SyscallHandlers,
        hyp_handlers: HypercallHandlers,
    ) -> Result<Vm> {
        debug!("creating VM on {} backend", hv.name());
        let hv_vm = hv.create_vm()?;
        let pager = Pager::new(hv_vm.clone(), config.user_memory)?;
        let mut rm = RegionManager::new(pager);

        let isr = flat::load(&mut rm, &config.resource_dir.join("isr"), FlatKind::Kernel)?;
        let entry_flat = flat::load(&mut rm, &config.resource_dir.join("entry"), FlatKind::Kernel)?;
        let signal_flat = flat::load(
            &mut rm,
            &config.resource_dir.join("signal"),
            FlatKind::User {
                guest_addr: SIGNAL_FLAT_ADDR,
            },
        )?;

        let mut vcpus = Vec::with_capacity(config.vcpu_count as usize);
        for id in 0..config.vcpu_count {
            let handle = hv_vm.create_vcpu(id)?;
            let stack = GuestStack::new(&mut rm, id, config.stack_floor)?;
            let mut vcpu = Vcpu::new(handle, id, stack)?;
            setup_long_mode(&mut vcpu, &mut rm, isr.guest_addr, entry_flat.guest_addr)?;
            vcpus.push(vcpu);
        }

        Ok(Vm {
            mem: Arc::new(Mutex::new(AddressSpace::new(rm))),
            vcpus,
            handlers,
            hyp_handlers,
            signals: Arc::new(Mutex::new(SignalTable::new(signal_flat.guest_addr))),
            entry: 0,
            debug: config.debug,
        })
    }

    /// Loads a static binary, composes its initial stack and points VCPU 0
    /// at the entry point.
    pub fn load_binary(&mut self, path: &Path, argv: &[String], envp: &[String]) -> Result<()> {
        let mut mem = self.mem.lock().unwrap();
        let loaded = elf::load(&mut mem.rm, path)?;
        mem.heap.init_brk(loaded.brk_start);

        let vcpu = &mut self.vcpus[0];
        let environment = env::build(&mut mem.rm, &loaded, argv, envp, vcpu.stack.top())?;
        vcpu.stack
            .adopt_initial(environment.region, environment.region_base);

        let regs = vcpu.regs_mut();
        regs.rip = loaded.entry;
        regs.rsp = environment.initial_rsp;
        self.entry = loaded.entry;
        Ok(())
    }

    pub fn entry_point(&self) -> u64 {
        self.entry
    }

    pub fn set_debug(&mut self, on: bool) {
        self.debug = on;
    }

    pub fn memory(&self) -> &Arc<Mutex<AddressSpace>> {
        &self.mem
    }

    pub fn vcpu(&self, id: usize) -> &Vcpu {
        &self.vcpus[id]
    }

    pub fn vcpu_mut(&mut self, id: usize) -> &mut Vcpu {
        &mut self.vcpus[id]
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.mem.lock().unwrap().rm.pager().chunk_count()
    }

    pub fn chunk(&self, num: usize) -> Option<Chunk> {
        self.mem.lock().unwrap().rm.pager().chunk(num).copied()
    }

    /// Discards a chunk's contents and re-registers it with a new size at
    /// the same guest-physical base.
    pub fn chunk_remap(&mut self, num: usize, newsize: u64) -> Result<()> {
        self.mem
            .lock()
            .unwrap()
            .rm
            .pager_mut()
            .chunk_remap(num, newsize)
    }

    /// Maps an externally sourced interval (the attach demo) at a fixed
    /// guest address; returns the host backing so the caller can fill it.
    pub fn map_external_region(
        &mut self,
        guest: u64,
        size: u64,
        writable: bool,
        exec: bool,
    ) -> Result<u64> {
        let mut mem = self.mem.lock().unwrap();
        let size = align_up(size);
        let id = mem.rm.allocate_region(size, "attach")?;
        let host = mem.rm.region(id).host_base();
        mem.rm.set_guest(id, GuestAddress(guest));
        let mut flags = PageFlags::USER;
        if writable {
            flags |= PageFlags::WRITE;
        }
        if exec {
            flags |= PageFlags::EXEC;
        }
        mem.rm
            .pager_mut()
            .map_region(host, GuestAddress(guest), size / PAGE_SIZE, flags)?;
        Ok(host)
    }

    /// One dispatcher iteration on VCPU 0: enter, classify, handle.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let vcpu = &mut self.vcpus[0];
        if self.mem.lock().unwrap().rm.pager_mut().take_flush() {
            vcpu.mark_tlb_flush();
        }
        let exit = vcpu.run()?;
        dispatch_exit(
            vcpu,
            &self.mem,
            &self.handlers,
            &self.hyp_handlers,
            &self.signals,
            self.debug,
            exit,
        )
    }

    /// Runs the guest to completion; returns the `exit_group` status.
    pub fn run(&mut self) -> Result<i32> {
        if self.vcpus.len() == 1 {
            loop {
                if let StepOutcome::Exited(status) = self.step()? {
                    return Ok(status);
                }
            }
        }

        // one host thread per VCPU; the first exit_group or fatal error wins
        let (tx, rx) = crossbeam_channel::unbounded();
        for mut vcpu in std::mem::take(&mut self.vcpus) {
            let mem = self.mem.clone();
            let handlers = self.handlers;
            let hyp_handlers = self.hyp_handlers;
            let signals = self.signals.clone();
            let debug_mode = self.debug;
            let tx = tx.clone();
            std::thread::Builder::new()
                .name(format!("vcpu{}", vcpu.id()))
                .spawn(move || {
                    let guard = scopeguard::guard(tx, |tx| {
                        let _ = tx.send(Err(Error::Fatal(
                            "VCPU thread terminated abnormally".into(),
                        )));
                    });
                    let result = run_vcpu(
                        &mut vcpu,
                        &mem,
                        &handlers,
                        &hyp_handlers,
                        &signals,
                        debug_mode,
                    );
                    let tx = scopeguard::ScopeGuard::into_inner(guard);
                    let _ = tx.send(result);
                })
                .map_err(|e| Error::Resource("spawning a VCPU thread", e))?;
        }
        drop(tx);
        rx.recv()
            .map_err(|_| Error::Fatal("all VCPU threads exited without a result".into()))?
    }
}

fn run_vcpu(
    vcpu: &mut Vcpu,
    mem: &Mutex<AddressSpace>,
    handlers: &SyscallHandlers,
    hyp_handlers: &HypercallHandlers,
    signals: &Mutex<SignalTable>,
    debug_mode: bool,
) -> Result<i32> {
    loop {
        if mem.lock().unwrap().rm.pager_mut().take_flush() {
            vcpu.mark_tlb_flush();
        }
        let exit = vcpu.run()?;
        if let StepOutcome::Exited(status) = dispatch_exit(
            vcpu,
            mem,
            handlers,
            hyp_handlers,
            signals,
            debug_mode,
            exit,
        )? {
            return Ok(status);
        }
    }
}

/// Classifies one VM exit and routes it.
fn dispatch_exit(
    vcpu: &mut Vcpu,
    mem: &Mutex<AddressSpace>,
    handlers: &SyscallHandlers,
    hyp_handlers: &HypercallHandlers,
    signals: &Mutex<SignalTable>,
    debug_mode: bool,
    exit: VmExit,
) -> Result<StepOutcome> {
    match exit {
        VmExit::Hlt => match vcpu.regs().rax & 0xff {
            HYPERCALL_SYSCALL => {
                if let Some(pre) = hyp_handlers.pre {
                    let ret = pre(HypercallKind::Syscall);
                    if ret < 0 {
                        vcpu.regs_mut().rax = ret as u64;
                        return Ok(StepOutcome::Resumed);
                    }
                }
                let outcome = {
                    let mut mem = mem.lock().unwrap();
                    let mut signals = signals.lock().unwrap();
                    syscall::handle(vcpu, &mut mem, handlers, &mut signals)?
                };
                if let Some(post) = hyp_handlers.post {
                    post(HypercallKind::Syscall);
                }
                Ok(match outcome {
                    Outcome::Continue => StepOutcome::Resumed,
                    Outcome::Exit(status) => StepOutcome::Exited(status),
                })
            }
            HYPERCALL_INTERRUPT => {
                if let Some(pre) = hyp_handlers.pre {
                    pre(HypercallKind::Interrupt);
                }
                {
                    let mut mem = mem.lock().unwrap();
                    interrupt::handle(vcpu, &mut mem, handlers, debug_mode)?;
                }
                if let Some(post) = hyp_handlers.post {
                    post(HypercallKind::Interrupt);
                }
                Ok(StepOutcome::Resumed)
            }
            HYPERCALL_DEBUG => {
                if let Some(pre) = hyp_handlers.pre {
                    pre(HypercallKind::Debug);
                }
                let rip = vcpu.regs().rip;
                breakpoint_hit(handlers, rip)?;
                Ok(StepOutcome::Breakpoint(rip))
            }
            kind => {
                dump_state(vcpu, &mem.lock().unwrap());
                Err(Error::Fatal(format!("unknown hypercall type {kind}")))
            }
        },
        VmExit::IoIn { port, len } => {
            debug!("unused IO-in exit (port {:#x}, {} bytes)", port, len);
            Ok(StepOutcome::Resumed)
        }
        VmExit::IoOut { port, data } => {
            debug!("unused IO-out exit (port {:#x}, {:x?})", port, data);
            Ok(StepOutcome::Resumed)
        }
        VmExit::MmioRead { addr, len } => {
            debug!("unused MMIO read at {:#x} ({} bytes)", addr, len);
            Ok(StepOutcome::Resumed)
        }
        VmExit::MmioWrite { addr, data } => {
            debug!("unused MMIO write at {:#x} ({:x?})", addr, data);
            Ok(StepOutcome::Resumed)
        }
        VmExit::Debug { pc } => {
            breakpoint_hit(handlers, pc)?;
            Ok(StepOutcome::Breakpoint(pc))
        }
        VmExit::Intr => Ok(StepOutcome::Resumed),
        VmExit::Exception => {
            dump_state(vcpu, &mem.lock().unwrap());
            Err(Error::Fatal("unhandled exception exit".into()))
        }
        VmExit::Shutdown => {
            dump_state(vcpu, &mem.lock().unwrap());
            Err(Error::Fatal("guest shutdown (triple fault)".into()))
        }
        VmExit::FailEntry { reason } => Err(Error::Fatal(format!(
            "hypervisor entry failure ({reason:#x})"
        ))),
        VmExit::InternalError => {
            dump_state(vcpu, &mem.lock().unwrap());
            Err(Error::Fatal("hypervisor internal error".into()))
        }
        VmExit::Unsupported(reason) => {
            warn!("unsupported exit reason: {}", reason);
            dump_state(vcpu, &mem.lock().unwrap());
            Err(Error::Fatal(format!("unhandled exit: {reason}")))
        }
    }
}

/// Puts a VCPU into 64-bit mode with paging on, ring-3 segments, the boot
/// GDT/IDT/TSS in kernel space and the SYSCALL entry MSRs programmed.
fn setup_long_mode(
    vcpu: &mut Vcpu,
    rm: &mut RegionManager,
    isr_base: u64,
    lstar: u64,
) -> Result<()> {
    use arch::x86_64::tss::{Tss64, TSS_SIZE};
    use arch::x86_64::{gdt, idt, msr};

    // TSS image; IST1 carries the ring-0 entry stack
    let tss_region = rm.allocate_system_region(PAGE_SIZE, "tss")?;
    let tss = Tss64::new(vcpu.stack.kernel_top().0);
    rm.region_mut(tss_region).bytes_mut()[..TSS_SIZE].copy_from_slice(tss.as_slice());
    let tss_host = rm.region(tss_region).host_base();
    let tss_guest = rm.pager_mut().map_kernel_page(tss_host, PageFlags::WRITE)?;
    rm.set_guest(tss_region, tss_guest);

    // boot GDT with the TSS descriptor pair
    let gdt_table = gdt::boot_gdt(tss_guest.0);
    let gdt_region = rm.allocate_system_region(PAGE_SIZE, "gdt")?;
    {
        let bytes = rm.region_mut(gdt_region).bytes_mut();
        for (i, entry) in gdt_table.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&entry.to_le_bytes());
        }
    }
    let gdt_host = rm.region(gdt_region).host_base();
    let gdt_guest = rm.pager_mut().map_kernel_page(gdt_host, PageFlags::WRITE)?;
    rm.set_guest(gdt_region, gdt_guest);

    // IDT: every vector routes to its stub, all gates on IST1.
    //
    // Interrupt-frame layout at the stub's HLT, growing down from IST1:
    // [rsp] vector, [rsp+8] error code, [rsp+16] rip, [rsp+24] cs,
    // [rsp+32] rflags, [rsp+40] the interrupted rsp. Kernel-mode unwinding
    // (the debugger) relies on this.
    let idt_region = rm.allocate_system_region(PAGE_SIZE, "idt")?;
    {
        let bytes = rm.region_mut(idt_region).bytes_mut();
        for vector in 0..idt::IDT_ENTRIES {
            let gate = idt::interrupt_gate(
                isr_base + vector as u64 * ISR_STUB_STRIDE,
                x86::KERNEL_CS,
                1,
            );
            bytes[vector * idt::GATE_SIZE..(vector + 1) * idt::GATE_SIZE]
                .copy_from_slice(gate.as_slice());
        }
    }
    let idt_host = rm.region(idt_region).host_base();
    let idt_guest = rm.pager_mut().map_kernel_page(idt_host, PageFlags::WRITE)?;
    rm.set_guest(idt_region, idt_guest);

    let sregs = vcpu.sregs_mut();
    sregs.cr3 = 0; // PML4 root sits at guest-physical zero
    sregs.cr0 |= x86::CR0_PE
        | x86::CR0_MP
        | x86::CR0_ET
        | x86::CR0_NE
        | x86::CR0_WP
        | x86::CR0_AM
        | x86::CR0_PG;
    sregs.cr4 |= x86::CR4_PAE | x86::CR4_OSFXSR | x86::CR4_OSXMMEXCPT;
    sregs.efer = x86::EFER_LME | x86::EFER_LMA | x86::EFER_SCE | x86::EFER_NXE;
    sregs.gdt.base = gdt_guest.0;
    sregs.gdt.limit = (gdt_table.len() * 8 - 1) as u16;
    sregs.idt.base = idt_guest.0;
    sregs.idt.limit = (idt::IDT_ENTRIES * idt::GATE_SIZE - 1) as u16;

    // the binary itself runs in ring 3
    sregs.cs = gdt::kvm_segment_from_gdt_rpl(gdt_table[4], 4, x86::RPL_USER);
    let data = gdt::kvm_segment_from_gdt_rpl(gdt_table[3], 3, x86::RPL_USER);
    sregs.ds = data;
    sregs.es = data;
    sregs.ss = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.tr = kvm_segment {
        base: tss_guest.0,
        limit: (TSS_SIZE - 1) as u32,
        selector: x86::TSS_SELECTOR,
        type_: 11, // busy 64-bit TSS
        present: 1,
        ..Default::default()
    };

    vcpu.regs_mut().rflags = x86::RFLAGS_RESERVED;

    vcpu.set_msr(msr::MSR_LSTAR, lstar)?;
    vcpu.set_msr(
        msr::MSR_STAR,
        msr::star_value(x86::KERNEL_CS, (x86::USER_DS - 8) | x86::RPL_USER),
    )?;
    vcpu.set_msr(msr::MSR_SFMASK, x86::RFLAGS_IF)?;
    Ok(())
}
