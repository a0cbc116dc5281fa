use std::collections::HashMap;

use kvm_bindings::{kvm_regs, kvm_sregs};
use tracing::debug;
use vm_memory::GuestAddress;

use crate::error::{Error, Result};
use crate::hv::{VcpuHandle, VmExit};
use crate::memory::{GuestStack, RegionManager};

const BREAKPOINT_OPCODE: u8 = 0xcc;

/// Register names for the debug interface; everything internal works on the
/// whole snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
}

#[derive(Debug, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
}

/// Wraps a backend VCPU with a cached register snapshot and debug state.
///
/// State machine: Idle -> Running -> Idle, one transition per [`Vcpu::run`].
/// Registers may only be mutated while Idle; dirty snapshots are written
/// back through the backend right before entering the hypervisor, so the
/// authoritative copy is always current at entry.
pub struct Vcpu {
    id: u8,
    handle: Box<dyn VcpuHandle>,
    regs: kvm_regs,
    sregs: kvm_sregs,
    regs_dirty: bool,
    sregs_dirty: bool,
    state: RunState,
    single_step: bool,
    breakpoints: HashMap<u64, u8>,
    pub stack: GuestStack,
}

impl Vcpu {
    pub fn new(handle: Box<dyn VcpuHandle>, id: u8, stack: GuestStack) -> Result<Self> {
        let regs = handle.get_regs()?;
        let sregs = handle.get_sregs()?;
        Ok(Vcpu {
            id,
            handle,
            regs,
            sregs,
            regs_dirty: false,
            sregs_dirty: false,
            state: RunState::Idle,
            single_step: false,
            breakpoints: HashMap::new(),
            stack,
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Enters the hypervisor and refreshes the register snapshot on exit.
    pub fn run(&mut self) -> Result<VmExit> {
        debug_assert_eq!(RunState::Idle, self.state);
        self.flush_registers()?;
        self.state = RunState::Running;
        let exit = self.handle.run();
        self.state = RunState::Idle;
        let exit = exit?;
        self.regs = self.handle.get_regs()?;
        self.sregs = self.handle.get_sregs()?;
        Ok(exit)
    }

    fn flush_registers(&mut self) -> Result<()> {
        if self.regs_dirty {
            self.handle.set_regs(&self.regs)?;
            self.regs_dirty = false;
        }
        if self.sregs_dirty {
            self.handle.set_sregs(&self.sregs)?;
            self.sregs_dirty = false;
        }
        Ok(())
    }

    pub fn regs(&self) -> &kvm_regs {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut kvm_regs {
        debug_assert_eq!(RunState::Idle, self.state);
        self.regs_dirty = true;
        &mut self.regs
    }

    pub fn sregs(&self) -> &kvm_sregs {
        &self.sregs
    }

    pub fn sregs_mut(&mut self) -> &mut kvm_sregs {
        debug_assert_eq!(RunState::Idle, self.state);
        self.sregs_dirty = true;
        &mut self.sregs
    }

    pub fn get_reg(&self, reg: Reg) -> u64 {
        let r = &self.regs;
        match reg {
            Reg::Rax => r.rax,
            Reg::Rbx => r.rbx,
            Reg::Rcx => r.rcx,
            Reg::Rdx => r.rdx,
            Reg::Rsi => r.rsi,
            Reg::Rdi => r.rdi,
            Reg::Rsp => r.rsp,
            Reg::Rbp => r.rbp,
            Reg::R8 => r.r8,
            Reg::R9 => r.r9,
            Reg::R10 => r.r10,
            Reg::R11 => r.r11,
            Reg::R12 => r.r12,
            Reg::R13 => r.r13,
            Reg::R14 => r.r14,
            Reg::R15 => r.r15,
            Reg::Rip => r.rip,
            Reg::Rflags => r.rflags,
        }
    }

    pub fn set_reg(&mut self, reg: Reg, value: u64) {
        let r = self.regs_mut();
        match reg {
            Reg::Rax => r.rax = value,
            Reg::Rbx => r.rbx = value,
            Reg::Rcx => r.rcx = value,
            Reg::Rdx => r.rdx = value,
            Reg::Rsi => r.rsi = value,
            Reg::Rdi => r.rdi = value,
            Reg::Rsp => r.rsp = value,
            Reg::Rbp => r.rbp = value,
            Reg::R8 => r.r8 = value,
            Reg::R9 => r.r9 = value,
            Reg::R10 => r.r10 = value,
            Reg::R11 => r.r11 = value,
            Reg::R12 => r.r12 = value,
            Reg::R13 => r.r13 = value,
            Reg::R14 => r.r14 = value,
            Reg::R15 => r.r15 = value,
            Reg::Rip => r.rip = value,
            Reg::Rflags => r.rflags = value,
        }
    }

    pub fn get_msr(&self, index: u32) -> Result<u64> {
        self.handle.get_msr(index)
    }

    pub fn set_msr(&self, index: u32, value: u64) -> Result<()> {
        // programming LSTAR before the entry trampoline exists is a
        // programmer error, not a guest condition
        debug_assert!(
            index != arch::x86_64::msr::MSR_LSTAR || value != 0,
            "LSTAR written before the entry trampoline was loaded"
        );
        self.handle.set_msr(index, value)
    }

    /// Forces a guest TLB flush on the next entry by rewriting sregs, which
    /// makes the hypervisor reload the MMU.
    pub fn mark_tlb_flush(&mut self) {
        self.sregs_dirty = true;
    }

    /// Pushes one word onto the guest stack through the pager, expanding the
    /// stack when the write lands just below its current bottom.
    pub fn push(&mut self, rm: &mut RegionManager, value: u64) -> Result<()> {
        let rsp = self.regs.rsp - 8;
        let host = match rm.pager().host_address(GuestAddress(rsp)) {
            Some(host) => host,
            None if self.stack.is_expansion(rsp) => {
                self.stack.grow(rm)?;
                rm.pager()
                    .host_address(GuestAddress(rsp))
                    .ok_or(Error::Translation(rsp))?
            }
            None => return Err(Error::Translation(rsp)),
        };
        unsafe { (host as *mut u64).write_unaligned(value) };
        self.regs_mut().rsp = rsp;
        Ok(())
    }

    /// Pops one word off the guest stack.
    pub fn pop(&mut self, rm: &RegionManager) -> Result<u64> {
        let rsp = self.regs.rsp;
        let host = rm
            .pager()
            .host_address(GuestAddress(rsp))
            .ok_or(Error::Translation(rsp))?;
        let value = unsafe { (host as *const u64).read_unaligned() };
        self.regs_mut().rsp = rsp + 8;
        Ok(value)
    }

    pub fn set_single_step(&mut self, on: bool) -> Result<()> {
        self.single_step = on;
        self.sync_guest_debug()
    }

    /// Plants `int3` at `guest`, remembering the displaced byte.
    pub fn set_software_breakpoint(&mut self, rm: &RegionManager, guest: u64) -> Result<()> {
        let host = rm
            .pager()
            .host_address(GuestAddress(guest))
            .ok_or(Error::Translation(guest))?;
        let original = unsafe { (host as *const u8).read() };
        self.breakpoints.insert(guest, original);
        unsafe { (host as *mut u8).write(BREAKPOINT_OPCODE) };
        debug!("breakpoint set at {:#x}", guest);
        self.sync_guest_debug()
    }

    /// Restores the displaced byte.
    pub fn remove_software_breakpoint(&mut self, rm: &RegionManager, guest: u64) -> Result<()> {
        let original = self
            .breakpoints
            .remove(&guest)
            .ok_or(Error::Translation(guest))?;
        let host = rm
            .pager()
            .host_address(GuestAddress(guest))
            .ok_or(Error::Translation(guest))?;
        unsafe { (host as *mut u8).write(original) };
        self.sync_guest_debug()
    }

    pub fn has_breakpoint(&self, guest: u64) -> bool {
        self.breakpoints.contains_key(&guest)
    }

    fn sync_guest_debug(&self) -> Result<()> {
        self.handle
            .set_guest_debug(self.single_step, !self.breakpoints.is_empty())
    }

    /// Grows the stack when the faulting address reported in CR2 is a stack
    /// access just below the current bottom. Returns whether it grew; the
    /// faulting instruction is retried by the trampoline's IRET.
    pub fn handle_stack_expansion(
        &mut self,
        rm: &mut RegionManager,
        err_code: u64,
        debug_mode: bool,
    ) -> Result<bool> {
        let pfla = self.sregs.cr2;
        if !self.stack.is_expansion(pfla) {
            return Ok(false);
        }
        if debug_mode {
            debug!(
                "expanding stack for fault at {:#x} (error code {:#x})",
                pfla, err_code
            );
        }
        self.stack.grow(rm)?;
        Ok(true)
    }
}
