//! Fatal-state diagnostics and the debugger attachment contract. The gdb
//! remote-protocol wire codec is a collaborator; this module only provides
//! the operations it needs against a VM.

use kvm_bindings::kvm_regs;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::memory::AddressSpace;
use crate::syscall::SyscallHandlers;
use crate::vcpu::Vcpu;
use crate::vm::{StepOutcome, Vm};

pub(crate) fn dump_regs(vcpu: &Vcpu) {
    let r = vcpu.regs();
    let s = vcpu.sregs();
    error!(
        "rip {:#018x} rsp {:#018x} rbp {:#018x} rflags {:#x}",
        r.rip, r.rsp, r.rbp, r.rflags
    );
    error!(
        "rax {:#018x} rbx {:#018x} rcx {:#018x} rdx {:#018x}",
        r.rax, r.rbx, r.rcx, r.rdx
    );
    error!(
        "rsi {:#018x} rdi {:#018x} r8  {:#018x} r9  {:#018x}",
        r.rsi, r.rdi, r.r8, r.r9
    );
    error!(
        "r10 {:#018x} r11 {:#018x} r12 {:#018x} r13 {:#018x}",
        r.r10, r.r11, r.r12, r.r13
    );
    error!(
        "r14 {:#018x} r15 {:#018x} cr2 {:#018x} cr3 {:#018x}",
        r.r14, r.r15, s.cr2, s.cr3
    );
}

/// Dumps the words above the current stack pointer, as far as they
/// translate.
pub(crate) fn dump_stack(vcpu: &Vcpu, mem: &AddressSpace) {
    let rsp = vcpu.regs().rsp;
    for i in 0..8 {
        let addr = rsp + i * 8;
        match mem.read_u64(addr) {
            Ok(word) => error!("  [{:#018x}] {:#018x}", addr, word),
            Err(_) => break,
        }
    }
}

/// Dumps the instruction bytes around RIP.
pub(crate) fn dump_code(vcpu: &Vcpu, mem: &AddressSpace) {
    let rip = vcpu.regs().rip;
    let mut bytes = [0u8; 16];
    if mem.read_bytes(rip, &mut bytes).is_ok() {
        error!("code at {:#x}: {:02x?}", rip, bytes);
    } else {
        error!("code at {:#x}: <does not translate>", rip);
    }
}

pub(crate) fn dump_state(vcpu: &Vcpu, mem: &AddressSpace) {
    dump_regs(vcpu);
    dump_stack(vcpu, mem);
    dump_code(vcpu, mem);
}

/// Notifies the breakpoint callback; a nonzero return aborts the run.
pub(crate) fn breakpoint_hit(handlers: &SyscallHandlers, pc: u64) -> Result<()> {
    info!("breakpoint hit at {:#x}", pc);
    if let Some(callback) = handlers.bp_callback {
        if callback(pc) != 0 {
            return Err(Error::Fatal("breakpoint callback requested abort".into()));
        }
    }
    Ok(())
}

/// The companion interface a remote-debugging front-end drives. The serial
/// encoding of these operations is its concern, not the monitor's.
pub struct Debugger<'a> {
    vm: &'a mut Vm,
}

impl<'a> Debugger<'a> {
    pub fn new(vm: &'a mut Vm) -> Self {
        Debugger { vm }
    }

    pub fn read_memory(&self, guest: u64, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.vm
            .memory()
            .lock()
            .unwrap()
            .read_bytes(guest, &mut bytes)?;
        Ok(bytes)
    }

    pub fn write_memory(&mut self, guest: u64, bytes: &[u8]) -> Result<()> {
        self.vm.memory().lock().unwrap().write_bytes(guest, bytes)
    }

    pub fn read_registers(&self) -> kvm_regs {
        *self.vm.vcpu(0).regs()
    }

    pub fn write_registers(&mut self, regs: kvm_regs) {
        *self.vm.vcpu_mut(0).regs_mut() = regs;
    }

    /// Executes one guest instruction.
    pub fn step_one(&mut self) -> Result<StepOutcome> {
        self.vm.vcpu_mut(0).set_single_step(true)?;
        let outcome = self.vm.step();
        self.vm.vcpu_mut(0).set_single_step(false)?;
        outcome
    }

    /// Runs until the next breakpoint or guest exit.
    pub fn cont(&mut self) -> Result<StepOutcome> {
        loop {
            match self.vm.step()? {
                StepOutcome::Resumed => continue,
                stop => return Ok(stop),
            }
        }
    }

    pub fn insert_sw_bp(&mut self, guest: u64) -> Result<()> {
        let mem = self.vm.memory().clone();
        let mem = mem.lock().unwrap();
        self.vm.vcpu_mut(0).set_software_breakpoint(&mem.rm, guest)
    }

    pub fn remove_sw_bp(&mut self, guest: u64) -> Result<()> {
        let mem = self.vm.memory().clone();
        let mem = mem.lock().unwrap();
        self.vm
            .vcpu_mut(0)
            .remove_software_breakpoint(&mem.rm, guest)
    }
}
