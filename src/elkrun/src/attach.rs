//! Attach-to-live-process demo: stop a process with ptrace, mirror its
//! memory map into a raw VM with process_vm_readv, and copy its registers
//! into VCPU 0. Resuming the copy is best-effort; the donor process stays
//! stopped until the monitor exits.

use std::io::{BufRead, IoSliceMut};

use anyhow::{bail, Context};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{info, warn};

use vmm::hv::Hypervisor;
use vmm::vcpu::Reg;
use vmm::{Vm, VmConfig};

struct MapEntry {
    start: u64,
    end: u64,
    readable: bool,
    writable: bool,
    exec: bool,
}

/// Stops the process and waits until the SIGSTOP lands, re-injecting any
/// other signal that arrives first.
fn stop_pid(pid: Pid) -> anyhow::Result<()> {
    ptrace::attach(pid).context("ptrace attach")?;
    loop {
        match waitpid(pid, None).context("waitpid")? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => break,
            WaitStatus::Stopped(_, signal) => {
                info!("not stopped yet, re-injecting {}", signal);
                ptrace::cont(pid, signal).context("ptrace cont")?;
            }
            status => bail!("unexpected wait status {:?}", status),
        }
    }
    info!("halted PID {}", pid);
    Ok(())
}

fn memory_map(pid: Pid) -> anyhow::Result<Vec<MapEntry>> {
    let file = std::fs::File::open(format!("/proc/{pid}/maps")).context("opening maps")?;
    let mut entries = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let Some((range, rest)) = line.split_once(' ') else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let perms = rest.split(' ').next().unwrap_or("");
        entries.push(MapEntry {
            start: u64::from_str_radix(start, 16)?,
            end: u64::from_str_radix(end, 16)?,
            readable: perms.starts_with('r'),
            writable: perms.len() > 1 && &perms[1..2] == "w",
            exec: perms.len() > 2 && &perms[2..3] == "x",
        });
    }
    info!("found {} mapped regions", entries.len());
    Ok(entries)
}

/// Builds a raw VM mirroring the target's user mappings and registers.
pub fn attach_vm(hv: &dyn Hypervisor, config: &VmConfig, pid: i32) -> anyhow::Result<Vm> {
    let pid = Pid::from_raw(pid);
    info!("attaching to PID {}", pid);
    stop_pid(pid)?;

    let mut vm = Vm::new(hv, config, Default::default(), Default::default())?;

    for entry in memory_map(pid)? {
        if !entry.readable || entry.start >= 0x8000_0000_0000 {
            // vsyscall and kernel-half mappings cannot be mirrored
            continue;
        }
        let size = entry.end - entry.start;
        let host = match vm.map_external_region(entry.start, size, entry.writable, entry.exec) {
            Ok(host) => host,
            Err(e) => {
                warn!("skipping {:#x}+{:#x}: {}", entry.start, size, e);
                continue;
            }
        };
        let local =
            unsafe { std::slice::from_raw_parts_mut(host as *mut u8, size as usize) };
        let remote = RemoteIoVec {
            base: entry.start as usize,
            len: size as usize,
        };
        match process_vm_readv(pid, &mut [IoSliceMut::new(local)], &[remote]) {
            Ok(bytes) => info!("copied {:#x} bytes from {:#x}", bytes, entry.start),
            Err(e) => warn!("could not copy {:#x}+{:#x}: {}", entry.start, size, e),
        }
    }

    let regs = ptrace::getregs(pid).context("ptrace getregs")?;
    let vcpu = vm.vcpu_mut(0);
    vcpu.set_reg(Reg::Rax, regs.rax);
    vcpu.set_reg(Reg::Rbx, regs.rbx);
    vcpu.set_reg(Reg::Rcx, regs.rcx);
    vcpu.set_reg(Reg::Rdx, regs.rdx);
    vcpu.set_reg(Reg::Rsi, regs.rsi);
    vcpu.set_reg(Reg::Rdi, regs.rdi);
    vcpu.set_reg(Reg::Rbp, regs.rbp);
    vcpu.set_reg(Reg::Rsp, regs.rsp);
    vcpu.set_reg(Reg::R8, regs.r8);
    vcpu.set_reg(Reg::R9, regs.r9);
    vcpu.set_reg(Reg::R10, regs.r10);
    vcpu.set_reg(Reg::R11, regs.r11);
    vcpu.set_reg(Reg::R12, regs.r12);
    vcpu.set_reg(Reg::R13, regs.r13);
    vcpu.set_reg(Reg::R14, regs.r14);
    vcpu.set_reg(Reg::R15, regs.r15);
    vcpu.set_reg(Reg::Rip, regs.rip);
    vcpu.set_reg(Reg::Rflags, regs.eflags);
    vcpu.sregs_mut().fs.base = regs.fs_base;
    vcpu.sregs_mut().gs.base = regs.gs_base;

    Ok(vm)
}
