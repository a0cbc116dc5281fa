//! KVM backend for the hypervisor capability interface.

use std::io;
use std::sync::Arc;

use kvm_bindings::{
    kvm_guest_debug, kvm_msr_entry, kvm_regs, kvm_sregs, kvm_userspace_memory_region, Msrs,
    KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP, KVM_GUESTDBG_USE_SW_BP,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use tracing::warn;

use super::{Hypervisor, VcpuHandle, VmExit, VmHandle};
use crate::error::{Error, Result};

fn hv_err(context: &'static str, e: kvm_ioctls::Error) -> Error {
    Error::Resource(context, io::Error::from_raw_os_error(e.errno()))
}

/// Process-wide handle on `/dev/kvm`. Opened once at startup, closed at
/// teardown; the kernel demultiplexes by VM and VCPU fd, so no serialization
/// is needed here.
pub struct KvmHypervisor {
    kvm: Kvm,
}

impl KvmHypervisor {
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(|e| hv_err("opening /dev/kvm", e))?;
        Ok(KvmHypervisor { kvm })
    }
}

impl Hypervisor for KvmHypervisor {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn create_vm(&self) -> Result<Arc<dyn VmHandle>> {
        let vm = self
            .kvm
            .create_vm()
            .map_err(|e| hv_err("creating the VM", e))?;
        Ok(Arc::new(KvmVm { vm }))
    }
}

struct KvmVm {
    vm: VmFd,
}

impl VmHandle for KvmVm {
    fn register_chunk(&self, slot: u32, guest_phys: u64, host_addr: u64, size: u64) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: guest_phys,
            memory_size: size,
            userspace_addr: host_addr,
        };
        // Safe as long as the host buffer outlives the registration, which
        // the pager's chunk table guarantees.
        unsafe { self.vm.set_user_memory_region(region) }
            .map_err(|e| hv_err("registering a memory chunk", e))
    }

    fn unregister_chunk(&self, slot: u32, guest_phys: u64, host_addr: u64) -> Result<()> {
        let region = kvm_userspace_memory_region {
            slot,
            flags: 0,
            guest_phys_addr: guest_phys,
            memory_size: 0,
            userspace_addr: host_addr,
        };
        unsafe { self.vm.set_user_memory_region(region) }
            .map_err(|e| hv_err("unregistering a memory chunk", e))
    }

    fn create_vcpu(&self, id: u8) -> Result<Box<dyn VcpuHandle>> {
        let vcpu = self
            .vm
            .create_vcpu(id as u64)
            .map_err(|e| hv_err("creating a VCPU", e))?;
        Ok(Box::new(KvmVcpu { vcpu }))
    }
}

struct KvmVcpu {
    vcpu: VcpuFd,
}

impl VcpuHandle for KvmVcpu {
    fn run(&mut self) -> Result<VmExit> {
        match self.vcpu.run() {
            Ok(exit) => Ok(match exit {
                VcpuExit::Hlt => VmExit::Hlt,
                VcpuExit::IoIn(port, data) => VmExit::IoIn {
                    port,
                    len: data.len(),
                },
                VcpuExit::IoOut(port, data) => VmExit::IoOut {
                    port,
                    data: data.to_vec(),
                },
                VcpuExit::MmioRead(addr, data) => VmExit::MmioRead {
                    addr,
                    len: data.len(),
                },
                VcpuExit::MmioWrite(addr, data) => VmExit::MmioWrite {
                    addr,
                    data: data.to_vec(),
                },
                VcpuExit::Debug(arch) => VmExit::Debug { pc: arch.pc },
                VcpuExit::Shutdown => VmExit::Shutdown,
                VcpuExit::FailEntry(reason, cpu) => {
                    warn!("KVM entry failure on cpu {}: {:#x}", cpu, reason);
                    VmExit::FailEntry { reason }
                }
                VcpuExit::InternalError => VmExit::InternalError,
                VcpuExit::Intr => VmExit::Intr,
                VcpuExit::Exception => VmExit::Exception,
                other => VmExit::Unsupported(format!("{:?}", other)),
            }),
            Err(e) if e.errno() == libc::EINTR => Ok(VmExit::Intr),
            Err(e) => Err(hv_err("running the VCPU", e)),
        }
    }

    fn get_regs(&self) -> Result<kvm_regs> {
        self.vcpu.get_regs().map_err(|e| hv_err("reading registers", e))
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        self.vcpu
            .set_regs(regs)
            .map_err(|e| hv_err("writing registers", e))
    }

    fn get_sregs(&self) -> Result<kvm_sregs> {
        self.vcpu
            .get_sregs()
            .map_err(|e| hv_err("reading special registers", e))
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        self.vcpu
            .set_sregs(sregs)
            .map_err(|e| hv_err("writing special registers", e))
    }

    fn get_msr(&self, index: u32) -> Result<u64> {
        let mut msrs = Msrs::from_entries(&[kvm_msr_entry {
            index,
            ..Default::default()
        }])
        .map_err(|_| Error::Fatal("MSR buffer allocation failed".into()))?;
        self.vcpu
            .get_msrs(&mut msrs)
            .map_err(|e| hv_err("reading an MSR", e))?;
        Ok(msrs.as_slice()[0].data)
    }

    fn set_msr(&self, index: u32, value: u64) -> Result<()> {
        let msrs = Msrs::from_entries(&[kvm_msr_entry {
            index,
            data: value,
            ..Default::default()
        }])
        .map_err(|_| Error::Fatal("MSR buffer allocation failed".into()))?;
        self.vcpu
            .set_msrs(&msrs)
            .map_err(|e| hv_err("writing an MSR", e))?;
        Ok(())
    }

    fn set_guest_debug(&self, single_step: bool, sw_breakpoints: bool) -> Result<()> {
        let mut control = 0;
        if single_step {
            control |= KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP;
        }
        if sw_breakpoints {
            control |= KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_SW_BP;
        }
        let debug = kvm_guest_debug {
            control,
            ..Default::default()
        };
        self.vcpu
            .set_guest_debug(&debug)
            .map_err(|e| hv_err("setting guest debug state", e))
    }
}
