//! A scripted hypervisor double. Tests stage register state and guest
//! memory between exits exactly the way the trampolines would, so the
//! monitor above the capability interface cannot tell the difference.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use kvm_bindings::{kvm_regs, kvm_sregs};

use super::{Hypervisor, VcpuHandle, VmExit, VmHandle};
use crate::error::Result;

/// One scripted step: mutate the visible CPU state like the guest would,
/// then report the exit the hypervisor delivers.
pub type ScriptStep = Box<dyn FnMut(&mut FakeVcpuState) -> VmExit + Send>;

#[derive(Default)]
pub struct FakeVcpuState {
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
    pub msrs: HashMap<u32, u64>,
    pub single_step: bool,
    pub sw_breakpoints: bool,
    pub set_sregs_calls: usize,
    pub script: VecDeque<ScriptStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeSlot {
    pub guest_phys: u64,
    pub host_addr: u64,
    pub size: u64,
}

#[derive(Default)]
pub struct FakeVmState {
    pub slots: HashMap<u32, FakeSlot>,
    pub vcpus: Vec<Arc<Mutex<FakeVcpuState>>>,
}

pub struct FakeHypervisor {
    state: Arc<Mutex<FakeVmState>>,
}

impl FakeHypervisor {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        FakeHypervisor {
            state: Arc::new(Mutex::new(FakeVmState::default())),
        }
    }

    /// Shared view of the single VM this double backs; tests keep it to
    /// inspect slots and to push script steps after the VM is built.
    pub fn vm_state(&self) -> Arc<Mutex<FakeVmState>> {
        self.state.clone()
    }

    pub fn vcpu_state(&self, id: usize) -> Arc<Mutex<FakeVcpuState>> {
        self.state.lock().unwrap().vcpus[id].clone()
    }
}

impl Hypervisor for FakeHypervisor {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn create_vm(&self) -> Result<Arc<dyn VmHandle>> {
        Ok(Arc::new(FakeVm {
            state: self.state.clone(),
        }))
    }
}

struct FakeVm {
    state: Arc<Mutex<FakeVmState>>,
}

impl VmHandle for FakeVm {
    fn register_chunk(&self, slot: u32, guest_phys: u64, host_addr: u64, size: u64) -> Result<()> {
        self.state.lock().unwrap().slots.insert(
            slot,
            FakeSlot {
                guest_phys,
                host_addr,
                size,
            },
        );
        Ok(())
    }

    fn unregister_chunk(&self, slot: u32, _guest_phys: u64, _host_addr: u64) -> Result<()> {
        self.state.lock().unwrap().slots.remove(&slot);
        Ok(())
    }

    fn create_vcpu(&self, _id: u8) -> Result<Box<dyn VcpuHandle>> {
        let vcpu = Arc::new(Mutex::new(FakeVcpuState::default()));
        self.state.lock().unwrap().vcpus.push(vcpu.clone());
        Ok(Box::new(FakeVcpu { state: vcpu }))
    }
}

struct FakeVcpu {
    state: Arc<Mutex<FakeVcpuState>>,
}

impl VcpuHandle for FakeVcpu {
    fn run(&mut self) -> Result<VmExit> {
        let step = self.state.lock().unwrap().script.pop_front();
        match step {
            Some(mut step) => {
                let mut state = self.state.lock().unwrap();
                Ok(step(&mut state))
            }
            None => Ok(VmExit::Shutdown),
        }
    }

    fn get_regs(&self) -> Result<kvm_regs> {
        Ok(self.state.lock().unwrap().regs)
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<()> {
        self.state.lock().unwrap().regs = *regs;
        Ok(())
    }

    fn get_sregs(&self) -> Result<kvm_sregs> {
        Ok(self.state.lock().unwrap().sregs)
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sregs = *sregs;
        state.set_sregs_calls += 1;
        Ok(())
    }

    fn get_msr(&self, index: u32) -> Result<u64> {
        Ok(*self.state.lock().unwrap().msrs.get(&index).unwrap_or(&0))
    }

    fn set_msr(&self, index: u32, value: u64) -> Result<()> {
        self.state.lock().unwrap().msrs.insert(index, value);
        Ok(())
    }

    fn set_guest_debug(&self, single_step: bool, sw_breakpoints: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.single_step = single_step;
        state.sw_breakpoints = sw_breakpoints;
        Ok(())
    }
}
