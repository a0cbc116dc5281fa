//! The capability interface the monitor requires from a virtualization
//! backend. KVM implements it in [`kvm`]; tests substitute the scripted
//! double in [`fake`].

use std::sync::Arc;

use kvm_bindings::{kvm_regs, kvm_sregs};

use crate::error::Result;

pub mod fake;
pub mod kvm;

/// One classified reason for a VM exit, decoupled from the backend's own
/// exit representation. Buffers carried by IO/MMIO exits are copied out;
/// the monitor only logs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmExit {
    /// The guest executed HLT; the hypercall type is in the low byte of rax.
    Hlt,
    IoIn { port: u16, len: usize },
    IoOut { port: u16, data: Vec<u8> },
    MmioRead { addr: u64, len: usize },
    MmioWrite { addr: u64, data: Vec<u8> },
    /// A debug exception while single-stepping or on a software breakpoint.
    Debug { pc: u64 },
    /// The run ioctl was interrupted by a host signal.
    Intr,
    Exception,
    Shutdown,
    FailEntry { reason: u64 },
    InternalError,
    Unsupported(String),
}

pub trait Hypervisor: Send {
    fn name(&self) -> &'static str;
    fn create_vm(&self) -> Result<Arc<dyn VmHandle>>;
}

/// Per-VM backend handle. Chunk registration maps a page-aligned host buffer
/// into guest-physical space under a numbered slot.
pub trait VmHandle: Send + Sync {
    fn register_chunk(&self, slot: u32, guest_phys: u64, host_addr: u64, size: u64) -> Result<()>;
    fn unregister_chunk(&self, slot: u32, guest_phys: u64, host_addr: u64) -> Result<()>;
    fn create_vcpu(&self, id: u8) -> Result<Box<dyn VcpuHandle>>;
}

/// Per-VCPU backend handle. Register accessors move whole snapshots; the
/// [`crate::vcpu::Vcpu`] wrapper caches them and flushes before every entry.
pub trait VcpuHandle: Send {
    fn run(&mut self) -> Result<VmExit>;
    fn get_regs(&self) -> Result<kvm_regs>;
    fn set_regs(&self, regs: &kvm_regs) -> Result<()>;
    fn get_sregs(&self) -> Result<kvm_sregs>;
    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<()>;
    fn get_msr(&self, index: u32) -> Result<u64>;
    fn set_msr(&self, index: u32, value: u64) -> Result<()>;
    fn set_guest_debug(&self, single_step: bool, sw_breakpoints: bool) -> Result<()>;
}
