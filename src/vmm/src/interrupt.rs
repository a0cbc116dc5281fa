//! Services interrupt hypercalls: the IDT stub has pushed the vector and an
//! error code onto the guest kernel stack and executed HLT.

use tracing::{debug, error};
use vm_memory::GuestAddress;

use crate::debug::{dump_regs, dump_stack, dump_state};
use crate::error::{Error, Result};
use crate::memory::AddressSpace;
use crate::syscall::SyscallHandlers;
use crate::vcpu::Vcpu;

pub const DEBUG_TRAP: u64 = 1;
pub const STACK_SEGMENT_FAULT: u64 = 12;
pub const GENERAL_PROTECTION_FAULT: u64 = 13;
pub const PAGE_FAULT: u64 = 14;

/// Handles one interrupt event. `Ok(())` means the trampoline may IRET and
/// resume (retrying the faulting instruction where applicable); a `Fatal`
/// error stops the run loop.
pub(crate) fn handle(
    vcpu: &mut Vcpu,
    mem: &mut AddressSpace,
    handlers: &SyscallHandlers,
    debug_mode: bool,
) -> Result<()> {
    let vector = vcpu.pop(&mem.rm)?;
    if debug_mode {
        debug!("interrupt with vector {:#x}", vector);
        dump_regs(vcpu);
        dump_stack(vcpu, mem);
    }
    let err_code = vcpu.pop(&mem.rm)?;

    match vector {
        DEBUG_TRAP => {
            // the stub reports the trapping RIP in the error-code slot
            debug!("debug trap at rip {:#x}", err_code);
            if let Some(callback) = handlers.bp_callback {
                if callback(err_code) != 0 {
                    return Err(Error::Fatal("breakpoint callback requested abort".into()));
                }
            }
            // push it back so the stub can IRET to it
            vcpu.push(&mut mem.rm, err_code)?;
            Ok(())
        }
        PAGE_FAULT => handle_page_fault(vcpu, mem, err_code, debug_mode),
        STACK_SEGMENT_FAULT => {
            error!("stack segment fault, error code {:#x}", err_code);
            dump_state(vcpu, mem);
            Err(Error::Fatal(format!(
                "stack segment fault (error code {err_code:#x})"
            )))
        }
        GENERAL_PROTECTION_FAULT => {
            error!("general protection fault, error code {:#x}", err_code);
            dump_state(vcpu, mem);
            Err(Error::Fatal(format!(
                "general protection fault (error code {err_code:#x})"
            )))
        }
        vector => {
            error!("unhandled interrupt vector {:#x}", vector);
            dump_state(vcpu, mem);
            Err(Error::Fatal(format!(
                "unhandled interrupt vector {vector:#x}"
            )))
        }
    }
}

fn handle_page_fault(
    vcpu: &mut Vcpu,
    mem: &mut AddressSpace,
    err_code: u64,
    debug_mode: bool,
) -> Result<()> {
    let pfla = vcpu.sregs().cr2;
    debug!("page fault at {:#x}, error code {:#x}", pfla, err_code);

    if vcpu.handle_stack_expansion(&mut mem.rm, err_code, debug_mode)? {
        return Ok(());
    }
    if pfla <= 0x1000 {
        error!("SEGMENTATION FAULT at {:#x}", pfla);
        dump_state(vcpu, mem);
        return Err(Error::Fatal(format!("segmentation fault at {pfla:#x}")));
    }

    let host = mem.rm.pager().host_address(GuestAddress(pfla));
    error!(
        "unhandled page fault at {:#x} (error code {:#x}, host backing {:?})",
        pfla, err_code, host
    );
    if host.is_some() {
        mem.rm.pager().dump_page_tables();
    }
    dump_state(vcpu, mem);
    Err(Error::Fatal(format!("unhandled page fault at {pfla:#x}")))
}
