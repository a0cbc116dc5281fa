//! The syscall bridge: unpacks the guest's trapped system call, translates
//! pointer arguments, consults the handler table and falls back to invoking
//! the matching host system call, then writes the result back into `rax`.

pub mod handlers;

use libc::c_void;
use nix::errno::Errno;
use tracing::{debug, warn};

use crate::error::Result;
use crate::memory::AddressSpace;
use crate::signal::{GuestSigaction, SignalTable};
use crate::vcpu::Vcpu;

pub use handlers::{HypercallHandlers, HypercallKind, RegionMapping, SyscallHandlers};

/// What the dispatcher should do after a serviced syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Exit(i32),
}

/// Per-call results carry a negative errno in the error position.
type SysResult = std::result::Result<i64, i64>;

fn efault() -> i64 {
    -i64::from(libc::EFAULT)
}

/// Re-issues a system call against the host kernel.
fn host_call(nr: i64, args: [u64; 6]) -> i64 {
    let ret = unsafe { libc::syscall(nr, args[0], args[1], args[2], args[3], args[4], args[5]) };
    Errno::result(ret)
        .map(|v| v as i64)
        .unwrap_or_else(|e| -i64::from(e as i32))
}

fn tr_buf(mem: &AddressSpace, guest: u64, len: u64) -> std::result::Result<u64, i64> {
    mem.translate_buf(guest, len).ok_or_else(efault)
}

fn tr_buf_opt(mem: &AddressSpace, guest: u64, len: u64) -> std::result::Result<u64, i64> {
    if guest == 0 {
        Ok(0)
    } else {
        tr_buf(mem, guest, len)
    }
}

fn tr_str(mem: &AddressSpace, guest: u64) -> std::result::Result<u64, i64> {
    mem.translate_str(guest).ok_or_else(efault)
}

/// Translate when the address maps, pass through raw otherwise; for
/// arguments that are pointers only for some request codes (`ioctl`,
/// `fcntl`, the positional `futex` arguments).
fn tr_maybe(mem: &AddressSpace, guest: u64) -> u64 {
    if guest == 0 {
        return 0;
    }
    mem.translate(guest).unwrap_or(guest)
}

/// Services one trapped system call. The entry trampoline has pushed the
/// syscall number onto the kernel stack; the six arguments sit in the
/// standard registers.
pub(crate) fn handle(
    vcpu: &mut Vcpu,
    mem: &mut AddressSpace,
    handlers: &SyscallHandlers,
    signals: &mut SignalTable,
) -> Result<Outcome> {
    let nr = vcpu.pop(&mem.rm)? as i64;
    let r = vcpu.regs();
    let args = [r.rdi, r.rsi, r.rdx, r.r10, r.r8, r.r9];
    debug!("syscall {} ({:#x}, {:#x}, {:#x})", nr, args[0], args[1], args[2]);

    if nr == libc::SYS_exit_group || nr == libc::SYS_exit {
        let status = args[0] as i32;
        if let Some(f) = handlers.exit_group {
            f(status);
        }
        return Ok(Outcome::Exit(status));
    }

    let ret = dispatch(nr, args, vcpu, mem, handlers, signals).unwrap_or_else(|e| e);
    vcpu.regs_mut().rax = ret as u64;
    Ok(Outcome::Continue)
}

fn dispatch(
    nr: i64,
    args: [u64; 6],
    vcpu: &mut Vcpu,
    mem: &mut AddressSpace,
    handlers: &SyscallHandlers,
    signals: &mut SignalTable,
) -> SysResult {
    use libc::*;

    let stat_len = std::mem::size_of::<libc::stat>() as u64;
    match nr {
        SYS_read => {
            let host = tr_buf(mem, args[1], args[2])?;
            Ok(match handlers.read {
                Some(f) => f(args[0] as i32, host as *mut c_void, args[2] as usize),
                None => host_call(nr, [args[0], host, args[2], 0, 0, 0]),
            })
        }
        SYS_write => {
            let host = tr_buf(mem, args[1], args[2])?;
            Ok(match handlers.write {
                Some(f) => f(args[0] as i32, host as *const c_void, args[2] as usize),
                None => host_call(nr, [args[0], host, args[2], 0, 0, 0]),
            })
        }
        SYS_open => {
            let path = tr_str(mem, args[0])?;
            Ok(match handlers.open {
                Some(f) => f(path as *const c_char, args[1] as i32, args[2] as u32),
                None => host_call(nr, [path, args[1], args[2], 0, 0, 0]),
            })
        }
        SYS_openat => {
            let path = tr_str(mem, args[1])?;
            Ok(match handlers.openat {
                Some(f) => f(
                    args[0] as i32,
                    path as *const c_char,
                    args[2] as i32,
                    args[3] as u32,
                ),
                None => host_call(nr, [args[0], path, args[2], args[3], 0, 0]),
            })
        }
        SYS_close => Ok(match handlers.close {
            Some(f) => f(args[0] as i32),
            None => host_call(nr, args),
        }),
        SYS_stat | SYS_lstat => {
            let path = tr_str(mem, args[0])?;
            let buf = tr_buf(mem, args[1], stat_len)?;
            let f = if nr == SYS_stat {
                handlers.stat
            } else {
                handlers.lstat
            };
            Ok(match f {
                Some(f) => f(path as *const c_char, buf as *mut libc::stat),
                None => host_call(nr, [path, buf, 0, 0, 0, 0]),
            })
        }
        SYS_fstat => {
            let buf = tr_buf(mem, args[1], stat_len)?;
            Ok(match handlers.fstat {
                Some(f) => f(args[0] as i32, buf as *mut libc::stat),
                None => host_call(nr, [args[0], buf, 0, 0, 0, 0]),
            })
        }
        SYS_poll => {
            let nfds = args[1];
            let len = nfds * std::mem::size_of::<pollfd>() as u64;
            let fds = tr_buf(mem, args[0], len)?;
            Ok(match handlers.poll {
                Some(f) => f(fds as *mut pollfd, nfds, args[2] as i32),
                None => host_call(nr, [fds, nfds, args[2], 0, 0, 0]),
            })
        }
        SYS_lseek => Ok(match handlers.lseek {
            Some(f) => f(args[0] as i32, args[1] as i64, args[2] as i32),
            None => host_call(nr, args),
        }),
        SYS_mmap => sys_mmap(mem, handlers, args),
        SYS_mprotect => {
            if let Some(f) = handlers.mprotect {
                return Ok(f(args[0], args[1] as usize, args[2] as i32));
            }
            let AddressSpace { rm, heap } = mem;
            heap.mprotect(rm, args[0], args[1], args[2] as i32)?;
            Ok(0)
        }
        SYS_munmap => {
            if let Some(f) = handlers.munmap {
                let desc = mem
                    .heap
                    .find_mapping(args[0])
                    .map(|m| m.to_descriptor())
                    .ok_or(-i64::from(EINVAL))?;
                return Ok(f(&desc));
            }
            let AddressSpace { rm, heap } = mem;
            heap.munmap(rm, args[0], args[1])?;
            Ok(0)
        }
        SYS_brk => Ok(mem.brk(args[0]) as i64),
        SYS_rt_sigaction => sys_rt_sigaction(mem, handlers, signals, args),
        SYS_rt_sigprocmask => {
            let set = tr_buf_opt(mem, args[1], args[3])?;
            let old = tr_buf_opt(mem, args[2], args[3])?;
            Ok(match handlers.sigprocmask {
                Some(f) => f(args[0] as i32, set as *const u64, old as *mut u64),
                None => host_call(nr, [args[0], set, old, args[3], 0, 0]),
            })
        }
        SYS_ioctl => {
            let argp = tr_maybe(mem, args[2]);
            Ok(match handlers.ioctl {
                Some(f) => f(args[0] as i32, args[1], argp),
                None => host_call(nr, [args[0], args[1], argp, 0, 0, 0]),
            })
        }
        SYS_readv | SYS_writev => sys_iovec(mem, handlers, nr, args),
        SYS_access => {
            let path = tr_str(mem, args[0])?;
            Ok(match handlers.access {
                Some(f) => f(path as *const c_char, args[1] as i32),
                None => host_call(nr, [path, args[1], 0, 0, 0, 0]),
            })
        }
        SYS_pipe => {
            let fds = tr_buf(mem, args[0], 8)?;
            Ok(match handlers.pipe {
                Some(f) => f(fds as *mut i32),
                None => host_call(nr, [fds, 0, 0, 0, 0, 0]),
            })
        }
        SYS_dup => Ok(match handlers.dup {
            Some(f) => f(args[0] as i32),
            None => host_call(nr, args),
        }),
        SYS_nanosleep => {
            let req = tr_buf(mem, args[0], 16)?;
            let rem = tr_buf_opt(mem, args[1], 16)?;
            Ok(match handlers.nanosleep {
                Some(f) => f(req as *const timespec, rem as *mut timespec),
                None => host_call(nr, [req, rem, 0, 0, 0, 0]),
            })
        }
        SYS_getpid => Ok(zero_arg(handlers.getpid, nr)),
        SYS_getuid => Ok(zero_arg(handlers.getuid, nr)),
        SYS_getgid => Ok(zero_arg(handlers.getgid, nr)),
        SYS_geteuid => Ok(zero_arg(handlers.geteuid, nr)),
        SYS_getegid => Ok(zero_arg(handlers.getegid, nr)),
        SYS_gettid => Ok(zero_arg(handlers.gettid, nr)),
        SYS_uname => {
            let buf = tr_buf(mem, args[0], std::mem::size_of::<utsname>() as u64)?;
            Ok(match handlers.uname {
                Some(f) => f(buf as *mut utsname),
                None => host_call(nr, [buf, 0, 0, 0, 0, 0]),
            })
        }
        SYS_fcntl => {
            let arg = tr_maybe(mem, args[2]);
            Ok(match handlers.fcntl {
                Some(f) => f(args[0] as i32, args[1] as i32, arg),
                None => host_call(nr, [args[0], args[1], arg, 0, 0, 0]),
            })
        }
        SYS_truncate => {
            let path = tr_str(mem, args[0])?;
            Ok(match handlers.truncate {
                Some(f) => f(path as *const c_char, args[1] as i64),
                None => host_call(nr, [path, args[1], 0, 0, 0, 0]),
            })
        }
        SYS_ftruncate => Ok(match handlers.ftruncate {
            Some(f) => f(args[0] as i32, args[1] as i64),
            None => host_call(nr, args),
        }),
        SYS_getdents | SYS_getdents64 => {
            let buf = tr_buf(mem, args[1], args[2])?;
            Ok(match handlers.getdents {
                Some(f) => f(args[0] as u32, buf as *mut c_void, args[2] as u32),
                None => host_call(nr, [args[0], buf, args[2], 0, 0, 0]),
            })
        }
        SYS_getcwd => {
            let buf = tr_buf(mem, args[0], args[1])?;
            Ok(match handlers.getcwd {
                Some(f) => f(buf as *mut c_char, args[1] as usize),
                None => host_call(nr, [buf, args[1], 0, 0, 0, 0]),
            })
        }
        SYS_mkdir => {
            let path = tr_str(mem, args[0])?;
            Ok(match handlers.mkdir {
                Some(f) => f(path as *const c_char, args[1] as u32),
                None => host_call(nr, [path, args[1], 0, 0, 0, 0]),
            })
        }
        SYS_unlink => {
            let path = tr_str(mem, args[0])?;
            Ok(match handlers.unlink {
                Some(f) => f(path as *const c_char),
                None => host_call(nr, [path, 0, 0, 0, 0, 0]),
            })
        }
        SYS_readlink => {
            let path = tr_str(mem, args[0])?;
            let buf = tr_buf(mem, args[1], args[2])?;
            Ok(match handlers.readlink {
                Some(f) => f(path as *const c_char, buf as *mut c_char, args[2] as usize),
                None => host_call(nr, [path, buf, args[2], 0, 0, 0]),
            })
        }
        SYS_gettimeofday => {
            let tv = tr_buf_opt(mem, args[0], std::mem::size_of::<timeval>() as u64)?;
            let tz = tr_buf_opt(mem, args[1], 8)?;
            Ok(match handlers.gettimeofday {
                Some(f) => f(tv as *mut timeval, tz as *mut c_void),
                None => host_call(nr, [tv, tz, 0, 0, 0, 0]),
            })
        }
        SYS_getrusage => {
            let usage = tr_buf(mem, args[1], std::mem::size_of::<rusage>() as u64)?;
            Ok(match handlers.getrusage {
                Some(f) => f(args[0] as i32, usage as *mut rusage),
                None => host_call(nr, [args[0], usage, 0, 0, 0, 0]),
            })
        }
        SYS_times => {
            let buf = tr_buf_opt(mem, args[0], std::mem::size_of::<tms>() as u64)?;
            Ok(match handlers.times {
                Some(f) => f(buf as *mut tms),
                None => host_call(nr, [buf, 0, 0, 0, 0, 0]),
            })
        }
        SYS_statfs => {
            let path = tr_str(mem, args[0])?;
            let buf = tr_buf(mem, args[1], std::mem::size_of::<libc::statfs>() as u64)?;
            Ok(match handlers.statfs {
                Some(f) => f(path as *const c_char, buf as *mut libc::statfs),
                None => host_call(nr, [path, buf, 0, 0, 0, 0]),
            })
        }
        SYS_time => {
            let tloc = tr_buf_opt(mem, args[0], 8)?;
            Ok(match handlers.time {
                Some(f) => f(tloc as *mut i64),
                None => host_call(nr, [tloc, 0, 0, 0, 0, 0]),
            })
        }
        SYS_futex => {
            let uaddr = tr_buf(mem, args[0], 4)?;
            let timeout = tr_maybe(mem, args[3]);
            let uaddr2 = tr_maybe(mem, args[4]);
            // may block; the VCPU thread parks in the host until it returns
            Ok(match handlers.futex {
                Some(f) => f(
                    uaddr as *mut i32,
                    args[1] as i32,
                    args[2] as i32,
                    timeout as *const timespec,
                    uaddr2 as *mut i32,
                    args[5] as i32,
                ),
                None => host_call(nr, [uaddr, args[1], args[2], timeout, uaddr2, args[5]]),
            })
        }
        SYS_clock_gettime => {
            let tp = tr_buf(mem, args[1], 16)?;
            Ok(match handlers.clock_gettime {
                Some(f) => f(args[0] as i32, tp as *mut timespec),
                None => host_call(nr, [args[0], tp, 0, 0, 0, 0]),
            })
        }
        SYS_tgkill => Ok(match handlers.tgkill {
            Some(f) => f(args[0] as i32, args[1] as i32, args[2] as i32),
            None => host_call(nr, args),
        }),
        SYS_set_tid_address => {
            let tidptr = tr_buf(mem, args[0], 4)?;
            Ok(host_call(nr, [tidptr, 0, 0, 0, 0, 0]))
        }
        SYS_arch_prctl => sys_arch_prctl(vcpu, mem, args),
        _ => {
            warn!("unknown syscall {}", nr);
            Err(-i64::from(ENOSYS))
        }
    }
}

fn zero_arg(handler: Option<fn() -> i64>, nr: i64) -> i64 {
    match handler {
        Some(f) => f(),
        None => host_call(nr, [0; 6]),
    }
}

fn sys_mmap(mem: &mut AddressSpace, handlers: &SyscallHandlers, args: [u64; 6]) -> SysResult {
    let mut desc = RegionMapping {
        host_p: 0,
        guest_p: args[0],
        length: args[1],
        prot: args[2] as i32,
        flags: args[3] as i32,
        fd: args[4] as i32,
        offset: args[5] as i64,
    };
    if let Some(pre) = handlers.mmap_before {
        let ret = pre(&mut desc);
        if ret < 0 {
            return Err(ret);
        }
    }
    let AddressSpace { rm, heap } = mem;
    let guest = heap.mmap(rm, &mut desc)?;
    if desc.flags & libc::MAP_ANONYMOUS == 0 && desc.fd >= 0 {
        let read = unsafe {
            libc::pread(
                desc.fd,
                desc.host_p as *mut c_void,
                desc.length as usize,
                desc.offset,
            )
        };
        if read < 0 {
            let errno = Errno::last();
            let _ = heap.munmap(rm, guest, desc.length);
            return Err(-i64::from(errno as i32));
        }
    }
    if let Some(post) = handlers.mmap_after {
        post(&mut desc);
    }
    Ok(guest as i64)
}

fn sys_rt_sigaction(
    mem: &mut AddressSpace,
    handlers: &SyscallHandlers,
    signals: &mut SignalTable,
    args: [u64; 6],
) -> SysResult {
    let signum = args[0] as i32;
    let size = std::mem::size_of::<GuestSigaction>() as u64;
    let act = tr_buf_opt(mem, args[1], size)?;
    let old = tr_buf_opt(mem, args[2], size)?;
    if let Some(f) = handlers.sigaction {
        return Ok(f(
            signum,
            act as *const GuestSigaction,
            old as *mut GuestSigaction,
        ));
    }
    let previous = if act != 0 {
        let action = unsafe { (act as *const GuestSigaction).read_unaligned() };
        signals.set(signum, action)?
    } else {
        if !(1..=crate::signal::NSIG as i32).contains(&signum) {
            return Err(-i64::from(libc::EINVAL));
        }
        signals.get(signum)
    };
    if old != 0 {
        unsafe { (old as *mut GuestSigaction).write_unaligned(previous.unwrap_or_default()) };
    }
    Ok(0)
}

#[repr(C)]
struct GuestIovec {
    base: u64,
    len: u64,
}

fn sys_iovec(
    mem: &mut AddressSpace,
    handlers: &SyscallHandlers,
    nr: i64,
    args: [u64; 6],
) -> SysResult {
    let count = args[2] as i64;
    if !(0..=libc::UIO_MAXIOV as i64).contains(&count) {
        return Err(-i64::from(libc::EINVAL));
    }
    let vec_host = tr_buf(
        mem,
        args[1],
        args[2] * std::mem::size_of::<GuestIovec>() as u64,
    )?;
    let guest_iovs =
        unsafe { std::slice::from_raw_parts(vec_host as *const GuestIovec, count as usize) };
    let mut host_iovs = Vec::with_capacity(count as usize);
    for iov in guest_iovs {
        let base = tr_buf(mem, iov.base, iov.len)?;
        host_iovs.push(libc::iovec {
            iov_base: base as *mut c_void,
            iov_len: iov.len as usize,
        });
    }
    let handler = if nr == libc::SYS_readv {
        handlers.readv
    } else {
        handlers.writev
    };
    Ok(match handler {
        Some(f) => f(args[0] as i32, host_iovs.as_ptr(), count as i32),
        None => host_call(nr, [args[0], host_iovs.as_ptr() as u64, args[2], 0, 0, 0]),
    })
}

// Not exposed by the `libc` crate; values per Linux arch/x86/include/uapi/asm/prctl.h.
const ARCH_SET_GS: i32 = 0x1001;
const ARCH_SET_FS: i32 = 0x1002;
const ARCH_GET_FS: i32 = 0x1003;
const ARCH_GET_GS: i32 = 0x1004;

fn sys_arch_prctl(vcpu: &mut Vcpu, mem: &mut AddressSpace, args: [u64; 6]) -> SysResult {
    match args[0] as i32 {
        ARCH_SET_FS => {
            vcpu.sregs_mut().fs.base = args[1];
            Ok(0)
        }
        ARCH_SET_GS => {
            vcpu.sregs_mut().gs.base = args[1];
            Ok(0)
        }
        ARCH_GET_FS => {
            let host = tr_buf(mem, args[1], 8)?;
            unsafe { (host as *mut u64).write_unaligned(vcpu.sregs().fs.base) };
            Ok(0)
        }
        ARCH_GET_GS => {
            let host = tr_buf(mem, args[1], 8)?;
            unsafe { (host as *mut u64).write_unaligned(vcpu.sregs().gs.base) };
            Ok(0)
        }
        _ => Err(-i64::from(libc::EINVAL)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::fake::FakeHypervisor;
    use crate::hv::Hypervisor;
    use crate::memory::stack::STACK_TOP;
    use crate::memory::{GuestStack, PageFlags, Pager, RegionManager, PAGE_SIZE};
    use vm_memory::GuestAddress;

    fn harness() -> (Vcpu, AddressSpace, SignalTable) {
        let hv = FakeHypervisor::new();
        let vm = hv.create_vm().unwrap();
        let mut rm = RegionManager::new(Pager::new(vm.clone(), 16 << 20).unwrap());
        let mut stack = GuestStack::new(&mut rm, 0, 0x1000).unwrap();

        let env = rm.allocate_region(PAGE_SIZE, "environ").unwrap();
        let base = STACK_TOP - PAGE_SIZE;
        let host = rm.region(env).host_base();
        rm.set_guest(env, GuestAddress(base));
        rm.pager_mut()
            .map_region(host, GuestAddress(base), 1, PageFlags::USER | PageFlags::WRITE)
            .unwrap();
        stack.adopt_initial(env, base);

        let vcpu = Vcpu::new(vm.create_vcpu(0).unwrap(), 0, stack).unwrap();
        let mem = AddressSpace::new(rm);
        (vcpu, mem, SignalTable::new(0))
    }

    /// Emulates the entry trampoline: the syscall number is pushed onto the
    /// kernel stack, the arguments go into the convention registers.
    fn stage_syscall(vcpu: &mut Vcpu, mem: &mut AddressSpace, nr: i64, args: [u64; 6]) {
        let ktop = vcpu.stack.kernel_top().0;
        vcpu.regs_mut().rsp = ktop;
        vcpu.regs_mut().rax = 1;
        mem.write_u64(ktop - 8, nr as u64).unwrap();
        vcpu.regs_mut().rsp = ktop - 8;
        let r = vcpu.regs_mut();
        r.rdi = args[0];
        r.rsi = args[1];
        r.rdx = args[2];
        r.r10 = args[3];
        r.r8 = args[4];
        r.r9 = args[5];
    }

    #[test]
    fn bad_pointer_returns_efault() {
        let (mut vcpu, mut mem, mut signals) = harness();
        stage_syscall(&mut vcpu, &mut mem, libc::SYS_write, [1, 0, 1, 0, 0, 0]);
        let outcome =
            handle(&mut vcpu, &mut mem, &SyscallHandlers::default(), &mut signals).unwrap();
        assert_eq!(Outcome::Continue, outcome);
        assert_eq!(-i64::from(libc::EFAULT) as u64, vcpu.regs().rax);
    }

    #[test]
    fn unknown_syscall_returns_enosys() {
        let (mut vcpu, mut mem, mut signals) = harness();
        stage_syscall(&mut vcpu, &mut mem, 100_000, [0; 6]);
        handle(&mut vcpu, &mut mem, &SyscallHandlers::default(), &mut signals).unwrap();
        assert_eq!(-i64::from(libc::ENOSYS) as u64, vcpu.regs().rax);
    }

    #[test]
    fn exit_group_stops_the_loop_with_the_status() {
        let (mut vcpu, mut mem, mut signals) = harness();
        stage_syscall(&mut vcpu, &mut mem, libc::SYS_exit_group, [42, 0, 0, 0, 0, 0]);
        let outcome =
            handle(&mut vcpu, &mut mem, &SyscallHandlers::default(), &mut signals).unwrap();
        assert_eq!(Outcome::Exit(42), outcome);
    }

    #[test]
    fn write_handler_intercepts_with_translated_pointer() {
        use std::sync::Mutex;
        static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());
        fn capture(_fd: i32, buf: *const c_void, count: usize) -> i64 {
            let bytes = unsafe { std::slice::from_raw_parts(buf as *const u8, count) };
            CAPTURED.lock().unwrap().extend_from_slice(bytes);
            count as i64
        }

        let (mut vcpu, mut mem, mut signals) = harness();
        // place the message in guest stack memory
        let msg_guest = STACK_TOP - 64;
        mem.write_bytes(msg_guest, b"hello").unwrap();

        let table = SyscallHandlers {
            write: Some(capture),
            ..Default::default()
        };
        stage_syscall(
            &mut vcpu,
            &mut mem,
            libc::SYS_write,
            [1, msg_guest, 5, 0, 0, 0],
        );
        handle(&mut vcpu, &mut mem, &table, &mut signals).unwrap();
        assert_eq!(5, vcpu.regs().rax);
        assert_eq!(b"hello".to_vec(), *CAPTURED.lock().unwrap());
    }

    #[test]
    fn brk_moves_the_break() {
        let (mut vcpu, mut mem, mut signals) = harness();
        mem.heap.init_brk(0x50_0000);
        stage_syscall(&mut vcpu, &mut mem, libc::SYS_brk, [0, 0, 0, 0, 0, 0]);
        handle(&mut vcpu, &mut mem, &SyscallHandlers::default(), &mut signals).unwrap();
        assert_eq!(0x50_0000, vcpu.regs().rax);

        stage_syscall(&mut vcpu, &mut mem, libc::SYS_brk, [0x50_3000, 0, 0, 0, 0, 0]);
        handle(&mut vcpu, &mut mem, &SyscallHandlers::default(), &mut signals).unwrap();
        assert_eq!(0x50_3000, vcpu.regs().rax);
        assert!(mem.translate(0x50_2000).is_some());
    }

    #[test]
    fn sigaction_records_and_reports_previous() {
        let (mut vcpu, mut mem, mut signals) = harness();
        let act_guest = STACK_TOP - 128;
        let old_guest = STACK_TOP - 256;
        let action = GuestSigaction {
            handler: 0x40_1000,
            ..Default::default()
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (&action as *const GuestSigaction) as *const u8,
                std::mem::size_of::<GuestSigaction>(),
            )
        };
        mem.write_bytes(act_guest, bytes).unwrap();

        stage_syscall(
            &mut vcpu,
            &mut mem,
            libc::SYS_rt_sigaction,
            [2, act_guest, 0, 8, 0, 0],
        );
        handle(&mut vcpu, &mut mem, &SyscallHandlers::default(), &mut signals).unwrap();
        assert_eq!(0, vcpu.regs().rax);
        assert_eq!(0x40_1000, signals.get(2).unwrap().handler);

        stage_syscall(
            &mut vcpu,
            &mut mem,
            libc::SYS_rt_sigaction,
            [2, 0, old_guest, 8, 0, 0],
        );
        handle(&mut vcpu, &mut mem, &SyscallHandlers::default(), &mut signals).unwrap();
        assert_eq!(0x40_1000, mem.read_u64(old_guest).unwrap());
    }

    #[test]
    fn mmap_honors_a_preselected_address() {
        fn force_addr(desc: &mut RegionMapping) -> i64 {
            desc.guest_p = 0x4000_0000;
            0
        }
        let (mut vcpu, mut mem, mut signals) = harness();
        let table = SyscallHandlers {
            mmap_before: Some(force_addr),
            ..Default::default()
        };
        stage_syscall(
            &mut vcpu,
            &mut mem,
            libc::SYS_mmap,
            [
                0,
                2 * PAGE_SIZE,
                (libc::PROT_READ | libc::PROT_WRITE) as u64,
                (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as u64,
                u64::MAX,
                0,
            ],
        );
        handle(&mut vcpu, &mut mem, &table, &mut signals).unwrap();
        assert_eq!(0x4000_0000, vcpu.regs().rax);
        assert!(mem.translate_buf(0x4000_0000, 2 * PAGE_SIZE).is_some());

        stage_syscall(
            &mut vcpu,
            &mut mem,
            libc::SYS_munmap,
            [0x4000_0000, 2 * PAGE_SIZE, 0, 0, 0, 0],
        );
        handle(&mut vcpu, &mut mem, &table, &mut signals).unwrap();
        assert_eq!(0, vcpu.regs().rax);
        assert!(mem.translate(0x4000_0000).is_none());
    }
}
