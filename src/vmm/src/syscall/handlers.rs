//! The pluggable system-call handler table. Every entry has the host-kernel
//! signature of the corresponding call, over pointers already translated to
//! host addresses; entries left at `None` fall back to host passthrough.

use libc::{
    c_char, c_void, iovec, pollfd, rusage, stat, statfs, timespec, timeval, tms, utsname,
};

use crate::signal::GuestSigaction;

/// Descriptor of an `mmap`-style allocation, shown to the `mmap_before` and
/// `mmap_after` handlers. `mmap_before` may preselect a guest address by
/// setting `guest_p`; after placement the descriptor carries the final
/// addresses.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegionMapping {
    pub host_p: u64,
    pub guest_p: u64,
    pub length: u64,
    pub prot: i32,
    pub flags: i32,
    pub fd: i32,
    pub offset: i64,
}

/// Which rendezvous the guest entered the monitor through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallKind {
    Syscall,
    Interrupt,
    Debug,
}

/// Pre/post interception around every hypercall. A negative return from
/// `pre` aborts the event and is reported to the guest as the result.
#[derive(Default, Clone, Copy)]
pub struct HypercallHandlers {
    pub pre: Option<fn(HypercallKind) -> i64>,
    pub post: Option<fn(HypercallKind) -> i64>,
}

#[derive(Default, Clone, Copy)]
pub struct SyscallHandlers {
    pub read: Option<fn(i32, *mut c_void, usize) -> i64>,
    pub write: Option<fn(i32, *const c_void, usize) -> i64>,
    pub open: Option<fn(*const c_char, i32, u32) -> i64>,
    pub close: Option<fn(i32) -> i64>,
    pub stat: Option<fn(*const c_char, *mut stat) -> i64>,
    pub fstat: Option<fn(i32, *mut stat) -> i64>,
    pub lstat: Option<fn(*const c_char, *mut stat) -> i64>,
    pub poll: Option<fn(*mut pollfd, u64, i32) -> i64>,
    pub lseek: Option<fn(i32, i64, i32) -> i64>,
    pub mmap_before: Option<fn(&mut RegionMapping) -> i64>,
    pub mmap_after: Option<fn(&mut RegionMapping) -> i64>,
    pub mprotect: Option<fn(u64, usize, i32) -> i64>,
    pub munmap: Option<fn(&RegionMapping) -> i64>,
    pub sigaction: Option<fn(i32, *const GuestSigaction, *mut GuestSigaction) -> i64>,
    pub sigprocmask: Option<fn(i32, *const u64, *mut u64) -> i64>,
    pub ioctl: Option<fn(i32, u64, u64) -> i64>,
    pub readv: Option<fn(i32, *const iovec, i32) -> i64>,
    pub writev: Option<fn(i32, *const iovec, i32) -> i64>,
    pub access: Option<fn(*const c_char, i32) -> i64>,
    pub pipe: Option<fn(*mut i32) -> i64>,
    pub dup: Option<fn(i32) -> i64>,
    pub nanosleep: Option<fn(*const timespec, *mut timespec) -> i64>,
    pub getpid: Option<fn() -> i64>,
    pub getuid: Option<fn() -> i64>,
    pub getgid: Option<fn() -> i64>,
    pub geteuid: Option<fn() -> i64>,
    pub getegid: Option<fn() -> i64>,
    pub uname: Option<fn(*mut utsname) -> i64>,
    pub fcntl: Option<fn(i32, i32, u64) -> i64>,
    pub truncate: Option<fn(*const c_char, i64) -> i64>,
    pub ftruncate: Option<fn(i32, i64) -> i64>,
    pub getdents: Option<fn(u32, *mut c_void, u32) -> i64>,
    pub getcwd: Option<fn(*mut c_char, usize) -> i64>,
    pub mkdir: Option<fn(*const c_char, u32) -> i64>,
    pub unlink: Option<fn(*const c_char) -> i64>,
    pub readlink: Option<fn(*const c_char, *mut c_char, usize) -> i64>,
    pub gettimeofday: Option<fn(*mut timeval, *mut c_void) -> i64>,
    pub getrusage: Option<fn(i32, *mut rusage) -> i64>,
    pub times: Option<fn(*mut tms) -> i64>,
    pub statfs: Option<fn(*const c_char, *mut statfs) -> i64>,
    pub gettid: Option<fn() -> i64>,
    pub time: Option<fn(*mut i64) -> i64>,
    pub futex: Option<fn(*mut i32, i32, i32, *const timespec, *mut i32, i32) -> i64>,
    pub clock_gettime: Option<fn(i32, *mut timespec) -> i64>,
    pub exit_group: Option<fn(i32)>,
    pub tgkill: Option<fn(i32, i32, i32) -> i64>,
    pub openat: Option<fn(i32, *const c_char, i32, u32) -> i64>,
    /// Called after a breakpoint has been hit with the reported RIP; a
    /// nonzero return aborts the run.
    pub bp_callback: Option<fn(u64) -> i32>,
}
