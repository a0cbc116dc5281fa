//! Guest signal bookkeeping. The monitor records the guest's `sigaction`
//! registrations and the address of the signal-return trampoline; the actual
//! delivery marshalling is a collaborator's concern.

pub const NSIG: usize = 64;

/// The x86-64 kernel `rt_sigaction` argument layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestSigaction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

pub struct SignalTable {
    actions: [Option<GuestSigaction>; NSIG + 1],
    cleanup_trampoline: u64,
}

impl SignalTable {
    /// `cleanup_trampoline` is the guest address of the signal-return flat.
    pub fn new(cleanup_trampoline: u64) -> Self {
        SignalTable {
            actions: [None; NSIG + 1],
            cleanup_trampoline,
        }
    }

    pub fn trampoline(&self) -> u64 {
        self.cleanup_trampoline
    }

    pub fn get(&self, signum: i32) -> Option<GuestSigaction> {
        self.actions.get(signum as usize).copied().flatten()
    }

    /// Records a registration; returns the previously recorded action.
    pub fn set(
        &mut self,
        signum: i32,
        action: GuestSigaction,
    ) -> Result<Option<GuestSigaction>, i64> {
        if !(1..=NSIG as i32).contains(&signum) {
            return Err(-i64::from(libc::EINVAL));
        }
        Ok(self.actions[signum as usize].replace(action))
    }
}
