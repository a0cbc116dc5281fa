//! Architecture-level constants and encoders for the privileged structures
//! the monitor builds inside the guest: GDT entries, IDT gates, the 64-bit
//! TSS image, MSR indices and control-register bits.

pub mod x86_64;
