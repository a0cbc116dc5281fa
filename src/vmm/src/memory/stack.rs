use tracing::debug;
use vm_memory::GuestAddress;

use super::pager::PageFlags;
use super::region::{RegionId, RegionManager};
use super::PAGE_SIZE;
use crate::error::Result;

/// 64-bit Linux puts the stack top at 47 bits.
pub const STACK_TOP: u64 = 0x8000_0000_0000;
/// One stack-expansion step.
pub const STACK_GROW: u64 = 0x20_0000;
/// Additional VCPUs get their stack top this far below the previous one.
pub const STACK_SPACING: u64 = 0x10_0000_0000;

const KERNEL_STACK_PAGES: u64 = 4;

/// Per-VCPU stack bookkeeping: the downward-growing user stack composed of
/// one or more regions, and the fixed kernel stack used for ring-0 entries.
pub struct GuestStack {
    top: u64,
    bottom: u64,
    floor: u64,
    regions: Vec<RegionId>,
    kernel_top: GuestAddress,
}

impl GuestStack {
    pub fn new(rm: &mut RegionManager, cpu_index: u8, floor: u64) -> Result<Self> {
        let top = STACK_TOP - u64::from(cpu_index) * STACK_SPACING;
        let kernel_stack =
            rm.allocate_system_region(KERNEL_STACK_PAGES * PAGE_SIZE, "kernel stack")?;
        let host = rm.region(kernel_stack).host_base();
        let kernel_base = rm
            .pager_mut()
            .map_kernel_region(host, KERNEL_STACK_PAGES, PageFlags::WRITE)?;
        rm.set_guest(kernel_stack, kernel_base);
        Ok(GuestStack {
            top,
            bottom: top,
            floor,
            regions: Vec::new(),
            kernel_top: GuestAddress(kernel_base.0 + KERNEL_STACK_PAGES * PAGE_SIZE),
        })
    }

    pub fn top(&self) -> u64 {
        self.top
    }

    pub fn bottom(&self) -> u64 {
        self.bottom
    }

    /// Top of the ring-0 stack, published through TSS.IST1.
    pub fn kernel_top(&self) -> GuestAddress {
        self.kernel_top
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Adopts the environment region as the initial user stack region; the
    /// first push below it will fault and trigger expansion.
    pub fn adopt_initial(&mut self, id: RegionId, guest_base: u64) {
        self.regions.push(id);
        self.bottom = guest_base;
    }

    /// True when a fault at `pfla` is a stack access just below the current
    /// bottom: within one growth step, and above the configured floor.
    pub fn is_expansion(&self, pfla: u64) -> bool {
        pfla < self.bottom && pfla > self.floor && self.bottom - pfla <= STACK_GROW
    }

    /// Extends the stack by exactly one region mapped immediately below the
    /// current bottom.
    pub fn grow(&mut self, rm: &mut RegionManager) -> Result<()> {
        let guest_base = self.bottom - STACK_GROW;
        let id = rm.allocate_region(STACK_GROW, "stack")?;
        let host = rm.region(id).host_base();
        rm.set_guest(id, GuestAddress(guest_base));
        rm.pager_mut().map_region(
            host,
            GuestAddress(guest_base),
            STACK_GROW / PAGE_SIZE,
            PageFlags::USER | PageFlags::WRITE,
        )?;
        self.regions.push(id);
        self.bottom = guest_base;
        debug!("stack grown to {:#x}", self.bottom);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::fake::FakeHypervisor;
    use crate::hv::Hypervisor;
    use crate::memory::pager::Pager;

    fn test_rm() -> RegionManager {
        let hv = FakeHypervisor::new();
        let vm = hv.create_vm().unwrap();
        RegionManager::new(Pager::new(vm, 16 << 20).unwrap())
    }

    fn stack_with_env(rm: &mut RegionManager) -> GuestStack {
        let mut stack = GuestStack::new(rm, 0, 0x1000).unwrap();
        let env = rm.allocate_region(4 * PAGE_SIZE, "environ").unwrap();
        let base = STACK_TOP - 4 * PAGE_SIZE;
        let host = rm.region(env).host_base();
        rm.set_guest(env, GuestAddress(base));
        rm.pager_mut()
            .map_region(host, GuestAddress(base), 4, PageFlags::USER | PageFlags::WRITE)
            .unwrap();
        stack.adopt_initial(env, base);
        stack
    }

    #[test]
    fn expansion_window_is_one_growth_step() {
        let mut rm = test_rm();
        let stack = stack_with_env(&mut rm);
        let bottom = stack.bottom();
        assert!(stack.is_expansion(bottom - 1));
        assert!(stack.is_expansion(bottom - 0x10000));
        assert!(stack.is_expansion(bottom - STACK_GROW));
        assert!(!stack.is_expansion(bottom));
        assert!(!stack.is_expansion(bottom - STACK_GROW - 1));
        assert!(!stack.is_expansion(0x800));
    }

    #[test]
    fn grow_maps_one_region_below_bottom() {
        let mut rm = test_rm();
        let mut stack = stack_with_env(&mut rm);
        let bottom = stack.bottom();
        let pfla = bottom - 0x10000;
        assert_eq!(1, stack.region_count());
        stack.grow(&mut rm).unwrap();
        assert_eq!(2, stack.region_count());
        assert_eq!(bottom - STACK_GROW, stack.bottom());
        assert!(rm.pager().host_address(GuestAddress(pfla)).is_some());
        // the faulting address is now mapped, a re-fault cannot grow again
        assert!(!stack.is_expansion(pfla));
    }

    #[test]
    fn kernel_stack_is_mapped_high() {
        let mut rm = test_rm();
        let stack = GuestStack::new(&mut rm, 0, 0x1000).unwrap();
        let top = stack.kernel_top();
        assert!(top.0 >= crate::memory::pager::KERNEL_SPACE_BASE);
        assert!(rm
            .pager()
            .host_address(GuestAddress(top.0 - 8))
            .is_some());
    }
}
