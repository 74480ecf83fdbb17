//! Per-physical-CPU "currently running VCPU" table.
//!
//! Subsystems poked from interrupt context (the virtual interrupt
//! controller, notably) need to find the VCPU occupying the current physical
//! CPU. The table is owned by the scheduler context ([`crate::AxVmm`]) and
//! indexed by physical CPU id; every accessor demands an [`IrqDisabled`]
//! guard as proof that the caller cannot migrate off the CPU mid-lookup.

use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::hal::AxVmHal;
use crate::vcpu::AxVCpu;

/// Proof that interrupts (and with them, preemption) are off on the current
/// CPU. Restores the previous interrupt state when dropped.
pub struct IrqDisabled<H: AxVmHal> {
    state: usize,
    // !Send + !Sync: the guard is only meaningful on the CPU it was taken on.
    _not_send: PhantomData<*mut ()>,
    _hal: PhantomData<H>,
}

impl<H: AxVmHal> IrqDisabled<H> {
    /// Disable interrupts on the current CPU.
    pub fn new() -> Self {
        Self {
            state: H::irq_save(),
            _not_send: PhantomData,
            _hal: PhantomData,
        }
    }
}

impl<H: AxVmHal> Default for IrqDisabled<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: AxVmHal> Drop for IrqDisabled<H> {
    fn drop(&mut self) {
        H::irq_restore(self.state);
    }
}

/// The currently running VCPU of every physical CPU.
pub struct CurrentVCpuTable<H: AxVmHal> {
    slots: Vec<AtomicPtr<AxVCpu<H>>>,
}

impl<H: AxVmHal> CurrentVCpuTable<H> {
    /// An empty table with one slot per physical CPU.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(H::cpu_count());
        slots.resize_with(H::cpu_count(), || AtomicPtr::new(ptr::null_mut()));
        Self { slots }
    }

    /// Publish `vcpu` as running on the current CPU.
    ///
    /// The run loop clears the slot before it gives up the VCPU again, so a
    /// registered pointer is always backed by a live VCPU.
    pub(crate) fn set(&self, _irq: &IrqDisabled<H>, vcpu: &AxVCpu<H>) {
        self.slots[H::cpu_id()].store(vcpu as *const _ as *mut _, Ordering::Release);
    }

    /// Clear the current CPU's slot.
    pub(crate) fn clear(&self, _irq: &IrqDisabled<H>) {
        self.slots[H::cpu_id()].store(ptr::null_mut(), Ordering::Release);
    }

    /// The VCPU currently occupying this physical CPU, if any.
    ///
    /// The returned reference is valid for as long as the guard is held: the
    /// slot can only be cleared by the run loop on this same CPU, which
    /// cannot run until interrupts are re-enabled.
    pub fn current<'a>(&'a self, _irq: &'a IrqDisabled<H>) -> Option<&'a AxVCpu<H>> {
        unsafe { self.slots[H::cpu_id()].load(Ordering::Acquire).as_ref() }
    }
}

impl<H: AxVmHal> Default for CurrentVCpuTable<H> {
    fn default() -> Self {
        Self::new()
    }
}
