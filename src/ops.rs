//! The collaborator seam: interrupt-controller/timer synchronization and the
//! per-exception-class emulation handlers.
//!
//! The run loop owns orchestration; everything that interprets guest state
//! (coprocessor access emulation, stage-2 fault fixup, WFI blocking) is
//! supplied by the surrounding system through this trait. Dispatch is a
//! compile-time-complete mapping from exception class to method, so "handler
//! missing for a known class" cannot happen at runtime.

use axerrno::AxResult;

use crate::exit::AxVmRunState;
use crate::hal::AxVmHal;
use crate::vcpu::AxVCpu;

/// What a trap handler wants the run loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerReturn {
    /// The trap was fully handled; re-enter the guest.
    ResumeGuest,
    /// The run state has been filled in; return to the external caller so it
    /// can service the request.
    ExitToCaller,
}

/// Services the run loop consumes from the surrounding system, invoked at
/// well-defined points of each guest-entry cycle.
///
/// The `sync_*` pair is called exactly once per cycle, before entry and
/// after exit; handlers run only for traps that survive classification and
/// the condition filter. Handlers may mutate the VCPU register context and
/// the run state; an `Err` aborts the run call and surfaces to the external
/// caller.
pub trait AxVmOps<H: AxVmHal> {
    /// Flush pending virtual-interrupt-controller and timer state into its
    /// hardware-visible form before the guest runs.
    fn sync_to_hardware(&mut self, vcpu: &AxVCpu<H>);

    /// Read interrupt-controller and timer side effects of the last guest
    /// slice back out of the hardware.
    fn sync_from_hardware(&mut self, vcpu: &AxVCpu<H>);

    /// Whether the interrupt-controller subsystem has a virtual interrupt
    /// queued for this VCPU, independent of the explicit line bits.
    fn has_pending_virtual_interrupt(&self, vcpu: &AxVCpu<H>) -> bool;

    /// Inject an undefined-instruction exception into the guest.
    fn inject_undefined(&mut self, vcpu: &AxVCpu<H>);

    /// The guest executed WFI/WFE. Typically blocks until the VCPU is
    /// runnable again.
    fn handle_wfi(&mut self, vcpu: &AxVCpu<H>, run: &mut AxVmRunState) -> AxResult<HandlerReturn>;

    /// 32-bit CP15 register access.
    fn handle_cp15_32(
        &mut self,
        vcpu: &AxVCpu<H>,
        run: &mut AxVmRunState,
    ) -> AxResult<HandlerReturn>;

    /// 64-bit CP15 register access.
    fn handle_cp15_64(
        &mut self,
        vcpu: &AxVCpu<H>,
        run: &mut AxVmRunState,
    ) -> AxResult<HandlerReturn>;

    /// 32- or 64-bit CP14 register access.
    fn handle_cp14_access(
        &mut self,
        vcpu: &AxVCpu<H>,
        run: &mut AxVmRunState,
    ) -> AxResult<HandlerReturn>;

    /// CP14 load/store.
    fn handle_cp14_load_store(
        &mut self,
        vcpu: &AxVCpu<H>,
        run: &mut AxVmRunState,
    ) -> AxResult<HandlerReturn>;

    /// Access to CP0..CP13 trapped by the coprocessor trap mask.
    fn handle_cp_0_13_access(
        &mut self,
        vcpu: &AxVCpu<H>,
        run: &mut AxVmRunState,
    ) -> AxResult<HandlerReturn>;

    /// CP10 identification register access.
    fn handle_cp10_id(
        &mut self,
        vcpu: &AxVCpu<H>,
        run: &mut AxVmRunState,
    ) -> AxResult<HandlerReturn>;

    /// Instruction or data abort from the guest: stage-2 fault fixup or MMIO
    /// emulation. Fills the run state with an MMIO request when the access
    /// must be serviced by the external caller.
    fn handle_guest_abort(
        &mut self,
        vcpu: &AxVCpu<H>,
        run: &mut AxVmRunState,
    ) -> AxResult<HandlerReturn>;
}
