//! The top-level VCPU run loop and exit dispatch.

use core::sync::atomic::{fence, Ordering};

use axerrno::{ax_err, AxResult};

use crate::condition::{guest_condition_valid, skip_guest_instr};
use crate::current::{CurrentVCpuTable, IrqDisabled};
use crate::exit::{AccessWidth, AxVmExitReason, AxVmRunState};
use crate::hal::AxVmHal;
use crate::ops::{AxVmOps, HandlerReturn};
use crate::trap::{ExceptionClass, ExceptionIndex};
use crate::vcpu::{AxVCpu, VCpuMode};
use crate::vmid::VmidAllocator;

/// The scheduler context: process-wide state shared by every VCPU the host
/// drives through this crate.
///
/// Owns the VMID allocator and the per-physical-CPU running-VCPU table, and
/// provides the run entry point itself.
pub struct AxVmm<H: AxVmHal> {
    vmid: VmidAllocator,
    running: CurrentVCpuTable<H>,
}

impl<H: AxVmHal> AxVmm<H> {
    /// A fresh context with no VCPU running anywhere and the whole VMID
    /// space free.
    pub fn new() -> Self {
        Self {
            vmid: VmidAllocator::new(),
            running: CurrentVCpuTable::new(),
        }
    }

    /// The VMID allocator.
    pub fn vmid_allocator(&self) -> &VmidAllocator {
        &self.vmid
    }

    /// The VCPU currently occupying this physical CPU, if any.
    pub fn current_vcpu<'a>(&'a self, irq: &'a IrqDisabled<H>) -> Option<&'a AxVCpu<H>> {
        self.running.current(irq)
    }

    /// Execute guest code on `vcpu` until something needs the external
    /// caller's attention.
    ///
    /// Loops through guest-entry/guest-exit cycles, servicing
    /// guest-recoverable traps internally, until a handler fills in the run
    /// state (`Ok` with `run.exit` set, e.g. an MMIO access to service) or a
    /// host signal arrives (`Ok` with `AxVmExitReason::Interrupted`; retry
    /// after servicing the signal). Errors are fatal to this run call.
    ///
    /// If the previous call stopped on an MMIO read, the caller must have
    /// stored the read data in the run state; it is written back to the
    /// guest register file before the guest resumes.
    pub fn run_vcpu(
        &self,
        vcpu: &AxVCpu<H>,
        ops: &mut impl AxVmOps<H>,
        run: &mut AxVmRunState,
    ) -> AxResult {
        // Make sure they initialized the vcpu with a target first.
        if !vcpu.is_configured() {
            return ax_err!(BadState, "vcpu has no target configured");
        }

        if let AxVmExitReason::MmioRead {
            reg, width, data, ..
        } = run.exit
        {
            complete_mmio_read(vcpu, reg, width, data)?;
        }

        run.exit = AxVmExitReason::Unknown;
        loop {
            // Check conditions before entering the guest.
            H::cond_yield();
            self.vmid.ensure_valid::<H>(vcpu.vm());
            ops.sync_to_hardware(vcpu);

            let irq = IrqDisabled::<H>::new();

            // Re-check atomic conditions: a signal may have arrived, or a
            // VMID rollover may have raced with the refresh above. Either
            // way this iteration must not enter the guest.
            if H::signal_pending() {
                drop(irq);
                ops.sync_from_hardware(vcpu);
                run.exit = AxVmExitReason::Interrupted;
                return Ok(());
            }
            if self.vmid.needs_new_generation(vcpu.vm()) {
                drop(irq);
                ops.sync_from_hardware(vcpu);
                continue;
            }

            // A set/way cache-maintenance op only cleaned the caches of the
            // CPU it ran on; catch this CPU up before the guest sees them.
            if vcpu.take_cache_flush_request(H::cpu_id()) {
                H::flush_local_cache();
            }

            self.running.set(&irq, vcpu);
            vcpu.set_mode(VCpuMode::InGuest);

            // The mode must be globally visible before the pause flag is
            // consulted, and before any kicker may trust it.
            fence(Ordering::SeqCst);

            let code = if vcpu.is_paused() {
                // Treat as a spurious exit: ignore, try again.
                ExceptionIndex::Irq as u32
            } else {
                trace!("vcpu {} entering guest at {:#010x}", vcpu.id(), vcpu.ctx().pc);
                H::enter_guest(
                    vcpu.ctx_mut(),
                    vcpu.vm().vttbr(),
                    vcpu.pending_lines().bits(),
                )
            };

            vcpu.set_mode(VCpuMode::OutsideGuest);
            vcpu.set_last_cpu(H::cpu_id());
            self.running.clear(&irq);
            drop(irq);

            trace!(
                "vcpu {} back from guest at {:#010x}, code {}",
                vcpu.id(),
                vcpu.ctx().pc,
                code
            );

            // Let the interrupt-controller and timer subsystems observe the
            // side effects of the slice before anything else runs.
            ops.sync_from_hardware(vcpu);

            match handle_exit(vcpu, ops, run, code)? {
                HandlerReturn::ResumeGuest => continue,
                HandlerReturn::ExitToCaller => return Ok(()),
            }
        }
    }
}

impl<H: AxVmHal> Default for AxVmm<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the data of a caller-serviced MMIO read back into the destination
/// register, so the guest observes it when it resumes after the load.
fn complete_mmio_read<H: AxVmHal>(
    vcpu: &AxVCpu<H>,
    reg: usize,
    width: AccessWidth,
    data: u64,
) -> AxResult {
    let ctx = vcpu.ctx_mut();
    let Some(gpr) = ctx.gprs.get_mut(reg) else {
        return ax_err!(InvalidInput, "mmio completion: bad register index");
    };
    *gpr = (data & width.mask()) as u32;
    Ok(())
}

/// Classify a raw exit code and service it.
fn handle_exit<H: AxVmHal>(
    vcpu: &AxVCpu<H>,
    ops: &mut impl AxVmOps<H>,
    run: &mut AxVmRunState,
    code: u32,
) -> AxResult<HandlerReturn> {
    let index = match ExceptionIndex::try_from(code) {
        Ok(index) => index,
        Err(code) => {
            warn!("unsupported exception type: {}", code);
            run.exit = AxVmExitReason::InternalError { code };
            return Ok(HandlerReturn::ExitToCaller);
        }
    };

    match index {
        // A host interrupt while the guest ran; nothing to service here.
        ExceptionIndex::Irq => Ok(HandlerReturn::ResumeGuest),
        ExceptionIndex::Undefined => {
            // The hypervisor's own privileged code faulted; no safe
            // recovery exists once control integrity is in doubt.
            error!(
                "undefined exception in hyp mode at {:#010x}",
                vcpu.ctx().hyp_pc
            );
            panic!("hypervisor undefined exception");
        }
        ExceptionIndex::PrefetchAbort | ExceptionIndex::DataAbort | ExceptionIndex::HvcTrap => {
            dispatch_trap(vcpu, ops, run)
        }
        other => {
            warn!("unsupported exception type: {:?}", other);
            run.exit = AxVmExitReason::InternalError { code };
            Ok(HandlerReturn::ExitToCaller)
        }
    }
}

/// Dispatch a guest-caused trap by exception class, filtering out traps from
/// instructions that architecturally would not have executed.
fn dispatch_trap<H: AxVmHal>(
    vcpu: &AxVCpu<H>,
    ops: &mut impl AxVmOps<H>,
    run: &mut AxVmRunState,
) -> AxResult<HandlerReturn> {
    let hsr = vcpu.ctx().hsr();
    let class = match ExceptionClass::from_hsr_ec(hsr.ec()) {
        Some(class) => class,
        None => {
            error!(
                "unknown exception class {:#04x}, hsr {:#010x}",
                hsr.ec(),
                hsr.0
            );
            panic!("incomplete architecture support for exception class");
        }
    };

    // The instruction may have trapped despite failing its condition code
    // check; in that case it is skipped, not emulated.
    if !guest_condition_valid(hsr, vcpu.ctx().cpsr) {
        skip_guest_instr(vcpu.ctx_mut(), hsr.is_wide());
        return Ok(HandlerReturn::ResumeGuest);
    }

    match class {
        ExceptionClass::Wfi => ops.handle_wfi(vcpu, run),
        ExceptionClass::Cp15_32 => ops.handle_cp15_32(vcpu, run),
        ExceptionClass::Cp15_64 => ops.handle_cp15_64(vcpu, run),
        ExceptionClass::Cp14Mr | ExceptionClass::Cp14_64 => ops.handle_cp14_access(vcpu, run),
        ExceptionClass::Cp14Ls => ops.handle_cp14_load_store(vcpu, run),
        ExceptionClass::Cp0_13 => ops.handle_cp_0_13_access(vcpu, run),
        ExceptionClass::Cp10Id => ops.handle_cp10_id(vcpu, run),
        ExceptionClass::Iabt | ExceptionClass::Dabt => ops.handle_guest_abort(vcpu, run),
        ExceptionClass::Hvc => {
            // The guest is not offered hypercalls; let it know with an
            // undefined exception.
            debug!(
                "guest hvc {:#06x} at {:#010x}",
                hsr.iss() & 0xffff,
                vcpu.ctx().pc
            );
            ops.inject_undefined(vcpu);
            Ok(HandlerReturn::ResumeGuest)
        }
        ExceptionClass::Smc => {
            debug!("guest smc at {:#010x}", vcpu.ctx().pc);
            ops.inject_undefined(vcpu);
            Ok(HandlerReturn::ResumeGuest)
        }
        ExceptionClass::SvcHyp => {
            // SVC from hyp mode should never get here.
            error!("svc taken from hyp mode at {:#010x}", vcpu.ctx().hyp_pc);
            panic!("svc taken from hyp mode");
        }
        ExceptionClass::IabtHyp => {
            error!(
                "prefetch abort in hyp mode at {:#010x} (hsr {:#010x})",
                vcpu.ctx().hifar,
                hsr.0
            );
            ax_err!(BadAddress, "prefetch abort in hyp mode")
        }
        ExceptionClass::DabtHyp => {
            error!(
                "data abort in hyp mode at {:#010x} (hsr {:#010x})",
                vcpu.ctx().hdfar,
                hsr.0
            );
            ax_err!(BadAddress, "data abort in hyp mode")
        }
    }
}
