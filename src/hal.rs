//! Host/hardware abstraction layer.

use crate::vcpu::{GuestContext, VCpuId};

/// The interfaces which the underlying software (kernel or hypervisor) must
/// implement for the run loop to drive guests on its physical CPUs.
///
/// Everything here is either a host-scheduler service or an irreducibly
/// architecture-specific primitive; the run loop only cares about the
/// contracts spelled out on each method.
pub trait AxVmHal: Sized {
    /// The id of the physical CPU this call executes on.
    ///
    /// Only meaningful while preemption is off; the run loop reads it inside
    /// its IRQ-disabled window.
    fn cpu_id() -> usize;

    /// The number of physical CPUs the host may schedule VCPUs on.
    fn cpu_count() -> usize;

    /// Invalidate cached guest translation/consistency state on every online
    /// CPU and return only once all of them have completed.
    ///
    /// This is the one mandatory cross-CPU barrier in the design: after a
    /// VMID generation rollover, no CPU may enter a guest with a tag from the
    /// new generation until every CPU has observed the flush.
    fn flush_vm_context_all();

    /// Flush the data cache of the current CPU.
    ///
    /// Called with interrupts disabled, when a VCPU that performed set/way
    /// cache maintenance is about to run here.
    fn flush_local_cache();

    /// Send a reschedule kick to `cpu`, forcing a VCPU running there back
    /// into the host so it re-reads its virtual interrupt line state.
    fn ipi_resched(cpu: usize);

    /// Mark a VCPU runnable, waking its host thread if it is blocked
    /// (e.g. inside WFI emulation).
    fn wake_vcpu(vcpu_id: VCpuId);

    /// Whether a host signal is pending for the current thread.
    ///
    /// Checked once per loop iteration and re-checked with IRQs off just
    /// before entry; a pending signal aborts the iteration and surfaces an
    /// `Interrupted` exit.
    fn signal_pending() -> bool;

    /// Give the host scheduler a chance to run something else. Called once
    /// per loop iteration so long-running guests do not starve the host.
    fn cond_yield();

    /// Disable interrupts on the current CPU, returning the previous state.
    fn irq_save() -> usize;

    /// Restore the interrupt state returned by [`AxVmHal::irq_save`].
    fn irq_restore(state: usize);

    /// Transfer control into the guest and return the raw exception code
    /// describing why it came back.
    ///
    /// The implementation performs the world switch: it loads `vttbr` into
    /// the stage-2 translation base, reflects `irq_lines` into the virtual
    /// IRQ/FIQ configuration, runs the guest from `ctx`, and on exit writes
    /// the trap record (`hsr` and the fault address registers) back into
    /// `ctx`. Called with interrupts disabled; treated as a non-preemptible
    /// critical section.
    fn enter_guest(ctx: &mut GuestContext, vttbr: u64, irq_lines: u32) -> u32;
}
