//! VCPU state and guest register context.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;
use axerrno::{ax_err, AxResult};

use crate::hal::AxVmHal;
use crate::interrupt::IrqLines;
use crate::ops::AxVmOps;
use crate::trap::{psr, Hsr};
use crate::vm::AxVM;

/// Identifier of a VCPU, unique within the host.
pub type VCpuId = usize;

/// The execution mode of a VCPU, as seen by other CPUs.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VCpuMode {
    /// Executing host code (or not scheduled at all).
    OutsideGuest = 0,
    /// Executing guest code on some physical CPU.
    InGuest = 1,
    /// Still in guest context but already kicked; will exit shortly.
    ExitingGuest = 2,
}

impl VCpuMode {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::OutsideGuest,
            1 => Self::InGuest,
            2 => Self::ExitingGuest,
            _ => unreachable!("invalid vcpu mode"),
        }
    }
}

/// The CPU type a VCPU must be configured with before it may run.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VCpuTarget {
    /// Cortex-A15 guest CPU.
    CortexA15 = 1,
}

/// Guest register file plus the trap record the world switch fills in on
/// every exit.
#[derive(Debug, Clone, Default)]
pub struct GuestContext {
    /// General-purpose registers r0-r14 of the current mode.
    pub gprs: [u32; 15],
    /// Guest program counter.
    pub pc: u32,
    /// Guest program status register (condition flags, IT state, mode).
    pub cpsr: u32,
    /// Hyp syndrome register recorded on the last trap.
    pub hsr: u32,
    /// Faulting virtual address for instruction aborts.
    pub hifar: u32,
    /// Faulting virtual address for data aborts.
    pub hdfar: u32,
    /// Faulting intermediate physical address (stage-2 faults).
    pub hpfar: u32,
    /// PC of the hypervisor itself when a hyp-mode exception was taken.
    pub hyp_pc: u32,
}

impl GuestContext {
    /// The trap syndrome recorded by the last world switch.
    pub fn hsr(&self) -> Hsr {
        Hsr(self.hsr)
    }
}

/// One schedulable guest execution context.
///
/// Cross-thread state (mode, pending interrupt lines, pause flag) is atomic
/// and may be poked from any CPU; the register context is only ever touched
/// by the thread running the VCPU and lives in an `UnsafeCell` so the run
/// path can reach it through a shared reference.
pub struct AxVCpu<H: AxVmHal> {
    /// Unique id of this VCPU.
    id: VCpuId,
    /// The machine this VCPU belongs to.
    vm: Arc<AxVM>,
    /// Configured target CPU type; 0 until `set_target` is called.
    target: AtomicU32,
    /// Execution mode, published with full ordering around guest entry.
    mode: AtomicU32,
    /// When set, entry attempts turn into spurious (ignored) exits.
    pause: AtomicBool,
    /// Pending virtual interrupt line bits (HCR.VI/VF), atomically owned.
    irq_lines: AtomicU32,
    /// The physical CPU this VCPU last ran on, for targeted kicks.
    last_cpu: AtomicUsize,
    /// One bit per physical CPU that must flush its data cache before this
    /// VCPU runs there again. Set by set/way cache-maintenance emulation.
    /// Sized from `cpu_count()` so hosts wider than one word work.
    dcache_flush_mask: Vec<AtomicUsize>,
    /// Register file and trap record. Run-path access only.
    ctx: UnsafeCell<GuestContext>,
    _hal: PhantomData<H>,
}

// The register context is confined to the thread currently running the VCPU
// (the run loop holds it exclusively between entry and exit); everything
// shared across threads is atomic.
unsafe impl<H: AxVmHal> Send for AxVCpu<H> {}
unsafe impl<H: AxVmHal> Sync for AxVCpu<H> {}

impl<H: AxVmHal> AxVCpu<H> {
    /// Create a VCPU belonging to `vm`. It cannot run until a target type is
    /// configured with [`AxVCpu::set_target`].
    pub fn new(id: VCpuId, vm: Arc<AxVM>) -> Self {
        Self {
            id,
            vm,
            target: AtomicU32::new(0),
            mode: AtomicU32::new(VCpuMode::OutsideGuest as u32),
            pause: AtomicBool::new(false),
            irq_lines: AtomicU32::new(0),
            last_cpu: AtomicUsize::new(0),
            dcache_flush_mask: (0..H::cpu_count().div_ceil(usize::BITS as usize))
                .map(|_| AtomicUsize::new(0))
                .collect(),
            ctx: UnsafeCell::new(GuestContext::default()),
            _hal: PhantomData,
        }
    }

    /// The id of this VCPU.
    pub const fn id(&self) -> VCpuId {
        self.id
    }

    /// The machine this VCPU belongs to.
    pub fn vm(&self) -> &Arc<AxVM> {
        &self.vm
    }

    /// Configure the target CPU type and reset the guest context.
    ///
    /// Required before the first run call; running an unconfigured VCPU is a
    /// caller-contract violation, not a guest fault.
    pub fn set_target(&self, target: VCpuTarget) -> AxResult {
        if self.mode() != VCpuMode::OutsideGuest {
            return ax_err!(BadState, "cannot reconfigure a vcpu in guest mode");
        }
        let ctx = self.ctx_mut();
        *ctx = GuestContext::default();
        // Reset state: supervisor mode with asynchronous aborts and
        // interrupts masked, as the target comes out of reset.
        ctx.cpsr = psr::SVC_MODE | psr::A | psr::I | psr::F;
        self.target.store(target as u32, Ordering::SeqCst);
        Ok(())
    }

    /// Whether a target type has been configured.
    pub fn is_configured(&self) -> bool {
        self.target.load(Ordering::SeqCst) != 0
    }

    /// The current execution mode.
    pub fn mode(&self) -> VCpuMode {
        VCpuMode::from_raw(self.mode.load(Ordering::SeqCst))
    }

    pub(crate) fn set_mode(&self, mode: VCpuMode) {
        self.mode.store(mode as u32, Ordering::SeqCst);
    }

    /// Whether entry attempts are currently suppressed.
    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Suppress or re-allow guest entry for this VCPU.
    ///
    /// Pausing kicks the VCPU out of the guest if it is running; unpausing
    /// wakes it in case its host thread blocked on the pause.
    pub fn set_pause(&self, paused: bool) {
        let was = self.pause.swap(paused, Ordering::SeqCst);
        if was == paused {
            return;
        }
        if paused {
            self.kick();
        } else {
            H::wake_vcpu(self.id);
        }
    }

    /// The raw pending interrupt line bits, as handed to the world switch.
    pub(crate) fn irq_lines_raw(&self) -> &AtomicU32 {
        &self.irq_lines
    }

    /// The pending virtual interrupt lines.
    pub fn pending_lines(&self) -> IrqLines {
        IrqLines::from_bits_truncate(self.irq_lines.load(Ordering::SeqCst))
    }

    /// The physical CPU this VCPU last ran on.
    pub fn last_cpu(&self) -> usize {
        self.last_cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_cpu(&self, cpu: usize) {
        self.last_cpu.store(cpu, Ordering::Release);
    }

    /// Request a data-cache flush on every physical CPU before this VCPU
    /// next runs there.
    ///
    /// Set/way cache-maintenance emulation calls this: such an operation
    /// only affects the caches of the CPU it ran on, so the others must
    /// catch up lazily.
    pub fn request_cache_flush(&self) {
        let mut remaining = H::cpu_count();
        for word in &self.dcache_flush_mask {
            let bits = remaining.min(usize::BITS as usize);
            let mask = usize::MAX >> (usize::BITS as usize - bits);
            word.fetch_or(mask, Ordering::SeqCst);
            remaining -= bits;
        }
    }

    /// Consume the pending cache-flush request for `cpu`, if any.
    pub(crate) fn take_cache_flush_request(&self, cpu: usize) -> bool {
        let width = usize::BITS as usize;
        let Some(word) = self.dcache_flush_mask.get(cpu / width) else {
            return false;
        };
        let bit = 1usize << (cpu % width);
        word.fetch_and(!bit, Ordering::SeqCst) & bit != 0
    }

    /// Make this VCPU's execution environment re-evaluate its condition for
    /// staying in guest mode: wake it if blocked, and if it is executing the
    /// guest right now, IPI its physical CPU so the world switch re-latches
    /// the virtual interrupt line state.
    pub fn kick(&self) {
        H::wake_vcpu(self.id);
        if self
            .mode
            .compare_exchange(
                VCpuMode::InGuest as u32,
                VCpuMode::ExitingGuest as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            H::ipi_resched(self.last_cpu());
        }
    }

    /// Whether this VCPU can make progress if scheduled: an interrupt line
    /// is asserted, or the interrupt-controller subsystem reports a pending
    /// virtual interrupt.
    pub fn runnable(&self, ops: &impl AxVmOps<H>) -> bool {
        !self.pending_lines().is_empty() || ops.has_pending_virtual_interrupt(self)
    }

    /// Shared view of the register context.
    ///
    /// Callers must not hold this across a guest entry on another thread;
    /// see [`AxVCpu::ctx_mut`].
    pub fn ctx(&self) -> &GuestContext {
        unsafe { &*self.ctx.get() }
    }

    /// Mutable access to the register context through a shared reference.
    ///
    /// Only the thread driving this VCPU's run loop (or holding it exclusive
    /// before the first run) may call this; the type is `Sync` on that
    /// contract.
    #[allow(clippy::mut_from_ref)]
    pub fn ctx_mut(&self) -> &mut GuestContext {
        unsafe { &mut *self.ctx.get() }
    }
}

impl<H: AxVmHal> core::fmt::Debug for AxVCpu<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AxVCpu")
            .field("id", &self.id)
            .field("mode", &self.mode())
            .field("pc", &format_args!("{:#010x}", self.ctx().pc))
            .field("irq_lines", &self.pending_lines())
            .finish()
    }
}
