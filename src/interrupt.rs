//! Virtual IRQ/FIQ line injection.
//!
//! Two level-triggered lines are modeled at this layer, matching the virtual
//! IRQ and FIQ bits the world switch latches into the guest's interrupt
//! configuration. Anything finer grained (per-interrupt state, priorities)
//! belongs to the interrupt-controller subsystem behind [`crate::AxVmOps`].

use alloc::sync::Arc;
use axerrno::{ax_err, AxResult};
use bitflags::bitflags;
use core::sync::atomic::Ordering;

use crate::hal::AxVmHal;
use crate::vcpu::AxVCpu;

bitflags! {
    /// Pending virtual interrupt line bits, laid out as the world switch
    /// expects them (the virtual IRQ/FIQ bits of the hyp configuration
    /// register).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqLines: u32 {
        /// Virtual IRQ line asserted.
        const VI = 1 << 7;
        /// Virtual FIQ line asserted.
        const VF = 1 << 6;
    }
}

/// One of the two per-VCPU interrupt lines modeled at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtIrqLine {
    /// The level-triggered IRQ line.
    Irq,
    /// The level-triggered FIQ line.
    Fiq,
}

impl VirtIrqLine {
    fn bit(self) -> u32 {
        match self {
            Self::Irq => IrqLines::VI.bits(),
            Self::Fiq => IrqLines::VF.bits(),
        }
    }
}

impl<H: AxVmHal> AxVCpu<H> {
    /// Assert or clear one virtual interrupt line.
    ///
    /// The update is an atomic test-and-set/clear on the line bitmask.
    /// Returns whether the line state actually changed. Iff it changed, the
    /// VCPU is kicked so the new state reaches the hardware configuration
    /// before the guest continues; repeated assertions of the same level are
    /// a no-op and cause no cross-CPU signaling.
    pub fn set_irq_line(&self, line: VirtIrqLine, level: bool) -> bool {
        let bit = line.bit();
        let prev = if level {
            self.irq_lines_raw().fetch_or(bit, Ordering::SeqCst)
        } else {
            self.irq_lines_raw().fetch_and(!bit, Ordering::SeqCst)
        };

        if (prev & bit != 0) == level {
            return false;
        }

        self.kick();
        true
    }
}

/// Interrupt target type encoded in a VM-level irq word.
const IRQ_TYPE_SHIFT: u32 = 24;
const IRQ_TYPE_MASK: u32 = 0xff;
const IRQ_VCPU_SHIFT: u32 = 16;
const IRQ_VCPU_MASK: u32 = 0xff;
const IRQ_NUM_MASK: u32 = 0xffff;

const IRQ_TYPE_CPU: u32 = 0;
const IRQ_TYPE_SPI: u32 = 1;
const IRQ_TYPE_PPI: u32 = 2;

const IRQ_CPU_IRQ: u32 = 0;
const IRQ_CPU_FIQ: u32 = 1;

/// Route a VM-level interrupt request to the right VCPU line.
///
/// The irq word packs `{type[31:24], vcpu[23:16], number[15:0]}`. Only
/// CPU-level lines are serviced here; per-interrupt (PPI/SPI) injection is
/// the in-kernel interrupt controller's job and is rejected as unsupported
/// at this layer.
pub fn vm_set_irq_line<H: AxVmHal>(
    vcpus: &[Arc<AxVCpu<H>>],
    irq: u32,
    level: bool,
) -> AxResult {
    let irq_type = (irq >> IRQ_TYPE_SHIFT) & IRQ_TYPE_MASK;
    let vcpu_idx = ((irq >> IRQ_VCPU_SHIFT) & IRQ_VCPU_MASK) as usize;
    let irq_num = irq & IRQ_NUM_MASK;

    match irq_type {
        IRQ_TYPE_CPU => {
            let vcpu = match vcpus.get(vcpu_idx) {
                Some(vcpu) => vcpu,
                None => return ax_err!(InvalidInput, "irq line: no such vcpu"),
            };
            let line = match irq_num {
                IRQ_CPU_IRQ => VirtIrqLine::Irq,
                IRQ_CPU_FIQ => VirtIrqLine::Fiq,
                _ => return ax_err!(InvalidInput, "irq line: bad cpu line number"),
            };
            vcpu.set_irq_line(line, level);
            Ok(())
        }
        IRQ_TYPE_PPI | IRQ_TYPE_SPI => {
            ax_err!(Unsupported, "irq line: PPI/SPI are routed by the vgic")
        }
        _ => ax_err!(InvalidInput, "irq line: unknown interrupt type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::mock::MockHal;
    use crate::vm::{AxVM, HostPhysAddr};
    use axerrno::AxError;

    fn new_vcpu(id: usize) -> Arc<AxVCpu<MockHal>> {
        Arc::new(AxVCpu::new(id, AxVM::new(HostPhysAddr::from(0x4000_0000usize))))
    }

    #[test]
    fn repeated_assertion_kicks_once() {
        MockHal::reset();
        let vcpu = new_vcpu(0);

        assert!(vcpu.set_irq_line(VirtIrqLine::Irq, true));
        assert_eq!(MockHal::wakes(), 1);
        assert!(vcpu.pending_lines().contains(IrqLines::VI));

        // Level already asserted: no state change, no second wake.
        assert!(!vcpu.set_irq_line(VirtIrqLine::Irq, true));
        assert_eq!(MockHal::wakes(), 1);

        assert!(vcpu.set_irq_line(VirtIrqLine::Irq, false));
        assert_eq!(MockHal::wakes(), 2);
        assert!(vcpu.pending_lines().is_empty());

        // Clearing an already-clear line is also a no-op.
        assert!(!vcpu.set_irq_line(VirtIrqLine::Irq, false));
        assert_eq!(MockHal::wakes(), 2);
    }

    #[test]
    fn lines_are_independent() {
        MockHal::reset();
        let vcpu = new_vcpu(0);
        vcpu.set_irq_line(VirtIrqLine::Irq, true);
        vcpu.set_irq_line(VirtIrqLine::Fiq, true);
        assert_eq!(vcpu.pending_lines(), IrqLines::VI | IrqLines::VF);
        vcpu.set_irq_line(VirtIrqLine::Irq, false);
        assert_eq!(vcpu.pending_lines(), IrqLines::VF);
    }

    #[test]
    fn vm_level_routing() {
        MockHal::reset();
        let vcpus = [new_vcpu(0), new_vcpu(1)];

        // CPU IRQ line of vcpu 1.
        let word = (IRQ_TYPE_CPU << IRQ_TYPE_SHIFT) | (1 << IRQ_VCPU_SHIFT) | IRQ_CPU_IRQ;
        vm_set_irq_line(&vcpus, word, true).unwrap();
        assert!(vcpus[0].pending_lines().is_empty());
        assert!(vcpus[1].pending_lines().contains(IrqLines::VI));

        // FIQ line of vcpu 0.
        let word = (IRQ_TYPE_CPU << IRQ_TYPE_SHIFT) | IRQ_CPU_FIQ;
        vm_set_irq_line(&vcpus, word, true).unwrap();
        assert!(vcpus[0].pending_lines().contains(IrqLines::VF));
    }

    #[test]
    fn vm_level_routing_rejects_bad_words() {
        MockHal::reset();
        let vcpus = [new_vcpu(0)];

        // Out-of-range vcpu index.
        let word = (IRQ_TYPE_CPU << IRQ_TYPE_SHIFT) | (7 << IRQ_VCPU_SHIFT);
        assert_eq!(
            vm_set_irq_line(&vcpus, word, true).unwrap_err(),
            AxError::InvalidInput
        );

        // Line number outside IRQ/FIQ.
        let word = (IRQ_TYPE_CPU << IRQ_TYPE_SHIFT) | 2;
        assert_eq!(
            vm_set_irq_line(&vcpus, word, true).unwrap_err(),
            AxError::InvalidInput
        );

        // PPI injection belongs to the vgic.
        let word = IRQ_TYPE_PPI << IRQ_TYPE_SHIFT;
        assert_eq!(
            vm_set_irq_line(&vcpus, word, true).unwrap_err(),
            AxError::Unsupported
        );
    }
}
