// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVmCore - VM execution core for ArceOS hypervisors.
//!
//! This crate is the control core of a trap-and-emulate virtualization layer
//! for 32-bit ARM guests. It drives virtual CPUs through repeated guest
//! entry/exit cycles, classifies each exit and dispatches it to the right
//! emulation handler, allocates generation-counted VMIDs so that many guest
//! machines can share the 8-bit hardware tag space, and injects virtual
//! IRQ/FIQ lines with idempotent wake-up.
//!
//! Everything architecture- or host-specific is kept behind two seams:
//!
//! - [`AxVmHal`]: host services (per-CPU identity, IPIs, TLB broadcast,
//!   signal/reschedule queries) and the opaque "enter the guest and return a
//!   raw exit code" primitive.
//! - [`AxVmOps`]: the collaborating subsystems - virtual interrupt controller
//!   and timer synchronization, plus the per-exception-class emulation
//!   handlers (coprocessor access, WFI, stage-2 aborts).
//!
//! The orchestration itself - the run loop, the exit dispatch, the VMID
//! generation scheme and the interrupt-line bookkeeping - lives here and is
//! fully portable.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

mod condition; // Architectural condition-code re-evaluation for trapped instructions
mod current; // Per-physical-CPU "currently running VCPU" table
mod exit; // Exit reasons surfaced to the external caller
mod hal; // Host/hardware abstraction layer trait
mod interrupt; // Virtual IRQ/FIQ line injection
mod ops; // Collaborator trait: vgic/timer sync and emulation handlers
mod run; // The top-level VCPU run loop and exit dispatch
mod trap; // HSR decoding, exception indices and classes
mod vcpu; // VCPU state and guest register context
mod vm; // Guest machine (one VM instance)
mod vmid; // Generation-counted VMID allocator

#[cfg(test)]
mod test;

pub use condition::{guest_condition_valid, skip_guest_instr};
pub use current::{CurrentVCpuTable, IrqDisabled};
pub use exit::{AccessWidth, AxVmExitReason, AxVmRunState, GuestPhysAddr};
pub use hal::AxVmHal;
pub use interrupt::{vm_set_irq_line, IrqLines, VirtIrqLine};
pub use ops::{AxVmOps, HandlerReturn};
pub use run::AxVmm;
pub use trap::{hsr_from_parts, psr, ExceptionClass, ExceptionIndex, Hsr};
pub use vcpu::{AxVCpu, GuestContext, VCpuId, VCpuMode, VCpuTarget};
pub use vm::{AxVM, HostPhysAddr};
pub use vmid::VmidAllocator;
