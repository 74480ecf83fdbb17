//! Shared test doubles and run-loop integration tests.
//!
//! The module-level unit tests only need a host they can observe; [`mock`]
//! provides a scriptable [`crate::AxVmHal`] whose state lives in a
//! thread-local (each test runs on its own thread) and a recording
//! [`crate::AxVmOps`].

pub(crate) mod mock {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use axerrno::AxResult;

    use crate::exit::{AxVmExitReason, AxVmRunState};
    use crate::hal::AxVmHal;
    use crate::ops::{AxVmOps, HandlerReturn};
    use crate::trap::Hsr;
    use crate::vcpu::{AxVCpu, GuestContext, VCpuId};

    struct ScriptedExit {
        code: u32,
        hsr: Option<Hsr>,
    }

    #[derive(Default)]
    struct HalState {
        irq_depth: usize,
        flushes: usize,
        cache_flushes: usize,
        ipis: Vec<usize>,
        wakes: Vec<VCpuId>,
        signals: VecDeque<bool>,
        entries: usize,
        exits: VecDeque<ScriptedExit>,
        entry_hook: Option<Box<dyn Fn()>>,
    }

    thread_local! {
        static STATE: RefCell<HalState> = RefCell::new(HalState::default());
    }

    /// A host whose every observable action is recorded, and whose guest
    /// entries replay a per-test script of exits.
    pub(crate) struct MockHal;

    impl MockHal {
        pub fn reset() {
            STATE.with(|s| *s.borrow_mut() = HalState::default());
        }

        pub fn irq_depth() -> usize {
            STATE.with(|s| s.borrow().irq_depth)
        }

        pub fn flushes() -> usize {
            STATE.with(|s| s.borrow().flushes)
        }

        pub fn cache_flushes() -> usize {
            STATE.with(|s| s.borrow().cache_flushes)
        }

        pub fn ipis() -> usize {
            STATE.with(|s| s.borrow().ipis.len())
        }

        pub fn wakes() -> usize {
            STATE.with(|s| s.borrow().wakes.len())
        }

        /// How many times the guest was actually entered.
        pub fn entries() -> usize {
            STATE.with(|s| s.borrow().entries)
        }

        /// Queue the results of the next `signal_pending` checks. Once the
        /// queue runs dry, no signal is pending.
        pub fn script_signals(pending: &[bool]) {
            STATE.with(|s| s.borrow_mut().signals.extend(pending.iter().copied()));
        }

        /// Queue one guest entry: it returns `code`, after recording `hsr`
        /// (if given) into the trap record.
        pub fn script_exit(code: u32, hsr: Option<Hsr>) {
            STATE.with(|s| s.borrow_mut().exits.push_back(ScriptedExit { code, hsr }));
        }

        /// Run `hook` on every guest entry, from inside the slice.
        pub fn set_entry_hook(hook: impl Fn() + 'static) {
            STATE.with(|s| s.borrow_mut().entry_hook = Some(Box::new(hook)));
        }
    }

    impl AxVmHal for MockHal {
        fn cpu_id() -> usize {
            0
        }

        fn cpu_count() -> usize {
            4
        }

        fn flush_vm_context_all() {
            STATE.with(|s| s.borrow_mut().flushes += 1);
        }

        fn flush_local_cache() {
            STATE.with(|s| s.borrow_mut().cache_flushes += 1);
        }

        fn ipi_resched(cpu: usize) {
            STATE.with(|s| s.borrow_mut().ipis.push(cpu));
        }

        fn wake_vcpu(vcpu_id: VCpuId) {
            STATE.with(|s| s.borrow_mut().wakes.push(vcpu_id));
        }

        fn signal_pending() -> bool {
            STATE.with(|s| s.borrow_mut().signals.pop_front().unwrap_or(false))
        }

        fn cond_yield() {}

        fn irq_save() -> usize {
            STATE.with(|s| {
                let mut s = s.borrow_mut();
                let old = s.irq_depth;
                s.irq_depth = old + 1;
                old
            })
        }

        fn irq_restore(state: usize) {
            STATE.with(|s| s.borrow_mut().irq_depth = state);
        }

        fn enter_guest(ctx: &mut GuestContext, _vttbr: u64, _irq_lines: u32) -> u32 {
            let code = STATE.with(|s| {
                let mut s = s.borrow_mut();
                s.entries += 1;
                let exit = s
                    .exits
                    .pop_front()
                    .expect("guest entry without a scripted exit");
                if let Some(hsr) = exit.hsr {
                    ctx.hsr = hsr.0;
                }
                exit.code
            });
            // The hook may inspect mock-backed state, so call it with the
            // thread-local borrow released.
            if let Some(hook) = STATE.with(|s| s.borrow_mut().entry_hook.take()) {
                hook();
                STATE.with(|s| s.borrow_mut().entry_hook = Some(hook));
            }
            code
        }
    }

    /// Records every call; handlers reply with a per-test script.
    pub(crate) struct MockOps<'a> {
        /// What [`AxVmOps::has_pending_virtual_interrupt`] reports.
        pub pending_virtual_interrupt: bool,
        /// Names of the trait methods invoked, in order.
        pub calls: Vec<&'static str>,
        /// What every class handler returns.
        pub reply: AxResult<HandlerReturn>,
        /// If set, `handle_guest_abort` stores this into the run state.
        pub exit_on_abort: Option<AxVmExitReason>,
        /// Invoked on every `sync_to_hardware`, to interleave host activity
        /// with the run loop.
        pub on_sync_to: Option<Box<dyn FnMut() + 'a>>,
    }

    impl Default for MockOps<'_> {
        fn default() -> Self {
            Self {
                pending_virtual_interrupt: false,
                calls: Vec::new(),
                reply: Ok(HandlerReturn::ExitToCaller),
                exit_on_abort: None,
                on_sync_to: None,
            }
        }
    }

    impl MockOps<'_> {
        fn handler(&mut self, name: &'static str) -> AxResult<HandlerReturn> {
            self.calls.push(name);
            self.reply
        }
    }

    impl<'a> AxVmOps<MockHal> for MockOps<'a> {
        fn sync_to_hardware(&mut self, _vcpu: &AxVCpu<MockHal>) {
            self.calls.push("sync_to");
            if let Some(hook) = self.on_sync_to.as_mut() {
                hook();
            }
        }

        fn sync_from_hardware(&mut self, _vcpu: &AxVCpu<MockHal>) {
            self.calls.push("sync_from");
        }

        fn has_pending_virtual_interrupt(&self, _vcpu: &AxVCpu<MockHal>) -> bool {
            self.pending_virtual_interrupt
        }

        fn inject_undefined(&mut self, _vcpu: &AxVCpu<MockHal>) {
            self.calls.push("inject_undefined");
        }

        fn handle_wfi(
            &mut self,
            _vcpu: &AxVCpu<MockHal>,
            _run: &mut AxVmRunState,
        ) -> AxResult<HandlerReturn> {
            self.handler("wfi")
        }

        fn handle_cp15_32(
            &mut self,
            _vcpu: &AxVCpu<MockHal>,
            _run: &mut AxVmRunState,
        ) -> AxResult<HandlerReturn> {
            self.handler("cp15_32")
        }

        fn handle_cp15_64(
            &mut self,
            _vcpu: &AxVCpu<MockHal>,
            _run: &mut AxVmRunState,
        ) -> AxResult<HandlerReturn> {
            self.handler("cp15_64")
        }

        fn handle_cp14_access(
            &mut self,
            _vcpu: &AxVCpu<MockHal>,
            _run: &mut AxVmRunState,
        ) -> AxResult<HandlerReturn> {
            self.handler("cp14_access")
        }

        fn handle_cp14_load_store(
            &mut self,
            _vcpu: &AxVCpu<MockHal>,
            _run: &mut AxVmRunState,
        ) -> AxResult<HandlerReturn> {
            self.handler("cp14_load_store")
        }

        fn handle_cp_0_13_access(
            &mut self,
            _vcpu: &AxVCpu<MockHal>,
            _run: &mut AxVmRunState,
        ) -> AxResult<HandlerReturn> {
            self.handler("cp_0_13_access")
        }

        fn handle_cp10_id(
            &mut self,
            _vcpu: &AxVCpu<MockHal>,
            _run: &mut AxVmRunState,
        ) -> AxResult<HandlerReturn> {
            self.handler("cp10_id")
        }

        fn handle_guest_abort(
            &mut self,
            _vcpu: &AxVCpu<MockHal>,
            run: &mut AxVmRunState,
        ) -> AxResult<HandlerReturn> {
            if let Some(exit) = self.exit_on_abort {
                run.exit = exit;
            }
            self.handler("guest_abort")
        }
    }
}

mod run_loop {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    use axerrno::AxError;

    use super::mock::{MockHal, MockOps};
    use crate::exit::{AccessWidth, AxVmExitReason, AxVmRunState, GuestPhysAddr};
    use crate::run::AxVmm;
    use crate::trap::{hsr_from_parts, ExceptionIndex};
    use crate::vcpu::{AxVCpu, VCpuTarget};
    use crate::vm::{AxVM, HostPhysAddr};
    use crate::{IrqDisabled, VCpuMode};

    fn setup() -> (AxVmm<MockHal>, AxVCpu<MockHal>, AxVmRunState) {
        MockHal::reset();
        let vmm = AxVmm::new();
        let vcpu = AxVCpu::new(0, AxVM::new(HostPhysAddr::from(0x4000_0000usize)));
        vcpu.set_target(VCpuTarget::CortexA15).unwrap();
        (vmm, vcpu, AxVmRunState::new())
    }

    #[test]
    fn rejects_unconfigured_vcpu() {
        MockHal::reset();
        let vmm = AxVmm::<MockHal>::new();
        let vcpu = AxVCpu::new(0, AxVM::new(HostPhysAddr::from(0x4000_0000usize)));
        let mut ops = MockOps::default();
        let mut run = AxVmRunState::new();

        assert_eq!(
            vmm.run_vcpu(&vcpu, &mut ops, &mut run).err(),
            Some(AxError::BadState)
        );
        assert_eq!(MockHal::entries(), 0);
    }

    #[test]
    fn host_irq_exit_resumes_until_a_signal_arrives() {
        MockHal::reset();
        let vmm = AxVmm::<MockHal>::new();
        let vcpu = Arc::new(AxVCpu::new(
            0,
            AxVM::new(HostPhysAddr::from(0x4000_0000usize)),
        ));
        vcpu.set_target(VCpuTarget::CortexA15).unwrap();
        let mut ops = MockOps::default();
        let mut run = AxVmRunState::new();

        // Observe the execution mode from inside the guest slice.
        let modes = Rc::new(RefCell::new(Vec::new()));
        MockHal::set_entry_hook({
            let vcpu = Arc::clone(&vcpu);
            let modes = Rc::clone(&modes);
            move || modes.borrow_mut().push(vcpu.mode())
        });
        MockHal::script_exit(ExceptionIndex::Irq as u32, None);
        MockHal::script_signals(&[false, true]);

        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();

        assert_eq!(run.exit, AxVmExitReason::Interrupted);
        assert_eq!(MockHal::entries(), 1);
        // One sync pair per iteration, nothing dispatched.
        assert_eq!(ops.calls, ["sync_to", "sync_from", "sync_to", "sync_from"]);
        // The full transition was OutsideGuest -> InGuest -> OutsideGuest.
        assert_eq!(*modes.borrow(), [VCpuMode::InGuest]);
        assert_eq!(vcpu.mode(), VCpuMode::OutsideGuest);

        // The loop unregistered the vcpu from the running table.
        let irq = IrqDisabled::new();
        assert!(vmm.current_vcpu(&irq).is_none());
    }

    #[test]
    fn pause_suppresses_guest_entry() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        vcpu.set_pause(true);
        MockHal::script_signals(&[false, true]);

        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();

        assert_eq!(run.exit, AxVmExitReason::Interrupted);
        assert_eq!(MockHal::entries(), 0);
    }

    #[test]
    fn guest_data_abort_reaches_the_abort_handler() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        let mmio = AxVmExitReason::MmioWrite {
            addr: GuestPhysAddr::from(0x0900_0000usize),
            width: AccessWidth::Word,
            data: 0xabcd,
        };
        ops.exit_on_abort = Some(mmio);
        MockHal::script_exit(
            ExceptionIndex::DataAbort as u32,
            Some(hsr_from_parts(0x24, true, None, 0x40)),
        );

        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();

        assert_eq!(run.exit, mmio);
        assert_eq!(ops.calls, ["sync_to", "sync_from", "guest_abort"]);
    }

    #[test]
    fn mmio_read_round_trip_writes_the_destination_register() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        ops.exit_on_abort = Some(AxVmExitReason::MmioRead {
            addr: GuestPhysAddr::from(0x0900_0004usize),
            width: AccessWidth::Halfword,
            reg: 3,
            data: 0,
        });
        MockHal::script_exit(
            ExceptionIndex::DataAbort as u32,
            Some(hsr_from_parts(0x24, true, None, 0)),
        );
        MockHal::script_signals(&[false, true]);

        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();
        let AxVmExitReason::MmioRead { reg, data, .. } = &mut run.exit else {
            panic!("expected an mmio read exit, got {:?}", run.exit);
        };
        assert_eq!(*reg, 3);

        // The caller performs the device read and hands the data back; only
        // the accessed bytes may land in the register.
        *data = 0xdead_beef;
        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();

        assert_eq!(vcpu.ctx().gprs[3], 0xbeef);
        assert_eq!(run.exit, AxVmExitReason::Interrupted);
    }

    #[test]
    fn mmio_completion_rejects_bad_register_index() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        run.exit = AxVmExitReason::MmioRead {
            addr: GuestPhysAddr::from(0x0900_0000usize),
            width: AccessWidth::Word,
            reg: 15,
            data: 0,
        };

        assert_eq!(
            vmm.run_vcpu(&vcpu, &mut ops, &mut run).err(),
            Some(AxError::InvalidInput)
        );
    }

    #[test]
    fn failed_condition_skips_the_trapped_instruction() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        // A CP15 trap whose recorded condition is EQ; the reset CPSR has the
        // Z flag clear, so the instruction would not have executed.
        MockHal::script_exit(
            ExceptionIndex::HvcTrap as u32,
            Some(hsr_from_parts(0x03, true, Some(0), 0)),
        );
        MockHal::script_signals(&[false, true]);

        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();

        assert_eq!(run.exit, AxVmExitReason::Interrupted);
        // No emulation ran; the guest resumes past the skipped instruction.
        assert_eq!(ops.calls, ["sync_to", "sync_from", "sync_to", "sync_from"]);
        assert_eq!(vcpu.ctx().pc, 4);
    }

    #[test]
    fn hvc_from_the_guest_injects_undefined() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        MockHal::script_exit(
            ExceptionIndex::HvcTrap as u32,
            Some(hsr_from_parts(0x12, true, None, 0x4a)),
        );
        MockHal::script_signals(&[false, true]);

        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();

        assert_eq!(run.exit, AxVmExitReason::Interrupted);
        assert!(ops.calls.contains(&"inject_undefined"));
    }

    #[test]
    fn unhandled_exit_code_surfaces_an_internal_error() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        MockHal::script_exit(ExceptionIndex::Fiq as u32, None);

        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();
        assert_eq!(
            run.exit,
            AxVmExitReason::InternalError {
                code: ExceptionIndex::Fiq as u32
            }
        );

        // Codes past the exception vector table take the same path.
        MockHal::script_exit(42, None);
        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();
        assert_eq!(run.exit, AxVmExitReason::InternalError { code: 42 });
    }

    #[test]
    fn hyp_data_abort_fails_the_run() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        MockHal::script_exit(
            ExceptionIndex::DataAbort as u32,
            Some(hsr_from_parts(0x25, true, None, 0)),
        );

        assert_eq!(
            vmm.run_vcpu(&vcpu, &mut ops, &mut run).err(),
            Some(AxError::BadAddress)
        );
    }

    #[test]
    #[should_panic(expected = "hypervisor undefined exception")]
    fn hyp_undefined_exception_is_fatal() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        MockHal::script_exit(ExceptionIndex::Undefined as u32, None);

        let _ = vmm.run_vcpu(&vcpu, &mut ops, &mut run);
    }

    #[test]
    #[should_panic(expected = "incomplete architecture support")]
    fn unknown_exception_class_is_fatal() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        // EC 0x0f has no assigned class.
        MockHal::script_exit(
            ExceptionIndex::HvcTrap as u32,
            Some(hsr_from_parts(0x0f, true, None, 0)),
        );

        let _ = vmm.run_vcpu(&vcpu, &mut ops, &mut run);
    }

    #[test]
    fn set_way_flush_request_is_honored_once_per_cpu() {
        let (vmm, vcpu, mut run) = setup();
        let mut ops = MockOps::default();
        vcpu.request_cache_flush();
        MockHal::script_exit(ExceptionIndex::Irq as u32, None);
        MockHal::script_exit(ExceptionIndex::Irq as u32, None);
        MockHal::script_signals(&[false, false, true]);

        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();

        // Two entries on the same CPU, but the request is consumed by the
        // first one.
        assert_eq!(MockHal::entries(), 2);
        assert_eq!(MockHal::cache_flushes(), 1);
    }

    #[test]
    fn stale_generation_detected_before_entry_forces_retry() {
        let (vmm, vcpu, mut run) = setup();

        // While the loop prepares the entry, another machine exhausts the
        // whole tag space and rolls the generation.
        let mut exhausted = false;
        let mut ops = MockOps::default();
        ops.on_sync_to = Some(Box::new(|| {
            if exhausted {
                return;
            }
            exhausted = true;
            for i in 0..255usize {
                let other = AxVM::new(HostPhysAddr::from(0x5000_0000 + (i << 20)));
                vmm.vmid_allocator().ensure_valid::<MockHal>(&other);
            }
        }));
        MockHal::script_signals(&[false, true]);

        vmm.run_vcpu(&vcpu, &mut ops, &mut run).unwrap();

        // The stale tag was caught with IRQs off: no entry happened, and the
        // retry picked up a tag from the new generation.
        assert_eq!(run.exit, AxVmExitReason::Interrupted);
        assert_eq!(MockHal::entries(), 0);
        assert_eq!(MockHal::flushes(), 1);
        assert_eq!(vcpu.vm().vmid_gen(), 2);
    }
}
