//! The thread life-cycle state machine.
//!
//! A thread moves `Free -> Active -> (Suspended -> Active)* -> Free`. Every transition happens with the global lock held, and the lock
//! also covers each thread's saved registers, flags, owner and thread-specific data. Only one thread in the whole system may be active at a
//! time, regardless of how many cores are in the secure world.

use core::ffi::c_void;
use core::fmt;
use core::ptr::NonNull;

use crate::arch;
use crate::arch::regs::{AbortRegs, CpuMode, Cpsr, SvcRegs, ThreadCtxRegs};
use crate::arch::VirtAddr;
use crate::config::{NUM_CPUS, NUM_THREADS};
use crate::log;
use crate::sync::UninterruptibleSpinlock;
use crate::util::OneShotManualInit;

use super::core_local::{CoreLocal, CoreLocals};
use super::handlers::{AbortType, StackCanaries, ThreadHandlers};
use super::rpc::RpcArgs;
use super::smc::{SmcArgs, SmcCall, RETURN_EBUSY, RETURN_ERESUME};
use super::table::{ThreadCtx, ThreadFlags, ThreadId, ThreadSpecificData, ThreadState, ThreadTable};

/// Raw stack id naming the calling core's temporary stack.
pub const THREAD_TMP_STACK: u32 = u32::MAX;
/// Raw stack id naming the calling core's abort stack.
pub const THREAD_ABT_STACK: u32 = u32::MAX - 1;

/// Which stack a call to [`ThreadManager::init_stack`] registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StackId {
    Thread(ThreadId),
    Temp,
    Abort
}

impl StackId {
    pub fn from_raw(raw: u32) -> StackId {
        match raw {
            THREAD_TMP_STACK => StackId::Temp,
            THREAD_ABT_STACK => StackId::Abort,
            id => StackId::Thread(id as ThreadId)
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StackInitError {
    OutOfRange,
    NotFree
}

impl fmt::Display for StackInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StackInitError::OutOfRange => write!(f, "thread id is out of range"),
            StackInitError::NotFree => write!(f, "thread is in use")
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NoActiveThread;

impl fmt::Display for NoActiveThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no thread is active on this core")
    }
}

/// What the caller of [`ThreadManager::handle_smc_call`] must do next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub enum SmcOutcome {
    /// The call has been answered in place and the caller returns to the normal world.
    Return,
    /// A thread was bound to the calling core. The caller must switch into it with these registers.
    Resume(ThreadCtxRegs)
}

/// The thread table, the per-core trackers and the handlers they dispatch to.
///
/// Every operation takes the position of the calling core explicitly. The process-wide instance behind the functions in
/// [`crate::thread`] always passes [`arch::core_pos`]; passing any other core produces undefined results outside of tests.
pub struct ThreadManager<const THREADS: usize = NUM_THREADS, const CPUS: usize = NUM_CPUS> {
    threads: UninterruptibleSpinlock<ThreadTable<THREADS>>,
    cores: CoreLocals<CPUS>,
    handlers: OneShotManualInit<&'static dyn ThreadHandlers>,
    canaries: OneShotManualInit<&'static dyn StackCanaries>
}

impl<const THREADS: usize, const CPUS: usize> ThreadManager<THREADS, CPUS> {
    pub const fn new() -> Self {
        ThreadManager {
            threads: UninterruptibleSpinlock::new(ThreadTable::new()),
            cores: CoreLocals::new(),
            handlers: OneShotManualInit::uninit(),
            canaries: OneShotManualInit::uninit()
        }
    }

    fn core(&self, core: usize) -> &CoreLocal {
        self.cores.get(core)
    }

    fn curr_thread_or_panic(&self, core: usize) -> ThreadId {
        match self.core(core).curr_thread() {
            Some(id) => id,
            None => panic!("core {} has no active thread", core)
        }
    }

    fn assert_no_curr_thread(&self, core: usize) {
        if let Some(id) = self.core(core).curr_thread() {
            panic!("core {} entered the dispatcher while still running thread {}", core, id);
        }
    }

    fn check_canaries(&self) {
        if let Some(canaries) = self.canaries.try_get() {
            canaries.check();
        }
    }

    /// Installs the handlers every call is dispatched to.
    ///
    /// # Panics
    ///
    /// Panics if handlers have already been installed.
    pub fn init_handlers(&self, handlers: &'static dyn ThreadHandlers) {
        self.handlers.set(handlers);
        log!(Info, "thread", "Installed thread handlers ({} threads, {} cores)", THREADS, CPUS);
    }

    /// Returns the installed handlers.
    ///
    /// # Panics
    ///
    /// Panics if no handlers have been installed yet.
    pub fn handlers(&self) -> &'static dyn ThreadHandlers {
        *self.handlers.get()
    }

    /// Installs the stack canary check run on every entry and every suspend.
    ///
    /// # Panics
    ///
    /// Panics if a check has already been installed.
    pub fn init_canaries(&self, canaries: &'static dyn StackCanaries) {
        self.canaries.set(canaries);
    }

    /// Registers the top of a stack.
    ///
    /// [`StackId::Temp`] and [`StackId::Abort`] name stacks private to the calling core. Registering the temporary stack also marks the core
    /// as running no thread and makes it the core's IRQ and FIQ stack. A thread stack can only be registered while the thread is free.
    ///
    /// # Safety
    ///
    /// `sp` must be the top of a stack that is reserved for this use for the rest of the system's lifetime. `core` must be the calling core
    /// for the per-core stacks, since they are loaded into its banked stack pointers immediately.
    pub unsafe fn init_stack(&self, core: usize, id: StackId, sp: VirtAddr) -> Result<(), StackInitError> {
        match id {
            StackId::Temp => {
                let local = self.core(core);

                local.set_tmp_stack(sp);
                local.set_curr_thread(None);

                arch::set_irq_sp(sp);
                arch::set_fiq_sp(sp);
            },
            StackId::Abort => {
                self.core(core).set_abt_stack(sp);
                arch::set_abt_sp(sp);
            },
            StackId::Thread(id) => {
                let mut threads = self.threads.lock();
                let thread = threads.get_mut(id).ok_or(StackInitError::OutOfRange)?;

                if thread.state() != ThreadState::Free {
                    return Err(StackInitError::NotFree);
                }

                thread.set_stack_va_end(sp);
            }
        }

        Ok(())
    }

    /// Returns the calling core's temporary stack.
    pub fn tmp_stack(&self, core: usize) -> VirtAddr {
        self.core(core).tmp_stack()
    }

    /// Routes an incoming secure monitor call.
    ///
    /// Fast calls are answered in place. Anything else either binds a thread to `core` and returns its registers for the caller to resume,
    /// or is refused with a status code written into `args`.
    pub fn handle_smc_call(&self, core: usize, args: &mut SmcArgs) -> SmcOutcome {
        self.check_canaries();

        match SmcCall::classify(args) {
            SmcCall::Fast => {
                self.handlers().fastcall(args);
                SmcOutcome::Return
            },
            SmcCall::ReturnFromRpc => self.resume_from_rpc(core, args),
            SmcCall::Standard => self.alloc_and_run(core, args)
        }
    }

    /// Starts a standard call on the lowest free thread.
    ///
    /// The call is refused with `RETURN_EBUSY` if any thread is active anywhere in the system or no thread is free.
    ///
    /// # Panics
    ///
    /// Panics if `core` is already running a thread.
    pub fn alloc_and_run(&self, core: usize, args: &mut SmcArgs) -> SmcOutcome {
        self.assert_no_curr_thread(core);

        let mut threads = self.threads.lock();
        let id = if threads.has_active() { None } else { threads.first_free() };

        let id = match id {
            Some(id) => id,
            None => {
                drop(threads);
                log!(Debug, "thread", "Refusing standard call {:#x} on core {}: busy", args.a0, core);

                args.set_status(RETURN_EBUSY);
                return SmcOutcome::Return;
            }
        };

        let thread = &mut threads[id];
        let stack = thread.stack_va_end();

        thread.set_state(ThreadState::Active);
        thread.set_hyp_clnt_id(args.client_id());

        let regs = thread.regs_mut();
        let pc = arch::stdcall_entry();
        let mut cpsr = Cpsr::with_mode(CpuMode::Svc);

        if pc & 1 != 0 {
            cpsr |= Cpsr::T;
        }

        regs.pc = pc;
        regs.cpsr = cpsr.bits();
        regs.svc_sp = stack.as_u32();
        regs.set_args(&args.words());

        let regs = *regs;
        self.core(core).set_curr_thread(Some(id));
        drop(threads);

        log!(Debug, "thread", "Allocated thread {} on core {} for client {:#x}", id, core, args.client_id());
        SmcOutcome::Resume(regs)
    }

    /// Reactivates the thread named in `a3` after the normal world has serviced its RPC.
    ///
    /// The call is refused with `RETURN_EBUSY` if any thread is active, and with `RETURN_ERESUME` if the thread does not exist, is not
    /// suspended or was allocated by a different client than the one in `a7`. If the thread asked for its RPC result, `a0..a3` are
    /// copied into `r0..r3` before it resumes.
    ///
    /// # Panics
    ///
    /// Panics if `core` is already running a thread.
    pub fn resume_from_rpc(&self, core: usize, args: &mut SmcArgs) -> SmcOutcome {
        self.assert_no_curr_thread(core);

        let id = args.a3 as ThreadId;
        let client = args.client_id();
        let mut threads = self.threads.lock();

        let resumed = if threads.has_active() {
            Err(RETURN_EBUSY)
        } else {
            match threads.get_mut(id) {
                Some(thread) if thread.state() == ThreadState::Suspended && thread.hyp_clnt_id() == client => {
                    thread.set_state(ThreadState::Active);

                    if thread.flags().contains(ThreadFlags::COPY_ARGS_ON_RETURN) {
                        thread.regs_mut().set_args(&args.words()[..4]);
                        thread.flags_mut().remove(ThreadFlags::COPY_ARGS_ON_RETURN);
                    }

                    self.core(core).set_curr_thread(Some(id));
                    Ok(*thread.regs())
                },
                _ => Err(RETURN_ERESUME)
            }
        };

        drop(threads);

        match resumed {
            Ok(regs) => {
                log!(Debug, "thread", "Resumed thread {} on core {}", id, core);
                SmcOutcome::Resume(regs)
            },
            Err(status) => {
                log!(Debug, "thread", "Refusing resume of thread {} on core {}: status {:#x}", id, core, status);

                args.set_status(status);
                SmcOutcome::Return
            }
        }
    }

    /// Suspends the thread running on `core`, recording `cpsr` and `pc` as the point it resumes from. Returns the id of the thread.
    ///
    /// Only [`ThreadFlags::COPY_ARGS_ON_RETURN`] is taken from `flags`; it replaces whatever the thread had set before.
    ///
    /// # Panics
    ///
    /// Panics if `core` is not running a thread, or the thread it is running is not active.
    pub fn state_suspend(&self, core: usize, flags: ThreadFlags, cpsr: Cpsr, pc: u32) -> ThreadId {
        let id = self.curr_thread_or_panic(core);

        self.check_canaries();

        let mut threads = self.threads.lock();
        let thread = &mut threads[id];

        assert_eq!(ThreadState::Active, thread.state(), "suspending thread {} that is not active", id);

        thread.flags_mut().remove(ThreadFlags::COPY_ARGS_ON_RETURN);
        thread.flags_mut().insert(flags & ThreadFlags::COPY_ARGS_ON_RETURN);
        thread.regs_mut().cpsr = cpsr.bits();
        thread.regs_mut().pc = pc;
        thread.set_state(ThreadState::Suspended);

        self.core(core).set_curr_thread(None);
        drop(threads);

        log!(Debug, "thread", "Suspended thread {} on core {}", id, core);
        id
    }

    /// Suspends the running thread for an RPC and builds the call record handed back to the normal world: the RPC words in `a0..a2` and
    /// the thread id in `a3`.
    pub fn suspend_for_rpc(&self, core: usize, flags: ThreadFlags, rpc: &RpcArgs, cpsr: Cpsr, pc: u32) -> SmcArgs {
        let id = self.state_suspend(core, flags, cpsr, pc);

        SmcArgs::new([rpc[0], rpc[1], rpc[2], id as u32, 0, 0, 0, 0])
    }

    /// Returns the thread running on `core` to the free pool.
    ///
    /// Thread-specific data should have been released already. Anything still attached is detached without running its destructor, so
    /// the next call allocated to this thread never sees it.
    ///
    /// # Panics
    ///
    /// Panics if `core` is not running a thread, or the thread it is running is not active.
    pub fn state_free(&self, core: usize) {
        let id = self.curr_thread_or_panic(core);
        let mut threads = self.threads.lock();
        let thread = &mut threads[id];

        assert_eq!(ThreadState::Active, thread.state(), "freeing thread {} that is not active", id);

        let leaked = thread.tsd_mut().take();

        thread.set_state(ThreadState::Free);
        *thread.flags_mut() = ThreadFlags::empty();

        self.core(core).set_curr_thread(None);
        drop(threads);

        if let Some(tsd) = leaked {
            log!(Warning, "thread", "Thread {} freed with thread-specific data {:?} still attached", id, tsd.data());
        }

        log!(Debug, "thread", "Freed thread {} on core {}", id, core);
    }

    /// The body of a standard call once it is running inside its thread: runs the handler, releases any thread-specific data the handler
    /// left behind and frees the thread. The answer is left in `args` for the exit path to return to the normal world.
    pub fn run_stdcall(&self, core: usize, args: &mut SmcArgs) {
        self.handlers().stdcall(args);

        if let Err(err) = self.release_tsd(core) {
            panic!("standard call on core {} returned outside of its thread: {}", core, err);
        }

        self.state_free(core);
    }

    /// Runs `f` on the saved registers of the thread running on `core`.
    ///
    /// # Panics
    ///
    /// Panics if `core` is not running a thread.
    pub fn with_ctx_regs<U>(&self, core: usize, f: impl FnOnce(&mut ThreadCtxRegs) -> U) -> U {
        let id = self.curr_thread_or_panic(core);

        f(self.threads.lock()[id].regs_mut())
    }

    fn with_active_thread<U>(&self, core: usize, f: impl FnOnce(&mut ThreadCtx) -> U) -> Result<U, NoActiveThread> {
        let id = self.core(core).curr_thread().ok_or(NoActiveThread)?;
        let mut threads = self.threads.lock();
        let thread = &mut threads[id];

        if thread.state() == ThreadState::Active {
            Ok(f(thread))
        } else {
            Err(NoActiveThread)
        }
    }

    /// Attaches thread-specific data to the thread running on `core`, replacing anything attached before.
    pub fn set_tsd(&self, core: usize, tsd: ThreadSpecificData) -> Result<(), NoActiveThread> {
        self.with_active_thread(core, |thread| *thread.tsd_mut() = Some(tsd))
    }

    /// Returns the thread-specific data of the thread running on `core`, or `None` if there is none or no thread is running.
    ///
    /// Only the payload is handed out. The destructor stays with the thread and runs in [`ThreadManager::release_tsd`].
    pub fn tsd(&self, core: usize) -> Option<NonNull<c_void>> {
        self.with_active_thread(core, |thread| thread.tsd()).ok().flatten()
    }

    /// Detaches the thread-specific data of the thread running on `core` and runs its destructor.
    pub fn release_tsd(&self, core: usize) -> Result<(), NoActiveThread> {
        // The destructor runs after the lock is dropped since it is arbitrary code.
        if let Some(tsd) = self.with_active_thread(core, |thread| thread.tsd_mut().take())? {
            tsd.release();
        }

        Ok(())
    }

    pub fn handle_fiq(&self) {
        self.handlers().fiq();
    }

    pub fn handle_svc(&self, regs: &mut SvcRegs) {
        self.handlers().svc(regs);
    }

    pub fn handle_abort(&self, abort_type: AbortType, regs: &mut AbortRegs) {
        self.handlers().abort(abort_type, regs);
    }

    /// Returns the thread `core` is running, if any.
    pub fn curr_thread(&self, core: usize) -> Option<ThreadId> {
        self.core(core).curr_thread()
    }

    /// Runs `f` on a snapshot of the thread `id` taken under the global lock, or returns `None` if there is no such thread.
    pub fn inspect<U>(&self, id: ThreadId, f: impl FnOnce(&ThreadCtx) -> U) -> Option<U> {
        self.threads.lock().get(id).map(f)
    }

    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.inspect(id, |thread| thread.state())
    }

    /// Counts the threads currently in `state`.
    pub fn count(&self, state: ThreadState) -> usize {
        self.threads.lock().count(state)
    }
}

impl<const THREADS: usize, const CPUS: usize> Default for ThreadManager<THREADS, CPUS> {
    fn default() -> Self {
        ThreadManager::new()
    }
}

#[cfg(test)]
mod test {
    use core::cell::Cell;
    use core::ffi::c_void;
    use core::ptr::NonNull;
    use std::boxed::Box;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};
    use std::vec::Vec;

    use super::*;
    use crate::arch::PhysAddr;
    use crate::thread::rpc::{complete_rpc, RpcClient, RpcYield};
    use crate::thread::smc::*;

    type TestManager = ThreadManager<3, 2>;

    const CLIENT: u32 = 0x77;
    const SUSPEND_CPSR: Cpsr = Cpsr::with_mode(CpuMode::Svc);
    const SUSPEND_PC: u32 = 0x0e10_4400;

    #[derive(Default)]
    struct TestHandlers {
        fiqs: AtomicUsize,
        aborts: Mutex<Vec<AbortType>>
    }

    impl ThreadHandlers for TestHandlers {
        fn stdcall(&self, args: &mut SmcArgs) {
            let sum = args.a1 + args.a2;

            args.set_status(RETURN_OK);
            args.a1 = sum;
        }

        fn fastcall(&self, args: &mut SmcArgs) {
            args.set_status(RETURN_OK);
            args.a1 = 0xfa57;
        }

        fn fiq(&self) {
            self.fiqs.fetch_add(1, Ordering::Relaxed);
        }

        fn svc(&self, regs: &mut SvcRegs) {
            regs.r0 = regs.r7;
        }

        fn abort(&self, abort_type: AbortType, regs: &mut AbortRegs) {
            self.aborts.lock().unwrap().push(abort_type);
            regs.elr += 4;
        }
    }

    #[derive(Default)]
    struct CountingCanaries(AtomicUsize);

    impl StackCanaries for CountingCanaries {
        fn check(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn manager() -> (TestManager, &'static TestHandlers) {
        let handlers: &'static TestHandlers = Box::leak(Box::default());
        let manager = TestManager::new();

        manager.init_handlers(handlers);
        (manager, handlers)
    }

    fn std_call(a1: u32, a2: u32) -> SmcArgs {
        SmcArgs::new([call_val(false, false, OWNER_TRUSTED_OS, 0x10), a1, a2, 3, 4, 5, 6, CLIENT])
    }

    fn resume_call(id: ThreadId, client: u32, r1: u32, r2: u32) -> SmcArgs {
        SmcArgs::new([CALL_RETURN_FROM_RPC, r1, r2, id as u32, 0, 0, 0, client])
    }

    fn expect_resume(outcome: SmcOutcome) -> ThreadCtxRegs {
        match outcome {
            SmcOutcome::Resume(regs) => regs,
            SmcOutcome::Return => panic!("call was not admitted")
        }
    }

    fn alloc(manager: &TestManager, core: usize) -> ThreadCtxRegs {
        expect_resume(manager.handle_smc_call(core, &mut std_call(1, 2)))
    }

    fn suspend(manager: &TestManager, core: usize, flags: ThreadFlags) -> ThreadId {
        manager.state_suspend(core, flags, SUSPEND_CPSR, SUSPEND_PC)
    }

    #[test]
    fn test_alloc_initializes_context() {
        let (manager, _) = manager();

        unsafe {
            manager.init_stack(0, StackId::Thread(0), VirtAddr::new(0x0e20_0000)).unwrap();
        }

        let mut args = std_call(1, 2);
        let regs = expect_resume(manager.handle_smc_call(0, &mut args));

        assert_eq!(arch::stdcall_entry(), regs.pc);
        assert_eq!(Cpsr::with_mode(CpuMode::Svc), regs.cpsr());
        assert_eq!(0x0e20_0000, regs.svc_sp);
        assert_eq!(args.words(), regs.args());

        assert_eq!(Some(0), manager.curr_thread(0));
        assert_eq!(Some(ThreadState::Active), manager.thread_state(0));
        assert_eq!(Some(CLIENT), manager.inspect(0, |thread| thread.hyp_clnt_id()));
    }

    #[test]
    fn test_alloc_busy_while_active() {
        let (manager, _) = manager();

        alloc(&manager, 0);

        let mut args = std_call(1, 2);
        assert_eq!(SmcOutcome::Return, manager.handle_smc_call(1, &mut args));

        assert_eq!([RETURN_EBUSY, 0, 0, 0, 0, 0, 0, 0], args.words());
        assert_eq!(1, manager.count(ThreadState::Active));
        assert_eq!(2, manager.count(ThreadState::Free));
        assert_eq!(None, manager.curr_thread(1));
    }

    #[test]
    fn test_alloc_busy_when_exhausted() {
        let (manager, _) = manager();

        for id in 0..3 {
            alloc(&manager, 0);
            assert_eq!(id, suspend(&manager, 0, ThreadFlags::empty()));
        }

        let mut args = std_call(1, 2);
        assert_eq!(SmcOutcome::Return, manager.handle_smc_call(1, &mut args));

        assert_eq!([RETURN_EBUSY, 0, 0, 0, 0, 0, 0, 0], args.words());
        assert_eq!(3, manager.count(ThreadState::Suspended));
    }

    #[test]
    fn test_resume_refusals() {
        let (manager, _) = manager();

        alloc(&manager, 0);
        suspend(&manager, 0, ThreadFlags::COPY_ARGS_ON_RETURN);

        let states = |manager: &TestManager| [0, 1, 2].map(|id| manager.thread_state(id));
        let before = states(&manager);

        assert_eq!([Some(ThreadState::Suspended), Some(ThreadState::Free), Some(ThreadState::Free)], before);

        for (id, client) in [(1, CLIENT), (2, CLIENT), (99, CLIENT), (0, CLIENT + 1)] {
            let mut args = resume_call(id, client, 5, 6);

            assert_eq!(SmcOutcome::Return, manager.handle_smc_call(1, &mut args));
            assert_eq!([RETURN_ERESUME, 0, 0, 0, 0, 0, 0, 0], args.words());
            assert_eq!(before, states(&manager));
            assert_eq!(None, manager.curr_thread(1));
        }

        assert_eq!(Some(ThreadFlags::COPY_ARGS_ON_RETURN), manager.inspect(0, |thread| thread.flags()));

        // A valid resume is still refused while another thread runs.
        alloc(&manager, 1);

        let before = states(&manager);
        let mut args = resume_call(0, CLIENT, 5, 6);

        assert_eq!(SmcOutcome::Return, manager.handle_smc_call(0, &mut args));
        assert_eq!([RETURN_EBUSY, 0, 0, 0, 0, 0, 0, 0], args.words());
        assert_eq!(before, states(&manager));
        assert_eq!(None, manager.curr_thread(0));
        assert_eq!(Some(1), manager.curr_thread(1));
    }

    #[test]
    fn test_suspend_and_resume_on_other_core() {
        let (manager, _) = manager();

        alloc(&manager, 0);

        assert_eq!(0, suspend(&manager, 0, ThreadFlags::COPY_ARGS_ON_RETURN));
        assert_eq!(None, manager.curr_thread(0));
        assert_eq!(Some(ThreadState::Suspended), manager.thread_state(0));

        let regs = expect_resume(manager.handle_smc_call(1, &mut resume_call(0, CLIENT, 0x11, 0x22)));

        assert_eq!([CALL_RETURN_FROM_RPC, 0x11, 0x22, 0], regs.args()[..4]);
        assert_eq!(SUSPEND_PC, regs.pc);
        assert_eq!(SUSPEND_CPSR, regs.cpsr());

        assert_eq!(Some(0), manager.curr_thread(1));
        assert_eq!(None, manager.curr_thread(0));
        assert_eq!(Some(ThreadFlags::empty()), manager.inspect(0, |thread| thread.flags()));
    }

    #[test]
    fn test_copy_args_used_once() {
        let (manager, _) = manager();

        alloc(&manager, 0);
        suspend(&manager, 0, ThreadFlags::COPY_ARGS_ON_RETURN);

        let first = expect_resume(manager.handle_smc_call(0, &mut resume_call(0, CLIENT, 0x11, 0x22)));

        suspend(&manager, 0, ThreadFlags::empty());

        let second = expect_resume(manager.handle_smc_call(0, &mut resume_call(0, CLIENT, 0x33, 0x44)));

        assert_eq!(first.args(), second.args());
        assert_eq!(0x11, second.r1);
    }

    #[test]
    fn test_free() {
        let (manager, _) = manager();

        alloc(&manager, 0);
        suspend(&manager, 0, ThreadFlags::COPY_ARGS_ON_RETURN);
        expect_resume(manager.handle_smc_call(1, &mut resume_call(0, CLIENT, 0, 0)));
        suspend(&manager, 1, ThreadFlags::COPY_ARGS_ON_RETURN);
        expect_resume(manager.handle_smc_call(1, &mut resume_call(0, CLIENT, 0, 0)));

        manager.state_free(1);

        assert_eq!(Some(ThreadState::Free), manager.thread_state(0));
        assert_eq!(Some(ThreadFlags::empty()), manager.inspect(0, |thread| thread.flags()));
        assert_eq!(None, manager.curr_thread(1));

        // The freed thread is the first one handed out again.
        alloc(&manager, 0);
        assert_eq!(Some(0), manager.curr_thread(0));
    }

    #[test]
    #[should_panic]
    fn test_free_without_thread() {
        let (manager, _) = manager();

        manager.state_free(0);
    }

    #[test]
    #[should_panic]
    fn test_suspend_without_thread() {
        let (manager, _) = manager();

        suspend(&manager, 1, ThreadFlags::empty());
    }

    #[test]
    #[should_panic]
    fn test_alloc_on_busy_core() {
        let (manager, _) = manager();

        alloc(&manager, 0);
        let _ = manager.handle_smc_call(0, &mut std_call(1, 2));
    }

    #[test]
    #[should_panic]
    fn test_core_out_of_range() {
        let (manager, _) = manager();

        let _ = manager.handle_smc_call(2, &mut std_call(1, 2));
    }

    #[test]
    fn test_fast_call_bypasses_table() {
        let (manager, _) = manager();

        alloc(&manager, 0);

        let mut args = SmcArgs::new([call_val(true, false, OWNER_TRUSTED_OS, 1), 9, 9, 9, 9, 9, 9, 9]);

        assert_eq!(SmcOutcome::Return, manager.handle_smc_call(1, &mut args));
        assert_eq!([RETURN_OK, 0xfa57, 0, 0, 0, 0, 0, 0], args.words());
        assert_eq!(None, manager.curr_thread(1));
        assert_eq!(1, manager.count(ThreadState::Active));
    }

    #[test]
    fn test_init_stack() {
        let (manager, _) = manager();

        assert_eq!(StackId::Temp, StackId::from_raw(THREAD_TMP_STACK));
        assert_eq!(StackId::Abort, StackId::from_raw(THREAD_ABT_STACK));
        assert_eq!(StackId::Thread(2), StackId::from_raw(2));

        unsafe {
            assert_eq!(Ok(()), manager.init_stack(0, StackId::Thread(1), VirtAddr::new(0x1000)));
            assert_eq!(Err(StackInitError::OutOfRange), manager.init_stack(0, StackId::Thread(3), VirtAddr::new(0x2000)));
        }

        assert_eq!(Some(VirtAddr::new(0x1000)), manager.inspect(1, |thread| thread.stack_va_end()));

        alloc(&manager, 0);

        unsafe {
            assert_eq!(Err(StackInitError::NotFree), manager.init_stack(0, StackId::Thread(0), VirtAddr::new(0x3000)));

            // Registering the temporary stack resets whatever the core believed it was running.
            assert_eq!(Ok(()), manager.init_stack(0, StackId::Temp, VirtAddr::new(0x8000)));
            assert_eq!(Ok(()), manager.init_stack(0, StackId::Abort, VirtAddr::new(0x9000)));
        }

        assert_eq!(VirtAddr::new(0x8000), manager.tmp_stack(0));
        assert_eq!(None, manager.curr_thread(0));

        let stacks = arch::exception_stacks();

        assert_eq!(VirtAddr::new(0x8000), stacks.irq);
        assert_eq!(VirtAddr::new(0x8000), stacks.fiq);
        assert_eq!(VirtAddr::new(0x9000), stacks.abt);
    }

    #[test]
    fn test_init_stack_on_suspended_thread() {
        let (manager, _) = manager();

        unsafe {
            assert_eq!(Ok(()), manager.init_stack(0, StackId::Thread(0), VirtAddr::new(0x1000)));
        }

        alloc(&manager, 0);
        suspend(&manager, 0, ThreadFlags::COPY_ARGS_ON_RETURN);

        unsafe {
            assert_eq!(Err(StackInitError::NotFree), manager.init_stack(1, StackId::Thread(0), VirtAddr::new(0x3000)));
        }

        assert_eq!(Some(VirtAddr::new(0x1000)), manager.inspect(0, |thread| thread.stack_va_end()));
        assert_eq!(Some(ThreadState::Suspended), manager.thread_state(0));
    }

    static RELEASED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn release_counter(data: NonNull<c_void>) {
        RELEASED.fetch_add(data.as_ptr() as usize, Ordering::Relaxed);
    }

    fn tsd(val: usize) -> ThreadSpecificData {
        unsafe { ThreadSpecificData::new(NonNull::new(val as *mut c_void).unwrap(), release_counter) }
    }

    #[test]
    fn test_tsd() {
        let (manager, _) = manager();

        assert_eq!(Err(NoActiveThread), manager.set_tsd(0, tsd(0x100)));
        assert_eq!(None, manager.tsd(0));

        alloc(&manager, 0);

        assert_eq!(None, manager.tsd(0));
        assert_eq!(Ok(()), manager.set_tsd(0, tsd(0x100)));
        assert_eq!(Some(0x100), manager.tsd(0).map(|data| data.as_ptr() as usize));
        assert_eq!(None, manager.tsd(1));

        // Suspended threads have no thread-specific data as far as any core can tell.
        suspend(&manager, 0, ThreadFlags::empty());
        assert_eq!(None, manager.tsd(0));
        expect_resume(manager.handle_smc_call(0, &mut resume_call(0, CLIENT, 0, 0)));

        let before = RELEASED.load(Ordering::Relaxed);

        assert_eq!(Ok(()), manager.release_tsd(0));
        assert_eq!(None, manager.tsd(0));
        assert!(RELEASED.load(Ordering::Relaxed) >= before + 0x100);
    }

    static RELEASED_ONCE: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_release(_data: NonNull<c_void>) {
        RELEASED_ONCE.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_tsd_released_once() {
        let (manager, _) = manager();

        alloc(&manager, 0);
        manager.set_tsd(0, unsafe { ThreadSpecificData::new(NonNull::dangling(), count_release) }).unwrap();

        let data = manager.tsd(0);

        assert_eq!(Some(NonNull::dangling()), data);
        assert_eq!(Ok(()), manager.release_tsd(0));
        assert_eq!(Ok(()), manager.release_tsd(0));
        assert_eq!(None, manager.tsd(0));
        assert_eq!(1, RELEASED_ONCE.load(Ordering::Relaxed));

        // A fresh payload left behind by the handler is released by the standard call exit path, and only there.
        manager.set_tsd(0, unsafe { ThreadSpecificData::new(NonNull::dangling(), count_release) }).unwrap();
        manager.run_stdcall(0, &mut std_call(1, 2));

        assert_eq!(2, RELEASED_ONCE.load(Ordering::Relaxed));
        assert_eq!(Err(NoActiveThread), manager.release_tsd(0));
        assert_eq!(2, RELEASED_ONCE.load(Ordering::Relaxed));
    }

    #[test]
    fn test_free_detaches_leaked_tsd() {
        let (manager, _) = manager();

        alloc(&manager, 0);
        manager.set_tsd(0, tsd(0x1_0000)).unwrap();
        manager.state_free(0);

        assert_eq!(Some(true), manager.inspect(0, |thread| thread.tsd().is_none()));

        alloc(&manager, 1);
        assert_eq!(None, manager.tsd(1));
    }

    #[test]
    fn test_run_stdcall() {
        let (manager, _) = manager();

        alloc(&manager, 0);

        let mut args = std_call(40, 2);
        manager.run_stdcall(0, &mut args);

        assert_eq!([RETURN_OK, 42, 0, 0, 0, 0, 0, 0], args.words());
        assert_eq!(None, manager.curr_thread(0));
        assert_eq!(3, manager.count(ThreadState::Free));
    }

    #[test]
    fn test_with_ctx_regs() {
        let (manager, _) = manager();

        alloc(&manager, 0);
        manager.with_ctx_regs(0, |regs| regs.r12 = 0x1234);
        suspend(&manager, 0, ThreadFlags::empty());

        let regs = expect_resume(manager.handle_smc_call(1, &mut resume_call(0, CLIENT, 0, 0)));

        assert_eq!(0x1234, regs.r12);
    }

    #[test]
    fn test_trap_handlers_forwarded() {
        let (manager, handlers) = manager();

        manager.handle_fiq();
        assert_eq!(1, handlers.fiqs.load(Ordering::Relaxed));

        let mut svc = SvcRegs { r7: 0x55, ..SvcRegs::default() };
        manager.handle_svc(&mut svc);
        assert_eq!(0x55, svc.r0);

        let mut abort = AbortRegs { elr: 0x100, ..AbortRegs::default() };
        manager.handle_abort(AbortType::Prefetch, &mut abort);
        manager.handle_abort(AbortType::Data, &mut abort);

        assert_eq!(0x108, abort.elr);
        assert_eq!([AbortType::Prefetch, AbortType::Data], handlers.aborts.lock().unwrap()[..]);
    }

    #[test]
    #[should_panic]
    fn test_handlers_installed_twice() {
        let (manager, _) = manager();

        manager.init_handlers(Box::leak(Box::new(TestHandlers::default())));
    }

    #[test]
    fn test_canaries_checked() {
        let (manager, _) = manager();
        let canaries: &'static CountingCanaries = Box::leak(Box::default());

        manager.init_canaries(canaries);

        alloc(&manager, 0);
        suspend(&manager, 0, ThreadFlags::empty());

        assert_eq!(2, canaries.0.load(Ordering::Relaxed));
    }

    /// Plays the normal world for a thread that starts on one core and is resumed on another. Each RPC is answered with its own parameter
    /// words plus a fixed offset.
    struct NormalWorld<'a> {
        manager: &'a TestManager,
        core: Cell<usize>,
        resume_core: usize,
        requests: Cell<usize>
    }

    const ANSWER_OFFSET: u32 = 0x1000;

    impl RpcYield for NormalWorld<'_> {
        fn rpc(&self, flags: ThreadFlags, args: &mut RpcArgs) {
            let out = self.manager.suspend_for_rpc(self.core.get(), flags, args, SUSPEND_CPSR, SUSPEND_PC);

            assert_eq!(args[..], out.words()[..3]);
            assert_eq!([0, 0, 0, 0], out.words()[4..]);
            assert!(is_rpc_return(out.a0));
            assert_eq!(1, self.manager.count(ThreadState::Suspended));

            self.requests.set(self.requests.get() + 1);

            let mut resume = resume_call(out.a3 as ThreadId, CLIENT, out.a1 + ANSWER_OFFSET, out.a2 + ANSWER_OFFSET);
            let regs = expect_resume(self.manager.handle_smc_call(self.resume_core, &mut resume));

            self.core.set(self.resume_core);
            complete_rpc(&regs, args);
        }
    }

    #[test]
    fn test_rpc_round_trip() {
        let (manager, _) = manager();
        let world = NormalWorld { manager: &manager, core: Cell::new(0), resume_core: 1, requests: Cell::new(0) };
        let client = RpcClient::new(&world);

        let start = alloc(&manager, 0);
        assert_eq!([call_val(false, false, OWNER_TRUSTED_OS, 0x10), 1, 2, 3, 4, 5, 6, CLIENT], start.args());

        let answer = client.cmd(PhysAddr::new(0x4000_0000));

        assert_eq!([CALL_RETURN_FROM_RPC, 0x4000_0000 + ANSWER_OFFSET, ANSWER_OFFSET], answer);
        assert_eq!(Some(0), manager.curr_thread(1));
        assert_eq!(None, manager.curr_thread(0));

        let (arg, payload) = client.alloc(0x40, 0x200);

        assert_eq!(PhysAddr::new(0x40 + ANSWER_OFFSET), arg);
        assert_eq!(PhysAddr::new(0x200 + ANSWER_OFFSET), payload);

        client.free(arg, payload);
        assert_eq!(3, world.requests.get());

        manager.state_free(1);
        assert_eq!(3, manager.count(ThreadState::Free));

        let mut args = std_call(7, 8);
        let fresh = expect_resume(manager.handle_smc_call(0, &mut args));

        assert_eq!(args.words(), fresh.args());
        assert_eq!(Some(0), manager.curr_thread(0));
    }

    #[test]
    fn test_irq_rpc_keeps_registers() {
        let (manager, _) = manager();

        let start = alloc(&manager, 0);

        manager.state_suspend(0, ThreadFlags::empty(), SUSPEND_CPSR, SUSPEND_PC);

        let regs = expect_resume(manager.handle_smc_call(0, &mut resume_call(0, CLIENT, 0x11, 0x22)));

        assert_eq!(start.args(), regs.args());

        // The same through the client, which must not ask for the words to be copied.
        manager.state_free(0);
        alloc(&manager, 0);

        let world = NormalWorld { manager: &manager, core: Cell::new(0), resume_core: 0, requests: Cell::new(0) };
        RpcClient::new(&world).irq();

        assert_eq!(1, world.requests.get());
        assert_eq!(Some(ThreadFlags::empty()), manager.inspect(0, |thread| thread.flags()));
    }

    /// A fixed pseudo-random walk over every transition from two cores, checking after each step that no more than one thread is ever
    /// active and that the cores agree with the table.
    #[test]
    fn test_single_active_thread_walk() {
        let (manager, _) = manager();
        let mut seed = 0x2545_f491u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        for _ in 0..2000 {
            let core = (next() % 2) as usize;
            let choice = next();

            match manager.curr_thread(core) {
                Some(_) if choice % 2 == 0 => manager.state_free(core),
                Some(_) => {
                    suspend(&manager, core, ThreadFlags::from_bits_truncate(choice >> 1));
                },
                None if choice % 3 == 0 => {
                    let _ = manager.handle_smc_call(core, &mut std_call(1, 2));
                },
                None => {
                    let id = (choice >> 2) % 4;
                    let client = if choice % 7 == 0 { CLIENT + 1 } else { CLIENT };

                    let _ = manager.handle_smc_call(core, &mut resume_call(id as ThreadId, client, 0, 0));
                }
            }

            let active = manager.count(ThreadState::Active);
            let bound = (0..2).filter(|&core| manager.curr_thread(core).is_some()).count();

            assert!(active <= 1);
            assert_eq!(active, bound);
        }
    }

    #[test]
    fn test_concurrent_admission() {
        let (manager, _) = manager();
        let barrier = Barrier::new(2);

        for _ in 0..100 {
            let admitted: Vec<bool> = std::thread::scope(|s| {
                let workers: Vec<_> = (0..2)
                    .map(|core| {
                        let manager = &manager;
                        let barrier = &barrier;

                        s.spawn(move || {
                            barrier.wait();
                            matches!(manager.handle_smc_call(core, &mut std_call(1, 2)), SmcOutcome::Resume(_))
                        })
                    })
                    .collect();

                workers.into_iter().map(|w| w.join().unwrap()).collect()
            });

            assert_eq!(1, admitted.iter().filter(|&&a| a).count());

            let core = admitted.iter().position(|&a| a).unwrap();
            manager.state_free(core);
        }
    }
}
