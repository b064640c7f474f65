// Per-CPU state and the scheduler.
//
// Each CPU owns a FIFO run queue of runnable processes and an idle task.
// The scheduler runs on the CPU's own stack with interrupts disabled and
// no spinlocks held; tasks reach it through `yield_now` (round trip) or
// `yield_noreturn` (the task restarts from its saved user frame next time
// it runs).

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{self, Context};
use crate::kalloc;
use crate::param::{CANARY, NCPU};
use crate::proc::{Proc, ProcState};
use crate::spinlock::SpinLock;
use crate::vm;

struct RunQueue {
    head: *mut Proc,
    tail: *mut Proc,
}

unsafe impl Send for RunQueue {}

impl RunQueue {
    const fn new() -> Self {
        RunQueue { head: ptr::null_mut(), tail: ptr::null_mut() }
    }

    unsafe fn push(&mut self, p: *mut Proc) {
        (*p).runq_next = ptr::null_mut();
        (*p).on_runq = true;
        if self.tail.is_null() {
            self.head = p;
        } else {
            (*self.tail).runq_next = p;
        }
        self.tail = p;
    }

    unsafe fn pop(&mut self) -> Option<*mut Proc> {
        let p = self.head;
        if p.is_null() {
            return None;
        }
        self.head = (*p).runq_next;
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        (*p).runq_next = ptr::null_mut();
        (*p).on_runq = false;
        Some(p)
    }
}

pub struct CpuState {
    pub index: usize,
    pub current: *mut Proc,
    idle_task: *mut Proc,
    pub nschedule: u64,
    // push_off bookkeeping (see spinlock.rs).
    pub noff: u32,
    pub intena: bool,
    sched_ctx: Context,
    runq: SpinLock<RunQueue>,
    canary: u64,
}

impl CpuState {
    const NEW: CpuState = CpuState {
        index: 0,
        current: ptr::null_mut(),
        idle_task: ptr::null_mut(),
        nschedule: 0,
        noff: 0,
        intena: false,
        sched_ctx: Context::zero(),
        runq: SpinLock::new("runq", RunQueue::new()),
        canary: CANARY,
    };

    fn check_canary(&self) {
        if self.canary != CANARY {
            panic!("cpu {} state corrupted", self.index);
        }
    }
}

struct CpuArray(UnsafeCell<[CpuState; NCPU]>);

unsafe impl Sync for CpuArray {}

static CPUS: CpuArray = CpuArray(UnsafeCell::new([CpuState::NEW; NCPU]));
static NCPU_ACTIVE: AtomicUsize = AtomicUsize::new(1);

/// Number of CPUs that have been brought up.
pub fn ncpu() -> usize {
    NCPU_ACTIVE.load(Ordering::Acquire)
}

/// Record that `n` CPUs are online. Called once by the boot path.
pub fn set_ncpu(n: usize) {
    assert!(n >= 1 && n <= NCPU);
    NCPU_ACTIVE.store(n, Ordering::Release);
}

/// This CPU's state. Interrupts must be disabled (or the caller must
/// otherwise be pinned) so the task cannot migrate mid-access.
#[allow(clippy::mut_from_ref)]
pub fn this_cpu() -> &'static mut CpuState {
    cpu(arch::cpu_index())
}

pub fn cpu(index: usize) -> &'static mut CpuState {
    unsafe { &mut (*CPUS.0.get())[index] }
}

/// The task running on this CPU.
pub fn current() -> *mut Proc {
    this_cpu().current
}

/// Queue `p` on `index`'s run queue. Does nothing if `p` is already
/// queued or currently running there.
pub fn enqueue(index: usize, p: *mut Proc) {
    let c = cpu(index);
    let mut q = c.runq.lock();
    unsafe {
        if c.current == p || (*p).on_runq {
            return;
        }
        q.push(p);
    }
}

/// Bring this CPU online: stamp its index and remember its id for
/// `this_cpu`. The boot path calls this once per CPU before `scheduler`.
pub fn cpu_init(index: usize) {
    let c = cpu(index);
    c.index = index;
    c.check_canary();
}

/// The per-CPU scheduling loop; never returns. Interrupts must be
/// disabled and no spinlocks held on entry.
///
/// # Safety
/// Must run on the CPU's own stack, once per CPU.
pub unsafe fn scheduler() -> ! {
    arch::irq_disable();
    let cpu = this_cpu();
    cpu.check_canary();
    assert_eq!(cpu.noff, 0, "scheduler entered with spinlocks held");

    if cpu.idle_task.is_null() {
        cpu.idle_task = crate::proc::alloc_idle(cpu.index);
    }

    loop {
        cpu.nschedule += 1;

        // Retire whatever just ran.
        let prev = cpu.current;
        let mut zombie: *mut Proc = ptr::null_mut();
        {
            let mut q = cpu.runq.lock();
            if !prev.is_null() && prev != cpu.idle_task {
                match (*prev).state {
                    ProcState::Runnable => q.push(prev),
                    // Exited covers faulted tasks too; they surface as
                    // Broken below.
                    ProcState::Exited => zombie = prev,
                    // Blocked waiters are parked on their wait queue.
                    _ => {}
                }
            }
            cpu.current = ptr::null_mut();
            // Run queue empty or not, leave the outgoing address space.
            arch::set_pagetable(vm::kernel_root());
            if let Some(p) = q.pop() {
                cpu.current = p;
            }
        }

        if !zombie.is_null() {
            // Off this CPU's stack for good: release the address-space
            // root and let the parent reap the record. A faulted task is
            // published as Broken, which is never scheduled but is still
            // collectable by waitpid.
            if let Some(aspace) = (*zombie).aspace.take() {
                kalloc::kfree(aspace.root_pa());
            }
            (*zombie).state = if (*zombie).faulted {
                ProcState::Broken
            } else {
                ProcState::WaitExited
            };
            crate::proc::notify_exit(zombie);
        }

        if cpu.current.is_null() {
            cpu.current = cpu.idle_task;
        }

        let p = cpu.current;
        (*p).check_canary();
        if let Some(aspace) = &(*p).aspace {
            arch::set_pagetable(aspace.root_pa());
        }
        arch::swtch(&mut cpu.sched_ctx, &(*p).ctx);
        // The task switched back; go around.
    }
}

/// Give up the CPU; returns when the scheduler next picks this task.
/// The caller must hold no spinlocks.
pub fn yield_now() {
    let intena = arch::irq_enabled();
    arch::irq_disable();
    let cpu = this_cpu();
    assert_eq!(cpu.noff, 0, "yield with spinlocks held");
    let p = cpu.current;
    assert!(!p.is_null());
    unsafe {
        arch::swtch(&mut (*p).ctx, &cpu.sched_ctx);
    }
    if intena {
        arch::irq_enable();
    }
}

/// Give up the CPU discarding the kernel call stack; the task's next run
/// re-enters user mode from its saved register frame.
pub fn yield_noreturn() -> ! {
    arch::irq_disable();
    let cpu = this_cpu();
    let p = cpu.current;
    unsafe {
        (*p).ctx = Context::kernel_entry(user_return_entry, (*p).kstack_top);
        let mut scratch = Context::zero();
        arch::swtch(&mut scratch, &cpu.sched_ctx);
    }
    unreachable!("yield_noreturn resumed");
}

extern "C" fn user_return_entry() -> ! {
    let p = current();
    unsafe { arch::user_return(&(*p).regs) }
}

#[cfg(test)]
pub(crate) fn take_runq_head(index: usize) -> Option<*mut Proc> {
    let c = cpu(index);
    let mut q = c.runq.lock();
    unsafe { q.pop() }
}

/// Arrange for `p`'s next run to enter user mode from its saved frame.
///
/// # Safety
/// `p` must be a live process record that is not currently running.
pub unsafe fn set_user_return(p: *mut Proc) {
    (*p).ctx = Context::kernel_entry(user_return_entry, (*p).kstack_top);
}

// The idle task: halt until an interrupt might have made someone
// runnable, then let the scheduler look again.
pub extern "C" fn idle_main() -> ! {
    loop {
        arch::irq_enable();
        arch::halt();
        arch::irq_disable();
        yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc;

    #[test]
    fn runq_is_fifo() {
        let _t = crate::testing::setup();
        let a = proc::test_proc(0);
        let b = proc::test_proc(0);
        let c = proc::test_proc(0);
        let cpu = cpu(0);
        unsafe {
            let mut q = cpu.runq.lock();
            q.push(a);
            q.push(b);
            q.push(c);
            assert_eq!(q.pop(), Some(a));
            assert_eq!(q.pop(), Some(b));
            assert_eq!(q.pop(), Some(c));
            assert_eq!(q.pop(), None);
        }
        proc::free_test_proc(a);
        proc::free_test_proc(b);
        proc::free_test_proc(c);
    }

    #[test]
    fn enqueue_skips_running_and_queued_tasks() {
        let _t = crate::testing::setup();
        let a = proc::test_proc(0);
        let cpu0 = cpu(0);
        enqueue(0, a);
        enqueue(0, a); // second enqueue is a no-op
        unsafe {
            {
                let mut q = cpu0.runq.lock();
                assert_eq!(q.pop(), Some(a));
                assert_eq!(q.pop(), None);
            }
            cpu0.current = a;
            enqueue(0, a); // running task never queues on its own CPU
            {
                let mut q = cpu0.runq.lock();
                assert_eq!(q.pop(), None);
            }
            cpu0.current = ptr::null_mut();
        }
        proc::free_test_proc(a);
    }
}
