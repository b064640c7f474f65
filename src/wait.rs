// Wait queues.
//
// A wait queue is a locked intrusive list of blocked processes; the links
// are embedded in the process record, so a process occupies at most one
// queue and blocking never allocates. The lost-wakeup discipline is the
// usual one: a waiter links itself (and goes `Blocked`) before testing its
// predicate, so a wake that lands between the test and the sleep still
// finds it on the queue.

use core::ptr;

use crate::cpu;
use crate::proc::{Pid, Proc, ProcState};
use crate::spinlock::{SpinGuard, SpinLock};

struct WqList {
    head: *mut Proc,
    tail: *mut Proc,
}

unsafe impl Send for WqList {}

impl WqList {
    fn link(&mut self, p: *mut Proc) {
        unsafe {
            (*p).wait_prev = self.tail;
            (*p).wait_next = ptr::null_mut();
            if self.tail.is_null() {
                self.head = p;
            } else {
                (*self.tail).wait_next = p;
            }
            self.tail = p;
        }
    }

    fn unlink(&mut self, p: *mut Proc) {
        unsafe {
            if (*p).wait_prev.is_null() {
                self.head = (*p).wait_next;
            } else {
                (*(*p).wait_prev).wait_next = (*p).wait_next;
            }
            if (*p).wait_next.is_null() {
                self.tail = (*p).wait_prev;
            } else {
                (*(*p).wait_next).wait_prev = (*p).wait_prev;
            }
            (*p).wait_next = ptr::null_mut();
            (*p).wait_prev = ptr::null_mut();
        }
    }

    fn pop(&mut self) -> Option<*mut Proc> {
        let p = self.head;
        if p.is_null() {
            return None;
        }
        self.unlink(p);
        Some(p)
    }
}

pub struct WaitQueue {
    q: SpinLock<WqList>,
}

impl WaitQueue {
    pub const fn new(name: &'static str) -> Self {
        WaitQueue { q: SpinLock::new(name, WqList { head: ptr::null_mut(), tail: ptr::null_mut() }) }
    }

    /// Wake every waiter: mark it runnable and hand it back to its home
    /// CPU's run queue, in queue order.
    pub fn wake_all(&self) {
        let mut l = self.q.lock();
        while let Some(p) = l.pop() {
            unsafe { wake(p) };
        }
    }

    /// Wake the first waiter whose process id is `pid`.
    pub fn wake_pid(&self, pid: Pid) {
        let mut l = self.q.lock();
        let mut cur = l.head;
        while !cur.is_null() {
            unsafe {
                if (*cur).pid == pid {
                    l.unlink(cur);
                    wake(cur);
                    break;
                }
                cur = (*cur).wait_next;
            }
        }
    }
}

// The waiter has been unlinked; make it schedulable again.
unsafe fn wake(p: *mut Proc) {
    (*p).wq = ptr::null();
    if (*p).state == ProcState::Blocked {
        (*p).state = ProcState::Runnable;
    }
    cpu::enqueue((*p).home_cpu, p);
}

/// A process's handle for blocking on wait queues. Binds the process to at
/// most one queue at a time.
pub struct Waiter {
    p: *mut Proc,
}

impl Waiter {
    /// # Safety
    /// `p` must be the live record of the calling task.
    pub unsafe fn new(p: *mut Proc) -> Self {
        Waiter { p }
    }

    /// Mark the caller blocked and link it onto `wq`.
    pub fn prepare(&mut self, wq: &WaitQueue) {
        let mut l = wq.q.lock();
        unsafe {
            (*self.p).state = ProcState::Blocked;
            (*self.p).wq = wq as *const WaitQueue;
        }
        l.link(self.p);
    }

    /// Yield to the scheduler, then unlink from whatever queue the waiter
    /// is still on.
    pub fn block(&mut self) {
        cpu::yield_now();
        self.clear();
    }

    /// Back out of the queue registered by `prepare`, leaving the process
    /// runnable.
    pub fn clear(&mut self) {
        let wq = unsafe { (*self.p).wq };
        if wq.is_null() {
            unsafe { (*self.p).state = ProcState::Runnable };
            return;
        }
        let mut l = unsafe { (*wq).q.lock() };
        unsafe {
            // A waker may have unlinked us already; the back-link tells.
            if !(*self.p).wq.is_null() {
                l.unlink(self.p);
                (*self.p).wq = ptr::null();
            }
            (*self.p).state = ProcState::Runnable;
        }
    }

    /// Block on `wq` until `predicate` holds. The predicate always runs
    /// with `lock` held, and the guard is returned still locked, so the
    /// condition cannot go stale before the caller acts on it.
    pub fn block_until<'a, T, F>(
        &mut self,
        wq: &WaitQueue,
        lock: &'a SpinLock<T>,
        mut predicate: F,
    ) -> SpinGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            self.prepare(wq);
            let mut guard = lock.lock();
            if predicate(&mut *guard) {
                self.clear();
                return guard;
            }
            drop(guard);
            self.block();
        }
    }
}
