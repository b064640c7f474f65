// Process lifecycle: records, the pid table, the parent/child hierarchy,
// fork, exec's host process, exit, and waitpid.
//
// A process record lives at the bottom of its own page; the rest of the
// page is the task's kernel stack. The table maps pid to record pointer
// under ptable_lock; parent/child edges change only under hierarchy_lock.
// Orphans are adopted by init (pid 1), a kernel task whose only job is
// sweeping them up.

use core::ptr;

use log::{debug, info};

use crate::arch::Context;
use crate::console;
use crate::cpu;
use crate::error::{Error, Result};
use crate::kalloc;
use crate::param::{CANARY, NPROC, PGSIZE};
use crate::spinlock::SpinLock;
use crate::timer;
use crate::trap::Regs;
use crate::vfs::{self, FdTable};
use crate::vm::{self, AddressSpace, PteFlags};
use crate::wait::{WaitQueue, Waiter};

pub type Pid = i32;

pub const INIT_PID: Pid = 1;

/// waitpid option: poll instead of blocking.
pub const W_NOHANG: u64 = 1;

/// Status word recorded for a process torn down by an unrecoverable
/// user fault.
pub const FAULT_STATUS: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcState {
    Blank,
    Runnable,
    Blocked,
    Broken,
    Exited,
    WaitExited,
    Dead,
}

const NAMESZ: usize = 16;

#[repr(C)]
pub struct Proc {
    pub pid: Pid,
    pub ppid: Pid, // hierarchy_lock
    pub state: ProcState,
    pub regs: Regs,
    pub aspace: Option<AddressSpace>,
    pub fdtable: *mut FdTable,
    pub exit_status: i32,
    // Set by an unrecoverable fault; the scheduler publishes the retired
    // record as Broken instead of WaitExited.
    pub faulted: bool,

    // Intrusive membership links.
    pub runq_next: *mut Proc, // this CPU's runq_lock
    pub on_runq: bool,
    pub children: *mut Proc,   // hierarchy_lock
    pub child_next: *mut Proc, // hierarchy_lock
    pub wait_next: *mut Proc,  // owning wait queue's lock
    pub wait_prev: *mut Proc,
    pub wq: *const WaitQueue,

    pub wheel_slot: i32, // sleep-wheel slot while sleeping, else -1
    pub home_cpu: usize,
    pub kstack_top: usize,
    pub ctx: Context,
    pub name: [u8; NAMESZ],
    canary: u64,
}

impl Proc {
    fn new(pid: Pid) -> Proc {
        Proc {
            pid,
            ppid: 0,
            state: ProcState::Blank,
            regs: Regs::zeroed(),
            aspace: None,
            fdtable: ptr::null_mut(),
            exit_status: 0,
            faulted: false,
            runq_next: ptr::null_mut(),
            on_runq: false,
            children: ptr::null_mut(),
            child_next: ptr::null_mut(),
            wait_next: ptr::null_mut(),
            wait_prev: ptr::null_mut(),
            wq: ptr::null(),
            wheel_slot: -1,
            home_cpu: 0,
            kstack_top: 0,
            ctx: Context::zero(),
            name: [0; NAMESZ],
            canary: CANARY,
        }
    }

    pub fn check_canary(&self) {
        if self.canary != CANARY {
            panic!("process {} record corrupted", self.pid);
        }
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let n = name.len().min(NAMESZ);
        self.name = [0; NAMESZ];
        self.name[..n].copy_from_slice(&name[..n]);
    }
}

// A record plus its kernel stack must fit in one page.
const _: () = assert!(core::mem::size_of::<Proc>() + 1024 <= PGSIZE);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Reserved, // pid handed out, record under construction
    Live(*mut Proc),
}

struct Ptable {
    slots: [Slot; NPROC],
}

unsafe impl Send for Ptable {}

static PTABLE: SpinLock<Ptable> = SpinLock::new("ptable", Ptable { slots: [Slot::Free; NPROC] });

// Serializes every parent/child edge mutation.
static HIERARCHY: SpinLock<()> = SpinLock::new("hierarchy", ());

// Parents blocked in waitpid sleep here; exit wakes them by pid.
static WAIT_WQ: WaitQueue = WaitQueue::new("wait exit");

/// Record pointer for `pid`, or null.
pub fn lookup(pid: Pid) -> *mut Proc {
    if pid < 0 || pid as usize >= NPROC {
        return ptr::null_mut();
    }
    match PTABLE.lock().slots[pid as usize] {
        Slot::Live(p) => p,
        _ => ptr::null_mut(),
    }
}

/// The task running on this CPU.
pub fn current() -> *mut Proc {
    cpu::current()
}

// Reserve the lowest free pid; pid 0 belongs to the idle tasks.
fn alloc_pid() -> Result<Pid> {
    let mut t = PTABLE.lock();
    for pid in 1..NPROC {
        if t.slots[pid] == Slot::Free {
            t.slots[pid] = Slot::Reserved;
            return Ok(pid as Pid);
        }
    }
    Err(Error::Again)
}

// Allocate a page and plant a fresh record at its base; the remainder is
// the kernel stack.
unsafe fn alloc_proc(pid: Pid) -> Result<*mut Proc> {
    let pa = kalloc::kallocpage().ok_or(Error::NoMem)?;
    let p = vm::pa2ka(pa) as *mut Proc;
    p.write(Proc::new(pid));
    (*p).kstack_top = p as usize + PGSIZE;
    Ok(p)
}

unsafe fn free_proc_page(p: *mut Proc) {
    kalloc::kfree(vm::ka2pa(p as usize));
}

unsafe fn alloc_fdtable() -> Result<*mut FdTable> {
    let pa = kalloc::kallocpage().ok_or(Error::NoMem)?;
    let ft = vm::pa2ka(pa) as *mut FdTable;
    ft.write(FdTable::new());
    Ok(ft)
}

const _: () = assert!(core::mem::size_of::<FdTable>() <= PGSIZE);

unsafe fn free_fdtable_page(ft: *mut FdTable) {
    kalloc::kfree(vm::ka2pa(ft as usize));
}

// Release the frames behind a user address space: every user page except
// the shared console alias, then the private page-table pages. The root
// stays for the caller.
unsafe fn free_user_memory(aspace: &AddressSpace) {
    let console_pa = console::console_pa();
    for m in aspace.iter() {
        if m.flags.contains(PteFlags::U) && m.pa != console_pa {
            kalloc::kfree(m.pa);
        }
    }
    // At most a handful of table pages cover the user span; collect them
    // before freeing so the walk never reads a recycled page.
    let mut tables = [0usize; 16];
    let mut n = 0;
    for pa in aspace.pt_iter() {
        debug_assert!(n < tables.len());
        tables[n] = pa;
        n += 1;
    }
    for &pa in &tables[..n] {
        kalloc::kfree(pa);
    }
}

pub(crate) unsafe fn destroy_address_space(aspace: AddressSpace) {
    free_user_memory(&aspace);
    kalloc::kfree(aspace.root_pa());
}

/// Fork the calling process. Returns the child pid to the parent; the
/// child's saved frame returns 0. All partial state is rolled back on
/// failure.
///
/// # Safety
/// `parent` must be the calling task's record with its user frame saved
/// in `regs`.
pub unsafe fn fork(parent: *mut Proc) -> Result<Pid> {
    let pid = alloc_pid()?;
    match fork_inner(parent, pid) {
        Ok(child) => {
            PTABLE.lock().slots[pid as usize] = Slot::Live(child);
            {
                let _h = HIERARCHY.lock();
                (*child).ppid = (*parent).pid;
                (*child).child_next = (*parent).children;
                (*parent).children = child;
            }
            (*child).home_cpu = pid as usize % cpu::ncpu();
            (*child).state = ProcState::Runnable;
            cpu::enqueue((*child).home_cpu, child);
            debug!("fork: {} -> {}", (*parent).pid, pid);
            Ok(pid)
        }
        Err(e) => {
            PTABLE.lock().slots[pid as usize] = Slot::Free;
            Err(e)
        }
    }
}

unsafe fn fork_inner(parent: *mut Proc, pid: Pid) -> Result<*mut Proc> {
    let child = alloc_proc(pid)?;

    let mut aspace = match AddressSpace::new() {
        Ok(a) => a,
        Err(e) => {
            free_proc_page(child);
            return Err(e);
        }
    };

    let ft = match alloc_fdtable() {
        Ok(ft) => ft,
        Err(e) => {
            destroy_address_space(aspace);
            free_proc_page(child);
            return Err(e);
        }
    };
    vfs::clone_table(&*(*parent).fdtable, &*ft);
    (*child).fdtable = ft;

    // Duplicate the parent's user memory: the console page is aliased,
    // everything else is copied into fresh frames with the parent's
    // permissions.
    let console_pa = console::console_pa();
    let parent_aspace = (*parent).aspace.as_ref().expect("fork from kernel task");
    for m in parent_aspace.iter() {
        if !m.flags.contains(PteFlags::U) {
            continue;
        }
        let r = if m.pa == console_pa {
            aspace.map(m.va, m.pa, m.flags)
        } else {
            match kalloc::kallocpage() {
                Some(pg) => {
                    ptr::copy_nonoverlapping(vm::pa2ka(m.pa) as *const u8, vm::pa2ka(pg), PGSIZE);
                    aspace.map(m.va, pg, m.flags).map_err(|e| {
                        kalloc::kfree(pg);
                        e
                    })
                }
                None => Err(Error::NoMem),
            }
        };
        if let Err(e) = r {
            vfs::close_all(&*ft);
            free_fdtable_page(ft);
            destroy_address_space(aspace);
            free_proc_page(child);
            return Err(e);
        }
    }

    (*child).regs = (*parent).regs;
    (*child).regs.rax = 0;
    cpu::set_user_return(child);
    (*child).aspace = Some(aspace);
    (*child).name = (*parent).name;
    Ok(child)
}

/// Terminate the calling process: record the status, drop its files and
/// user memory, hand its children to init, and wake whoever might be
/// waiting on it. The record stays as a zombie until the parent (or
/// init's reaper) collects it; the caller must follow with
/// `yield_noreturn`.
///
/// # Safety
/// `p` must be the calling task's record.
pub unsafe fn exit(p: *mut Proc, status: i32) {
    debug!("exit: {} status {}", (*p).pid, status);

    if !(*p).fdtable.is_null() {
        vfs::close_all(&*(*p).fdtable);
        free_fdtable_page((*p).fdtable);
        (*p).fdtable = ptr::null_mut();
    }

    if let Some(aspace) = (*p).aspace.as_ref() {
        // The root survives until the scheduler has switched away.
        free_user_memory(aspace);
    }

    let init = lookup(INIT_PID);
    {
        let _h = HIERARCHY.lock();
        let mut c = (*p).children;
        while !c.is_null() {
            let next = (*c).child_next;
            (*c).ppid = INIT_PID;
            if !init.is_null() {
                (*c).child_next = (*init).children;
                (*init).children = c;
            }
            c = next;
        }
        (*p).children = ptr::null_mut();
        (*p).exit_status = status;
        (*p).state = ProcState::Exited;
    }

    wake_parent(p);
}

/// Take an unrecoverable user fault: the same teardown as `exit` with the
/// conventional fault status, except that once the task is off its CPU
/// the scheduler publishes it as `Broken`. Broken records are never
/// scheduled again but stay waitable, so the parent reaps them like any
/// other dead child. The caller must follow with `yield_noreturn`.
///
/// # Safety
/// `p` must be the calling task's record.
pub unsafe fn broken(p: *mut Proc) {
    (*p).faulted = true;
    exit(p, FAULT_STATUS);
}

/// Scheduler callback once an exited task is off its CPU: the record is
/// now a reapable zombie; tell the parent again in case it went back to
/// sleep between the exit and the final switch.
pub(crate) unsafe fn notify_exit(p: *mut Proc) {
    wake_parent(p);
}

unsafe fn wake_parent(p: *mut Proc) {
    let ppid = (*p).ppid;
    WAIT_WQ.wake_pid(ppid);
    let parent = lookup(ppid);
    if !parent.is_null() {
        timer::poke(parent, ppid);
    }
}

enum Scan {
    Reap(*mut Proc),
    Pending,
    NoChild,
}

// Classify the parent's children against `target` (0 = any child).
// Zombies and broken children are both collectable. hierarchy_lock must
// be held.
unsafe fn scan_children(parent: *mut Proc, target: Pid) -> Scan {
    let mut any = false;
    let mut c = (*parent).children;
    while !c.is_null() {
        if target == 0 || (*c).pid == target {
            any = true;
            if matches!((*c).state, ProcState::WaitExited | ProcState::Broken) {
                return Scan::Reap(c);
            }
        }
        c = (*c).child_next;
    }
    if any {
        Scan::Pending
    } else {
        Scan::NoChild
    }
}

/// Wait for a child to die. `target` 0 matches any child; otherwise only
/// the named pid, which fails immediately with `NoChild` if it is not a
/// child. `W_NOHANG` turns the block into a poll returning `Again`.
/// On success the child — a zombie, or a broken task with the fault
/// status — is reaped and (pid, status) returned.
///
/// # Safety
/// `p` must be the calling task's record.
pub unsafe fn waitpid(p: *mut Proc, target: Pid, options: u64) -> Result<(Pid, i32)> {
    if options & W_NOHANG != 0 {
        let guard = HIERARCHY.lock();
        return match scan_children(p, target) {
            Scan::Reap(c) => Ok(reap(p, c, guard)),
            Scan::Pending => Err(Error::Again),
            Scan::NoChild => Err(Error::NoChild),
        };
    }

    let mut w = Waiter::new(p);
    let guard = w.block_until(&WAIT_WQ, &HIERARCHY, |_| {
        !matches!(scan_children(p, target), Scan::Pending)
    });
    match scan_children(p, target) {
        Scan::Reap(c) => Ok(reap(p, c, guard)),
        Scan::NoChild => Err(Error::NoChild),
        Scan::Pending => unreachable!(),
    }
}

// Collect a zombie: unlink it from the child list, clear its table slot,
// release what is left of it. Consumes the hierarchy guard.
unsafe fn reap(
    parent: *mut Proc,
    c: *mut Proc,
    guard: crate::spinlock::SpinGuard<'_, ()>,
) -> (Pid, i32) {
    let mut cur = &mut (*parent).children as *mut *mut Proc;
    while !(*cur).is_null() {
        if *cur == c {
            *cur = (*c).child_next;
            break;
        }
        cur = &mut (**cur).child_next as *mut *mut Proc;
    }
    drop(guard);

    let pid = (*c).pid;
    let status = (*c).exit_status;
    PTABLE.lock().slots[pid as usize] = Slot::Free;
    if let Some(aspace) = (*c).aspace.take() {
        // Normally the scheduler already freed this; a never-scheduled
        // corpse still owns its root.
        kalloc::kfree(aspace.root_pa());
    }
    (*c).state = ProcState::Dead;
    free_proc_page(c);
    debug!("reap: {} status {}", pid, status);
    (pid, status)
}

/// Build the init task (pid 1): a kernel task that adopts orphans and
/// loops reaping them.
pub unsafe fn build_init() {
    {
        let mut t = PTABLE.lock();
        assert!(t.slots[INIT_PID as usize] == Slot::Free, "init built twice");
        t.slots[INIT_PID as usize] = Slot::Reserved;
    }
    let p = alloc_proc(INIT_PID).expect("out of memory building init");
    (*p).ppid = INIT_PID;
    (*p).set_name(b"init");
    (*p).home_cpu = INIT_PID as usize % cpu::ncpu();
    (*p).ctx = Context::kernel_entry(init_main, (*p).kstack_top);
    (*p).state = ProcState::Runnable;
    PTABLE.lock().slots[INIT_PID as usize] = Slot::Live(p);
    cpu::enqueue((*p).home_cpu, p);
}

extern "C" fn init_main() -> ! {
    let p = current();
    info!("init: reaper running");
    loop {
        while let Ok((pid, status)) = unsafe { waitpid(p, 0, W_NOHANG) } {
            debug!("init: reaped {} status {}", pid, status);
        }
        cpu::yield_now();
    }
}

/// Build one idle task for a CPU. Idle tasks have pid 0 and never enter
/// the process table or a run queue.
pub unsafe fn alloc_idle(cpu_index: usize) -> *mut Proc {
    let p = alloc_proc(0).expect("out of memory building idle task");
    (*p).set_name(b"idle");
    (*p).home_cpu = cpu_index;
    (*p).ctx = Context::kernel_entry(cpu::idle_main, (*p).kstack_top);
    (*p).state = ProcState::Runnable;
    p
}

/// Load `name` as the first user process with the given pid: fresh
/// address space, stdio on the shared stream, child of init.
pub unsafe fn process_setup(pid: Pid, name: &[u8]) -> Result<Pid> {
    {
        let mut t = PTABLE.lock();
        if t.slots[pid as usize] != Slot::Free {
            return Err(Error::Again);
        }
        t.slots[pid as usize] = Slot::Reserved;
    }
    match setup_inner(pid, name) {
        Ok(p) => {
            PTABLE.lock().slots[pid as usize] = Slot::Live(p);
            let init = lookup(INIT_PID);
            {
                let _h = HIERARCHY.lock();
                (*p).ppid = INIT_PID;
                if !init.is_null() {
                    (*p).child_next = (*init).children;
                    (*init).children = p;
                }
            }
            (*p).home_cpu = pid as usize % cpu::ncpu();
            (*p).state = ProcState::Runnable;
            cpu::enqueue((*p).home_cpu, p);
            info!(
                "process {} running {}",
                pid,
                core::str::from_utf8(name).unwrap_or("?")
            );
            Ok(pid)
        }
        Err(e) => {
            PTABLE.lock().slots[pid as usize] = Slot::Free;
            Err(e)
        }
    }
}

unsafe fn setup_inner(pid: Pid, name: &[u8]) -> Result<*mut Proc> {
    let p = alloc_proc(pid)?;
    let mut aspace = match AddressSpace::new() {
        Ok(a) => a,
        Err(e) => {
            free_proc_page(p);
            return Err(e);
        }
    };
    let ft = match alloc_fdtable() {
        Ok(ft) => ft,
        Err(e) => {
            destroy_address_space(aspace);
            free_proc_page(p);
            return Err(e);
        }
    };

    let built = vfs::open_stream_stdio(&*ft)
        .and_then(|_| crate::exec::build_image(&mut aspace, name, &[name]));
    match built {
        Ok(image) => {
            (*p).fdtable = ft;
            (*p).regs = Regs::user_entry(image.entry, image.rsp);
            (*p).regs.rdi = image.argc as u64;
            (*p).regs.rsi = image.argv_va as u64;
            cpu::set_user_return(p);
            (*p).aspace = Some(aspace);
            (*p).set_name(name);
            Ok(p)
        }
        Err(e) => {
            vfs::close_all(&*ft);
            free_fdtable_page(ft);
            destroy_address_space(aspace);
            free_proc_page(p);
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) fn test_proc(home_cpu: usize) -> *mut Proc {
    unsafe {
        let p = alloc_proc(0).unwrap();
        (*p).home_cpu = home_cpu;
        (*p).state = ProcState::Runnable;
        (*p).fdtable = alloc_fdtable().unwrap();
        p
    }
}

#[cfg(test)]
pub(crate) fn free_test_proc(p: *mut Proc) {
    unsafe {
        if !(*p).fdtable.is_null() {
            vfs::close_all(&*(*p).fdtable);
            free_fdtable_page((*p).fdtable);
        }
        free_proc_page(p);
    }
}
