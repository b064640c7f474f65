#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

// The finch kernel: a small preemptive multi-CPU teaching kernel for
// x86-64. Boot, APIC programming, the interrupt vector stubs and the
// display belong to the external hardware layer; they call in through
// `kernel_start`, `exception`, `syscall_entry` and
// `keyboard_interrupt`.

pub mod arch;
pub mod config;
pub mod console;
pub mod cpu;
pub mod error;
pub mod exec;
pub mod kalloc;
pub mod klog;
pub mod param;
pub mod proc;
pub mod spinlock;
pub mod syscall;
pub mod timer;
pub mod trap;
pub mod vfs;
pub mod vm;
pub mod wait;

pub use console::keyboard_interrupt;
pub use trap::{exception, syscall_entry};

use core::sync::atomic::Ordering;

use log::{error, info};

/// Boot-CPU entry. The boot path has sized memory into `ranges`, counted
/// `ncpu` processors, and stashed this CPU's index at gs:0; `command` is
/// the loader's option string. Never returns: ends in the scheduler.
pub fn kernel_start(command: &str, ranges: &[kalloc::MemRange], ncpu: usize) -> ! {
    let cfg = config::parse(command);
    klog::init(cfg.loglevel);
    info!("finch starting on {} cpus", ncpu);

    syscall::sysproc::KDISPLAY.store(cfg.kdisplay as i64, Ordering::Relaxed);
    cpu::set_ncpu(ncpu);
    kalloc::init(ranges.iter().copied());
    vm::kernel_init(ranges.iter().copied());
    vfs::init();
    cpu::cpu_init(0);

    unsafe {
        proc::build_init();
        if let Err(e) = proc::process_setup(2, cfg.first()) {
            error!("cannot start first process: {:?}", e);
        }
        cpu::scheduler()
    }
}

/// Secondary-CPU entry, after `kernel_start` has the globals up.
pub fn kernel_start_ap(index: usize) -> ! {
    cpu::cpu_init(index);
    unsafe { cpu::scheduler() }
}

// Shared scaffolding for the hosted test harness: a static arena seeds
// the page allocator once, and a process-wide mutex serializes the tests
// that touch global kernel state.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, MutexGuard, Once};

    use crate::kalloc::{self, MemKind, MemRange};
    use crate::proc::Proc;

    const ARENA_BYTES: usize = 4 << 20;

    #[repr(C, align(2097152))]
    struct Arena([u8; ARENA_BYTES]);

    static mut ARENA: Arena = Arena([0; ARENA_BYTES]);

    static LOCK: Mutex<()> = Mutex::new(());
    static INIT: Once = Once::new();

    pub fn setup() -> MutexGuard<'static, ()> {
        let guard = match LOCK.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        INIT.call_once(|| {
            let base = core::ptr::addr_of!(ARENA) as usize;
            kalloc::init([MemRange {
                start: base,
                end: base + ARENA_BYTES,
                kind: MemKind::Available,
            }]);
            crate::vfs::init();
        });
        guard
    }

    /// Release an address space built by a test (tables and root only;
    /// the test owns any frames it mapped).
    pub fn drop_aspace(a: crate::vm::AddressSpace) {
        let pts: Vec<usize> = a.pt_iter().collect();
        for pa in pts {
            kalloc::kfree(pa);
        }
        kalloc::kfree(a.root_pa());
    }

    /// Remove `p` from its home run queue, keeping everyone else's order.
    pub fn unqueue(p: *mut Proc) {
        let home = unsafe { (*p).home_cpu };
        let mut keep = Vec::new();
        while let Some(q) = crate::cpu::take_runq_head(home) {
            if q != p {
                keep.push(q);
            }
        }
        for q in keep {
            crate::cpu::enqueue(home, q);
        }
    }

    /// Run `f` with a throwaway task installed as CPU 0's current, so
    /// code paths that consult `current()` (waiters, syscalls) work.
    pub fn with_current<R>(f: impl FnOnce() -> R) -> R {
        let p = crate::proc::test_proc(0);
        let cpu = crate::cpu::cpu(0);
        let prev = cpu.current;
        cpu.current = p;
        let r = f();
        cpu.current = prev;
        crate::proc::free_test_proc(p);
        r
    }

    /// As `with_current`, but the task also owns an empty user address
    /// space, torn down afterwards with everything mapped into it.
    pub fn with_user_current<R>(f: impl FnOnce() -> R) -> R {
        with_current(|| {
            let p = crate::proc::current();
            unsafe {
                (*p).aspace = Some(crate::vm::AddressSpace::new().unwrap());
            }
            let r = f();
            unsafe {
                if let Some(aspace) = (*p).aspace.take() {
                    crate::proc::destroy_address_space(aspace);
                }
            }
            r
        })
    }
}
