// Process-side system calls.

use core::sync::atomic::{AtomicI64, Ordering};

use crate::arch;
use crate::console;
use crate::cpu;
use crate::error::{Error, Result};
use crate::kalloc;
use crate::param::{PGSIZE, USER_TOP};
use crate::proc::{self, Pid, Proc};
use crate::timer;
use crate::trap::Regs;
use crate::vm::{self, PteFlags};

pub const KDISPLAY_NONE: u64 = 0;
pub const KDISPLAY_MEMVIEWER: u64 = 1;

// Current display mode; the memviewer itself lives with the display
// hardware.
pub static KDISPLAY: AtomicI64 = AtomicI64::new(KDISPLAY_MEMVIEWER as i64);

const USER_PAGE: PteFlags = PteFlags::from_bits_truncate(
    PteFlags::P.bits() | PteFlags::W.bits() | PteFlags::U.bits(),
);

pub(super) fn sys_getpid(p: *mut Proc) -> Result<u64> {
    Ok(unsafe { (*p).pid } as u64)
}

pub(super) fn sys_getppid(p: *mut Proc) -> Result<u64> {
    Ok(unsafe { (*p).ppid } as u64)
}

pub(super) fn sys_yield() -> Result<u64> {
    cpu::yield_now();
    Ok(0)
}

// Spin in the kernel with interrupts open, long enough for timer
// interrupts to land.
pub(super) fn sys_pause() -> Result<u64> {
    arch::irq_enable();
    for _ in 0..1_000_000 {
        arch::cpu_relax();
    }
    arch::irq_disable();
    Ok(0)
}

pub(super) fn sys_panic(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let va = regs.rdi as usize;
    let mut msg = [0u8; 128];
    let len = unsafe {
        (*p).aspace
            .as_ref()
            .and_then(|a| vm::copy_str_from_user(a, &mut msg, va).ok())
            .unwrap_or(0)
    };
    panic!(
        "user panic: {}",
        core::str::from_utf8(&msg[..len]).unwrap_or("(bad message)")
    );
}

pub(super) fn sys_page_alloc(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let va = regs.rdi as usize;
    if va % PGSIZE != 0 || va >= USER_TOP {
        return Err(Error::Inval);
    }
    let pg = kalloc::kallocpage().ok_or(Error::NoMem)?;
    let aspace = unsafe { (*p).aspace.as_mut().ok_or(Error::Fault)? };
    if let Err(e) = aspace.map(va, pg, USER_PAGE) {
        kalloc::kfree(pg);
        return Err(e);
    }
    Ok(0)
}

pub(super) fn sys_map_console(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let va = regs.rdi as usize;
    if va % PGSIZE != 0 || va >= USER_TOP {
        return Err(Error::Inval);
    }
    let aspace = unsafe { (*p).aspace.as_mut().ok_or(Error::Fault)? };
    aspace.map(va, console::console_pa(), USER_PAGE)?;
    Ok(0)
}

pub(super) fn sys_fork(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    unsafe {
        (*p).regs = *regs;
        let pid = proc::fork(p)?;
        Ok(pid as u64)
    }
}

pub(super) fn sys_exit(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    unsafe { proc::exit(p, regs.rdi as i32) };
    cpu::yield_noreturn();
}

pub(super) fn sys_msleep(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    unsafe { timer::msleep(p, regs.rdi) }
}

pub(super) fn sys_waitpid(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let target = regs.rdi as i64 as Pid;
    let status_va = regs.rsi as usize;
    let options = regs.rdx;
    if status_va != 0 {
        let ok = unsafe {
            (*p).aspace
                .as_ref()
                .map(|a| a.range_perm(status_va, 4, PteFlags::U | PteFlags::W))
                .unwrap_or(false)
        };
        if !ok {
            return Err(Error::Fault);
        }
    }
    let (pid, status) = unsafe { proc::waitpid(p, target, options)? };
    if status_va != 0 {
        let aspace = unsafe { (*p).aspace.as_ref().ok_or(Error::Fault)? };
        vm::copy_to_user(aspace, status_va, &status.to_le_bytes())?;
    }
    Ok(pid as u64)
}

pub(super) fn sys_kdisplay(regs: &mut Regs) -> Result<u64> {
    let mode = regs.rdi;
    if mode > KDISPLAY_MEMVIEWER {
        return Err(Error::Inval);
    }
    KDISPLAY.store(mode as i64, Ordering::Relaxed);
    Ok(0)
}
