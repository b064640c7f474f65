// System-call numbers and dispatch.
//
// Numbers are user ABI and stable. Every handler validates its user
// pointers for the required permission before touching them; the
// dispatcher flattens `Result` into the negative-code register
// convention.

pub mod sysfile;
pub mod sysproc;

use log::warn;

use crate::error::Error;
use crate::proc;
use crate::trap::Regs;

pub const SYS_GETPID: u64 = 1;
pub const SYS_YIELD: u64 = 2;
pub const SYS_PAUSE: u64 = 3;
pub const SYS_PANIC: u64 = 4;
pub const SYS_PAGE_ALLOC: u64 = 5;
pub const SYS_FORK: u64 = 6;
pub const SYS_EXIT: u64 = 7;
pub const SYS_MAP_CONSOLE: u64 = 8;
pub const SYS_MSLEEP: u64 = 9;
pub const SYS_GETPPID: u64 = 10;
pub const SYS_KDISPLAY: u64 = 100;
pub const SYS_READ: u64 = 101;
pub const SYS_WRITE: u64 = 102;
pub const SYS_CLOSE: u64 = 103;
pub const SYS_DUP2: u64 = 104;
pub const SYS_PIPE: u64 = 105;
pub const SYS_EXECV: u64 = 106;
pub const SYS_WAITPID: u64 = 107;
pub const SYS_OPEN: u64 = 108;

/// Fan a trapped system call out to its handler. `regs` is the caller's
/// live frame; the return value lands in rax.
pub fn dispatch(regs: &mut Regs) -> i64 {
    let p = proc::current();
    let r = match regs.rax {
        SYS_GETPID => sysproc::sys_getpid(p),
        SYS_YIELD => sysproc::sys_yield(),
        SYS_PAUSE => sysproc::sys_pause(),
        SYS_PANIC => sysproc::sys_panic(p, regs),
        SYS_PAGE_ALLOC => sysproc::sys_page_alloc(p, regs),
        SYS_FORK => sysproc::sys_fork(p, regs),
        SYS_EXIT => sysproc::sys_exit(p, regs),
        SYS_MAP_CONSOLE => sysproc::sys_map_console(p, regs),
        SYS_MSLEEP => sysproc::sys_msleep(p, regs),
        SYS_GETPPID => sysproc::sys_getppid(p),
        SYS_KDISPLAY => sysproc::sys_kdisplay(regs),
        SYS_READ => sysfile::sys_read(p, regs),
        SYS_WRITE => sysfile::sys_write(p, regs),
        SYS_CLOSE => sysfile::sys_close(p, regs),
        SYS_DUP2 => sysfile::sys_dup2(p, regs),
        SYS_PIPE => sysfile::sys_pipe(p),
        SYS_EXECV => sysfile::sys_execv(p, regs),
        SYS_WAITPID => sysproc::sys_waitpid(p, regs),
        SYS_OPEN => sysfile::sys_open(p, regs),
        num => {
            unsafe { warn!("{}: unknown sys call {}", (*p).pid, num) };
            Err(Error::NoSys)
        }
    };
    match r {
        Ok(v) => v as i64,
        Err(e) => e.code(),
    }
}
