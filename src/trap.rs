// Exception and system-call entry.
//
// The external vector stubs push the machine state onto the current
// task's kernel stack as a `Regs`, switch to the kernel address space,
// and call `exception` or `syscall_entry`. On return they restore the
// frame and drop back to the interrupted context; the APIC acknowledge
// also happens in the stubs.

use log::error;

use crate::arch;
use crate::cpu;
use crate::proc;
use crate::syscall;
use crate::timer;

/// Saved machine state at trap time. Field order is ABI: the entry stubs
/// and `arch`'s user-return path address this layout by offset.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub intno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

// GDT selectors established by the boot path.
pub const USER_CS: u64 = 0x23;
pub const USER_SS: u64 = 0x1b;
pub const RFLAGS_IF: u64 = 0x200;

impl Regs {
    pub const fn zeroed() -> Regs {
        Regs {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            intno: 0,
            err: 0,
            rip: 0,
            cs: USER_CS,
            rflags: RFLAGS_IF,
            rsp: 0,
            ss: USER_SS,
        }
    }

    /// Fresh user-mode frame entering at `rip` with stack `rsp`.
    pub fn user_entry(rip: usize, rsp: usize) -> Regs {
        let mut r = Regs::zeroed();
        r.rip = rip as u64;
        r.rsp = rsp as u64;
        r
    }

    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

pub const INT_PAGEFAULT: u64 = 14;
pub const INT_IRQ: u64 = 32;
pub const IRQ_TIMER: u64 = 0;
pub const IRQ_KEYBOARD: u64 = 1;

const PFERR_WRITE: u64 = 2;
const PFERR_USER: u64 = 4;

/// Exception handler: interrupts, traps and faults.
pub extern "C" fn exception(regs: &mut Regs) {
    match regs.intno {
        n if n == INT_IRQ + IRQ_TIMER => {
            let cpu = cpu::this_cpu();
            if cpu.index == 0 {
                timer::on_tick();
            }
            if regs.from_user() {
                // Preempt: park the user frame in the task and restart it
                // from there next time it is scheduled.
                let p = cpu.current;
                unsafe { (*p).regs = *regs };
                cpu::yield_noreturn();
            }
            // Kernel context (idle, or a task mid-syscall): just return.
        }

        n if n == INT_PAGEFAULT => {
            let addr = arch::fault_addr();
            let op = if regs.err & PFERR_WRITE != 0 { "write" } else { "read" };
            if regs.err & PFERR_USER == 0 {
                panic!(
                    "kernel page fault for {:#x} ({}, rip={:#x})",
                    addr, op, regs.rip
                );
            }
            let p = cpu::current();
            unsafe {
                error!(
                    "process {} page fault for {:#x} ({}, rip={:#x})",
                    (*p).pid,
                    addr,
                    op,
                    regs.rip
                );
                // The task is done for: release its files, memory and
                // children now, and leave a Broken record that is never
                // scheduled again but stays visible to waitpid.
                (*p).regs = *regs;
                proc::broken(p);
            }
            cpu::yield_noreturn();
        }

        n if n == INT_IRQ + IRQ_KEYBOARD => {
            // Byte decoding lives in the external keyboard driver, which
            // feeds console::keyboard_interrupt.
        }

        n => panic!("unexpected exception {}", n),
    }
}

/// System-call entry: dispatch and store the return value where the stub
/// will restore it into rax.
pub extern "C" fn syscall_entry(regs: &mut Regs) {
    let r = syscall::dispatch(regs);
    regs.rax = r as u64;
}
