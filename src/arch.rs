// Thin seam over the privileged x86-64 instructions the rest of the kernel
// needs: the interrupt flag, HLT, CR3 loads, the per-CPU index, kernel
// context switches, and the return-to-user path. Hosted test builds get
// stand-ins at the bottom of the file so the pure-logic subsystems can run
// under the host test harness.

use crate::trap::Regs;

/// Saved callee-saved register set for kernel context switches.
/// Layout is fixed; `__finch_ctx_switch` below addresses it by offset.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rbp: u64, // 0x08
    pub rbx: u64, // 0x10
    pub r12: u64, // 0x18
    pub r13: u64, // 0x20
    pub r14: u64, // 0x28
    pub r15: u64, // 0x30
}

impl Context {
    pub const fn zero() -> Self {
        Context { rsp: 0, rbp: 0, rbx: 0, r12: 0, r13: 0, r14: 0, r15: 0 }
    }

    /// Build a context that, when switched to, starts running `entry` on
    /// `kstack_top`. The entry address is planted where `ret` will find it,
    /// leaving the stack with call-like alignment on arrival.
    ///
    /// # Safety
    /// `kstack_top` must be the one-past-the-end address of a live, 16-byte
    /// aligned kernel stack.
    pub unsafe fn kernel_entry(entry: extern "C" fn() -> !, kstack_top: usize) -> Self {
        let slot = (kstack_top - 16) as *mut u64;
        slot.write(entry as usize as u64);
        let mut ctx = Context::zero();
        ctx.rsp = slot as u64;
        ctx
    }
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    // __finch_ctx_switch(old: *mut Context (rdi), new: *const Context (rsi))
    //
    // Saves the callee-saved registers into *old and restores *new; the
    // final ret resumes whatever call site last saved *new.
    .global __finch_ctx_switch
    __finch_ctx_switch:
        mov [rdi + 0x00], rsp
        mov [rdi + 0x08], rbp
        mov [rdi + 0x10], rbx
        mov [rdi + 0x18], r12
        mov [rdi + 0x20], r13
        mov [rdi + 0x28], r14
        mov [rdi + 0x30], r15
        mov rsp, [rsi + 0x00]
        mov rbp, [rsi + 0x08]
        mov rbx, [rsi + 0x10]
        mov r12, [rsi + 0x18]
        mov r13, [rsi + 0x20]
        mov r14, [rsi + 0x28]
        mov r15, [rsi + 0x30]
        ret

    // __finch_user_return(regs: *const Regs (rdi)) -> !
    //
    // Rebuilds the interrupt frame from a saved Regs (see trap.rs for the
    // layout) and drops to user mode. Offsets: rax 0x00, rbx 0x08, rcx
    // 0x10, rdx 0x18, rsi 0x20, rdi 0x28, rbp 0x30, r8..r15 0x38..0x70,
    // intno 0x78, err 0x80, rip 0x88, cs 0x90, rflags 0x98, rsp 0xa0,
    // ss 0xa8.
    .global __finch_user_return
    __finch_user_return:
        push qword ptr [rdi + 0xa8]
        push qword ptr [rdi + 0xa0]
        push qword ptr [rdi + 0x98]
        push qword ptr [rdi + 0x90]
        push qword ptr [rdi + 0x88]
        mov rax, [rdi + 0x00]
        mov rbx, [rdi + 0x08]
        mov rcx, [rdi + 0x10]
        mov rdx, [rdi + 0x18]
        mov rsi, [rdi + 0x20]
        mov rbp, [rdi + 0x30]
        mov r8,  [rdi + 0x38]
        mov r9,  [rdi + 0x40]
        mov r10, [rdi + 0x48]
        mov r11, [rdi + 0x50]
        mov r12, [rdi + 0x58]
        mov r13, [rdi + 0x60]
        mov r14, [rdi + 0x68]
        mov r15, [rdi + 0x70]
        mov rdi, [rdi + 0x28]
        iretq
    "#
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn __finch_ctx_switch(old: *mut Context, new: *const Context);
    fn __finch_user_return(regs: *const Regs) -> !;
}

/// Switch kernel contexts: save into `old`, resume `new`.
///
/// # Safety
/// Both pointers must reference valid contexts; `new` must have been filled
/// by a previous switch or by `Context::kernel_entry`. Interrupts must be
/// disabled.
#[cfg(target_arch = "x86_64")]
pub unsafe fn swtch(old: *mut Context, new: *const Context) {
    __finch_ctx_switch(old, new);
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn swtch(_old: *mut Context, _new: *const Context) {
    unimplemented!("context switch is x86-64 only");
}

/// Restore a saved user register frame and enter user mode.
///
/// # Safety
/// `regs` must hold a complete user-mode frame and the matching address
/// space must be active.
#[cfg(target_arch = "x86_64")]
pub unsafe fn user_return(regs: &Regs) -> ! {
    __finch_user_return(regs)
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn user_return(_regs: &Regs) -> ! {
    unimplemented!("user return is x86-64 only");
}

/// Relax the CPU inside a spin loop.
pub fn cpu_relax() {
    core::hint::spin_loop();
}

#[cfg(all(target_arch = "x86_64", not(test)))]
mod imp {
    use x86_64::instructions::{hlt, interrupts};
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::PhysAddr;

    pub fn irq_enabled() -> bool {
        interrupts::are_enabled()
    }

    pub fn irq_disable() {
        interrupts::disable();
    }

    pub fn irq_enable() {
        interrupts::enable();
    }

    /// Stop the CPU until the next interrupt.
    pub fn halt() {
        hlt();
    }

    /// Load a new address-space root.
    ///
    /// # Safety
    /// `root_pa` must be the physical address of a valid top-level page
    /// table that maps the currently executing kernel text and stack.
    pub unsafe fn set_pagetable(root_pa: usize) {
        let frame = PhysFrame::containing_address(PhysAddr::new(root_pa as u64));
        Cr3::write(frame, Cr3Flags::empty());
    }

    /// Index of the executing CPU. The boot stub stores it at gs:0 before
    /// entering the kernel proper; interrupts must be disabled so the task
    /// cannot migrate mid-read.
    pub fn cpu_index() -> usize {
        let idx: u64;
        unsafe {
            core::arch::asm!("mov {0}, gs:[0]", out(reg) idx, options(nostack));
        }
        idx as usize
    }

    /// Faulting address of the most recent page fault.
    pub fn fault_addr() -> usize {
        x86_64::registers::control::Cr2::read().as_u64() as usize
    }
}

#[cfg(all(not(target_arch = "x86_64"), not(test)))]
mod imp {
    pub fn irq_enabled() -> bool {
        false
    }
    pub fn irq_disable() {}
    pub fn irq_enable() {}
    pub fn halt() {}
    pub unsafe fn set_pagetable(_root_pa: usize) {}
    pub fn cpu_index() -> usize {
        0
    }
    pub fn fault_addr() -> usize {
        0
    }
}


pub use imp::{cpu_index, fault_addr, halt, irq_disable, irq_enable, irq_enabled, set_pagetable};
