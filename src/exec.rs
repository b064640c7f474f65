// Program image loading for process setup and execv.
//
// Images are flat binaries held by the memfile registry; the loader copies
// one into fresh frames at USER_START, aliases the console page, and
// builds the initial stack: argument strings packed downward from the top,
// then the pointer array with one extra slot for the terminating null.

use crate::arch;
use crate::console;
use crate::error::{Error, Result};
use crate::kalloc;
use crate::param::{ARG_MAX, PGSIZE, USER_START, USER_TOP};
use crate::proc::{self, Proc};
use crate::trap::Regs;
use crate::vfs::memfile;
use crate::vm::{pa2ka, AddressSpace, PteFlags};

pub struct Image {
    pub entry: usize,
    pub rsp: usize,
    pub argc: usize,
    pub argv_va: usize,
}

const USER_RWX: PteFlags = PteFlags::from_bits_truncate(
    PteFlags::P.bits() | PteFlags::W.bits() | PteFlags::U.bits(),
);

/// Copy the image named `path` into `aspace` and build its entry state.
/// On failure the caller owns whatever was partially mapped (a full
/// address-space teardown releases it).
pub fn build_image(aspace: &mut AddressSpace, path: &[u8], args: &[&[u8]]) -> Result<Image> {
    if args.len() > ARG_MAX {
        return Err(Error::Inval);
    }
    let idx = memfile::find(path).ok_or(Error::Io)?;
    let size = memfile::with_data(idx, |d| d.len()).ok_or(Error::Io)?;
    if size == 0 || USER_START + size > USER_TOP - PGSIZE {
        return Err(Error::Io);
    }

    // Text and data, page by page.
    let mut off = 0;
    while off < size {
        let pg = kalloc::kallocpage().ok_or(Error::NoMem)?;
        let n = (size - off).min(PGSIZE);
        memfile::with_data(idx, |d| unsafe {
            core::ptr::copy_nonoverlapping(d.as_ptr().add(off), pa2ka(pg), n);
            core::ptr::write_bytes(pa2ka(pg).add(n), 0, PGSIZE - n);
        });
        if let Err(e) = aspace.map(USER_START + off, pg, USER_RWX) {
            kalloc::kfree(pg);
            return Err(e);
        }
        off += PGSIZE;
    }

    // The CGA page sits below the user ceiling; alias it in place so the
    // image can draw without asking.
    let console_pa = console::console_pa();
    if console_pa < USER_TOP {
        aspace.map(console_pa, console_pa, USER_RWX)?;
    }

    // Initial stack page, with the argument block at its top.
    let stk = kalloc::kallocpage().ok_or(Error::NoMem)?;
    unsafe { core::ptr::write_bytes(pa2ka(stk), 0, PGSIZE) };
    if let Err(e) = aspace.map(USER_TOP - PGSIZE, stk, USER_RWX) {
        kalloc::kfree(stk);
        return Err(e);
    }

    let page = pa2ka(stk);
    let base_va = USER_TOP - PGSIZE;
    let mut top = PGSIZE;
    let mut ptrs = [0u64; ARG_MAX + 1];
    for (i, a) in args.iter().enumerate() {
        top -= a.len() + 1;
        unsafe {
            core::ptr::copy_nonoverlapping(a.as_ptr(), page.add(top), a.len());
            page.add(top + a.len()).write(0);
        }
        ptrs[i] = (base_va + top) as u64;
    }
    top &= !7;
    top -= 8 * (args.len() + 1); // argv[argc] is the null terminator
    for (i, ptr) in ptrs.iter().take(args.len() + 1).enumerate() {
        unsafe { (page.add(top) as *mut u64).add(i).write(*ptr) };
    }
    let argv_va = base_va + top;

    Ok(Image {
        entry: USER_START,
        rsp: argv_va & !0xf,
        argc: args.len(),
        argv_va,
    })
}

/// Replace the calling process's image with `path`. Keeps the pid, the
/// fdtable and the parent; does not return to the old image on success —
/// the rewritten frame enters the new one. On failure the old image is
/// untouched.
///
/// # Safety
/// `p` must be the calling task's record and `regs` its live frame.
pub unsafe fn execv(p: *mut Proc, regs: &mut Regs, path: &[u8], args: &[&[u8]]) -> Result<u64> {
    let mut aspace = AddressSpace::new()?;
    let image = match build_image(&mut aspace, path, args) {
        Ok(image) => image,
        Err(e) => {
            proc::destroy_address_space(aspace);
            return Err(e);
        }
    };

    *regs = Regs::user_entry(image.entry, image.rsp);
    regs.rdi = image.argc as u64;
    regs.rsi = image.argv_va as u64;
    (*p).regs = *regs;
    (*p).set_name(path);

    // Install the new space before tearing down the one this call
    // arrived on.
    let old = (*p).aspace.replace(aspace);
    arch::set_pagetable((*p).aspace.as_ref().map(|a| a.root_pa()).unwrap_or(0));
    if let Some(old) = old {
        proc::destroy_address_space(old);
    }
    Ok(0)
}
