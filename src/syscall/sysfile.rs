// File-side system calls: argument validation and fan-out to the vfs.

use crate::error::{Error, Result};
use crate::exec;
use crate::param::{ARG_MAX, ARG_STRLEN, PATH_MAX};
use crate::proc::Proc;
use crate::trap::Regs;
use crate::vfs::{self, FdTable, OpenFlags};
use crate::vm::{self, PteFlags};

// Transfers move through a kernel bounce buffer; a call moves at most one
// bufferful and returns the partial count, which callers loop on.
const IOBUF: usize = 512;

unsafe fn fdtable_of<'a>(p: *mut Proc) -> Result<&'a FdTable> {
    let ft = (*p).fdtable;
    if ft.is_null() {
        return Err(Error::BadFd);
    }
    Ok(&*ft)
}

pub(super) fn sys_read(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let (fd, va, n) = (regs.rdi as usize, regs.rsi as usize, regs.rdx as usize);
    let aspace = unsafe { (*p).aspace.as_ref().ok_or(Error::Fault)? };
    if !aspace.range_perm(va, n, PteFlags::U | PteFlags::W) {
        return Err(Error::Fault);
    }
    let ft = unsafe { fdtable_of(p)? };
    let fid = vfs::fd_lookup_ref(ft, fd)?;

    let mut kbuf = [0u8; IOBUF];
    let chunk = n.min(IOBUF);
    let r = vfs::file_read(fid, &mut kbuf[..chunk]);
    let r = match r {
        Ok(got) => vm::copy_to_user(aspace, va, &kbuf[..got]).map(|_| got as u64),
        Err(e) => Err(e),
    };
    vfs::file_deref(fid);
    r
}

pub(super) fn sys_write(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let (fd, va, n) = (regs.rdi as usize, regs.rsi as usize, regs.rdx as usize);
    let aspace = unsafe { (*p).aspace.as_ref().ok_or(Error::Fault)? };
    if !aspace.range_perm(va, n, PteFlags::U) {
        return Err(Error::Fault);
    }
    let ft = unsafe { fdtable_of(p)? };
    let fid = vfs::fd_lookup_ref(ft, fd)?;

    let mut kbuf = [0u8; IOBUF];
    let chunk = n.min(IOBUF);
    let r = match vm::copy_from_user(aspace, &mut kbuf[..chunk], va) {
        Ok(()) => vfs::file_write(fid, &kbuf[..chunk]).map(|got| got as u64),
        Err(e) => Err(e),
    };
    vfs::file_deref(fid);
    r
}

pub(super) fn sys_close(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let ft = unsafe { fdtable_of(p)? };
    vfs::close(ft, regs.rdi as usize)
}

pub(super) fn sys_dup2(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let ft = unsafe { fdtable_of(p)? };
    vfs::dup2(ft, regs.rdi as usize, regs.rsi as usize)
}

pub(super) fn sys_pipe(p: *mut Proc) -> Result<u64> {
    let ft = unsafe { fdtable_of(p)? };
    vfs::make_pipe(ft)
}

pub(super) fn sys_open(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let mut path = [0u8; PATH_MAX];
    let len = {
        let aspace = unsafe { (*p).aspace.as_ref().ok_or(Error::Fault)? };
        vm::copy_str_from_user(aspace, &mut path, regs.rdi as usize)?
    };
    let flags = OpenFlags::from_bits(regs.rsi).ok_or(Error::Inval)?;
    let ft = unsafe { fdtable_of(p)? };
    vfs::open(ft, &path[..len], flags)
}

pub(super) fn sys_execv(p: *mut Proc, regs: &mut Regs) -> Result<u64> {
    let path_va = regs.rdi as usize;
    let argv_va = regs.rsi as usize;
    let argc = regs.rdx as usize;
    if argc > ARG_MAX {
        return Err(Error::Inval);
    }

    let mut path = [0u8; PATH_MAX];
    let mut strs = [[0u8; ARG_STRLEN]; ARG_MAX];
    let mut lens = [0usize; ARG_MAX];
    let path_len;
    {
        let aspace = unsafe { (*p).aspace.as_ref().ok_or(Error::Fault)? };
        path_len = vm::copy_str_from_user(aspace, &mut path, path_va)?;

        // argc pointers plus the terminating null must all be readable.
        if !aspace.range_perm(argv_va, (argc + 1) * 8, PteFlags::U) {
            return Err(Error::Fault);
        }
        for i in 0..=argc {
            let mut raw = [0u8; 8];
            vm::copy_from_user(aspace, &mut raw, argv_va + i * 8)?;
            let ptr = u64::from_le_bytes(raw) as usize;
            if i == argc {
                if ptr != 0 {
                    return Err(Error::Inval);
                }
                break;
            }
            if ptr == 0 {
                return Err(Error::Inval);
            }
            lens[i] = vm::copy_str_from_user(aspace, &mut strs[i], ptr)?;
        }
    }

    let mut args: [&[u8]; ARG_MAX] = [&[]; ARG_MAX];
    for i in 0..argc {
        args[i] = &strs[i][..lens[i]];
    }
    unsafe { exec::execv(p, regs, &path[..path_len], &args[..argc]) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc;
    use crate::param::{PGSIZE, USER_START};
    use crate::proc;
    use crate::syscall::{
        dispatch, SYS_CLOSE, SYS_DUP2, SYS_EXECV, SYS_OPEN, SYS_PIPE, SYS_READ, SYS_WRITE,
    };
    use crate::testing;
    use crate::vfs::memfile;

    // Map one writable user page and return its va.
    unsafe fn map_user_page() -> usize {
        let p = proc::current();
        let pg = kalloc::kallocpage().unwrap();
        core::ptr::write_bytes(vm::pa2ka(pg), 0, PGSIZE);
        (*p).aspace
            .as_mut()
            .unwrap()
            .map(USER_START, pg, PteFlags::W | PteFlags::U)
            .unwrap();
        USER_START
    }

    #[test]
    fn read_write_through_a_pipe() {
        let _t = testing::setup();
        testing::with_user_current(|| unsafe {
            let va = map_user_page();
            let p = proc::current();
            let aspace = (*p).aspace.as_ref().unwrap();

            let mut regs = Regs::zeroed();
            regs.rax = SYS_PIPE;
            let packed = dispatch(&mut regs) as u64;
            let (rfd, wfd) = (packed & 0xffff_ffff, packed >> 32);

            vm::copy_to_user(aspace, va, b"ping!").unwrap();
            regs.rax = SYS_WRITE;
            regs.rdi = wfd;
            regs.rsi = va as u64;
            regs.rdx = 5;
            assert_eq!(dispatch(&mut regs), 5);

            regs.rax = SYS_READ;
            regs.rdi = rfd;
            regs.rsi = (va + 64) as u64;
            regs.rdx = 5;
            assert_eq!(dispatch(&mut regs), 5);
            let mut back = [0u8; 5];
            vm::copy_from_user(aspace, &mut back, va + 64).unwrap();
            assert_eq!(&back, b"ping!");

            regs.rax = SYS_CLOSE;
            regs.rdi = rfd;
            assert_eq!(dispatch(&mut regs), 0);
            // Closed is closed.
            assert_eq!(dispatch(&mut regs), Error::BadFd.code());

            // With the reader gone the write end reports a broken pipe.
            regs.rax = SYS_WRITE;
            regs.rdi = wfd;
            regs.rsi = va as u64;
            regs.rdx = 1;
            assert_eq!(dispatch(&mut regs), Error::BrokenPipe.code());

            regs.rax = SYS_CLOSE;
            regs.rdi = wfd;
            assert_eq!(dispatch(&mut regs), 0);
        });
    }

    #[test]
    fn user_pointers_are_validated_before_io() {
        let _t = testing::setup();
        testing::with_user_current(|| unsafe {
            let va = map_user_page();
            let mut regs = Regs::zeroed();
            regs.rax = SYS_PIPE;
            let packed = dispatch(&mut regs) as u64;
            let (rfd, wfd) = (packed & 0xffff_ffff, packed >> 32);

            // Unmapped buffer.
            regs.rax = SYS_READ;
            regs.rdi = rfd;
            regs.rsi = 0x5000;
            regs.rdx = 4;
            assert_eq!(dispatch(&mut regs), Error::Fault.code());
            // Range runs off the mapped page.
            regs.rsi = (va + PGSIZE - 2) as u64;
            regs.rdx = 8;
            assert_eq!(dispatch(&mut regs), Error::Fault.code());
            // Bad fd.
            regs.rax = SYS_WRITE;
            regs.rdi = 200;
            regs.rsi = va as u64;
            regs.rdx = 1;
            assert_eq!(dispatch(&mut regs), Error::BadFd.code());

            let mut regs2 = Regs::zeroed();
            regs2.rax = SYS_CLOSE;
            regs2.rdi = rfd;
            dispatch(&mut regs2);
            regs2.rdi = wfd;
            dispatch(&mut regs2);
        });
    }

    #[test]
    fn dup2_via_syscall() {
        let _t = testing::setup();
        testing::with_user_current(|| {
            let mut regs = Regs::zeroed();
            regs.rax = SYS_PIPE;
            let packed = dispatch(&mut regs) as u64;
            let (rfd, wfd) = (packed & 0xffff_ffff, packed >> 32);

            regs.rax = SYS_DUP2;
            regs.rdi = rfd;
            regs.rsi = 9;
            assert_eq!(dispatch(&mut regs), 9);
            regs.rdi = 99999;
            assert_eq!(dispatch(&mut regs), Error::BadFd.code());

            for fd in [rfd, wfd, 9] {
                regs.rax = SYS_CLOSE;
                regs.rdi = fd;
                assert_eq!(dispatch(&mut regs), 0);
            }
        });
    }

    #[test]
    fn open_reads_the_path_from_user_memory() {
        let _t = testing::setup();
        testing::with_user_current(|| unsafe {
            memfile::install(b"motd", b"welcome").unwrap();
            let va = map_user_page();
            let p = proc::current();
            let aspace = (*p).aspace.as_ref().unwrap();
            vm::copy_to_user(aspace, va, b"motd\0").unwrap();

            let mut regs = Regs::zeroed();
            regs.rax = SYS_OPEN;
            regs.rdi = va as u64;
            regs.rsi = OpenFlags::OF_READ.bits();
            let fd = dispatch(&mut regs);
            assert!(fd >= 0);

            regs.rax = SYS_READ;
            regs.rdi = fd as u64;
            regs.rsi = (va + 100) as u64;
            regs.rdx = 32;
            assert_eq!(dispatch(&mut regs), 7);

            // Unknown flag bits are rejected.
            regs.rax = SYS_OPEN;
            regs.rdi = va as u64;
            regs.rsi = 1 << 20;
            assert_eq!(dispatch(&mut regs), Error::Inval.code());

            regs.rax = SYS_CLOSE;
            regs.rdi = fd as u64;
            assert_eq!(dispatch(&mut regs), 0);
            memfile::remove(b"motd");
        });
    }

    #[test]
    fn execv_checks_its_argv_contract() {
        let _t = testing::setup();
        testing::with_user_current(|| unsafe {
            memfile::install(b"prog", &[0xccu8; 16]).unwrap();
            let va = map_user_page();
            let p = proc::current();

            // Lay out path, one arg string, and the pointer array in user
            // memory.
            {
                let aspace = (*p).aspace.as_ref().unwrap();
                vm::copy_to_user(aspace, va, b"prog\0").unwrap();
                vm::copy_to_user(aspace, va + 16, b"prog\0").unwrap();
                let ptrs: [u64; 2] = [(va + 16) as u64, 0];
                let mut raw = [0u8; 16];
                for (i, q) in ptrs.iter().enumerate() {
                    raw[i * 8..i * 8 + 8].copy_from_slice(&q.to_le_bytes());
                }
                vm::copy_to_user(aspace, va + 64, &raw).unwrap();
            }

            let mut regs = Regs::zeroed();
            regs.rax = SYS_EXECV;
            regs.rdi = va as u64;
            regs.rsi = (va + 64) as u64;
            regs.rdx = 1;

            // A missing terminator is rejected before anything changes.
            regs.rdx = 2;
            assert_eq!(dispatch(&mut regs), Error::Inval.code());

            regs.rax = SYS_EXECV;
            regs.rdx = 1;
            assert_eq!(dispatch(&mut regs), 0);
            // The frame now enters the fresh image.
            assert_eq!(regs.rip as usize, USER_START);
            assert_eq!(regs.rdi, 1);

            memfile::remove(b"prog");
        });
    }
}
