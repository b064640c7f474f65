// File descriptions, vnodes, and per-process descriptor tables.
//
// A file description is open-file state (permissions, offset, reference
// count) shared by every fd that aliases it; descriptions point at a
// vnode, which supplies the read/write behavior. Descriptions and vnodes
// live in fixed pools and a slot is free exactly when its state is None.

pub mod memfile;
pub mod pipe;
pub mod stream;

use bitflags::bitflags;
use spin::Once;

use crate::error::{Error, Result};
use crate::param::{NFDS, NFILE, NVNODE, PIPE_CAPACITY};
use crate::spinlock::SpinLock;
use crate::wait::WaitQueue;

bitflags! {
    pub struct OpenFlags: u64 {
        const OF_READ   = 1 << 0;
        const OF_WRITE  = 1 << 1;
        const OF_CREATE = 1 << 2;
        const OF_TRUNC  = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Stream,
    Pipe,
    Memfile,
}

pub(crate) struct PipeState {
    pub buf: [u8; PIPE_CAPACITY],
    pub pos: usize, // read index
    pub len: usize,
    pub readers: u32,
    pub writers: u32,
}

impl PipeState {
    const fn new() -> Self {
        PipeState { buf: [0; PIPE_CAPACITY], pos: 0, len: 0, readers: 1, writers: 1 }
    }
}

pub(crate) enum VnodeKind {
    Stream,
    Pipe(PipeState),
    Memfile(usize),
}

pub(crate) struct VnodeState {
    pub refs: u32,
    pub kind: Option<VnodeKind>,
}

impl VnodeState {
    pub(crate) fn pipe_mut(&mut self) -> &mut PipeState {
        match &mut self.kind {
            Some(VnodeKind::Pipe(p)) => p,
            _ => panic!("not a pipe vnode"),
        }
    }
}

pub struct Vnode {
    pub(crate) state: SpinLock<VnodeState>,
    pub(crate) wq: WaitQueue,
}

static VNODES: [Vnode; NVNODE] = {
    const V: Vnode = Vnode {
        state: SpinLock::new("vnode", VnodeState { refs: 0, kind: None }),
        wq: WaitQueue::new("vnode"),
    };
    [V; NVNODE]
};

/// The single keyboard/console endpoint; held alive for the life of the
/// kernel and never destroyed.
pub const STREAM_VNODE: usize = 0;

static VFS_INIT: Once<()> = Once::new();

pub fn init() {
    VFS_INIT.call_once(|| {
        let mut st = VNODES[STREAM_VNODE].state.lock();
        st.refs = 1;
        st.kind = Some(VnodeKind::Stream);
    });
}

pub(crate) fn vnode(vid: usize) -> &'static Vnode {
    &VNODES[vid]
}

fn vnode_alloc(kind: VnodeKind, refs: u32) -> Result<usize> {
    for (i, v) in VNODES.iter().enumerate() {
        let mut st = v.state.lock();
        if st.refs == 0 && st.kind.is_none() {
            st.refs = refs;
            st.kind = Some(kind);
            return Ok(i);
        }
    }
    Err(Error::TooManyFiles)
}

fn vnode_adref(vid: usize) {
    let mut st = VNODES[vid].state.lock();
    if st.refs < 1 {
        panic!("vnode_adref");
    }
    st.refs += 1;
}

// Drop one reference. Pipe descriptions pass which side they held so the
// last close of a side can wake the peer (EOF for readers, broken pipe
// for writers).
fn vnode_deref(vid: usize, pipe_side: Option<bool>) {
    let v = &VNODES[vid];
    let wake = {
        let mut st = v.state.lock();
        let mut wake = false;
        if let Some(write_side) = pipe_side {
            let p = st.pipe_mut();
            if write_side {
                p.writers -= 1;
                wake = p.writers == 0;
            } else {
                p.readers -= 1;
                wake = p.readers == 0;
            }
        }
        if st.refs < 1 {
            panic!("vnode_deref");
        }
        st.refs -= 1;
        if st.refs == 0 {
            st.kind = None;
        }
        wake
    };
    if wake {
        v.wq.wake_all();
    }
}

struct FileState {
    kind: FileKind,
    readable: bool,
    writable: bool,
    vnode: usize,
    off: usize,
    refs: u32,
}

pub struct File {
    state: SpinLock<Option<FileState>>,
}

static FTABLE: [File; NFILE] = {
    const F: File = File { state: SpinLock::new("file", None) };
    [F; NFILE]
};

fn file_alloc(kind: FileKind, readable: bool, writable: bool, vnode: usize) -> Result<usize> {
    for (i, f) in FTABLE.iter().enumerate() {
        let mut st = f.state.lock();
        if st.is_none() {
            *st = Some(FileState { kind, readable, writable, vnode, off: 0, refs: 1 });
            return Ok(i);
        }
    }
    Err(Error::TooManyFiles)
}

pub fn file_adref(fid: usize) {
    let mut st = FTABLE[fid].state.lock();
    let fs = st.as_mut().expect("adref of closed file");
    if fs.refs < 1 {
        panic!("file_adref");
    }
    fs.refs += 1;
}

/// Drop one reference; the last one destroys the description and passes
/// its vnode reference on.
pub fn file_deref(fid: usize) {
    let last = {
        let mut st = FTABLE[fid].state.lock();
        let fs = st.as_mut().expect("deref of closed file");
        if fs.refs < 1 {
            panic!("file_deref");
        }
        fs.refs -= 1;
        if fs.refs == 0 {
            st.take()
        } else {
            None
        }
    };
    if let Some(fs) = last {
        let side = if fs.kind == FileKind::Pipe { Some(fs.writable) } else { None };
        vnode_deref(fs.vnode, side);
    }
}

// Per-process descriptor table: a fixed array of pool indices, -1 when
// closed. Not shared on fork; only the descriptions behind it are.

pub struct FdMap {
    pub refs: u32,
    slots: [i32; NFDS],
}

pub struct FdTable {
    pub map: SpinLock<FdMap>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable { map: SpinLock::new("fdtable", FdMap { refs: 1, slots: [-1; NFDS] }) }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind `fid` to the lowest free fd.
pub fn fd_install(ft: &FdTable, fid: usize) -> Result<usize> {
    let mut m = ft.map.lock();
    for fd in 0..NFDS {
        if m.slots[fd] < 0 {
            m.slots[fd] = fid as i32;
            return Ok(fd);
        }
    }
    Err(Error::TooManyFiles)
}

/// Resolve `fd` to its description, taking a reference that the caller
/// must give back with `file_deref` when the operation completes.
pub fn fd_lookup_ref(ft: &FdTable, fd: usize) -> Result<usize> {
    if fd >= NFDS {
        return Err(Error::BadFd);
    }
    let m = ft.map.lock();
    let fid = m.slots[fd];
    if fid < 0 {
        return Err(Error::BadFd);
    }
    // The table lock pins the description while we take our reference.
    file_adref(fid as usize);
    Ok(fid as usize)
}

pub fn close(ft: &FdTable, fd: usize) -> Result<u64> {
    if fd >= NFDS {
        return Err(Error::BadFd);
    }
    let fid = {
        let mut m = ft.map.lock();
        let fid = m.slots[fd];
        if fid < 0 {
            return Err(Error::BadFd);
        }
        m.slots[fd] = -1;
        fid as usize
    };
    file_deref(fid);
    Ok(0)
}

pub fn dup2(ft: &FdTable, oldfd: usize, newfd: usize) -> Result<u64> {
    if oldfd >= NFDS || newfd >= NFDS {
        return Err(Error::BadFd);
    }
    let displaced = {
        let mut m = ft.map.lock();
        let fid = m.slots[oldfd];
        if fid < 0 {
            return Err(Error::BadFd);
        }
        if oldfd == newfd {
            return Ok(newfd as u64);
        }
        file_adref(fid as usize);
        let prev = m.slots[newfd];
        m.slots[newfd] = fid;
        prev
    };
    if displaced >= 0 {
        file_deref(displaced as usize);
    }
    Ok(newfd as u64)
}

/// Copy `src`'s table into `dst` entry by entry, taking a reference on
/// every shared description. `dst` must be empty.
pub fn clone_table(src: &FdTable, dst: &FdTable) {
    let s = src.map.lock();
    let mut d = dst.map.lock();
    for fd in 0..NFDS {
        let fid = s.slots[fd];
        if fid >= 0 {
            file_adref(fid as usize);
            d.slots[fd] = fid;
        }
    }
}

/// Drop every open description; used at exit.
pub fn close_all(ft: &FdTable) {
    for fd in 0..NFDS {
        let fid = {
            let mut m = ft.map.lock();
            let fid = m.slots[fd];
            m.slots[fd] = -1;
            fid
        };
        if fid >= 0 {
            file_deref(fid as usize);
        }
    }
}

/// Wire fds 0, 1 and 2 to one shared description of the keyboard/console
/// stream, for the first user process.
pub fn open_stream_stdio(ft: &FdTable) -> Result<()> {
    vnode_adref(STREAM_VNODE);
    let fid = match file_alloc(FileKind::Stream, true, true, STREAM_VNODE) {
        Ok(fid) => fid,
        Err(e) => {
            vnode_deref(STREAM_VNODE, None);
            return Err(e);
        }
    };
    for want in 0..3 {
        if want > 0 {
            file_adref(fid);
        }
        match fd_install(ft, fid) {
            Ok(fd) if fd == want => {}
            Ok(fd) => {
                let _ = close(ft, fd);
                return Err(Error::BadFd);
            }
            Err(e) => {
                file_deref(fid);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Create a pipe: one vnode referenced by a read-only and a write-only
/// description, each installed in the table. Returns `rfd | wfd << 32`.
/// Failures undo in reverse.
pub fn make_pipe(ft: &FdTable) -> Result<u64> {
    let vid = vnode_alloc(VnodeKind::Pipe(PipeState::new()), 2)?;
    let rfid = match file_alloc(FileKind::Pipe, true, false, vid) {
        Ok(fid) => fid,
        Err(e) => {
            vnode_deref(vid, Some(false));
            vnode_deref(vid, Some(true));
            return Err(e);
        }
    };
    let wfid = match file_alloc(FileKind::Pipe, false, true, vid) {
        Ok(fid) => fid,
        Err(e) => {
            file_deref(rfid);
            vnode_deref(vid, Some(true));
            return Err(e);
        }
    };
    let rfd = match fd_install(ft, rfid) {
        Ok(fd) => fd,
        Err(e) => {
            file_deref(rfid);
            file_deref(wfid);
            return Err(e);
        }
    };
    let wfd = match fd_install(ft, wfid) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = close(ft, rfd);
            file_deref(wfid);
            return Err(e);
        }
    };
    Ok(rfd as u64 | (wfd as u64) << 32)
}

/// Open a named in-memory file.
pub fn open(ft: &FdTable, name: &[u8], flags: OpenFlags) -> Result<u64> {
    if !flags.intersects(OpenFlags::OF_READ | OpenFlags::OF_WRITE) {
        return Err(Error::Inval);
    }
    let idx = match memfile::find(name) {
        Some(idx) => idx,
        None if flags.contains(OpenFlags::OF_CREATE) => memfile::create(name)?,
        None => return Err(Error::Io),
    };
    if flags.contains(OpenFlags::OF_TRUNC) && flags.contains(OpenFlags::OF_WRITE) {
        memfile::truncate(idx);
    }
    let vid = vnode_alloc(VnodeKind::Memfile(idx), 1)?;
    let fid = match file_alloc(
        FileKind::Memfile,
        flags.contains(OpenFlags::OF_READ),
        flags.contains(OpenFlags::OF_WRITE),
        vid,
    ) {
        Ok(fid) => fid,
        Err(e) => {
            vnode_deref(vid, None);
            return Err(e);
        }
    };
    match fd_install(ft, fid) {
        Ok(fd) => Ok(fd as u64),
        Err(e) => {
            file_deref(fid);
            Err(e)
        }
    }
}

/// Read through a description into a kernel buffer. The vnode decides the
/// blocking behavior; seekable kinds advance the shared offset.
pub fn file_read(fid: usize, buf: &mut [u8]) -> Result<usize> {
    let (kind, vid, readable, off) = {
        let st = FTABLE[fid].state.lock();
        let fs = st.as_ref().ok_or(Error::BadFd)?;
        (fs.kind, fs.vnode, fs.readable, fs.off)
    };
    if !readable {
        return Err(Error::BadFd);
    }
    match kind {
        FileKind::Stream => stream::read(buf),
        FileKind::Pipe => pipe::read(vnode(vid), buf),
        FileKind::Memfile => {
            let idx = memfile_index(vid);
            let n = memfile::read_at(idx, off, buf);
            advance(fid, n);
            Ok(n)
        }
    }
}

pub fn file_write(fid: usize, buf: &[u8]) -> Result<usize> {
    let (kind, vid, writable, off) = {
        let st = FTABLE[fid].state.lock();
        let fs = st.as_ref().ok_or(Error::BadFd)?;
        (fs.kind, fs.vnode, fs.writable, fs.off)
    };
    if !writable {
        return Err(Error::BadFd);
    }
    match kind {
        FileKind::Stream => stream::write(buf),
        FileKind::Pipe => pipe::write(vnode(vid), buf),
        FileKind::Memfile => {
            let idx = memfile_index(vid);
            let n = memfile::write_at(idx, off, buf);
            advance(fid, n);
            Ok(n)
        }
    }
}

fn memfile_index(vid: usize) -> usize {
    let st = VNODES[vid].state.lock();
    match st.kind {
        Some(VnodeKind::Memfile(idx)) => idx,
        _ => panic!("not a memfile vnode"),
    }
}

fn advance(fid: usize, n: usize) {
    let mut st = FTABLE[fid].state.lock();
    if let Some(fs) = st.as_mut() {
        fs.off += n;
    }
}

#[cfg(test)]
pub(crate) fn file_refs(fid: usize) -> u32 {
    FTABLE[fid].state.lock().as_ref().map_or(0, |fs| fs.refs)
}

#[cfg(test)]
pub(crate) fn vnode_refs(vid: usize) -> u32 {
    VNODES[vid].state.lock().refs
}

#[cfg(test)]
pub(crate) fn fd_slot(ft: &FdTable, fd: usize) -> i32 {
    ft.map.lock().slots[fd]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn close_of_closed_fd_is_badf() {
        let _t = testing::setup();
        let ft = FdTable::new();
        assert_eq!(close(&ft, 3), Err(Error::BadFd));
        assert_eq!(close(&ft, NFDS), Err(Error::BadFd));
        assert_eq!(fd_lookup_ref(&ft, 0), Err(Error::BadFd));
    }

    #[test]
    fn pipe_fds_and_refcounts() {
        let _t = testing::setup();
        let ft = FdTable::new();
        let packed = make_pipe(&ft).unwrap();
        let rfd = (packed & 0xffff_ffff) as usize;
        let wfd = (packed >> 32) as usize;
        assert_ne!(rfd, wfd);

        let rfid = fd_slot(&ft, rfd) as usize;
        let wfid = fd_slot(&ft, wfd) as usize;
        assert_eq!(file_refs(rfid), 1);
        assert_eq!(file_refs(wfid), 1);

        // Both descriptions share one vnode with two references.
        let vid = {
            let st = FTABLE[rfid].state.lock();
            st.as_ref().unwrap().vnode
        };
        assert_eq!(vnode_refs(vid), 2);

        close(&ft, rfd).unwrap();
        assert_eq!(file_refs(rfid), 0);
        assert_eq!(vnode_refs(vid), 1);
        close(&ft, wfd).unwrap();
        assert_eq!(vnode_refs(vid), 0);
    }

    #[test]
    fn dup2_aliases_one_description() {
        let _t = testing::setup();
        let ft = FdTable::new();
        let packed = make_pipe(&ft).unwrap();
        let rfd = (packed & 0xffff_ffff) as usize;
        let wfd = (packed >> 32) as usize;
        let rfid = fd_slot(&ft, rfd) as usize;

        assert_eq!(dup2(&ft, rfd, 10), Ok(10));
        assert_eq!(fd_slot(&ft, 10) as usize, rfid);
        // fd conservation: two slots point at the description, refs == 2.
        assert_eq!(file_refs(rfid), 2);

        // Self-dup of an open fd is a no-op.
        assert_eq!(dup2(&ft, rfd, rfd), Ok(rfd as u64));
        assert_eq!(file_refs(rfid), 2);

        // dup2 onto an open fd closes it first.
        let wfid = fd_slot(&ft, wfd) as usize;
        assert_eq!(dup2(&ft, rfd, wfd), Ok(wfd as u64));
        assert_eq!(file_refs(wfid), 0);
        assert_eq!(file_refs(rfid), 3);

        assert_eq!(dup2(&ft, 77, 3), Err(Error::BadFd));

        close_all(&ft);
        assert_eq!(file_refs(rfid), 0);
    }

    #[test]
    fn fork_style_clone_shares_descriptions() {
        let _t = testing::setup();
        let parent = FdTable::new();
        let packed = make_pipe(&parent).unwrap();
        let rfd = (packed & 0xffff_ffff) as usize;
        let rfid = fd_slot(&parent, rfd) as usize;

        let child = FdTable::new();
        clone_table(&parent, &child);
        assert_eq!(fd_slot(&child, rfd) as usize, rfid);
        assert_eq!(file_refs(rfid), 2);

        close_all(&child);
        assert_eq!(file_refs(rfid), 1);
        close_all(&parent);
        assert_eq!(file_refs(rfid), 0);
    }

    #[test]
    fn stdio_shares_one_stream_description() {
        let _t = testing::setup();
        let before = vnode_refs(STREAM_VNODE);
        let ft = FdTable::new();
        open_stream_stdio(&ft).unwrap();
        let fid = fd_slot(&ft, 0) as usize;
        assert_eq!(fd_slot(&ft, 1) as usize, fid);
        assert_eq!(fd_slot(&ft, 2) as usize, fid);
        assert_eq!(file_refs(fid), 3);
        assert_eq!(vnode_refs(STREAM_VNODE), before + 1);

        close_all(&ft);
        // The stream vnode survives its last description.
        assert_eq!(vnode_refs(STREAM_VNODE), before);
    }

    #[test]
    fn open_memfile_and_read_back() {
        let _t = testing::setup();
        memfile::install(b"greeting", b"hello, bird").unwrap();
        let ft = FdTable::new();
        let fd = open(&ft, b"greeting", OpenFlags::OF_READ).unwrap() as usize;
        let fid = fd_lookup_ref(&ft, fd).unwrap();

        let mut buf = [0u8; 32];
        let n = file_read(fid, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello, bird");
        // Offset advanced; the next read sees EOF.
        assert_eq!(file_read(fid, &mut buf).unwrap(), 0);
        // Write through a read-only description is refused.
        assert_eq!(file_write(fid, b"x"), Err(Error::BadFd));

        file_deref(fid);
        close_all(&ft);
        memfile::remove(b"greeting");
    }

    #[test]
    fn open_missing_without_create_fails() {
        let _t = testing::setup();
        let ft = FdTable::new();
        assert_eq!(open(&ft, b"nope", OpenFlags::OF_READ), Err(Error::Io));
        assert_eq!(open(&ft, b"nope", OpenFlags::OF_CREATE), Err(Error::Inval));
        let fd = open(
            &ft,
            b"made",
            OpenFlags::OF_READ | OpenFlags::OF_WRITE | OpenFlags::OF_CREATE,
        )
        .unwrap() as usize;
        // Created empty: no growth on write, so reads and writes see 0.
        let fid = fd_lookup_ref(&ft, fd).unwrap();
        assert_eq!(file_write(fid, b"data").unwrap(), 0);
        let mut buf = [0u8; 4];
        assert_eq!(file_read(fid, &mut buf).unwrap(), 0);
        file_deref(fid);
        close_all(&ft);
        memfile::remove(b"made");
    }
}
