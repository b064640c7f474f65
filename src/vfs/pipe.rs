// Bounded-buffer pipes.
//
// The ring and the reader/writer counts live in the vnode under its lock;
// the vnode's wait queue carries both directions. Copies never cross the
// ring boundary in one step; the opposite side is woken after every
// non-empty transfer.

use super::Vnode;
use crate::error::{Error, Result};
use crate::param::PIPE_CAPACITY;
use crate::proc;
use crate::wait::Waiter;

/// Read up to `buf.len()` bytes. Blocks while the pipe is empty and a
/// writer remains; an empty pipe with no writers is EOF (returns 0).
pub fn read(vn: &'static Vnode, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let mut w = unsafe { Waiter::new(proc::current()) };
    let mut guard = w.block_until(&vn.wq, &vn.state, |st| {
        let p = st.pipe_mut();
        p.len > 0 || p.writers == 0
    });

    let p = guard.pipe_mut();
    if p.len == 0 {
        return Ok(0); // writers gone
    }

    let mut pos = 0;
    while pos < buf.len() && p.len > 0 {
        let ncopy = (buf.len() - pos).min(PIPE_CAPACITY - p.pos).min(p.len);
        buf[pos..pos + ncopy].copy_from_slice(&p.buf[p.pos..p.pos + ncopy]);
        p.pos = (p.pos + ncopy) % PIPE_CAPACITY;
        p.len -= ncopy;
        pos += ncopy;
    }
    drop(guard);
    vn.wq.wake_all();
    Ok(pos)
}

/// Write up to `buf.len()` bytes. Blocks while the pipe is full and a
/// reader remains; with no readers the write fails with `BrokenPipe`.
pub fn write(vn: &'static Vnode, buf: &[u8]) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let mut w = unsafe { Waiter::new(proc::current()) };
    let mut guard = w.block_until(&vn.wq, &vn.state, |st| {
        let p = st.pipe_mut();
        p.len < PIPE_CAPACITY || p.readers == 0
    });

    let p = guard.pipe_mut();
    if p.readers == 0 {
        return Err(Error::BrokenPipe);
    }

    let mut pos = 0;
    while pos < buf.len() && p.len < PIPE_CAPACITY {
        let windex = (p.pos + p.len) % PIPE_CAPACITY;
        let ncopy = (buf.len() - pos)
            .min(PIPE_CAPACITY - windex)
            .min(PIPE_CAPACITY - p.len);
        p.buf[windex..windex + ncopy].copy_from_slice(&buf[pos..pos + ncopy]);
        p.len += ncopy;
        pos += ncopy;
    }
    drop(guard);
    vn.wq.wake_all();
    Ok(pos)
}
