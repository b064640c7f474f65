// Named in-memory files.
//
// Each entry owns a fixed-capacity byte buffer and a length. These back
// both the memfile vnodes and the program images `execv` loads. Reads and
// writes clamp at the current length; the length only changes through
// `install` and `truncate`.

use crate::error::{Error, Result};
use crate::param::{MEMFILE_CAPACITY, MEMFILE_NAMESZ, NMEMFILE};
use crate::spinlock::SpinLock;

pub struct MemFile {
    name: [u8; MEMFILE_NAMESZ],
    name_len: usize,
    data: [u8; MEMFILE_CAPACITY],
    len: usize,
}

impl MemFile {
    fn named(name: &[u8]) -> MemFile {
        let mut f = MemFile {
            name: [0; MEMFILE_NAMESZ],
            name_len: name.len(),
            data: [0; MEMFILE_CAPACITY],
            len: 0,
        };
        f.name[..name.len()].copy_from_slice(name);
        f
    }
}

struct Registry {
    files: [Option<MemFile>; NMEMFILE],
}

static REGISTRY: SpinLock<Registry> = {
    const NONE: Option<MemFile> = None;
    SpinLock::new("memfile", Registry { files: [NONE; NMEMFILE] })
};

/// Install (or replace) a named file with the given contents. The boot
/// path uses this to seed program images.
pub fn install(name: &[u8], data: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > MEMFILE_NAMESZ || data.len() > MEMFILE_CAPACITY {
        return Err(Error::Inval);
    }
    let mut reg = REGISTRY.lock();
    let slot = match find_locked(&reg, name) {
        Some(idx) => idx,
        None => reg
            .files
            .iter()
            .position(|f| f.is_none())
            .ok_or(Error::TooManyFiles)?,
    };
    let mut f = MemFile::named(name);
    f.data[..data.len()].copy_from_slice(data);
    f.len = data.len();
    reg.files[slot] = Some(f);
    Ok(())
}

fn find_locked(reg: &Registry, name: &[u8]) -> Option<usize> {
    reg.files.iter().position(|f| match f {
        Some(f) => &f.name[..f.name_len] == name,
        None => false,
    })
}

pub fn find(name: &[u8]) -> Option<usize> {
    find_locked(&REGISTRY.lock(), name)
}

/// Create an empty named file.
pub fn create(name: &[u8]) -> Result<usize> {
    if name.is_empty() || name.len() > MEMFILE_NAMESZ {
        return Err(Error::Inval);
    }
    let mut reg = REGISTRY.lock();
    if let Some(idx) = find_locked(&reg, name) {
        return Ok(idx);
    }
    let slot = reg
        .files
        .iter()
        .position(|f| f.is_none())
        .ok_or(Error::TooManyFiles)?;
    reg.files[slot] = Some(MemFile::named(name));
    Ok(slot)
}

pub fn truncate(idx: usize) {
    let mut reg = REGISTRY.lock();
    if let Some(f) = reg.files[idx].as_mut() {
        f.len = 0;
    }
}

/// Copy out `min(buf.len(), len - off)` bytes from offset `off`.
pub fn read_at(idx: usize, off: usize, buf: &mut [u8]) -> usize {
    let reg = REGISTRY.lock();
    let f = match reg.files[idx].as_ref() {
        Some(f) => f,
        None => return 0,
    };
    if off >= f.len {
        return 0;
    }
    let n = buf.len().min(f.len - off);
    buf[..n].copy_from_slice(&f.data[off..off + n]);
    n
}

/// Copy in at most `len - off` bytes at offset `off`; the file never
/// grows on write.
pub fn write_at(idx: usize, off: usize, buf: &[u8]) -> usize {
    let mut reg = REGISTRY.lock();
    let f = match reg.files[idx].as_mut() {
        Some(f) => f,
        None => return 0,
    };
    if off >= f.len {
        return 0;
    }
    let n = buf.len().min(f.len - off);
    f.data[off..off + n].copy_from_slice(&buf[..n]);
    n
}

/// Run `f` over the file's current contents (for the image loader).
pub fn with_data<R>(idx: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
    let reg = REGISTRY.lock();
    reg.files[idx].as_ref().map(|m| f(&m.data[..m.len]))
}

#[cfg(test)]
pub(crate) fn remove(name: &[u8]) {
    let mut reg = REGISTRY.lock();
    if let Some(idx) = find_locked(&reg, name) {
        reg.files[idx] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_and_write_clamp_to_length() {
        install(b"clamp", b"0123456789").unwrap();
        let idx = find(b"clamp").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(read_at(idx, 8, &mut buf), 2);
        assert_eq!(&buf[..2], b"89");
        assert_eq!(read_at(idx, 10, &mut buf), 0);
        assert_eq!(read_at(idx, 99, &mut buf), 0);

        assert_eq!(write_at(idx, 8, b"xyz"), 2);
        assert_eq!(read_at(idx, 6, &mut buf), 4);
        assert_eq!(&buf, b"67xy");

        remove(b"clamp");
    }

    #[test]
    fn truncate_resets_length() {
        install(b"trunc", b"contents").unwrap();
        let idx = find(b"trunc").unwrap();
        truncate(idx);
        let mut buf = [0u8; 8];
        assert_eq!(read_at(idx, 0, &mut buf), 0);
        assert_eq!(write_at(idx, 0, b"z"), 0);
        remove(b"trunc");
    }

    #[test]
    fn install_validates_and_replaces() {
        assert_eq!(install(b"", b"x"), Err(Error::Inval));
        let long = [b'n'; MEMFILE_NAMESZ + 1];
        assert_eq!(install(&long, b"x"), Err(Error::Inval));

        install(b"twice", b"first").unwrap();
        install(b"twice", b"second!").unwrap();
        let idx = find(b"twice").unwrap();
        let mut buf = [0u8; 16];
        let n = read_at(idx, 0, &mut buf);
        assert_eq!(&buf[..n], b"second!");
        remove(b"twice");
    }
}
