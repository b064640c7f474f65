// System-wide constants.

/// Maximum number of CPUs the kernel will drive.
pub const NCPU: usize = 8;

/// Process-table capacity (and therefore the largest pid + 1).
pub const NPROC: usize = 16;

/// Per-process file-descriptor table capacity.
pub const NFDS: usize = 256;

/// Global file-description pool capacity.
pub const NFILE: usize = 128;

/// Global vnode pool capacity.
pub const NVNODE: usize = 64;

/// Named in-memory file capacity.
pub const NMEMFILE: usize = 16;
pub const MEMFILE_NAMESZ: usize = 32;
pub const MEMFILE_CAPACITY: usize = 4096;

/// Pipe ring-buffer capacity in bytes.
pub const PIPE_CAPACITY: usize = 16;

/// Timer interrupts per second; one tick is 10 ms.
pub const HZ: u64 = 100;

/// Sleep-wheel slot count.
pub const WHEEL_SIZE: usize = 8;

// Physical page geometry. An order-k buddy block is 2^k bytes; the
// smallest block is one page, the largest 2 MiB.
pub const PAGE_SHIFT: usize = 12;
pub const PGSIZE: usize = 1 << PAGE_SHIFT;
pub const MIN_ORDER: usize = 12;
pub const MAX_ORDER: usize = 21;
pub const ORDER_COUNT: usize = MAX_ORDER - MIN_ORDER + 1;

/// Page-record capacity of the allocator: the largest physical window it
/// will manage, in pages (4 MiB).
pub const PHYS_PAGES: usize = 1024;

/// First user virtual address an image may occupy.
pub const USER_START: usize = 0x10_0000;

/// One past the highest user virtual address; the initial stack page sits
/// just below it.
pub const USER_TOP: usize = 0x30_0000;

/// Stack canary stamped into process and CPU records.
pub const CANARY: u64 = 0x4649_4e43__4b52_4e4c;

/// Longest program name `execv`/`open` accept, including the terminator.
pub const PATH_MAX: usize = 32;

/// argv limits for `execv`: at most ARG_MAX pointers, each string at most
/// ARG_STRLEN bytes including the terminator.
pub const ARG_MAX: usize = 8;
pub const ARG_STRLEN: usize = 64;
