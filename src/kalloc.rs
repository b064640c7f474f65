// Physical page allocator.
//
// Pages are grouped into buddy blocks: physically contiguous power-of-two
// runs aligned to their own size, order MIN_ORDER (one page) through
// MAX_ORDER (2 MiB). Every managed frame has a page record carrying the
// order of its containing block, a free bit, and a block-head bit; only
// block heads are linked into the per-order free lists. A single lock
// protects the records and all lists.

use crate::param::{MAX_ORDER, MIN_ORDER, ORDER_COUNT, PAGE_SHIFT, PGSIZE, PHYS_PAGES};
use crate::spinlock::SpinLock;

use log::{info, warn};
use spin::Once;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemKind {
    Available,
    Reserved,
}

/// One physical address range reported by the boot memory map.
#[derive(Clone, Copy, Debug)]
pub struct MemRange {
    pub start: usize,
    pub end: usize,
    pub kind: MemKind,
}

const NO_ORDER: u8 = 0xff;
const NIL: u32 = u32::MAX;

#[derive(Clone, Copy)]
struct PageInfo {
    order: u8, // log2 of the containing block size; NO_ORDER outside any block
    free: bool,
    head: bool, // this frame starts its buddy block
    prev: u32,  // free-list links, meaningful only for free heads
    next: u32,
}

impl PageInfo {
    const fn unmanaged() -> Self {
        PageInfo { order: NO_ORDER, free: false, head: false, prev: NIL, next: NIL }
    }
}

#[derive(Clone, Copy)]
struct FreeList {
    head: u32,
    tail: u32,
}

impl FreeList {
    const fn empty() -> Self {
        FreeList { head: NIL, tail: NIL }
    }
}

pub struct BuddyAllocator {
    base_pn: usize, // first frame of the managed window; 2 MiB aligned
    npages: usize,  // window length in frames, at most PHYS_PAGES
    pages: [PageInfo; PHYS_PAGES],
    lists: [FreeList; ORDER_COUNT], // index 0 holds order MIN_ORDER heads
}

fn log2_floor(x: usize) -> usize {
    debug_assert!(x != 0);
    usize::BITS as usize - 1 - x.leading_zeros() as usize
}

// Smallest order whose block covers `size` bytes.
fn order_for(size: usize) -> usize {
    if size <= PGSIZE {
        MIN_ORDER
    } else {
        log2_floor(size - 1) + 1
    }
}

impl BuddyAllocator {
    pub const fn new() -> Self {
        BuddyAllocator {
            base_pn: 0,
            npages: 0,
            pages: [PageInfo::unmanaged(); PHYS_PAGES],
            lists: [FreeList::empty(); ORDER_COUNT],
        }
    }

    fn idx_of(&self, pa: usize) -> usize {
        (pa >> PAGE_SHIFT) - self.base_pn
    }

    fn pa_of(&self, idx: usize) -> usize {
        (self.base_pn + idx) << PAGE_SHIFT
    }

    // Free-list plumbing. Links live in the page records themselves.

    fn push(&mut self, ord: usize, idx: usize) {
        debug_assert!(self.pages[idx].head && self.pages[idx].free);
        debug_assert_eq!(self.pages[idx].order as usize, ord);
        let l = &mut self.lists[ord - MIN_ORDER];
        self.pages[idx].prev = l.tail;
        self.pages[idx].next = NIL;
        if l.tail != NIL {
            self.pages[l.tail as usize].next = idx as u32;
        } else {
            l.head = idx as u32;
        }
        l.tail = idx as u32;
    }

    fn pop(&mut self, ord: usize) -> Option<usize> {
        let l = self.lists[ord - MIN_ORDER];
        if l.head == NIL {
            return None;
        }
        let idx = l.head as usize;
        self.unlink(ord, idx);
        Some(idx)
    }

    fn unlink(&mut self, ord: usize, idx: usize) {
        let (prev, next) = (self.pages[idx].prev, self.pages[idx].next);
        let l = &mut self.lists[ord - MIN_ORDER];
        if prev != NIL {
            self.pages[prev as usize].next = next;
        } else {
            l.head = next;
        }
        let l = &mut self.lists[ord - MIN_ORDER];
        if next != NIL {
            self.pages[next as usize].prev = prev;
        } else {
            l.tail = prev;
        }
        self.pages[idx].prev = NIL;
        self.pages[idx].next = NIL;
    }

    /// Seed the allocator from the boot memory map. For each available
    /// range, greedily emit the largest aligned block that fits at the
    /// current address, clamped at MAX_ORDER, and advance past it.
    pub fn seed<I>(&mut self, ranges: I)
    where
        I: IntoIterator<Item = MemRange>,
    {
        let mut seen_base = false;
        for r in ranges {
            if r.kind != MemKind::Available || r.end <= r.start {
                continue;
            }
            if !seen_base {
                // Anchor the window at a 2 MiB boundary so the XOR buddy
                // of any in-window block stays in-window.
                let base = r.start & !((1usize << MAX_ORDER) - 1);
                self.base_pn = base >> PAGE_SHIFT;
                self.npages = PHYS_PAGES;
                seen_base = true;
            }
            let window_end = self.pa_of(self.npages);
            if r.start >= window_end {
                warn!(
                    "kalloc: range {:#x}..{:#x} outside managed window, ignored",
                    r.start, r.end
                );
                continue;
            }
            let mut cur = (r.start + PGSIZE - 1) & !(PGSIZE - 1);
            let end = r.end.min(window_end) & !(PGSIZE - 1);
            while cur + PGSIZE <= end {
                let mut ord = log2_floor(end - cur).min(MAX_ORDER);
                while ord > MIN_ORDER && cur % (1 << ord) != 0 {
                    ord -= 1;
                }
                let idx = self.idx_of(cur);
                let npgs = 1 << (ord - MIN_ORDER);
                for i in idx..idx + npgs {
                    self.pages[i].order = ord as u8;
                    self.pages[i].free = true;
                }
                self.pages[idx].head = true;
                self.push(ord, idx);
                cur += npgs * PGSIZE;
            }
        }
        info!("kalloc: managing {} KiB free", self.free_bytes() / 1024);
    }

    /// Allocate a block of at least `size` bytes, aligned to its
    /// power-of-two size. Returns the physical address of the block, or
    /// None if `size` is unsatisfiable or memory is exhausted.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        if size == 0 || size > 1 << MAX_ORDER {
            return None;
        }
        let req = order_for(size);

        // Exact fit available.
        if let Some(idx) = self.pop(req) {
            let npgs = 1 << (req - MIN_ORDER);
            for i in idx..idx + npgs {
                debug_assert!(self.pages[i].free);
                self.pages[i].free = false;
            }
            return Some(self.pa_of(idx));
        }

        // Otherwise take the smallest larger block and split it down.
        let mut found = None;
        for ord in req + 1..=MAX_ORDER {
            if let Some(idx) = self.pop(ord) {
                found = Some((idx, ord));
                break;
            }
        }
        let (idx, mut ord) = found?;

        while ord > req {
            // Halve: every page in the block drops one order, then the
            // upper half becomes a free block of its own. Orders are
            // settled before the new head is linked so the lists are
            // consistent at every step.
            let half = 1 << (ord - 1 - MIN_ORDER);
            for i in idx..idx + 2 * half {
                debug_assert!(self.pages[i].free);
                self.pages[i].order -= 1;
            }
            self.pages[idx + half].head = true;
            self.push(ord - 1, idx + half);
            ord -= 1;
        }

        let npgs = 1 << (req - MIN_ORDER);
        for i in idx..idx + npgs {
            self.pages[i].free = false;
        }
        Some(self.pa_of(idx))
    }

    /// Return the block at `pa` to the allocator, coalescing with its
    /// buddy as long as the buddy is a whole free block of the same order.
    /// Freeing a null address is a no-op; freeing anything that is not a
    /// currently allocated block head is a fatal error.
    pub fn free(&mut self, pa: usize) {
        if pa == 0 {
            return;
        }
        if pa % PGSIZE != 0
            || pa < self.pa_of(0)
            || pa >= self.pa_of(self.npages)
        {
            panic!("kfree: bad address {:#x}", pa);
        }
        let mut idx = self.idx_of(pa);
        let pi = self.pages[idx];
        if !pi.head || pi.order == NO_ORDER {
            panic!("kfree: {:#x} is not a block head", pa);
        }
        if pi.free {
            panic!("kfree: double free of {:#x}", pa);
        }
        let mut ord = pi.order as usize;
        let npgs = 1 << (ord - MIN_ORDER);
        for i in idx..idx + npgs {
            if self.pages[i].free || self.pages[i].order as usize != ord {
                panic!("kfree: corrupt block at {:#x}", pa);
            }
            self.pages[i].free = true;
        }

        while ord < MAX_ORDER {
            let buddy = idx ^ (1 << (ord - MIN_ORDER));
            if buddy >= self.npages {
                break;
            }
            let b = self.pages[buddy];
            if !(b.free && b.head && b.order as usize == ord) {
                break;
            }
            self.unlink(ord, buddy);
            let lo = idx.min(buddy);
            let hi = idx.max(buddy);
            self.pages[hi].head = false;
            for i in lo..lo + 2 * (1 << (ord - MIN_ORDER)) {
                self.pages[i].order += 1;
            }
            idx = lo;
            ord += 1;
        }

        debug_assert!(self.pages[idx].head);
        self.push(ord, idx);
    }

    /// Total bytes currently sitting on the free lists.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        for ord in MIN_ORDER..=MAX_ORDER {
            let mut n = self.lists[ord - MIN_ORDER].head;
            while n != NIL {
                total += 1usize << ord;
                n = self.pages[n as usize].next;
            }
        }
        total
    }

    /// Validate every allocator invariant; panics on corruption.
    pub fn check(&self) {
        let mut covered = [false; PHYS_PAGES];
        for ord in MIN_ORDER..=MAX_ORDER {
            let mut n = self.lists[ord - MIN_ORDER].head;
            let mut prev = NIL;
            while n != NIL {
                let idx = n as usize;
                let pi = self.pages[idx];
                assert!(pi.head, "list {} holds a non-head", ord);
                assert!(pi.free, "list {} holds an allocated block", ord);
                assert_eq!(pi.order as usize, ord, "order mismatch on list {}", ord);
                assert_eq!(pi.prev, prev, "broken back-link on list {}", ord);
                assert_eq!(
                    (self.base_pn + idx) % (1 << (ord - PAGE_SHIFT)),
                    0,
                    "misaligned head on list {}",
                    ord
                );
                let npgs = 1 << (ord - MIN_ORDER);
                for i in idx..idx + npgs {
                    let p = self.pages[i];
                    assert!(p.free && p.order as usize == ord, "torn block at {}", i);
                    assert!(i == idx || !p.head, "nested head at {}", i);
                    assert!(!covered[i], "overlapping free blocks at {}", i);
                    covered[i] = true;
                }
                // A free buddy of the same order should have coalesced.
                let buddy = idx ^ npgs;
                if buddy < self.npages {
                    let b = self.pages[buddy];
                    assert!(
                        !(b.free && b.head && b.order as usize == ord),
                        "uncoalesced buddies at {} and {}",
                        idx,
                        buddy
                    );
                }
                prev = n;
                n = pi.next;
            }
        }
        // Every free page must be reachable from exactly one list.
        for i in 0..self.npages {
            if self.pages[i].free {
                assert!(covered[i], "free page {} not on any list", i);
            }
        }
    }
}

static KALLOC: SpinLock<BuddyAllocator> = SpinLock::new("page", BuddyAllocator::new());
static SEEDED: Once<()> = Once::new();

/// Seed the global allocator from the boot memory map. Later calls are
/// ignored.
pub fn init<I>(ranges: I)
where
    I: IntoIterator<Item = MemRange>,
{
    SEEDED.call_once(|| {
        KALLOC.lock().seed(ranges);
    });
}

/// Allocate at least `size` bytes of physical memory; see
/// [`BuddyAllocator::alloc`].
pub fn kalloc(size: usize) -> Option<usize> {
    KALLOC.lock().alloc(size)
}

/// Allocate one page of physical memory.
pub fn kallocpage() -> Option<usize> {
    kalloc(PGSIZE)
}

/// Free a block previously returned by `kalloc`. Null is a no-op.
pub fn kfree(pa: usize) {
    KALLOC.lock().free(pa);
}

pub fn free_bytes() -> usize {
    KALLOC.lock().free_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x4000_0000; // 2 MiB aligned fake window
    const TWO_MIB: usize = 1 << MAX_ORDER;

    fn arena() -> BuddyAllocator {
        let mut a = BuddyAllocator::new();
        a.seed([MemRange { start: BASE, end: BASE + TWO_MIB, kind: MemKind::Available }]);
        a
    }

    #[test]
    fn seeds_one_superblock() {
        let a = arena();
        assert_eq!(a.free_bytes(), TWO_MIB);
        assert_eq!(a.lists[MAX_ORDER - MIN_ORDER].head, 0);
        a.check();
    }

    #[test]
    fn rejects_degenerate_sizes() {
        let mut a = arena();
        assert_eq!(a.alloc(0), None);
        assert_eq!(a.alloc(TWO_MIB + 1), None);
        assert!(a.alloc(TWO_MIB).is_some());
    }

    #[test]
    fn alloc_is_aligned_to_its_order() {
        let mut a = arena();
        for ord in MIN_ORDER..=MAX_ORDER {
            let pa = a.alloc(1 << ord).unwrap();
            assert_eq!(pa % (1 << ord), 0, "order {} misaligned", ord);
            a.free(pa);
            a.check();
        }
    }

    #[test]
    fn splitting_leaves_a_ladder() {
        let mut a = arena();
        let pa = a.alloc(PGSIZE).unwrap();
        assert_eq!(pa, BASE);
        // One remainder block at every order below the superblock.
        for ord in MIN_ORDER..MAX_ORDER {
            let l = a.lists[ord - MIN_ORDER];
            assert_ne!(l.head, NIL, "no remainder at order {}", ord);
            assert_eq!(a.pages[l.head as usize].next, NIL);
        }
        a.check();
        a.free(pa);
        assert_eq!(a.free_bytes(), TWO_MIB);
        a.check();
    }

    #[test]
    fn stress_512_pages_then_coalesce() {
        let mut a = arena();
        let mut pas = [0usize; 512];
        for (i, slot) in pas.iter_mut().enumerate() {
            let pa = a.alloc(PGSIZE).expect("arena exhausted early");
            assert_eq!(pa, BASE + i * PGSIZE); // splits hand out low halves first
            *slot = pa;
        }
        assert_eq!(a.free_bytes(), 0);
        assert_eq!(a.alloc(PGSIZE), None);
        for pa in pas.iter().rev() {
            a.free(*pa);
        }
        a.check();
        assert_eq!(a.free_bytes(), TWO_MIB);
        let l = a.lists[MAX_ORDER - MIN_ORDER];
        assert_eq!(l.head, 0);
        assert_eq!(a.pages[0].next, NIL);
    }

    #[test]
    fn round_trip_returns_same_address() {
        let mut a = arena();
        let hold = a.alloc(PGSIZE).unwrap();
        for size in [1, PGSIZE, PGSIZE + 1, 1 << 14, 1 << 18] {
            let pa = a.alloc(size).unwrap();
            a.free(pa);
            let again = a.alloc(size).unwrap();
            assert_eq!(pa, again, "size {}", size);
            a.free(again);
        }
        a.free(hold);
        a.check();
    }

    #[test]
    fn conservation_under_mixed_traffic() {
        let mut a = arena();
        let mut live = std::vec::Vec::new();
        let mut allocated = 0usize;
        for (i, size) in [PGSIZE, 3 * PGSIZE, 1 << 15, PGSIZE, 1 << 17, 5000]
            .iter()
            .cycle()
            .take(40)
            .enumerate()
        {
            if i % 3 == 2 {
                if let Some((pa, bytes)) = live.pop() {
                    a.free(pa);
                    allocated -= bytes;
                }
            } else if let Some(pa) = a.alloc(*size) {
                let bytes = 1usize << order_for(*size);
                live.push((pa, bytes));
                allocated += bytes;
            }
            a.check();
            assert_eq!(a.free_bytes() + allocated, TWO_MIB);
        }
        for (pa, _) in live {
            a.free(pa);
        }
        assert_eq!(a.free_bytes(), TWO_MIB);
    }

    #[test]
    fn reserved_ranges_are_skipped() {
        let mut a = BuddyAllocator::new();
        a.seed([
            MemRange { start: BASE, end: BASE + 4 * PGSIZE, kind: MemKind::Available },
            MemRange {
                start: BASE + 4 * PGSIZE,
                end: BASE + 8 * PGSIZE,
                kind: MemKind::Reserved,
            },
            MemRange {
                start: BASE + 8 * PGSIZE,
                end: BASE + 10 * PGSIZE,
                kind: MemKind::Available,
            },
        ]);
        assert_eq!(a.free_bytes(), 6 * PGSIZE);
        // The reserved hole can never be handed out.
        let mut seen = std::vec::Vec::new();
        while let Some(pa) = a.alloc(PGSIZE) {
            assert!(
                !(BASE + 4 * PGSIZE..BASE + 8 * PGSIZE).contains(&pa),
                "allocated from reserved range"
            );
            seen.push(pa);
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn unaligned_range_is_trimmed() {
        let mut a = BuddyAllocator::new();
        a.seed([MemRange {
            start: BASE + 100,
            end: BASE + 3 * PGSIZE + 50,
            kind: MemKind::Available,
        }]);
        assert_eq!(a.free_bytes(), 2 * PGSIZE);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut a = arena();
        let pa = a.alloc(PGSIZE).unwrap();
        a.free(pa);
        a.free(pa);
    }

    #[test]
    #[should_panic(expected = "not a block head")]
    fn free_of_block_interior_panics() {
        let mut a = arena();
        let pa = a.alloc(4 * PGSIZE).unwrap();
        a.free(pa + PGSIZE);
    }

    #[test]
    fn null_free_is_noop() {
        let mut a = arena();
        a.free(0);
        assert_eq!(a.free_bytes(), TWO_MIB);
    }
}
