// Tick accounting and the sleep wheel.
//
// The hardware timer fires HZ times a second; CPU 0 advances the global
// tick. Sleepers hang on the wheel slot their deadline maps to and publish
// the slot index in their process record; an early wake (a parent poke at
// exit) clears the published slot to -1, which the sleeper reports as
// `Intr`.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::param::WHEEL_SIZE;
use crate::proc::{Pid, Proc};
use crate::spinlock::SpinLock;
use crate::wait::{WaitQueue, Waiter};

static TICKS: AtomicU64 = AtomicU64::new(0);

// One wait queue per wheel slot; each slot is its own queue, initialized
// independently.
static WHEEL: [WaitQueue; WHEEL_SIZE] = {
    const SLOT: WaitQueue = WaitQueue::new("sleep wheel");
    [SLOT; WHEEL_SIZE]
};

// Serializes wheel-slot publication in process records.
static SLEEP_LOCK: SpinLock<()> = SpinLock::new("sleep", ());

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Timer-interrupt work: advance the tick and sweep the due wheel slot.
/// Sleepers woken ahead of their deadline re-check and re-sleep.
pub fn on_tick() {
    let now = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
    WHEEL[(now % WHEEL_SIZE as u64) as usize].wake_all();
}

/// Sleep for roughly `ms` milliseconds, rounded up to whole ticks.
/// Returns `Err(Intr)` if a poke arrives first.
///
/// # Safety
/// `p` must be the calling task's record.
pub unsafe fn msleep(p: *mut Proc, ms: u64) -> Result<u64> {
    let deadline = ticks() + (ms + 9) / 10;
    let slot = (deadline % WHEEL_SIZE as u64) as usize;
    {
        let _g = SLEEP_LOCK.lock();
        (*p).wheel_slot = slot as i32;
    }

    let mut w = Waiter::new(p);
    let guard = w.block_until(&WHEEL[slot], &SLEEP_LOCK, |_| {
        ticks() >= deadline || (*p).wheel_slot < 0
    });
    let interrupted = (*p).wheel_slot < 0 && ticks() < deadline;
    (*p).wheel_slot = -1;
    drop(guard);

    if interrupted {
        Err(Error::Intr)
    } else {
        Ok(0)
    }
}

/// Signal-like wake for a sleeping process: clear its published slot and
/// pull it off the wheel. No-op if `p` is not sleeping.
///
/// # Safety
/// `p` must point at a live process record.
pub unsafe fn poke(p: *mut Proc, pid: Pid) {
    let slot = {
        let _g = SLEEP_LOCK.lock();
        let s = (*p).wheel_slot;
        if s < 0 {
            return;
        }
        (*p).wheel_slot = -1;
        s as usize
    };
    WHEEL[slot].wake_pid(pid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_advance_and_wrap_the_wheel() {
        let _t = crate::testing::setup();
        let before = ticks();
        for _ in 0..WHEEL_SIZE + 1 {
            on_tick();
        }
        assert_eq!(ticks(), before + WHEEL_SIZE as u64 + 1);
    }

    #[test]
    fn msleep_rounds_up_to_ticks() {
        // (ms + 9) / 10 per the timer contract.
        assert_eq!((0 + 9) / 10, 0);
        assert_eq!((1 + 9) / 10, 1);
        assert_eq!((100 + 9) / 10, 10);
        assert_eq!((101 + 9) / 10, 11);
    }
}
