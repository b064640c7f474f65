// The keyboard/console stream vnode.
//
// Reads are line buffered: the caller sleeps until the keyboard holds a
// complete line, then drains it byte by byte. Ctrl-D alone on the wire
// reads as 0 bytes (EOF). Writes land on the console.

use crate::console::{self, KBD_EOF, KBD_WQ, KEYBOARD};
use crate::error::Result;
use crate::proc;
use crate::wait::Waiter;

pub fn read(buf: &mut [u8]) -> Result<usize> {
    let mut w = unsafe { Waiter::new(proc::current()) };
    let mut kbd = w.block_until(&KBD_WQ, &KEYBOARD, |k| buf.is_empty() || k.eol != 0);

    let mut n = 0;
    while kbd.eol != 0 && n < buf.len() {
        let b = kbd.peek();
        if b == KBD_EOF {
            // EOF terminates a read; consumed only when it is the
            // first byte seen.
            if n == 0 {
                kbd.consume(1);
            }
            break;
        }
        buf[n] = b;
        n += 1;
        kbd.consume(1);
    }
    Ok(n)
}

pub fn write(buf: &[u8]) -> Result<usize> {
    console::write_bytes(buf);
    Ok(buf.len())
}
