//! VGA text-mode console
//!
//! An 80x25 character byte sink over the legacy text buffer at 0xB8000.
//! The kernel log mirrors every line here once the console is enabled; the
//! panic path relies on it when no serial cable is attached.
//!
//! The hardware cursor is moved through the CRTC index/data ports
//! (0x3D4/0x3D5). When the bootloader hands us a linear framebuffer
//! instead of text mode, the console stays disabled and logging remains
//! serial-only.

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

const BUFFER_ADDR: usize = 0xB8000;
const WIDTH: usize = 80;
const HEIGHT: usize = 25;

/// CRTC index port
const CRTC_INDEX: u16 = 0x3D4;
/// CRTC data port
const CRTC_DATA: u16 = 0x3D5;

/// Light grey on black
const ATTR: u8 = 0x07;

static ENABLED: AtomicBool = AtomicBool::new(false);

struct Cursor {
    row: usize,
    col: usize,
}

static CURSOR: Mutex<Cursor> = Mutex::new(Cursor { row: 0, col: 0 });

/// Enable the text console and clear the screen.
///
/// Must only be called when the machine is in VGA text mode (no
/// framebuffer tag in the boot info).
pub fn init() {
    {
        let mut cursor = CURSOR.lock();
        for i in 0..WIDTH * HEIGHT {
            put_cell(i, b' ');
        }
        cursor.row = 0;
        cursor.col = 0;
    }
    ENABLED.store(true, Ordering::Release);
    update_hw_cursor(0, 0);
}

/// Write bytes to the console. No-op until `init` has run.
pub fn write_bytes(bytes: &[u8]) {
    if !ENABLED.load(Ordering::Acquire) {
        return;
    }
    crate::arch::without_interrupts(|| {
        let mut cursor = CURSOR.lock();
        for &b in bytes {
            write_byte(&mut cursor, b);
        }
        update_hw_cursor(cursor.row, cursor.col);
    });
}

fn write_byte(cursor: &mut Cursor, b: u8) {
    match b {
        b'\n' => {
            cursor.col = 0;
            cursor.row += 1;
        }
        b'\r' => cursor.col = 0,
        _ => {
            put_cell(cursor.row * WIDTH + cursor.col, b);
            cursor.col += 1;
            if cursor.col == WIDTH {
                cursor.col = 0;
                cursor.row += 1;
            }
        }
    }
    if cursor.row == HEIGHT {
        scroll();
        cursor.row = HEIGHT - 1;
    }
}

fn put_cell(index: usize, b: u8) {
    let cell = ((ATTR as u16) << 8) | b as u16;
    unsafe {
        let ptr = (BUFFER_ADDR as *mut u16).add(index);
        core::ptr::write_volatile(ptr, cell);
    }
}

fn scroll() {
    unsafe {
        let base = BUFFER_ADDR as *mut u16;
        for row in 1..HEIGHT {
            for col in 0..WIDTH {
                let cell = core::ptr::read_volatile(base.add(row * WIDTH + col));
                core::ptr::write_volatile(base.add((row - 1) * WIDTH + col), cell);
            }
        }
        for col in 0..WIDTH {
            let blank = ((ATTR as u16) << 8) | b' ' as u16;
            core::ptr::write_volatile(base.add((HEIGHT - 1) * WIDTH + col), blank);
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn update_hw_cursor(row: usize, col: usize) {
    use x86_64::instructions::port::Port;

    let pos = (row * WIDTH + col) as u16;
    unsafe {
        let mut index: Port<u8> = Port::new(CRTC_INDEX);
        let mut data: Port<u8> = Port::new(CRTC_DATA);
        // Cursor location high, then low
        index.write(0x0E);
        data.write((pos >> 8) as u8);
        index.write(0x0F);
        data.write((pos & 0xFF) as u8);
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn update_hw_cursor(_row: usize, _col: usize) {}
