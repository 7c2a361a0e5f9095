/*
Copyright © 2025 the minOS authors

This file is part of minOS.

minOS is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

minOS is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with minOS. If not, see
<https://www.gnu.org/licenses/>.
*/

//! The 80x25 text console.
//!
//! Models the hardware text buffer: one u16 cell per position, attribute
//! byte above the ascii byte. The write path advances a cursor with
//! wrap-around on both axes and no scrolling; the per-tick screen dump
//! overwrites the whole buffer from the running task's shadow page.

use core::fmt;

pub const NUM_COLUMNS: usize = 80;
pub const NUM_ROWS: usize = 25;
pub const NUM_CELLS: usize = NUM_COLUMNS * NUM_ROWS;

/// Attribute byte for kernel output.
const ATTR: u16 = 0x02;

pub struct Console {
    cells: [u16; NUM_CELLS],
    x: usize,
    y: usize,
}

impl Console {
    pub fn new() -> Self {
        Console {
            cells: [0; NUM_CELLS],
            x: 0,
            y: 0,
        }
    }

    /// Writes one byte at the cursor. Newlines reset the column and advance
    /// the row modulo the screen height.
    pub fn write_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            self.x = 0;
            self.y = (self.y + 1) % NUM_ROWS;
            return;
        }
        self.cells[self.y * NUM_COLUMNS + self.x] = (ATTR << 8) | byte as u16;
        self.x += 1;
        if self.x >= NUM_COLUMNS {
            self.x = 0;
            self.y = (self.y + 1) % NUM_ROWS;
        }
    }

    /// The console sink: renders a byte run into the cell buffer.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    /// Replaces the whole buffer from a shadow screen page (little-endian
    /// u16 cells). Runs once per tick for tasks that own a screen page.
    pub fn load_cells(&mut self, page: &[u8]) {
        for i in 0..NUM_CELLS {
            self.cells[i] = u16::from_le_bytes([page[2 * i], page[2 * i + 1]]);
        }
    }

    pub fn cells(&self) -> &[u16; NUM_CELLS] {
        &self.cells
    }

    pub fn cell(&self, x: usize, y: usize) -> u16 {
        self.cells[y * NUM_COLUMNS + x]
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.x, self.y)
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}
