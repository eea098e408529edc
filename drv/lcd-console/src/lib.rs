// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console engine for alphanumeric (HD44780-class) LCDs.
//!
//! This is the character-and-cursor state machine only; the bus cycles
//! that poke the controller live behind [`LcdBus`], next to the board
//! support. Control characters do the terminal-ish things: `\f` clears
//! and homes, `\n` moves down a row, `\r` returns to column zero, `\t`
//! advances to the next tab stop. Writing past the last row reports
//! `LcdRowFull` rather than wrapping, so callers can page their output.

#![cfg_attr(not(test), no_std)]

use abi::{Error, KResult};

/// DDRAM base address for each row of a four-row panel.
const ROW_BASE: [u8; 4] = [0x80, 0xC0, 0x94, 0xD4];

/// The controller interface the console drives.
pub trait LcdBus {
    /// Issues a command cycle (RS low).
    fn write_command(&mut self, cmd: u8);
    /// Issues a data cycle (RS high).
    fn write_data(&mut self, byte: u8);
}

pub struct LcdConsole<B> {
    bus: B,
    rows: u8,
    cols: u8,
    tab_width: u8,
    cur_row: u8,
    cur_col: u8,
}

impl<B: LcdBus> LcdConsole<B> {
    /// A console over a `rows` × `cols` panel. Rows beyond four alias the
    /// controller's address map, so they are rejected.
    pub fn new(bus: B, rows: u8, cols: u8, tab_width: u8) -> Self {
        assert!(rows as usize <= ROW_BASE.len());
        assert!(tab_width > 0);
        Self {
            bus,
            rows,
            cols,
            tab_width,
            cur_row: 0,
            cur_col: 0,
        }
    }

    pub fn cursor(&self) -> (u8, u8) {
        (self.cur_row, self.cur_col)
    }

    /// Clears the panel and homes the cursor.
    pub fn clear(&mut self) {
        self.bus.write_command(0x01);
        self.cur_row = 0;
        self.cur_col = 0;
    }

    /// Writes one character, interpreting the control set.
    pub fn put_char(&mut self, c: u8) -> KResult<()> {
        match c {
            b'\x0c' => {
                self.clear();
                Ok(())
            }
            b'\n' => {
                if self.cur_row + 1 < self.rows {
                    self.cur_row += 1;
                    Ok(())
                } else {
                    Err(Error::LcdRowFull)
                }
            }
            b'\r' => {
                self.cur_col = 0;
                Ok(())
            }
            b'\t' => {
                let indent = self.tab_width - (self.cur_col % self.tab_width);
                if self.cur_col + indent < self.cols {
                    self.cur_col += indent;
                }
                Ok(())
            }
            c => {
                if self.cur_col == self.cols {
                    // Past the right edge: take the next row.
                    if self.cur_row + 1 >= self.rows {
                        return Err(Error::LcdRowFull);
                    }
                    self.cur_row += 1;
                    self.cur_col = 0;
                }
                let address =
                    ROW_BASE[usize::from(self.cur_row)] + self.cur_col;
                self.bus.write_command(address);
                self.bus.write_data(c);
                self.cur_col += 1;
                Ok(())
            }
        }
    }

    /// Writes a string, stopping at the first full-panel condition.
    pub fn write_str(&mut self, s: &str) -> KResult<()> {
        for &b in s.as_bytes() {
            self.put_char(b)?;
        }
        Ok(())
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TraceBus {
        ops: Vec<(bool, u8)>, // (is_command, byte)
    }

    impl LcdBus for TraceBus {
        fn write_command(&mut self, cmd: u8) {
            self.ops.push((true, cmd));
        }
        fn write_data(&mut self, byte: u8) {
            self.ops.push((false, byte));
        }
    }

    fn console() -> LcdConsole<TraceBus> {
        LcdConsole::new(TraceBus::default(), 4, 20, 4)
    }

    #[test]
    fn plain_text_advances_column() {
        let mut c = console();
        c.write_str("hi").unwrap();
        assert_eq!(c.cursor(), (0, 2));
        assert_eq!(
            c.bus_mut().ops,
            [(true, 0x80), (false, b'h'), (true, 0x81), (false, b'i')]
        );
    }

    #[test]
    fn newline_and_carriage_return() {
        let mut c = console();
        c.write_str("ab\n\rcd").unwrap();
        assert_eq!(c.cursor(), (1, 2));
        // Second row writes use the 0xC0 base.
        assert!(c.bus_mut().ops.contains(&(true, 0xC0)));
    }

    #[test]
    fn form_feed_clears_and_homes() {
        let mut c = console();
        c.write_str("xyz").unwrap();
        c.put_char(b'\x0c').unwrap();
        assert_eq!(c.cursor(), (0, 0));
        assert_eq!(c.bus_mut().ops.last(), Some(&(true, 0x01)));
    }

    #[test]
    fn tab_stops_are_configurable_width() {
        let mut c = console();
        c.put_char(b'a').unwrap();
        c.put_char(b'\t').unwrap();
        assert_eq!(c.cursor(), (0, 4));
        c.put_char(b'\t').unwrap();
        assert_eq!(c.cursor(), (0, 8));
    }

    #[test]
    fn tab_at_right_edge_stays_put() {
        let mut c = LcdConsole::new(TraceBus::default(), 2, 8, 4);
        c.write_str("abcdef").unwrap();
        c.put_char(b'\t').unwrap();
        assert_eq!(c.cursor(), (0, 6));
    }

    #[test]
    fn four_row_addresses() {
        let mut c = console();
        c.write_str("a\rb").ok();
        for _ in 0..3 {
            c.put_char(b'\n').unwrap();
            c.put_char(b'\r').unwrap();
            c.put_char(b'x').unwrap();
        }
        let cmds: Vec<u8> = c
            .bus_mut()
            .ops
            .iter()
            .filter(|(is_cmd, _)| *is_cmd)
            .map(|&(_, b)| b)
            .collect();
        assert!(cmds.contains(&0x80));
        assert!(cmds.contains(&0xC0));
        assert!(cmds.contains(&0x94));
        assert!(cmds.contains(&0xD4));
    }

    #[test]
    fn past_last_row_reports_full() {
        let mut c = LcdConsole::new(TraceBus::default(), 2, 4, 2);
        c.write_str("aaaa").unwrap(); // fills row 0
        c.write_str("bbbb").unwrap(); // spills to row 1, fills it
        assert_eq!(c.put_char(b'x'), Err(Error::LcdRowFull));
        assert_eq!(c.put_char(b'\n'), Err(Error::LcdRowFull));
        // A form feed recovers.
        c.put_char(b'\x0c').unwrap();
        assert_eq!(c.put_char(b'x'), Ok(()));
    }
}
