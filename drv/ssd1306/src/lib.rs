// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SSD1306 OLED command sequencing over I²C.
//!
//! Every transfer leads with a control byte: `0x00` for commands, `0x40`
//! for display data. Framebuffer flushes are chopped into
//! [`I2C_CHUNK`]-byte transfers because small-MCU I²C engines (and the
//! controller itself) dislike long ones. The I²C engine is behind
//! [`I2cWrite`]; this crate only knows the controller's language.

#![cfg_attr(not(test), no_std)]

use abi::KResult;

/// Display-data bytes per I²C transfer, control byte excluded.
pub const I2C_CHUNK: usize = 16;

const CTRL_COMMAND: u8 = 0x00;
const CTRL_DATA: u8 = 0x40;

/// The I²C engine interface.
pub trait I2cWrite {
    fn write(&mut self, addr: u8, bytes: &[u8]) -> KResult<()>;
}

pub struct Ssd1306<I> {
    bus: I,
    addr: u8,
    width: u8,
    height: u8,
}

impl<I: I2cWrite> Ssd1306<I> {
    pub fn new(bus: I, addr: u8, width: u8, height: u8) -> Self {
        assert!(height % 8 == 0);
        Self {
            bus,
            addr,
            width,
            height,
        }
    }

    /// The standard bring-up sequence, ending with the panel on.
    pub fn init(&mut self) -> KResult<()> {
        self.command(&[0xAE])?; // display off
        self.command(&[0xD5, 0x80])?; // clock divide
        self.command(&[0xA8, self.height - 1])?; // multiplex
        self.command(&[0xD3, 0x00])?; // display offset
        self.command(&[0x40])?; // start line 0
        self.command(&[0x8D, 0x14])?; // charge pump on
        self.command(&[0x20, 0x00])?; // horizontal memory mode
        self.command(&[0xA1])?; // segment remap
        self.command(&[0xC8])?; // COM scan decrement
        self.command(&[0xDA, if self.height == 32 { 0x02 } else { 0x12 }])?;
        self.command(&[0x81, 0xCF])?; // contrast
        self.command(&[0xD9, 0xF1])?; // pre-charge
        self.command(&[0xDB, 0x40])?; // VCOM deselect
        self.command(&[0xA4])?; // resume from all-on
        self.command(&[0xA6])?; // normal (not inverted)
        self.command(&[0x2E])?; // deactivate scroll
        self.command(&[0xAF])?; // display on
        Ok(())
    }

    /// Pushes a full framebuffer (`width * height / 8` bytes, page
    /// order).
    pub fn flush(&mut self, frame: &[u8]) -> KResult<()> {
        assert_eq!(
            frame.len(),
            usize::from(self.width) * usize::from(self.height) / 8
        );
        self.command(&[0x21, 0, self.width - 1])?; // column window
        self.command(&[0x22, 0, self.height / 8 - 1])?; // page window
        for chunk in frame.chunks(I2C_CHUNK) {
            let mut buf = [0u8; I2C_CHUNK + 1];
            buf[0] = CTRL_DATA;
            buf[1..1 + chunk.len()].copy_from_slice(chunk);
            self.bus.write(self.addr, &buf[..1 + chunk.len()])?;
        }
        Ok(())
    }

    pub fn set_contrast(&mut self, level: u8) -> KResult<()> {
        self.command(&[0x81, level])
    }

    pub fn display_on(&mut self, on: bool) -> KResult<()> {
        self.command(&[if on { 0xAF } else { 0xAE }])
    }

    fn command(&mut self, bytes: &[u8]) -> KResult<()> {
        // Command transfers are short; 8 covers the longest we issue.
        let mut buf = [0u8; 8];
        buf[0] = CTRL_COMMAND;
        buf[1..1 + bytes.len()].copy_from_slice(bytes);
        self.bus.write(self.addr, &buf[..1 + bytes.len()])
    }

    pub fn bus_mut(&mut self) -> &mut I {
        &mut self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TraceBus {
        writes: Vec<(u8, Vec<u8>)>,
    }

    impl I2cWrite for TraceBus {
        fn write(&mut self, addr: u8, bytes: &[u8]) -> KResult<()> {
            self.writes.push((addr, bytes.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn init_sequence_order() {
        let mut d = Ssd1306::new(TraceBus::default(), 0x3C, 128, 64);
        d.init().unwrap();
        let first_bytes: Vec<u8> = d
            .bus_mut()
            .writes
            .iter()
            .map(|(_, b)| b[1])
            .collect();
        assert_eq!(
            first_bytes,
            [
                0xAE, 0xD5, 0xA8, 0xD3, 0x40, 0x8D, 0x20, 0xA1, 0xC8, 0xDA,
                0x81, 0xD9, 0xDB, 0xA4, 0xA6, 0x2E, 0xAF
            ]
        );
        // Every command transfer leads with the command control byte.
        assert!(d.bus_mut().writes.iter().all(|(_, b)| b[0] == 0x00));
        // 64-row panels use the alternative COM pin layout.
        let compins = d
            .bus_mut()
            .writes
            .iter()
            .find(|(_, b)| b[1] == 0xDA)
            .unwrap();
        assert_eq!(compins.1[2], 0x12);
    }

    #[test]
    fn flush_chunks_with_data_marker() {
        let mut d = Ssd1306::new(TraceBus::default(), 0x3C, 128, 64);
        let frame = vec![0x5A; 128 * 64 / 8];
        d.flush(&frame).unwrap();
        let data_writes: Vec<&(u8, Vec<u8>)> = d
            .bus_mut()
            .writes
            .iter()
            .filter(|(_, b)| b[0] == CTRL_DATA)
            .collect();
        assert_eq!(data_writes.len(), (128 * 64 / 8) / I2C_CHUNK);
        for (_, w) in &data_writes {
            assert_eq!(w.len(), I2C_CHUNK + 1);
            assert!(w[1..].iter().all(|&b| b == 0x5A));
        }
    }

    #[test]
    fn flush_sets_address_window_first() {
        let mut d = Ssd1306::new(TraceBus::default(), 0x3C, 128, 32);
        let frame = vec![0; 128 * 32 / 8];
        d.flush(&frame).unwrap();
        let w = &d.bus_mut().writes;
        assert_eq!(&w[0].1, &[0x00, 0x21, 0, 127]);
        assert_eq!(&w[1].1, &[0x00, 0x22, 0, 3]);
    }
}
