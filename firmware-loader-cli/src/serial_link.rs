// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

use busupdate_host_core::link::encode_frame;
use busupdate_host_core::{FrameAccumulator, LinkError, Transport};
use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};
use std::time::Duration;

const TX_BUFFER_SIZE: usize = 1024;
const RX_BUFFER_SIZE: usize = 2048;

/// Bus bridge on a serial port. Frames are length-prefixed CBOR in both directions.
pub(crate) struct SerialTransport {
    serial: Box<dyn serialport::SerialPort>,
    accumulator: FrameAccumulator<RX_BUFFER_SIZE>,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud_rate: u32) -> IoResult<Self> {
        let serial = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| IoError::new(ErrorKind::ConnectionRefused, e.to_string()))?;

        log::info!("Connected to {} at {} baud", port_name, baud_rate);
        Ok(Self { serial, accumulator: FrameAccumulator::new() })
    }

    fn bytes_waiting(&self) -> IoResult<usize> {
        self.serial
            .bytes_to_read()
            .map(|count| count as usize)
            .map_err(|e| IoError::new(ErrorKind::Other, e.to_string()))
    }
}

fn link_error(err: LinkError) -> IoError {
    IoError::new(ErrorKind::InvalidData, format!("{:?}", err))
}

impl Transport for SerialTransport {
    type Error = IoError;

    fn send(&mut self, msg_type: u8, payload: &[u8]) -> IoResult<()> {
        let mut buffer = [0u8; TX_BUFFER_SIZE];
        let len = encode_frame(msg_type, payload, &mut buffer).map_err(|e| link_error(e.into()))?;
        self.serial.write_all(&buffer[..len])?;

        log::trace!("Sent frame of {} bytes", len);
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> IoResult<Option<(u8, usize)>> {
        loop {
            match self.accumulator.next_frame(buffer) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) => log::warn!("Discarding bad frame: {:?}", e),
            }

            let space = RX_BUFFER_SIZE - self.accumulator.len();
            let waiting = self.bytes_waiting()?;
            if waiting == 0 || space == 0 {
                return Ok(None);
            }

            let mut incoming = [0u8; 256];
            let want = waiting.min(space).min(incoming.len());
            let got = match self.serial.read(&mut incoming[..want]) {
                Ok(got) => got,
                Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e),
            };
            self.accumulator.push(&incoming[..got]).map_err(link_error)?;
        }
    }
}
