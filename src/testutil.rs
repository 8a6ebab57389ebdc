//! Scripted serial transport for unit tests.

use std::collections::VecDeque;
use std::time::Duration;

use crate::ifd::{Ifd, ReaderKind};
use crate::serial::{Parity, PortProperties, SerialError, SerialPort};

/// One scripted read outcome.
pub enum Reply {
	/// Bytes the "reader" sends; reads drain them in order, ignoring
	/// call boundaries.
	Data(Vec<u8>),
	/// The next read call times out.
	Timeout,
}

/// A mock port: records every write, serves reads from a reply script.
pub struct MockSerial {
	props: PortProperties,
	replies: VecDeque<Reply>,
	rx: VecDeque<u8>,
	pub writes: Vec<Vec<u8>>,
}

impl MockSerial {
	pub fn new() -> MockSerial {
		MockSerial {
			props: PortProperties {
				input_bps: 9600,
				output_bps: 9600,
				bits: 8,
				parity: Parity::Even,
				stopbits: 2,
				dtr: true,
				rts: true,
			},
			replies: VecDeque::new(),
			rx: VecDeque::new(),
			writes: Vec::new(),
		}
	}

	pub fn push(&mut self, reply: Reply) {
		self.replies.push_back(reply);
	}
}

impl SerialPort for MockSerial {
	fn set_properties(&mut self, props: &PortProperties) -> Result<(), SerialError> {
		self.props = *props;
		Ok(())
	}

	fn properties(&self) -> PortProperties {
		self.props
	}

	fn read(&mut self, _timeout: Duration, buf: &mut [u8]) -> Result<(), SerialError> {
		let mut filled = 0;
		while filled < buf.len() {
			if let Some(b) = self.rx.pop_front() {
				buf[filled] = b;
				filled += 1;
				continue;
			}

			match self.replies.pop_front() {
				Some(Reply::Data(bytes)) => self.rx.extend(bytes),
				Some(Reply::Timeout) | None => {
					return Err(SerialError::Timeout(buf.len()));
				}
			}
		}
		Ok(())
	}

	fn write(&mut self, _delay: Duration, data: &[u8]) -> Result<(), SerialError> {
		if !data.is_empty() {
			self.writes.push(data.to_vec());
		}
		Ok(())
	}
}

/// A reader handle that skips the wire-level bring-up.
pub fn ifd_for_test(io: MockSerial, slot: u8) -> Ifd<MockSerial> {
	Ifd::for_test(io, slot, ReaderKind::ChipdriveExtII)
}
