//! Test transports: a scripted port and a small reader simulator.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use chipdrive::serial::{Parity, PortProperties, SerialError, SerialPort};

pub fn default_props() -> PortProperties {
	PortProperties {
		input_bps: 9600,
		output_bps: 9600,
		bits: 8,
		parity: Parity::Even,
		stopbits: 2,
		dtr: true,
		rts: true,
	}
}

/// One scripted read outcome for [`ScriptedPort`].
pub enum Reply {
	Data(Vec<u8>),
	Timeout,
}

/// Serves reads from a fixed reply list and records all writes.
pub struct ScriptedPort {
	props: PortProperties,
	replies: VecDeque<Reply>,
	rx: VecDeque<u8>,
	pub writes: Vec<Vec<u8>>,
}

impl ScriptedPort {
	pub fn new() -> ScriptedPort {
		ScriptedPort {
			props: default_props(),
			replies: VecDeque::new(),
			rx: VecDeque::new(),
			writes: Vec::new(),
		}
	}

	pub fn push(&mut self, reply: Reply) {
		self.replies.push_back(reply);
	}
}

impl SerialPort for ScriptedPort {
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
				Some(Reply::Timeout) | None => return Err(SerialError::Timeout(buf.len())),
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

/// A reader with an I²C-short memory card inserted: parses the framed
/// commands it is written and answers the way the hardware would.
pub struct MemoryCardReader {
	props: PortProperties,
	rx: VecDeque<u8>,
	memory: Vec<u8>,
	/// Source the next buffer-read bursts drain: reset answer or memory.
	source: Vec<u8>,
	cursor: usize,
	write_addr: usize,
	out_of_range: bool,
}

impl MemoryCardReader {
	pub fn new(memory: Vec<u8>) -> MemoryCardReader {
		MemoryCardReader {
			props: default_props(),
			rx: VecDeque::new(),
			memory,
			source: Vec::new(),
			cursor: 0,
			write_addr: 0,
			out_of_range: false,
		}
	}

	pub fn memory(&self) -> &[u8] {
		&self.memory
	}

	fn ack(&mut self) {
		self.rx.push_back(0x01);
	}

	fn handle(&mut self, cmd: &[u8]) {
		match (cmd[0], cmd.len()) {
			// Reader info.
			(0x00, 2) => self.rx.extend([0x84, 0x10, 0x00]),

			// Status: card present, out-of-range as last addressed.
			(0x03, 2) => {
				let status = 0x40 | if self.out_of_range { 0x10 } else { 0x00 };
				self.rx.extend([status, 0x00]);
			}

			// Baudrate.
			(0x6E, 6) => self.ack(),

			// LED / parity.
			(0x6F, 5) => self.ack(),

			// Activate / deactivate.
			(0x60, 3) | (0x61, 3) => self.ack(),

			// Synchronous reset: this card has no ATR.
			(0x70, 5) => {
				self.ack();
				self.source = vec![0xFF; 8];
				self.cursor = 0;
			}

			// I²C-short set read address (doubles as write step one).
			(0x7C, 10) => {
				let addr = (((cmd[3] as usize & 0x1E) >> 1) << 8) | cmd[4] as usize;
				self.out_of_range = addr >= self.memory.len();
				if !self.out_of_range {
					self.source = self.memory.clone();
					self.cursor = addr;
				}
				self.ack();
			}

			// I²C-short write step two.
			(0x7E, 3) => self.rx.extend([0x00, 0x00]),

			// I²C-short write step three: the real write address.
			(0x7E, 8) => {
				self.write_addr = (((cmd[4] as usize & 0x1E) >> 1) << 8) | cmd[3] as usize;
				self.ack();
			}

			// Full write burst: opcode, 15 data bytes, checksum.
			(0x4E, 17) => {
				self.store(&cmd[1..16]);
				self.ack();
			}

			// Buffer-read burst.
			(op, 2) if op & 0xF0 == 0x10 => {
				let n = (op as usize & 0x0F) + 1;
				for _ in 0..n {
					let b = self.source.get(self.cursor).copied().unwrap_or(0xFF);
					self.rx.push_back(b);
					self.cursor += 1;
				}
				self.rx.push_back(0x00);
			}

			// Remainder write burst: opcode, data, 0x0F, checksum.
			(op, len) if op & 0xF0 == 0x40 => {
				let n = (op as usize & 0x0F) + 1;
				assert_eq!(len, n + 3, "remainder write length");
				let data = cmd[1..1 + n].to_vec();
				self.store(&data);
				self.ack();
			}

			other => panic!("reader simulator: unexpected command {other:?}: {cmd:02X?}"),
		}
	}

	fn store(&mut self, data: &[u8]) {
		for &b in data {
			if self.write_addr < self.memory.len() {
				self.memory[self.write_addr] = b;
				self.write_addr += 1;
			}
		}
	}
}

impl SerialPort for MemoryCardReader {
	fn set_properties(&mut self, props: &PortProperties) -> Result<(), SerialError> {
		self.props = *props;
		Ok(())
	}

	fn properties(&self) -> PortProperties {
		self.props
	}

	fn read(&mut self, _timeout: Duration, buf: &mut [u8]) -> Result<(), SerialError> {
		for slot in buf.iter_mut() {
			match self.rx.pop_front() {
				Some(b) => *slot = b,
				None => return Err(SerialError::Timeout(buf.len())),
			}
		}
		Ok(())
	}

	fn write(&mut self, _delay: Duration, data: &[u8]) -> Result<(), SerialError> {
		// Length prefixes at 115200 and direction switches carry no
		// reply of their own.
		if data.len() > 1 {
			let cmd = data.to_vec();
			self.handle(&cmd);
		}
		Ok(())
	}
}
