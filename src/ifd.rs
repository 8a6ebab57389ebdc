//! Reader framer for the Chipdrive / Kartenzwerg family.
//!
//! Every command put on the wire ends in a running XOR-rotate checksum
//! seeded with the slot address; at 115200 bps a length byte precedes
//! the body and folds into the seed. The framer exposes the reader's
//! atomic primitives (status, activation, resets, LED and line control,
//! card transmit/receive, the memory-card address/buffer/PIN
//! operations), each writing one command and reading exactly the
//! documented number of reply bytes.

use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use heapless::Vec as BoundedVec;
use num_enum::FromPrimitive;
use thiserror::Error;

use crate::atr::synch::SyncAtr;
use crate::atr::Atr;
use crate::serial::{Parity, PortProperties, SerialError, SerialPort};

/// Reply timeout for framed commands.
const TIMEOUT: Duration = Duration::from_millis(1000);
/// Per-byte timeout while the card emits its ATR.
const ATR_TIMEOUT: Duration = Duration::from_millis(400);
/// Base write delay (none; card timings add on top).
const DELAY: Duration = Duration::from_millis(0);
/// Line rate the reader speaks after power-up.
pub const DEFAULT_BAUDRATE: u32 = 9600;
/// Burst size of the memory-card read/write buffer commands.
const PS: usize = 15;
/// Largest payload of one card-transmit block.
const MAX_TRANSMIT: usize = 255;
/// Card clock, fixed by the reader hardware.
pub const CLOCK_RATE: u32 = 372 * 9600;
pub const MAX_BAUDRATE: u32 = 115_200;

pub const SLOT_A: u8 = 0x00;
pub const SLOT_B: u8 = 0x01;
const PIN_SIZE: usize = 3;

/// Reader model, as reported by the info command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ReaderKind {
	ChipdriveExtII = 0x84,
	ChipdriveExtI = 0x88,
	ChipdriveIntern = 0x90,
	ChipdriveMicro = 0x64,
	KartenzwergII = 0x61,
	Kartenzwerg = 0x60,
	#[num_enum(default)]
	Unknown = 0x00,
}

/// LED colors; the byte doubles as the command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Led {
	Off = 0x00,
	Green = 0x40,
	Red = 0x80,
	Yellow = 0xC0,
}

/// Parity convention of the card line, as the reader encodes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IfdParity {
	Odd = 0x01,
	Even = 0x02,
}

/// Wiring of a synchronous memory card; selects the command templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCardKind {
	I2cShort,
	I2cLong,
	TwoWire,
	ThreeWire,
}

/// Reset polarity handling during the async reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConventionPolicy {
	/// Start direct, flip to inverse when the card stays silent.
	#[default]
	Adaptive,
	/// Direct convention only.
	Direct,
	/// Inverse convention only.
	Inverse,
}

bitflags! {
	/// Status byte returned by the status command.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ReaderStatus: u8 {
		/// A card sits in the slot.
		const CARD_PRESENT = 0x40;
		/// Insertion or removal happened since the last query.
		const CHANGED = 0x80;
		/// The last memory address was outside the card.
		const OUT_OF_RANGE = 0x10;
	}
}

/// Per-card delays and timeouts added on top of the framer's own,
/// in milliseconds. Owned by the ICC layer and derived from the ATR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
	pub block_timeout: u32,
	pub char_timeout: u32,
	pub block_delay: u32,
	pub char_delay: u32,
}

#[derive(Debug, Error)]
pub enum IfdError {
	#[error("serial transport failed")]
	Io(#[from] SerialError),
	/// The reader did not acknowledge a command with 0x01.
	#[error("reader rejected the command")]
	Chk,
	#[error("argument out of range for this reader")]
	Param,
	#[error("operation not supported by this reader")]
	Unsupported,
	/// Neither reset polarity produced a parseable ATR.
	#[error("card did not answer to reset")]
	NoAnswer,
}

/// One initialized reader slot on the serial line.
pub struct Ifd<S: SerialPort> {
	io: S,
	slot: u8,
	kind: ReaderKind,
	firmware: u8,
}

impl<S: SerialPort> Ifd<S> {
	/// Bring up the reader on `io` and identify it. The port is put into
	/// the power-up profile (9600 8E2, DTR/RTS high) first.
	pub fn new(io: S, slot: u8) -> Result<Ifd<S>, IfdError> {
		if slot != SLOT_A && slot != SLOT_B {
			return Err(IfdError::Param);
		}

		debug!("IFD: initializing slot {slot}");

		let mut ifd = Ifd {
			io,
			slot,
			kind: ReaderKind::Unknown,
			firmware: 0,
		};

		let mut props = PortProperties {
			input_bps: DEFAULT_BAUDRATE,
			output_bps: DEFAULT_BAUDRATE,
			bits: 8,
			parity: Parity::Even,
			stopbits: 2,
			dtr: true,
			rts: true,
		};
		ifd.io.set_properties(&props)?;

		ifd.set_baudrate(DEFAULT_BAUDRATE)?;
		ifd.set_parity(IfdParity::Even)?;
		ifd.read_reader_info()?;

		// Kartenzwerg wants the port at 8N1 once identified.
		if ifd.kind == ReaderKind::Kartenzwerg {
			props.parity = Parity::None;
			props.stopbits = 1;
			ifd.io.set_properties(&props)?;
		}

		Ok(ifd)
	}

	/// Turn the LED off and hand the transport back.
	pub fn close(mut self) -> Result<S, IfdError> {
		debug!("IFD: closing slot {}", self.slot);
		self.set_led(Led::Off)?;
		Ok(self.io)
	}

	pub fn kind(&self) -> ReaderKind {
		self.kind
	}

	pub fn firmware(&self) -> u8 {
		self.firmware
	}

	pub fn slot(&self) -> u8 {
		self.slot
	}

	pub fn num_slots(&self) -> u8 {
		if self.kind == ReaderKind::ChipdriveExtII { 2 } else { 1 }
	}

	/// Short model code plus firmware revision, e.g. `CE2 0x23` as "CE223".
	pub fn description(&self) -> String {
		let code = match self.kind {
			ReaderKind::ChipdriveExtII => "CE2",
			ReaderKind::ChipdriveExtI => "CE1",
			ReaderKind::ChipdriveIntern => "CDI",
			ReaderKind::ChipdriveMicro => "CDM",
			ReaderKind::KartenzwergII => "KZ2",
			ReaderKind::Kartenzwerg => "KZ1",
			ReaderKind::Unknown => "UNK",
		};
		format!("{code}{:02X}", self.firmware)
	}

	pub fn clock_rate(&self) -> u32 {
		CLOCK_RATE
	}

	pub fn max_baudrate(&self) -> u32 {
		MAX_BAUDRATE
	}

	pub fn baudrate(&self) -> u32 {
		self.io.properties().output_bps
	}

	/// Switch reader and port to `baudrate`. A request for the current
	/// rate is a no-op on the wire.
	pub fn set_baudrate(&mut self, baudrate: u32) -> Result<(), IfdError> {
		if baudrate == 0 || baudrate > self.max_baudrate() {
			debug!("IFD: unsupported baudrate {baudrate}");
			return Err(IfdError::Param);
		}

		let mut props = self.io.properties();
		if props.output_bps == baudrate {
			return Ok(());
		}

		debug!("IFD: setting baudrate to {baudrate}");

		// Reader-internal quantum for the next-higher table rate.
		let (quantum, divider) = match baudrate {
			..=1200 => (0x60, 0x07),
			..=2400 => (0x2E, 0x03),
			..=4800 => (0x17, 0x05),
			..=6975 => (0x0F, 0x01),
			..=9600 => (0x0B, 0x02),
			..=14400 => (0x07, 0x01),
			..=19200 => (0x05, 0x02),
			..=28800 => (0x03, 0x00),
			..=38400 => (0x02, 0x00),
			..=57600 => (0x01, 0x00),
			_ => (0x80, 0x00),
		};

		let mut cmd = [0x6E, quantum, quantum ^ 0x5D, divider, 0x08, 0x00];
		self.send_command(&mut cmd)?;
		self.read_ack()?;

		props.input_bps = baudrate;
		props.output_bps = baudrate;
		self.io.set_properties(&props)?;

		// The reader needs a moment to settle on the new rate.
		thread::sleep(Duration::from_millis(150));

		Ok(())
	}

	/// Ask the reader to sample card bytes with the given parity. The ack
	/// byte is read but deliberately not checked; the switch is best
	/// effort on all known firmware revisions.
	pub fn set_parity(&mut self, parity: IfdParity) -> Result<(), IfdError> {
		if self.kind == ReaderKind::Kartenzwerg {
			return Err(IfdError::Unsupported);
		}

		debug!("IFD: parity {parity:?}");

		let mut props = self.io.properties();

		// The reader expects the handshake at even parity.
		if props.parity == Parity::Odd {
			props.parity = Parity::Even;
			self.io.set_properties(&props)?;
		}

		let mut cmd = [0x6F, parity as u8, 0x6A, 0x0F, 0x00];
		self.send_command(&mut cmd)?;

		let mut status = [0u8; 1];
		self.io.read(TIMEOUT, &mut status)?;

		if parity == IfdParity::Odd {
			props.parity = Parity::Odd;
			self.io.set_properties(&props)?;
		}

		Ok(())
	}

	pub fn set_led(&mut self, color: Led) -> Result<(), IfdError> {
		debug!("IFD: LED {color:?}");
		let mut cmd = [0x6F, color as u8, 0x6A, 0x0F, 0x00];
		self.send_command(&mut cmd)?;
		self.read_ack()
	}

	/// Query card presence and the change-since-last-query bit. The
	/// first read after an insertion or removal may time out once; one
	/// retry covers it.
	pub fn status(&mut self) -> Result<ReaderStatus, IfdError> {
		let mut reply = [0u8; 2];

		let mut cmd = [0x03, 0x00];
		self.send_command(&mut cmd)?;

		if self.io.read(TIMEOUT, &mut reply).is_err() {
			warn!("IFD: status read timed out, retrying once");

			let mut cmd = [0x03, 0x00];
			self.send_command(&mut cmd)?;
			self.io.read(TIMEOUT, &mut reply)?;
		}

		let status = ReaderStatus::from_bits_retain(reply[0]);
		debug!(
			"IFD: status: {} / {}",
			if status.contains(ReaderStatus::CARD_PRESENT) { "card" } else { "no card" },
			if status.contains(ReaderStatus::CHANGED) { "change" } else { "no change" },
		);

		Ok(status)
	}

	pub fn activate_icc(&mut self) -> Result<(), IfdError> {
		debug!("IFD: activating card");
		let mut cmd = [0x60, 0x0F, 0x00];
		self.send_command(&mut cmd)?;
		self.read_ack()
	}

	pub fn deactivate_icc(&mut self) -> Result<(), IfdError> {
		debug!("IFD: deactivating card");
		let mut cmd = [0x61, 0x0F, 0x00];
		self.send_command(&mut cmd)?;
		self.read_ack()
	}

	/// Reset an asynchronous card and capture its ATR. Both reset
	/// polarities are tried under the current parity; when the card
	/// stays silent and the policy allows it, the parity convention is
	/// flipped and the sequence repeated. The line always ends up back
	/// at even parity.
	pub fn reset_async_icc(
		&mut self,
		convention: ConventionPolicy,
		strict_atr: bool,
	) -> Result<Atr, IfdError> {
		if self.kind == ReaderKind::Kartenzwerg {
			return Err(IfdError::Unsupported);
		}

		debug!("IFD: resetting card");

		// Checksums over the fixed reset commands are seeded with the
		// slot directly; no length prefix is in play at reset speed.
		let mut active_high = [0x80, 0x6F, 0x00, 0x05, 0x00];
		let mut active_low = [0xA0, 0x6F, 0x00, 0x05, 0x00];
		active_high[4] = checksum(&active_high[..4], self.slot);
		active_low[4] = checksum(&active_low[..4], self.slot);

		let mut parity = IfdParity::Even;
		if convention == ConventionPolicy::Inverse {
			parity = IfdParity::Odd;
			self.set_parity(parity)?;
		}

		let mut result = Err(IfdError::NoAnswer);

		loop {
			for _ in 0..2 {
				self.io.write(DELAY, &active_low)?;
				if let Some(atr) = self.capture_atr(strict_atr) {
					result = Ok(atr);
					break;
				}

				self.io.write(DELAY, &active_high)?;
				if let Some(atr) = self.capture_atr(strict_atr) {
					result = Ok(atr);
					break;
				}
			}

			if result.is_ok() {
				if parity == IfdParity::Odd {
					parity = IfdParity::Even;
					self.set_parity(parity)?;
				}
			} else if convention != ConventionPolicy::Direct {
				parity = match parity {
					IfdParity::Even => IfdParity::Odd,
					IfdParity::Odd => IfdParity::Even,
				};
				warn!("IFD: no ATR, flipping parity to {parity:?}");
				self.set_parity(parity)?;
			}

			if parity == IfdParity::Even {
				break;
			}
		}

		result
	}

	fn capture_atr(&mut self, strict: bool) -> Option<Atr> {
		if strict {
			return Atr::from_stream(&mut self.io, ATR_TIMEOUT).ok();
		}

		// Lenient capture: collect bytes until the card falls silent,
		// then let the parser judge the buffer.
		let mut buf: BoundedVec<u8, { Atr::MAX_SIZE }> = BoundedVec::new();
		while buf.len() < Atr::MAX_SIZE {
			let mut byte = [0u8; 1];
			if self.io.read(ATR_TIMEOUT, &mut byte).is_err() {
				break;
			}
			let _ = buf.push(byte[0]);
		}

		if buf.is_empty() {
			return None;
		}
		Atr::from_bytes(&buf).ok()
	}

	/// Reset a synchronous card. The reader answers with an 8-byte
	/// buffer; a leading 0xFF means the card has no ATR.
	pub fn reset_sync_icc(&mut self) -> Result<Option<SyncAtr>, IfdError> {
		let mut cmd = [0x70, 0x80, 0x62, 0x0F, 0x00];
		self.send_command(&mut cmd)?;
		self.read_ack()?;

		let mut answer = [0u8; 8];
		self.read_buffer(&mut answer)?;

		if answer[0] == 0xFF {
			return Ok(None);
		}
		Ok(SyncAtr::from_bytes(&answer))
	}

	/// Send bytes to the card, framed in blocks of at most 255 payload
	/// bytes. The first byte of the whole transfer honors the block
	/// delay, every other byte the character delay.
	pub fn transmit(&mut self, timings: &Timings, data: &[u8]) -> Result<(), IfdError> {
		if self.kind == ReaderKind::Kartenzwerg {
			return Err(IfdError::Unsupported);
		}

		debug!("IFD: transmit {data:02X?}");

		let high_speed = self.io.properties().output_bps > DEFAULT_BAUDRATE;
		let char_delay = DELAY + Duration::from_millis(timings.char_delay as u64);
		let block_delay = DELAY + Duration::from_millis(timings.block_delay as u64);

		let mut sent = 0;
		while sent < data.len() {
			let to_send = (data.len() - sent).min(MAX_TRANSMIT);
			let chunk = &data[sent..sent + to_send];

			let mut header = [0x6F, to_send as u8, 0x05, 0x00, 0xFE, 0xF8];
			let seed = self.command_seed(4)?;
			header[3] = checksum(&header[..3], seed);
			let header_len = if high_speed { 6 } else { 4 };
			self.io.write(DELAY, &header[..header_len])?;

			if sent == 0 && block_delay != char_delay {
				self.io.write(block_delay, &chunk[..1])?;
				if chunk.len() > 1 {
					self.io.write(char_delay, &chunk[1..])?;
				}
			} else {
				self.io.write(char_delay, chunk)?;
			}

			sent += to_send;
		}

		Ok(())
	}

	/// Read card bytes; the first byte waits out the block timeout, the
	/// rest the character timeout.
	pub fn receive(&mut self, timings: &Timings, data: &mut [u8]) -> Result<(), IfdError> {
		if self.kind == ReaderKind::Kartenzwerg {
			return Err(IfdError::Unsupported);
		}

		let char_timeout = TIMEOUT + Duration::from_millis(timings.char_timeout as u64);
		let block_timeout = TIMEOUT + Duration::from_millis(timings.block_timeout as u64);

		if block_timeout != char_timeout && !data.is_empty() {
			self.io.read(block_timeout, &mut data[..1])?;
			if data.len() > 1 {
				self.io.read(char_timeout, &mut data[1..])?;
			}
		} else {
			self.io.read(char_timeout, data)?;
		}

		debug!("IFD: receive {data:02X?}");

		Ok(())
	}

	/// Turn the line around between host transmit and card answer. Only
	/// meaningful above the power-up rate; a no-op otherwise.
	pub fn switch_direction(&mut self) -> Result<(), IfdError> {
		if self.io.properties().output_bps > DEFAULT_BAUDRATE {
			self.io.write(DELAY, &[0xF8])?;
			debug!("IFD: direction switch");
		}
		Ok(())
	}

	/// Load the card's address counter for a subsequent buffer read.
	pub fn set_read_address(&mut self, kind: MemoryCardKind, address: u16) -> Result<(), IfdError> {
		let [hi, lo] = address.to_be_bytes();

		debug!("IFD: {kind:?} set read address {address}");

		match kind {
			MemoryCardKind::I2cShort => {
				let mut cmd = [
					0x7C, 0x64, 0x41, (hi << 1) | 0xA0, lo, 0x64, 0x40, (hi << 1) | 0xA1, 0x0F,
					0x00,
				];
				self.send_command(&mut cmd)?;
			}
			MemoryCardKind::I2cLong => {
				let mut cmd = [
					0x7C, 0x64, 0x42, 0xA0, hi, lo, 0x64, 0x40, 0xA1, 0x0F, 0x00,
				];
				self.send_command(&mut cmd)?;
			}
			MemoryCardKind::TwoWire => {
				let mut cmd = [0x70, 0x64, 0x42, 0x30, lo, 0x00, 0x65, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
			}
			MemoryCardKind::ThreeWire => {
				let mut cmd = [0x70, 0xA0, 0x42, (hi << 6) | 0x0E, lo, 0x00, 0x80, 0x50, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
			}
		}

		self.read_ack()
	}

	/// Load the card's address counter for a subsequent buffer write.
	pub fn set_write_address(
		&mut self,
		kind: MemoryCardKind,
		address: u16,
		pagemode: u8,
	) -> Result<(), IfdError> {
		let [hi, lo] = address.to_be_bytes();

		debug!("IFD: {kind:?} set write address {address}");

		match kind {
			MemoryCardKind::I2cShort => {
				let mut cmd = [
					0x7C, 0x64, 0x41, 0xA0, 0x00, 0x64, 0x40, 0xA1, 0x0F, 0x00,
				];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x7E, 0x10, 0x00];
				self.send_command(&mut cmd)?;
				let mut reply = [0u8; 2];
				self.io.read(TIMEOUT, &mut reply)?;

				let mut cmd = [0x7E, 0x66, 0x6E, lo, (hi << 1) | 0xA0, pagemode, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()
			}
			MemoryCardKind::I2cLong => {
				let mut cmd = [
					0x7C, 0x64, 0x42, 0xA0, 0x00, 0x00, 0x64, 0x40, 0xA1, 0x0F, 0x00,
				];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x7E, 0x10, 0x00];
				self.send_command(&mut cmd)?;
				let mut reply = [0u8; 2];
				self.io.read(TIMEOUT, &mut reply)?;

				let mut cmd = [0x7F, 0x66, 0x6E, lo, hi, 0xA0, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()
			}
			MemoryCardKind::TwoWire => {
				let mut cmd = [0x72, 0x6E, lo, 0x38, 0x03, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()
			}
			MemoryCardKind::ThreeWire => {
				let mut cmd = [0x73, 0x67, 0x6E, lo, (hi << 6) | 0x33, 0x02, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()
			}
		}
	}

	/// Fetch `data.len()` bytes from the current read address, in bursts
	/// of at most 15 plus a remainder.
	pub fn read_buffer(&mut self, data: &mut [u8]) -> Result<(), IfdError> {
		let mut status = [0u8; 1];

		let full_blocks = data.len() / PS;
		for block in 0..full_blocks {
			let mut cmd = [(PS as u8 - 1) | 0x10, 0x00];
			self.send_command(&mut cmd)?;

			self.io.read(TIMEOUT, &mut data[block * PS..(block + 1) * PS])?;
			self.io.read(TIMEOUT, &mut status)?;
		}

		let remainder = data.len() % PS;
		if remainder != 0 {
			let start = full_blocks * PS;
			let mut cmd = [(remainder as u8 - 1) | 0x10, 0x00];
			self.send_command(&mut cmd)?;

			self.io.read(TIMEOUT, &mut data[start..])?;
			self.io.read(TIMEOUT, &mut status)?;
		}

		debug!("IFD: read memory {data:02X?}");

		Ok(())
	}

	/// Store `data` at the current write address, in bursts of at most
	/// 15 plus a remainder.
	pub fn write_buffer(&mut self, data: &[u8]) -> Result<(), IfdError> {
		let mut cmd = [0u8; PS + 3];

		let full_blocks = data.len() / PS;
		for block in 0..full_blocks {
			cmd[0] = 0x4E;
			cmd[1..1 + PS].copy_from_slice(&data[block * PS..(block + 1) * PS]);
			self.send_command(&mut cmd[..PS + 2])?;
			self.read_ack()?;
		}

		let remainder = data.len() % PS;
		if remainder != 0 {
			let chunk = &data[full_blocks * PS..];
			cmd[0] = (remainder as u8 - 1) | 0x40;
			cmd[1..1 + remainder].copy_from_slice(chunk);
			cmd[1 + remainder] = 0x0F;
			self.send_command(&mut cmd[..remainder + 3])?;
			self.read_ack()?;
		}

		debug!("IFD: write memory {data:02X?}");

		Ok(())
	}

	/// Remaining PIN trials, the Hamming weight of the card's error
	/// counter byte.
	pub fn read_error_counter(&mut self, kind: MemoryCardKind) -> Result<u32, IfdError> {
		match kind {
			MemoryCardKind::TwoWire => {
				let mut cmd = [0x70, 0x64, 0x42, 0x31, 0x00, 0x00, 0x65, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x13, 0x00];
				self.send_command(&mut cmd)?;
				let mut reply = [0u8; 5];
				self.io.read(TIMEOUT, &mut reply)?;

				let trials = num_trials(reply[0]);
				debug!("IFD: 2W error counter: {trials}");
				Ok(trials)
			}
			MemoryCardKind::ThreeWire => {
				let mut cmd = [0x70, 0xA0, 0x42, 0xCE, 0xFD, 0xFD, 0x80, 0x50, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x10, 0x00];
				self.send_command(&mut cmd)?;
				let mut reply = [0u8; 2];
				self.io.read(TIMEOUT, &mut reply)?;

				let trials = num_trials(reply[0]);
				debug!("IFD: 3W error counter: {trials}");
				Ok(trials)
			}
			_ => Err(IfdError::Param),
		}
	}

	/// Present the PIN to a 2-wire or 3-wire card. `trials` is the
	/// current error counter; it selects the counter bit the ceremony
	/// burns.
	pub fn enter_pin(
		&mut self,
		kind: MemoryCardKind,
		pin: &[u8; PIN_SIZE],
		trials: u32,
	) -> Result<(), IfdError> {
		match kind {
			MemoryCardKind::TwoWire => {
				debug!("IFD: 2W enter pin");

				let mut cmd = [0x72, 0x6E, 0x00, 0x39, 0x03, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let counter = match trials {
					3 => 0x06,
					2 => 0x04,
					_ => 0x00,
				};
				let mut cmd = [0x40, counter, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x72, 0x6E, 0x01, 0x33, 0x03, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x42, pin[0], pin[1], pin[2], 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				let mut status = [0u8; 1];
				self.io.read(TIMEOUT, &mut status)?;

				let mut cmd = [0x72, 0x6E, 0x00, 0x39, 0x03, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x40, 0xFF, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()
			}
			MemoryCardKind::ThreeWire => {
				debug!("IFD: 3W enter pin");

				let mut cmd = [0x73, 0x67, 0x6E, 0xFD, 0xF2, 0x02, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let counter = match trials {
					8 => 0xFE,
					7 => 0xFC,
					6 => 0xF8,
					5 => 0xF0,
					4 => 0xE0,
					3 => 0xC0,
					2 => 0x80,
					_ => 0x00,
				};
				let mut cmd = [0x40, counter, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x73, 0x67, 0x6E, 0xFE, 0xCD, 0x02, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x40, pin[0], 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x73, 0x67, 0x6E, 0xFF, 0xCD, 0x02, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x40, pin[1], 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x73, 0x67, 0x6E, 0xFD, 0xF3, 0x02, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x40, 0xFF, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()
			}
			_ => Err(IfdError::Param),
		}
	}

	/// Write a new PIN to a 2-wire or 3-wire card. The current PIN must
	/// have been verified beforehand.
	pub fn change_pin(&mut self, kind: MemoryCardKind, pin: &[u8; PIN_SIZE]) -> Result<(), IfdError> {
		match kind {
			MemoryCardKind::TwoWire => {
				debug!("IFD: 2W change pin");

				let mut cmd = [0x72, 0x6E, 0x01, 0x39, 0x03, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x42, pin[0], pin[1], pin[2], 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()
			}
			MemoryCardKind::ThreeWire => {
				debug!("IFD: 3W change pin");

				let mut cmd = [0x73, 0x67, 0x6E, 0xFE, 0xF3, 0x02, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x40, pin[0], 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x73, 0x67, 0x6E, 0xFF, 0xF3, 0x02, 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()?;

				let mut cmd = [0x40, pin[1], 0x0F, 0x00];
				self.send_command(&mut cmd)?;
				self.read_ack()
			}
			_ => Err(IfdError::Param),
		}
	}

	#[cfg(test)]
	pub(crate) fn for_test(io: S, slot: u8, kind: ReaderKind) -> Ifd<S> {
		Ifd { io, slot, kind, firmware: 0x10 }
	}

	#[cfg(test)]
	pub(crate) fn into_io(self) -> S {
		self.io
	}

	fn read_reader_info(&mut self) -> Result<(), IfdError> {
		let mut cmd = [0x00, 0x00];
		cmd[1] = checksum(&cmd[..1], self.slot);
		self.io.write(DELAY, &cmd)?;

		let mut reply = [0u8; 3];
		self.io.read(TIMEOUT, &mut reply)?;

		self.kind = ReaderKind::from_primitive(reply[0]);
		self.firmware = reply[1];

		info!("IFD: reader {:?}, firmware {:#04x}", self.kind, self.firmware);

		Ok(())
	}

	/// Complete `cmd` with its checksum and put it on the wire. At
	/// 115200 bps a length byte goes out first and seeds the checksum.
	fn send_command(&mut self, cmd: &mut [u8]) -> Result<(), IfdError> {
		let seed = self.command_seed(cmd.len())?;
		let body = cmd.len() - 1;
		cmd[body] = checksum(&cmd[..body], seed);
		self.io.write(DELAY, cmd)?;
		Ok(())
	}

	fn command_seed(&mut self, len: usize) -> Result<u8, IfdError> {
		if self.io.properties().output_bps >= MAX_BAUDRATE {
			let prefix = [len as u8 - 1];
			self.io.write(DELAY, &prefix)?;
			Ok(checksum(&prefix, self.slot))
		} else {
			Ok(self.slot)
		}
	}

	fn read_ack(&mut self) -> Result<(), IfdError> {
		let mut status = [0u8; 1];
		self.io.read(TIMEOUT, &mut status)?;
		if status[0] != 0x01 {
			return Err(IfdError::Chk);
		}
		Ok(())
	}
}

/// Running XOR-rotate over `bytes`: XOR in the byte, shift left, and set
/// the low bit iff the evicted high bit was zero.
fn checksum(bytes: &[u8], seed: u8) -> u8 {
	let mut c = seed;
	for &b in bytes {
		c ^= b;
		let x7 = c & 0x80;
		c <<= 1;
		if x7 == 0 {
			c |= 0x01;
		}
	}
	c
}

fn num_trials(counter: u8) -> u32 {
	counter.count_ones()
}
