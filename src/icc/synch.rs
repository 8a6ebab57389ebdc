//! Synchronous (memory) card handling.
//!
//! Memory cards carry no protocol engine of their own: the reader moves
//! an address counter and shovels raw bytes. This layer figures out what
//! kind of card sits in the slot (I²C short or long addressing, 2-wire,
//! 3-wire), how much memory it has and whether writes are paged, then
//! offers verified reads and writes plus the PIN ceremonies of the wired
//! bus types.

use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::atr::synch::{self, SyncAtr};
use crate::ifd::{Ifd, IfdError, Led, MemoryCardKind, ReaderKind, ReaderStatus};
use crate::serial::SerialPort;

/// Line rate used for all memory-card traffic.
const BAUDRATE: u32 = 115_200;
/// Largest burst that keeps the low byte of the address counter valid.
const MAX_TRANSMIT: usize = 256;
/// I²C cells occasionally need a second write before they stick.
const I2C_MAX_RETRIES: usize = 2;
/// Writes longer than this get the retry treatment.
const I2C_RETRY_TRIGGER: usize = 1;
/// EEPROM settle time the internal drive needs after each burst.
const EEPROM_DELAY: Duration = Duration::from_millis(90);

pub const PIN_SIZE: usize = 3;

#[derive(Debug, Error)]
pub enum SyncIccError {
	#[error("reader command failed")]
	Ifd(#[from] IfdError),
	/// The card answered neither as I²C nor per its ATR.
	#[error("memory card type could not be determined")]
	Detect,
	/// Read-back after write kept differing; the address is read-only.
	#[error("memory is read-only at the written address")]
	ReadOnly,
	#[error("PIN verification failed, {trials} trials left")]
	Pin { trials: u32 },
	#[error("PIN retry counter is exhausted")]
	Blocked,
}

/// An initialized memory card and everything probed about it.
#[derive(Debug)]
pub struct SyncIcc {
	atr: SyncAtr,
	kind: MemoryCardKind,
	length: usize,
	pagemode: u8,
	pin: [u8; PIN_SIZE],
	pin_ok: bool,
	pin_needed: bool,
	active: bool,
	baudrate: u32,
}

impl SyncIcc {
	/// Reset the card and probe type, memory length and page mode. When
	/// the card offers no ATR, a synthetic one is fabricated from the
	/// probe results so upper layers always see a header.
	pub fn init<S: SerialPort>(ifd: &mut Ifd<S>) -> Result<SyncIcc, SyncIccError> {
		ifd.set_led(Led::Red)?;
		ifd.set_baudrate(BAUDRATE)?;
		ifd.activate_icc()?;

		let atr = ifd.reset_sync_icc()?;

		let mut icc = SyncIcc {
			atr: SyncAtr::synthetic(synch::PROTOCOL_SDA, 0),
			kind: MemoryCardKind::I2cShort,
			length: 0,
			pagemode: 0,
			pin: [0; PIN_SIZE],
			pin_ok: false,
			pin_needed: true,
			active: true,
			baudrate: BAUDRATE,
		};

		if let Err(err) = icc.probe(ifd, atr) {
			let _ = ifd.deactivate_icc();
			return Err(err);
		}

		info!(
			"ICC: {:?} memory card, {} bytes, pagemode {:#04x}",
			icc.kind, icc.length, icc.pagemode
		);

		ifd.set_led(Led::Green)?;

		if icc.needs_deactivate() {
			ifd.deactivate_icc()?;
			icc.active = false;
		}

		Ok(icc)
	}

	/// Power the card down and turn the LED off.
	pub fn close<S: SerialPort>(&mut self, ifd: &mut Ifd<S>) -> Result<(), IfdError> {
		ifd.deactivate_icc()?;
		ifd.set_led(Led::Off)
	}

	pub fn atr(&self) -> &SyncAtr {
		&self.atr
	}

	pub fn kind(&self) -> MemoryCardKind {
		self.kind
	}

	/// Memory size in bytes.
	pub fn length(&self) -> usize {
		self.length
	}

	pub fn pagemode(&self) -> u8 {
		self.pagemode
	}

	/// Bring the reader to the memory-card line rate.
	pub fn begin_transmission<S: SerialPort>(&self, ifd: &mut Ifd<S>) -> Result<(), IfdError> {
		ifd.set_baudrate(self.baudrate)
	}

	/// Read `data.len()` bytes starting at `address`.
	pub fn read<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		address: u16,
		data: &mut [u8],
	) -> Result<(), SyncIccError> {
		if self.needs_activate() {
			ifd.activate_icc()?;
			self.active = true;
		}

		ifd.set_read_address(self.kind, address)?;
		ifd.read_buffer(data)?;

		if self.needs_deactivate() {
			ifd.deactivate_icc()?;
			self.pin_needed = true;
			self.active = false;
		}

		Ok(())
	}

	/// Write `data` at `address`. The transfer is cut into bursts that
	/// stay below 256 bytes and never cross a page boundary; every burst
	/// is read back and compared, with a bounded retry for I²C cells.
	/// 2-wire cards re-enter their PIN whenever the write had to
	/// re-activate them.
	pub fn write<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		address: u16,
		data: &[u8],
	) -> Result<(), SyncIccError> {
		let i2c = matches!(self.kind, MemoryCardKind::I2cShort | MemoryCardKind::I2cLong);
		let max_retries = if data.len() > I2C_RETRY_TRIGGER && i2c {
			I2C_MAX_RETRIES
		} else {
			1
		};

		let mask = self.pagemode.wrapping_sub(1) as usize;
		let mut readback = [0u8; MAX_TRANSMIT];

		let mut written = 0;
		while written < data.len() {
			let burst_start = address as usize + written;
			let page_room = ((burst_start | mask) + 1) - burst_start;
			let to_write = (data.len() - written).min(MAX_TRANSMIT).min(page_room);
			let chunk = &data[written..written + to_write];

			let mut retries = 0;
			loop {
				if self.needs_activate() {
					ifd.activate_icc()?;
					self.active = true;

					if self.pin_ok && self.needs_pin() {
						let pin = self.pin;
						self.enter_pin(ifd, &pin)?;
					}
				}

				ifd.set_write_address(self.kind, burst_start as u16, self.pagemode)?;
				ifd.write_buffer(chunk)?;

				if self.needs_deactivate() {
					ifd.deactivate_icc()?;
					self.pin_needed = true;
					self.active = false;
				}

				self.read(ifd, burst_start as u16, &mut readback[..to_write])?;
				if readback[..to_write] == *chunk {
					break;
				}

				retries += 1;
				if retries >= max_retries {
					return Err(SyncIccError::ReadOnly);
				}
			}

			if ifd.kind() == ReaderKind::ChipdriveIntern {
				thread::sleep(EEPROM_DELAY);
			}

			written += to_write;
		}

		Ok(())
	}

	/// Present the PIN. Returns the remaining trial count on success;
	/// failure reports the decremented counter, an exhausted counter
	/// reports the card as blocked. I²C cards have no PIN and accept
	/// anything.
	pub fn enter_pin<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		pin: &[u8; PIN_SIZE],
	) -> Result<u32, SyncIccError> {
		if matches!(self.kind, MemoryCardKind::I2cShort | MemoryCardKind::I2cLong) {
			return Ok(0);
		}

		if self.needs_activate() {
			ifd.activate_icc()?;
			self.active = true;
		}

		let trials = ifd.read_error_counter(self.kind)?;
		if trials == 0 {
			return Err(SyncIccError::Blocked);
		}

		ifd.enter_pin(self.kind, pin, trials)?;

		let new_trials = ifd.read_error_counter(self.kind)?;
		if new_trials < trials {
			self.pin_ok = false;
			return Err(SyncIccError::Pin { trials: new_trials });
		}

		self.pin = *pin;
		self.pin_ok = true;
		self.pin_needed = false;

		Ok(new_trials)
	}

	/// Replace the PIN. The current PIN must already be verified; a card
	/// that had to be re-activated re-enters it first.
	pub fn change_pin<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		pin: &[u8; PIN_SIZE],
	) -> Result<(), SyncIccError> {
		if matches!(self.kind, MemoryCardKind::I2cShort | MemoryCardKind::I2cLong) {
			return Ok(());
		}

		if self.needs_activate() {
			ifd.activate_icc()?;
			self.active = true;

			if self.pin_ok && self.needs_pin() {
				let current = self.pin;
				self.enter_pin(ifd, &current)?;
			}
		}

		ifd.change_pin(self.kind, pin)?;

		self.pin = *pin;
		self.pin_ok = true;
		self.pin_needed = false;

		Ok(())
	}

	fn needs_pin(&self) -> bool {
		matches!(self.kind, MemoryCardKind::TwoWire | MemoryCardKind::ThreeWire) && self.pin_needed
	}

	fn needs_activate(&self) -> bool {
		!self.active
	}

	// 3-wire cards lose their state when powered down mid-session.
	fn needs_deactivate(&self) -> bool {
		self.kind != MemoryCardKind::ThreeWire && self.active
	}

	fn probe<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		atr: Option<SyncAtr>,
	) -> Result<(), SyncIccError> {
		self.kind = self.probe_card_kind(ifd, atr.as_ref())?;
		self.length = self.probe_memory_length(ifd, atr.as_ref())?;
		self.pagemode = if self.kind == MemoryCardKind::I2cLong { 0x40 } else { 0x00 };

		self.atr = match atr {
			Some(atr) => atr,
			None => SyncAtr::synthetic(protocol_nibble(self.kind), self.length),
		};

		Ok(())
	}

	fn probe_card_kind<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		atr: Option<&SyncAtr>,
	) -> Result<MemoryCardKind, SyncIccError> {
		if let Some(atr) = atr {
			let kind = match atr.protocol_type() {
				synch::PROTOCOL_3W => MemoryCardKind::ThreeWire,
				synch::PROTOCOL_2W => MemoryCardKind::TwoWire,
				synch::PROTOCOL_SDA => MemoryCardKind::I2cShort,
				other => {
					debug!("ICC: sync card with unknown protocol type {other:#x}");
					return Err(SyncIccError::Detect);
				}
			};
			return Ok(kind);
		}

		// No ATR: poke the card as I²C and see whether the address took.
		ifd.set_read_address(MemoryCardKind::I2cShort, 0)?;
		let status = ifd.status()?;
		ifd.deactivate_icc()?;
		self.active = false;

		if status.contains(ReaderStatus::OUT_OF_RANGE) {
			return Err(SyncIccError::Detect);
		}

		// Short addressing answered; a write probe that cannot be
		// restored demotes the card to long addressing.
		self.kind = MemoryCardKind::I2cShort;

		let mut orig = [0u8; 1];
		self.read(ifd, 0, &mut orig)?;

		let modified = match orig[0] {
			0xFF => 0x01,
			0x00 => 0xFE,
			b => !b,
		};

		if self.write(ifd, 0, &[modified]).is_ok() {
			self.write(ifd, 0, &orig)?;
		} else {
			self.kind = MemoryCardKind::I2cLong;
		}

		ifd.activate_icc()?;
		self.active = true;

		Ok(self.kind)
	}

	fn probe_memory_length<S: SerialPort>(
		&mut self,
		ifd: &mut Ifd<S>,
		atr: Option<&SyncAtr>,
	) -> Result<usize, SyncIccError> {
		if let Some(atr) = atr {
			return Ok(atr.memory_len());
		}

		// Double-and-test: set a read address just past the candidate
		// size and watch the out-of-range bit.
		let (min, max) = match self.kind {
			MemoryCardKind::I2cLong => (2048, 32768),
			_ => (256, 2048),
		};

		let mut length = min;
		while length < max {
			ifd.set_read_address(self.kind, length as u16)?;
			let status = ifd.status()?;
			ifd.deactivate_icc()?;
			ifd.activate_icc()?;

			if status.contains(ReaderStatus::OUT_OF_RANGE) {
				break;
			}
			length *= 2;
		}

		Ok(length)
	}

	#[cfg(test)]
	pub(crate) fn for_test(atr: SyncAtr, kind: MemoryCardKind, length: usize, pagemode: u8) -> SyncIcc {
		SyncIcc {
			atr,
			kind,
			length,
			pagemode,
			pin: [0; PIN_SIZE],
			pin_ok: false,
			pin_needed: true,
			active: false,
			baudrate: crate::ifd::DEFAULT_BAUDRATE,
		}
	}
}

fn protocol_nibble(kind: MemoryCardKind) -> u8 {
	match kind {
		MemoryCardKind::I2cShort | MemoryCardKind::I2cLong => synch::PROTOCOL_SDA,
		MemoryCardKind::TwoWire => synch::PROTOCOL_2W,
		MemoryCardKind::ThreeWire => synch::PROTOCOL_3W,
	}
}
