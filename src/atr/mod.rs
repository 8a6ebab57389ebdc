//! ISO-7816-3 Answer-To-Reset decoding.
//!
//! The parser accepts either an already captured byte buffer or a
//! streaming source that yields one byte per read (used when the reader
//! is driven in strict mode and each byte must arrive within the ATR
//! timeout). The decoded form keeps the raw bytes alongside, so
//! serializing a parsed ATR reproduces the input.

pub mod synch;

use std::time::Duration;

use heapless::Vec as BoundedVec;
use smallvec::SmallVec;
use thiserror::Error;

use crate::serial::{SerialError, SerialPort};

/// Clock conversion factors indexed by the high nibble of TA1.
/// Zero marks a reserved code; users fall back to the default 372.
const FI_TABLE: [u32; 16] = [
	372, 372, 558, 744, 1116, 1488, 1860, 0, 0, 512, 768, 1024, 1536, 2048, 0, 0,
];

/// Baud rate adjustment factors indexed by the low nibble of TA1.
const DI_TABLE: [u32; 16] = [0, 1, 2, 4, 8, 16, 32, 64, 12, 20, 0, 0, 0, 0, 0, 0];

pub const DEFAULT_FI: u32 = 372;
pub const DEFAULT_DI: u32 = 1;
pub const DEFAULT_WI: u8 = 10;
pub const DEFAULT_IFSC: u8 = 32;

const MAX_SIZE: usize = 33;

/// Bit convention announced by TS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
	Direct,
	Inverse,
}

/// The four interface byte kinds of one TA/TB/TC/TD group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceByte {
	Ta,
	Tb,
	Tc,
	Td,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AtrError {
	#[error("ATR does not follow the ISO 7816-3 grammar")]
	Malformed,
	#[error("ATR check byte does not match")]
	Checksum,
	#[error("reading ATR byte from the card failed")]
	Io,
}

impl From<SerialError> for AtrError {
	fn from(_: SerialError) -> Self {
		AtrError::Io
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct IbGroup {
	ta: Option<u8>,
	tb: Option<u8>,
	tc: Option<u8>,
	td: Option<u8>,
}

/// A parsed Answer-To-Reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
	raw: BoundedVec<u8, MAX_SIZE>,
	ts: u8,
	t0: u8,
	ib: SmallVec<[IbGroup; 4]>,
	hb: BoundedVec<u8, 15>,
	tck: Option<u8>,
}

impl Atr {
	/// Longest ATR the standard allows.
	pub const MAX_SIZE: usize = MAX_SIZE;

	/// Parse a captured buffer. Bytes beyond the grammar (trailing noise
	/// from a timeout-terminated capture) are ignored and not retained.
	pub fn from_bytes(bytes: &[u8]) -> Result<Atr, AtrError> {
		let mut pos = 0;
		Self::parse(|| {
			let b = bytes.get(pos).copied().ok_or(AtrError::Malformed)?;
			pos += 1;
			Ok(b)
		})
	}

	/// Parse directly from the serial transport, demanding every byte the
	/// grammar calls for within `timeout`.
	pub fn from_stream<S: SerialPort>(port: &mut S, timeout: Duration) -> Result<Atr, AtrError> {
		Self::parse(|| {
			let mut b = [0u8; 1];
			port.read(timeout, &mut b)?;
			Ok(b[0])
		})
	}

	fn parse(mut next: impl FnMut() -> Result<u8, AtrError>) -> Result<Atr, AtrError> {
		let mut raw = BoundedVec::new();
		let mut take = |raw: &mut BoundedVec<u8, MAX_SIZE>| -> Result<u8, AtrError> {
			let b = next()?;
			raw.push(b).map_err(|_| AtrError::Malformed)?;
			Ok(b)
		};

		let ts = take(&mut raw)?;
		if ts != 0x3B && ts != 0x3F {
			return Err(AtrError::Malformed);
		}

		let t0 = take(&mut raw)?;
		let hbn = t0 & 0x0F;

		let mut ib: SmallVec<[IbGroup; 4]> = SmallVec::new();
		let mut y = t0 >> 4;
		let mut tck_needed = false;

		while y != 0 {
			let mut group = IbGroup::default();

			if y & 0x01 != 0 {
				group.ta = Some(take(&mut raw)?);
			}
			if y & 0x02 != 0 {
				group.tb = Some(take(&mut raw)?);
			}
			if y & 0x04 != 0 {
				group.tc = Some(take(&mut raw)?);
			}
			if y & 0x08 != 0 {
				let td = take(&mut raw)?;
				group.td = Some(td);
				if td & 0x0F != 0 {
					tck_needed = true;
				}
				y = td >> 4;
			} else {
				y = 0;
			}

			ib.push(group);
		}

		let mut hb = BoundedVec::new();
		for _ in 0..hbn {
			let b = take(&mut raw)?;
			hb.push(b).map_err(|_| AtrError::Malformed)?;
		}

		// TCK is present iff a protocol other than T=0 was offered, and
		// then T0 through TCK must XOR to zero.
		let tck = if tck_needed {
			let tck = take(&mut raw)?;
			if raw[1..].iter().fold(0u8, |acc, b| acc ^ b) != 0 {
				return Err(AtrError::Checksum);
			}
			Some(tck)
		} else {
			None
		};

		Ok(Atr { raw, ts, t0, ib, hb, tck })
	}

	/// The raw ATR bytes, exactly as parsed.
	pub fn raw(&self) -> &[u8] {
		&self.raw
	}

	pub fn convention(&self) -> Convention {
		if self.ts == 0x3F {
			Convention::Inverse
		} else {
			Convention::Direct
		}
	}

	pub fn t0(&self) -> u8 {
		self.t0
	}

	pub fn historical_bytes(&self) -> &[u8] {
		&self.hb
	}

	pub fn tck(&self) -> Option<u8> {
		self.tck
	}

	/// Interface byte of `kind` in the 1-based group `i`, if announced.
	pub fn interface_byte(&self, i: usize, kind: InterfaceByte) -> Option<u8> {
		let group = self.ib.get(i.checked_sub(1)?)?;
		match kind {
			InterfaceByte::Ta => group.ta,
			InterfaceByte::Tb => group.tb,
			InterfaceByte::Tc => group.tc,
			InterfaceByte::Td => group.td,
		}
	}

	/// Protocol numbers named by the TD bytes, in offer order.
	pub fn protocols(&self) -> impl Iterator<Item = u8> + '_ {
		self.ib.iter().filter_map(|g| g.td).map(|td| td & 0x0F)
	}

	/// The first offered protocol; T=0 when no TD1 is present.
	pub fn first_protocol(&self) -> u8 {
		self.protocols().next().unwrap_or(0)
	}

	/// Clock conversion factor from TA1, default 372.
	pub fn fi(&self) -> u32 {
		match self.interface_byte(1, InterfaceByte::Ta) {
			Some(ta1) => match FI_TABLE[(ta1 >> 4) as usize] {
				0 => DEFAULT_FI,
				fi => fi,
			},
			None => DEFAULT_FI,
		}
	}

	/// Baud adjustment factor from TA1, default 1.
	pub fn di(&self) -> u32 {
		match self.interface_byte(1, InterfaceByte::Ta) {
			Some(ta1) => match DI_TABLE[(ta1 & 0x0F) as usize] {
				0 => DEFAULT_DI,
				di => di,
			},
			None => DEFAULT_DI,
		}
	}

	/// Extra guard time N from TC1, default 0.
	pub fn guard_time(&self) -> u8 {
		self.interface_byte(1, InterfaceByte::Tc).unwrap_or(0)
	}

	/// T=0 waiting time integer WI from TC2, default 10.
	pub fn wi(&self) -> u8 {
		self.interface_byte(2, InterfaceByte::Tc).unwrap_or(DEFAULT_WI)
	}

	/// T=1 information field size from TA3, default 32.
	pub fn ifsc(&self) -> u8 {
		match self.interface_byte(3, InterfaceByte::Ta) {
			Some(0) => DEFAULT_IFSC,
			Some(ifsc) => ifsc,
			None => DEFAULT_IFSC,
		}
	}

	/// T=1 BWI/CWI from TB3, defaults 4 and 13.
	pub fn bwi_cwi(&self) -> (u8, u8) {
		match self.interface_byte(3, InterfaceByte::Tb) {
			Some(tb3) => (tb3 >> 4, tb3 & 0x0F),
			None => (4, 13),
		}
	}

	/// True when TC3 selects CRC as the T=1 error detection code.
	pub fn t1_crc(&self) -> bool {
		self.interface_byte(3, InterfaceByte::Tc)
			.map(|tc3| tc3 & 0x01 != 0)
			.unwrap_or(false)
	}
}
