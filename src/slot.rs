//! Per-slot lifecycle: probe, route, release.
//!
//! A slot owns the reader and, after a successful probe, exactly one
//! card plus the protocol engine that matches it. Probing tries the
//! synchronous stack first by default (memory cards answer fast and an
//! async reset confuses some of them), then the asynchronous stack with
//! PPS on top. Every APDU is routed by exhaustive match on the closed
//! card enum; a probed-empty slot answers `6F 00` the way terminals
//! report a removed card.

use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::apdu::{ApduCmd, ApduRsp};
use crate::icc::asynch::AsyncIcc;
use crate::icc::synch::SyncIcc;
use crate::ifd::{ConventionPolicy, Ifd, IfdError, ReaderStatus};
use crate::protocol::synch::SyncProtocol;
use crate::protocol::t0::T0;
use crate::protocol::t1::T1;
use crate::protocol::{ProtocolError, pps};
use crate::serial::SerialPort;

/// Probe order for a freshly inserted card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeOrder {
	#[default]
	SyncFirst,
	AsyncFirst,
}

/// Policy knobs of a slot, all runtime configuration.
#[derive(Debug, Clone, Copy)]
pub struct SlotConfig {
	pub probe_order: ProbeOrder,
	/// Full ISO T=0 handling of `61xx`/`6Cxx` (Get-Response and
	/// re-issue). Off, those SWs pass through to the caller.
	pub t0_iso: bool,
	/// Demand a grammar-exact ATR byte stream instead of capturing
	/// until the card falls silent.
	pub strict_atr: bool,
	pub convention: ConventionPolicy,
}

impl Default for SlotConfig {
	fn default() -> Self {
		SlotConfig {
			probe_order: ProbeOrder::SyncFirst,
			t0_iso: true,
			strict_atr: false,
			convention: ConventionPolicy::Adaptive,
		}
	}
}

/// What the probe found in the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IccKind {
	Sync,
	Async,
}

/// The engine carrying APDUs for the current card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
	Sync,
	T0,
	T1,
}

enum AsyncEngine {
	T0(T0),
	T1(T1),
}

enum Card {
	Empty,
	Sync { icc: SyncIcc, proto: SyncProtocol },
	Async { icc: AsyncIcc, proto: AsyncEngine },
}

#[derive(Debug, Error)]
pub enum SlotError {
	#[error("reader I/O failed")]
	Ifd(#[from] IfdError),
	#[error("card protocol failed")]
	Protocol(#[from] ProtocolError),
}

/// One reader slot and whatever card currently sits in it.
pub struct Slot<S: SerialPort> {
	ifd: Ifd<S>,
	card: Card,
	config: SlotConfig,
}

impl<S: SerialPort> Slot<S> {
	/// Initialize the reader on `io` and bind this handle to `slot`
	/// (`ifd::SLOT_A` or `ifd::SLOT_B`).
	pub fn new(io: S, slot: u8, config: SlotConfig) -> Result<Slot<S>, SlotError> {
		let ifd = Ifd::new(io, slot)?;
		Ok(Slot { ifd, card: Card::Empty, config })
	}

	pub fn ifd(&self) -> &Ifd<S> {
		&self.ifd
	}

	/// Card presence now, plus whether it changed since the last query.
	/// Waits up to `timeout` (whole seconds, polled once per second)
	/// for a card to appear.
	pub fn check(&mut self, timeout: Duration) -> Result<(bool, bool), SlotError> {
		let mut status = self.ifd.status()?;
		let mut changed = status.contains(ReaderStatus::CHANGED);

		let mut remaining = timeout.as_secs();
		while remaining > 0 && !status.contains(ReaderStatus::CARD_PRESENT) {
			remaining -= 1;
			thread::sleep(Duration::from_secs(1));

			status = self.ifd.status()?;
			changed |= status.contains(ReaderStatus::CHANGED);
		}

		Ok((status.contains(ReaderStatus::CARD_PRESENT), changed))
	}

	/// Identify the inserted card and build its protocol stack.
	///
	/// `pps_request` optionally carries 1..4 user PPS bytes for the
	/// asynchronous path. A slot where neither stack comes up is left
	/// `Empty` and reported as success; commands then answer `6F 00`.
	pub fn probe(&mut self, pps_request: Option<&[u8]>) -> Result<(), SlotError> {
		self.card = Card::Empty;

		match self.config.probe_order {
			ProbeOrder::SyncFirst => {
				if !self.probe_sync()? {
					self.probe_async(pps_request)?;
				}
			}
			ProbeOrder::AsyncFirst => {
				if !self.probe_async(pps_request)? {
					self.probe_sync()?;
				}
			}
		}

		Ok(())
	}

	fn probe_sync(&mut self) -> Result<bool, SlotError> {
		match SyncIcc::init(&mut self.ifd) {
			Ok(icc) => {
				let proto = SyncProtocol::new(&icc);
				self.card = Card::Sync { icc, proto };
				Ok(true)
			}
			Err(err) => {
				debug!("slot: no synchronous card: {err}");
				Ok(false)
			}
		}
	}

	fn probe_async(&mut self, pps_request: Option<&[u8]>) -> Result<bool, SlotError> {
		let mut icc = match AsyncIcc::init(
			&mut self.ifd,
			self.config.convention,
			self.config.strict_atr,
		) {
			Ok(icc) => icc,
			Err(err) => {
				debug!("slot: no asynchronous card: {err}");
				return Ok(false);
			}
		};

		let params = match pps::negotiate(&mut self.ifd, &mut icc, pps_request) {
			Ok(params) => params,
			Err(err) => {
				let _ = icc.close(&mut self.ifd);
				return Err(err.into());
			}
		};

		let proto = match params.t {
			0 => AsyncEngine::T0(T0::new(&self.ifd, &mut icc, &params, self.config.t0_iso)),
			1 => AsyncEngine::T1(T1::new(&self.ifd, &mut icc, &params)),
			t => {
				warn!("slot: card wants unsupported protocol T={t}");
				let _ = icc.close(&mut self.ifd);
				return Err(SlotError::Protocol(ProtocolError::Protocol));
			}
		};

		self.card = Card::Async { icc, proto };
		Ok(true)
	}

	/// Route one APDU to the current card's engine.
	pub fn command(&mut self, cmd: &ApduCmd) -> Result<ApduRsp, SlotError> {
		match &mut self.card {
			Card::Sync { icc, proto } => Ok(proto.command(&mut self.ifd, icc, cmd)?),
			Card::Async { icc, proto } => match proto {
				AsyncEngine::T0(t0) => Ok(t0.command(&mut self.ifd, icc, cmd)?),
				AsyncEngine::T1(t1) => Ok(t1.command(&mut self.ifd, icc, cmd)?),
			},
			// No card: the fixed terminal answer for a removed ICC.
			Card::Empty => Ok(ApduRsp::new(&[0x6F, 0x00])),
		}
	}

	/// Tear the card stack down, protocol engine before card.
	pub fn release(&mut self) -> Result<(), SlotError> {
		let mut result = Ok(());

		match &mut self.card {
			Card::Empty => {}
			Card::Sync { icc, .. } => {
				if let Err(err) = icc.close(&mut self.ifd) {
					result = Err(err.into());
				}
			}
			Card::Async { icc, .. } => {
				if let Err(err) = icc.close(&mut self.ifd) {
					result = Err(err.into());
				}
			}
		}

		self.card = Card::Empty;
		result
	}

	/// Release whatever is in the slot, shut the reader down and hand
	/// the transport back.
	pub fn close(mut self) -> Result<S, SlotError> {
		self.release()?;
		Ok(self.ifd.close()?)
	}

	pub fn icc_kind(&self) -> Option<IccKind> {
		match self.card {
			Card::Empty => None,
			Card::Sync { .. } => Some(IccKind::Sync),
			Card::Async { .. } => Some(IccKind::Async),
		}
	}

	pub fn protocol_kind(&self) -> Option<ProtocolKind> {
		match &self.card {
			Card::Empty => None,
			Card::Sync { .. } => Some(ProtocolKind::Sync),
			Card::Async { proto: AsyncEngine::T0(_), .. } => Some(ProtocolKind::T0),
			Card::Async { proto: AsyncEngine::T1(_), .. } => Some(ProtocolKind::T1),
		}
	}

	/// Raw ATR of the current card, if any.
	pub fn atr_bytes(&self) -> Option<Vec<u8>> {
		match &self.card {
			Card::Empty => None,
			Card::Sync { icc, .. } => Some(icc.atr().raw().to_vec()),
			Card::Async { icc, .. } => Some(icc.atr().raw().to_vec()),
		}
	}
}
