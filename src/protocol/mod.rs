//! Transmission protocols above the card layer.
//!
//! [`pps`] negotiates T and the timing parameters right after reset;
//! [`t0`] and [`t1`] carry APDUs over the two asynchronous ISO-7816-3
//! protocols; [`synch`] emulates the interindustry command set on raw
//! memory cards.

pub mod pps;
pub mod synch;
pub mod t0;
pub mod t1;

use thiserror::Error;

use crate::icc::synch::SyncIccError;
use crate::ifd::IfdError;

/// Parameters a protocol engine runs with, either the ATR defaults or
/// the outcome of a PPS exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParameters {
	/// Protocol number T.
	pub t: u8,
	/// Clock conversion factor Fi.
	pub f: u32,
	/// Baud adjustment factor Di.
	pub d: u32,
	/// Extra guard time N.
	pub n: u8,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("card communication failed")]
	Icc(#[from] IfdError),
	#[error("memory card access failed")]
	SyncIcc(#[from] SyncIccError),
	/// Malformed APDU, unexpected procedure byte or illegal block.
	#[error("protocol violation")]
	Protocol,
	/// The card kept sending NULL procedure bytes past the limit.
	#[error("card exceeded the NULL byte limit")]
	NullLimit,
	#[error("PPS response did not confirm the request")]
	PpsFailure,
}
