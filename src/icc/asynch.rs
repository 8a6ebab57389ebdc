//! Asynchronous (processor) card handling.

use crate::atr::Atr;
use crate::ifd::{ConventionPolicy, DEFAULT_BAUDRATE, Ifd, IfdError, Led, Timings};
use crate::serial::SerialPort;

/// An activated asynchronous card: its ATR, the negotiated line rate
/// and the timings every transmit and receive must honor. The timings
/// are owned here and pushed down to the framer on each call.
#[derive(Debug)]
pub struct AsyncIcc {
	atr: Atr,
	baudrate: u32,
	timings: Timings,
}

impl AsyncIcc {
	/// Activate the card and capture its ATR. The LED runs red during
	/// the reset and turns green once the card answered. A card that
	/// stays silent is powered back down before the error surfaces.
	pub fn init<S: SerialPort>(
		ifd: &mut Ifd<S>,
		convention: ConventionPolicy,
		strict_atr: bool,
	) -> Result<AsyncIcc, IfdError> {
		ifd.set_led(Led::Red)?;
		ifd.activate_icc()?;

		let atr = match ifd.reset_async_icc(convention, strict_atr) {
			Ok(atr) => atr,
			Err(err) => {
				let _ = ifd.deactivate_icc();
				return Err(err);
			}
		};

		info!("ICC: async card, ATR {:02X?}", atr.raw());

		ifd.set_led(Led::Green)?;

		Ok(AsyncIcc {
			atr,
			baudrate: DEFAULT_BAUDRATE,
			timings: Timings::default(),
		})
	}

	/// Power the card down and turn the LED off.
	pub fn close<S: SerialPort>(&mut self, ifd: &mut Ifd<S>) -> Result<(), IfdError> {
		ifd.deactivate_icc()?;
		ifd.set_led(Led::Off)
	}

	pub fn atr(&self) -> &Atr {
		&self.atr
	}

	pub fn timings(&self) -> Timings {
		self.timings
	}

	pub fn set_timings(&mut self, timings: Timings) {
		self.timings = timings;
	}

	pub fn baudrate(&self) -> u32 {
		self.baudrate
	}

	/// Record the line rate negotiated for this card; applied on the
	/// next [`begin_transmission`](Self::begin_transmission).
	pub fn set_baudrate(&mut self, baudrate: u32) {
		self.baudrate = baudrate;
	}

	/// Bring the reader to this card's line rate before an exchange.
	pub fn begin_transmission<S: SerialPort>(&self, ifd: &mut Ifd<S>) -> Result<(), IfdError> {
		ifd.set_baudrate(self.baudrate)
	}

	/// Counterpart of [`begin_transmission`](Self::begin_transmission);
	/// nothing to restore today, kept as the bracket's closing half.
	pub fn end_transmission<S: SerialPort>(&self, _ifd: &mut Ifd<S>) -> Result<(), IfdError> {
		Ok(())
	}

	pub fn transmit<S: SerialPort>(&self, ifd: &mut Ifd<S>, data: &[u8]) -> Result<(), IfdError> {
		ifd.transmit(&self.timings, data)
	}

	pub fn receive<S: SerialPort>(&self, ifd: &mut Ifd<S>, data: &mut [u8]) -> Result<(), IfdError> {
		ifd.receive(&self.timings, data)
	}

	/// Turn the line around between sending and receiving.
	pub fn switch<S: SerialPort>(&self, ifd: &mut Ifd<S>) -> Result<(), IfdError> {
		ifd.switch_direction()
	}

	#[cfg(test)]
	pub(crate) fn for_test(atr: Atr) -> AsyncIcc {
		AsyncIcc {
			atr,
			baudrate: DEFAULT_BAUDRATE,
			timings: Timings::default(),
		}
	}
}
