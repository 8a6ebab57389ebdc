//! Serial transport contract consumed by the reader framer.
//!
//! Opening and configuring the device (termios, port enumeration, modem
//! lines) is the host application's business. The framer only needs
//! blocking exact-count reads with a deadline, delayed writes, and a
//! cheap view of the currently applied port properties.

use std::time::Duration;

use thiserror::Error;

/// Parity setting of the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
	None,
	Even,
	Odd,
}

/// Full port configuration, applied atomically via
/// [`SerialPort::set_properties`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortProperties {
	pub input_bps: u32,
	pub output_bps: u32,
	/// Data bits per character (5..=8).
	pub bits: u8,
	pub parity: Parity,
	/// Stop bits (1 or 2).
	pub stopbits: u8,
	pub dtr: bool,
	pub rts: bool,
}

#[derive(Debug, Error)]
pub enum SerialError {
	/// Fewer bytes than requested arrived before the deadline.
	#[error("read timed out before {0} bytes arrived")]
	Timeout(usize),
	#[error("serial device error")]
	Io(#[from] std::io::Error),
}

/// Blocking byte transport to the reader.
///
/// Implementations are expected to cache the last applied properties so
/// that the framer's frequent identical [`set_properties`] calls and
/// [`properties`] queries stay off the wire.
///
/// [`set_properties`]: SerialPort::set_properties
/// [`properties`]: SerialPort::properties
pub trait SerialPort {
	/// Reconfigure the port.
	fn set_properties(&mut self, props: &PortProperties) -> Result<(), SerialError>;

	/// The currently applied properties, served from the cache.
	fn properties(&self) -> PortProperties;

	/// Read exactly `buf.len()` bytes. Succeeds only if all of them
	/// arrive within `timeout`; a short read is an error.
	fn read(&mut self, timeout: Duration, buf: &mut [u8]) -> Result<(), SerialError>;

	/// Write all of `data`. A nonzero `delay` is inserted before each
	/// byte; the T=0 engine uses this for guard-time spacing.
	fn write(&mut self, delay: Duration, data: &[u8]) -> Result<(), SerialError>;
}
