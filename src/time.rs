//! Time-related types based on the DW3000's system time
//!
//! Besides the 40-bit [`Instant`] and [`Duration`] types, this module holds the
//! conversions between microseconds, PHY symbols and device time that the
//! ranging layer needs to schedule its delayed transmissions.

use core::ops::{Add, Sub};

#[cfg(feature = "defmt")]
use defmt::Format;

/// The maximum value of 40-bit system time stamps.
pub const TIME_MAX: u64 = 0xffffffffff;

/// Length of one device time unit in seconds, 1 / (499.2 MHz * 128), ~15.65 ps
pub const DEV_TIME_UNIT_S: f64 = 1.0 / 499.2e6 / 128.0;

/// Length of one PHY symbol in microseconds
pub const SYMBOL_US: f64 = 1.0256;

/// Delayed transmissions ignore the low 9 bits of the programmed time
pub const DELAYED_TX_MASK: u64 = 0x00ff_ffff_fe00;

/// Represents an instant in time
///
/// Internally uses the same 40-bit timestamps that the DW3000 uses. The radio
/// delivers RX and TX timestamps in this format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
pub struct Instant(u64);

impl Instant {
    /// Creates a new instance of `Instant`
    ///
    /// The given value must fit in a 40-bit timestamp, so:
    /// 0 <= `value` <= 2^40 - 1
    ///
    /// Returns `Some(...)`, if `value` is within the valid range, `None` if it
    /// isn't.
    ///
    /// # Example
    ///
    /// ``` rust
    /// use dw3000_twr::time::{
    ///     TIME_MAX,
    ///     Instant,
    /// };
    ///
    /// let valid_instant   = Instant::new(TIME_MAX);
    /// let invalid_instant = Instant::new(TIME_MAX + 1);
    ///
    /// assert!(valid_instant.is_some());
    /// assert!(invalid_instant.is_none());
    /// ```
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Instant(value))
        } else {
            None
        }
    }

    /// Creates an `Instant` from any 64-bit value, dropping the bits above 40
    pub const fn from_masked(value: u64) -> Self {
        Instant(value & TIME_MAX)
    }

    /// Returns the raw 40-bit timestamp
    ///
    /// The returned value is guaranteed to be in the following range:
    /// 0 <= `value` <= 2^40 - 1
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Reads a timestamp in the 5-byte little-endian layout of the radio
    ///
    /// # Example
    ///
    /// ``` rust
    /// use dw3000_twr::time::Instant;
    ///
    /// let instant = Instant::from_le_bytes([0x01, 0x02, 0x03, 0x04, 0x05]);
    ///
    /// assert_eq!(instant.value(), 0x05_0403_0201);
    /// assert_eq!(instant.to_le_bytes(), [0x01, 0x02, 0x03, 0x04, 0x05]);
    /// ```
    pub fn from_le_bytes(bytes: [u8; 5]) -> Self {
        let mut raw = [0u8; 8];
        raw[..5].copy_from_slice(&bytes);

        Instant(u64::from_le_bytes(raw))
    }

    /// Writes the timestamp in the 5-byte little-endian layout of the radio
    pub fn to_le_bytes(&self) -> [u8; 5] {
        let raw = self.0.to_le_bytes();

        [raw[0], raw[1], raw[2], raw[3], raw[4]]
    }

    /// Rounds the instant down to the resolution of a delayed transmission
    ///
    /// The radio ignores the low 9 bits of the delayed TX time, so the frame
    /// leaves at this instant, not at `self`.
    pub fn delayed_tx(&self) -> Instant {
        Instant(self.0 & DELAYED_TX_MASK)
    }

    /// Returns the amount of time passed between the two `Instant`s
    ///
    /// Assumes that `&self` represents a later time than the argument
    /// `earlier`. Please make sure that this is the case, as this method has no
    /// way of knowing (DW3000 timestamps can overflow, so comparing the
    /// numerical value of the timestamp doesn't tell anything about order).
    ///
    /// # Example
    ///
    /// ``` rust
    /// use dw3000_twr::time::{
    ///     TIME_MAX,
    ///     Instant,
    /// };
    ///
    /// // `unwrap`ing here is okay, since we're passing constants that we know
    /// // are in the valid range.
    /// let instant_1 = Instant::new(TIME_MAX - 50).unwrap();
    /// let instant_2 = Instant::new(TIME_MAX).unwrap();
    /// let instant_3 = Instant::new(49).unwrap();
    ///
    /// // Works as expected, if the later timestamp is larger than the earlier
    /// // one.
    /// let duration = instant_2.duration_since(instant_1);
    /// assert_eq!(duration.value(), 50);
    ///
    /// // Still works as expected, if the later timestamp is the numerically
    /// // smaller value.
    /// let duration = instant_3.duration_since(instant_2);
    /// assert_eq!(duration.value(), 50);
    /// ```
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.wrapping_sub(earlier.0) & TIME_MAX)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        // Both values are 40-bit, the sum can't overflow a `u64`.
        Instant::from_masked(self.value() + rhs.value())
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Instant::from_masked(self.value().wrapping_sub(rhs.value()))
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Self::Output {
        self.duration_since(rhs)
    }
}

/// A duration between two instants in DW3000 system time
///
/// Internally uses the same 40-bit timestamps that the DW3000 uses.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
pub struct Duration(u64);

impl Duration {
    /// Creates a new instance of `Duration`
    ///
    /// The given value must fit in a 40-bit timestamp, so:
    /// 0 <= `value` <= 2^40 - 1
    ///
    /// Returns `Some(...)`, if `value` is within the valid range, `None` if it
    /// isn't.
    ///
    /// # Example
    ///
    /// ``` rust
    /// use dw3000_twr::time::{
    ///     TIME_MAX,
    ///     Duration,
    /// };
    ///
    /// let valid_duration   = Duration::new(TIME_MAX);
    /// let invalid_duration = Duration::new(TIME_MAX + 1);
    ///
    /// assert!(valid_duration.is_some());
    /// assert!(invalid_duration.is_none());
    /// ```
    pub fn new(value: u64) -> Option<Self> {
        if value <= TIME_MAX {
            Some(Duration(value))
        } else {
            None
        }
    }

    /// Creates an instance of `Duration` from a number of nanoseconds, rounding to the nearest
    ///
    /// On the DW3000, the TX_TIME/RX_TIME registers have a resolution of 40-bits
    /// and a unit of 1/(128*499.2*10^6) seconds. This means that 1 nanosecond
    /// is 63.8976 DW3000 time units.
    ///
    /// We do this with fixed point arithmetic, where
    /// (dividend + (divisor / 2)) / divisor
    pub fn from_nanos(nanos: u32) -> Self {
        // `nanos` takes up at most 32 bits, the product fits within 38 bits.
        Duration((nanos as u64 * 638976 + 5000) / 10000)
    }

    /// Creates a `Duration` from microseconds, truncating to whole device
    /// time units
    ///
    /// ``` rust
    /// use dw3000_twr::time::Duration;
    ///
    /// assert_eq!(Duration::from_micros(1.0).value(), 63897);
    /// assert_eq!(Duration::from_micros(186.0).value(), 11_884_953);
    /// ```
    pub fn from_micros(micros: f64) -> Self {
        Duration(((micros / DEV_TIME_UNIT_S) / 1e6) as u64 & TIME_MAX)
    }

    /// Creates a `Duration` from seconds, truncating to whole device time
    /// units and wrapping at 40 bits
    pub fn from_secs_f64(secs: f64) -> Self {
        Duration((secs / DEV_TIME_UNIT_S) as u64 & TIME_MAX)
    }

    /// Returns the duration in seconds
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 * DEV_TIME_UNIT_S
    }

    /// Returns the raw 40-bit timestamp
    ///
    /// The returned value is guaranteed to be in the following range:
    /// 0 <= `value` <= 2^40 - 1
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Writes the duration in the 5-byte little-endian layout of the radio
    pub fn to_le_bytes(&self) -> [u8; 5] {
        Instant(self.0).to_le_bytes()
    }
}

/// Converts microseconds to PHY symbols
pub fn us_to_symbols(us: f64) -> f64 {
    us / SYMBOL_US
}
