//! Air time of UWB frames
//!
//! Delayed transmissions of the ranging exchange are scheduled relative to the
//! RX timestamp of the previous frame, which marks the end of its SFD. The
//! scheduler needs to know how long the rest of that frame and the preamble
//! of the next one take, in microseconds, in symbols and in device time.

#[cfg(feature = "defmt")]
use defmt::Format;
#[allow(unused_imports)]
use num_traits::Float;

use crate::{
    configs::{BitRate, PhyConfig, PreambleLength, SfdSequence},
    ranging::message,
    time::{self, Duration},
};

/// Length of one data symbol at 850 kbps, ns
const SYMBOL_NS_850K: f32 = 1025.64;
/// Length of one data symbol at 6.8 Mbps, ns
const SYMBOL_NS_6M8: f32 = 128.21;
/// The PHR is always sent with 21 symbols at the 850 kbps symbol rate
const PHR_NS: f32 = 21.0 * SYMBOL_NS_850K;
/// Length of one STS symbol, us
const STS_SYMBOL_US: f32 = 512.8e-3;
/// Length of one preamble symbol with a 16 MHz PRF code, us
const PREAMBLE_SYMBOL_US_PRF16: f32 = 0.99359;
/// Length of one preamble symbol with a 64 MHz PRF code, us
const PREAMBLE_SYMBOL_US_PRF64: f32 = 1.01763;

/// The PHY parameters that decide the length of a frame
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct MsgParams {
    /// Data rate of PHR and payload
    pub bitrate: BitRate,
    /// Preamble length
    pub preamble_length: PreambleLength,
    /// STS length in symbols, 0 if no STS is sent
    pub sts_symbols: u32,
    /// SFD sequence
    pub sfd_sequence: SfdSequence,
    /// Preamble code, 1 to 24
    pub preamble_code: u8,
    /// Frame length in bytes, including the FCS
    pub len: u16,
}

impl MsgParams {
    /// Parameters of a frame of `len` bytes sent with `phy`
    pub fn new(phy: &PhyConfig, len: u16) -> Self {
        MsgParams {
            bitrate: phy.bitrate,
            preamble_length: phy.preamble_length,
            sts_symbols: phy.sts_symbols(),
            sfd_sequence: phy.sfd_sequence,
            preamble_code: phy.preamble_code,
            len,
        }
    }
}

/// Air time of a frame
///
/// All `_us` fields are truncated to whole microseconds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct MsgTime {
    /// Preamble and SFD
    pub preamble_us: u32,
    /// STS
    pub sts_us: u32,
    /// PHR
    pub phr_us: u32,
    /// Payload including FCS and Reed-Solomon parity
    pub data_us: u32,
    /// PHR and payload, truncated once from the sum
    pub phr_and_data_us: u32,
    /// The whole frame
    pub us: u32,
    /// The whole frame in symbols
    pub sy: u32,
    /// The whole frame in device time
    pub dt: Duration,
    /// `dt` in the 5-byte little-endian layout of the radio
    pub dt_bytes: [u8; 5],
}

impl MsgTime {
    /// Calculates the air time of a frame
    ///
    /// # Panics
    ///
    /// Panics on PHY parameters the DW3000 can't send: a bitrate of 110 kbps
    /// or a preamble code above 24. Scheduling transmissions with a wrong air
    /// time would break every exchange, so these are treated as programming
    /// errors. [`NodeConfig::validate`] rejects them up front.
    ///
    /// [`NodeConfig::validate`]: crate::configs::NodeConfig::validate
    ///
    /// ``` rust
    /// use dw3000_twr::configs::{BitRate, PreambleLength, SfdSequence};
    /// use dw3000_twr::msg_time::{MsgParams, MsgTime};
    ///
    /// let time = MsgTime::new(&MsgParams {
    ///     bitrate: BitRate::Kbps6800,
    ///     preamble_length: PreambleLength::Symbols128,
    ///     sts_symbols: 0,
    ///     sfd_sequence: SfdSequence::Decawave8,
    ///     preamble_code: 9,
    ///     len: 20,
    /// });
    ///
    /// assert_eq!(time.us, 186);
    /// ```
    pub fn new(params: &MsgParams) -> Self {
        let bits = params.len as f32 * 8.0;
        // 48 Reed-Solomon parity bits per block of up to 330 data bits
        let coded_bits = bits + 48.0 * (bits / 330.0).ceil();

        let data_ns = match params.bitrate {
            BitRate::Kbps850 => coded_bits * SYMBOL_NS_850K,
            BitRate::Kbps6800 => coded_bits * SYMBOL_NS_6M8,
            BitRate::Kbps110 => panic!("110 kbps is not supported by the DW3000"),
        };

        let shr_symbols =
            (params.sfd_sequence.symbols() + params.preamble_length.symbols()) as f32;
        let preamble_us = match params.preamble_code {
            0..=8 => shr_symbols * PREAMBLE_SYMBOL_US_PRF16,
            9..=24 => shr_symbols * PREAMBLE_SYMBOL_US_PRF64,
            code => panic!("invalid preamble code {}", code),
        };

        let sts_us = if params.sts_symbols > 0 {
            params.sts_symbols as f32 * STS_SYMBOL_US * 2.0
        } else {
            0.0
        };

        let phr_and_data_us = ((data_ns + PHR_NS) / 1000.0) as u32;
        let us = (preamble_us + sts_us + phr_and_data_us as f32) as u32;
        let dt = Duration::from_micros(us as f64);

        MsgTime {
            preamble_us: preamble_us as u32,
            sts_us: sts_us as u32,
            phr_us: (PHR_NS / 1000.0) as u32,
            data_us: (data_ns / 1000.0) as u32,
            phr_and_data_us,
            us,
            sy: time::us_to_symbols(us as f64) as u32,
            dt,
            dt_bytes: dt.to_le_bytes(),
        }
    }
}

/// Air times of every frame of the ranging exchange
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct MsgTimes {
    pub blink: MsgTime,
    pub ranging_config: MsgTime,
    pub poll: MsgTime,
    pub response: MsgTime,
    pub final_: MsgTime,
}

impl MsgTimes {
    /// Calculates the air times for the given PHY
    pub fn new(phy: &PhyConfig) -> Self {
        let time = |len: usize| MsgTime::new(&MsgParams::new(phy, len as u16));

        MsgTimes {
            blink: time(message::BLINK_FRAME_LEN),
            ranging_config: time(message::RANGING_CONFIG_FRAME_LEN),
            poll: time(message::POLL_FRAME_LEN),
            response: time(message::RESPONSE_FRAME_LEN),
            final_: time(message::FINAL_FRAME_LEN),
        }
    }
}
