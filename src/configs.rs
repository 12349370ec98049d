//! Configuration structs for the PHY, the superframe and the node
//!
//! The PHY settings decide how long each ranging frame stays on air, the
//! superframe settings decide when each tag gets to talk. Everything has a
//! `Default` matching a working out-of-the-box deployment, and the whole
//! [`NodeConfig`] can be serialized by a persistent store.

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::{geometry::Vec3, tag_list::KNOWN_TAG_LIST_SIZE, time::Duration, Error};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// The bitrate at which a message is transmitted
pub enum BitRate {
    /// 110 kilobits per second.
    /// Not supported by the DW3000, only kept to represent legacy
    /// configurations. The frame timing calculation rejects it.
    Kbps110,
    /// 850 kilobits per second.
    Kbps850,
    /// 6.8 megabits per second.
    #[default]
    Kbps6800,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// An enum that specifies the length of the preamble.
///
/// Longer preambles improve the reception quality and thus range.
/// This comes at the cost of longer transmission times and thus power consumption and bandwidth use.
pub enum PreambleLength {
    /// 64 symbols of preamble.
    #[default]
    Symbols64,
    /// 128 symbols of preamble.
    Symbols128,
    /// 256 symbols of preamble.
    Symbols256,
    /// 512 symbols of preamble.
    Symbols512,
    /// 1024 symbols of preamble.
    Symbols1024,
    /// 1536 symbols of preamble.
    Symbols1536,
    /// 2048 symbols of preamble.
    Symbols2048,
    /// 4096 symbols of preamble.
    Symbols4096,
}

impl PreambleLength {
    /// Number of preamble symbols
    pub fn symbols(&self) -> u32 {
        match self {
            PreambleLength::Symbols64 => 64,
            PreambleLength::Symbols128 => 128,
            PreambleLength::Symbols256 => 256,
            PreambleLength::Symbols512 => 512,
            PreambleLength::Symbols1024 => 1024,
            PreambleLength::Symbols1536 => 1536,
            PreambleLength::Symbols2048 => 2048,
            PreambleLength::Symbols4096 => 4096,
        }
    }

    /// Looks up the preamble length for a symbol count
    ///
    /// Returns `None` if the radio has no such preamble length.
    pub fn from_symbols(symbols: u32) -> Option<Self> {
        match symbols {
            64 => Some(PreambleLength::Symbols64),
            128 => Some(PreambleLength::Symbols128),
            256 => Some(PreambleLength::Symbols256),
            512 => Some(PreambleLength::Symbols512),
            1024 => Some(PreambleLength::Symbols1024),
            1536 => Some(PreambleLength::Symbols1536),
            2048 => Some(PreambleLength::Symbols2048),
            4096 => Some(PreambleLength::Symbols4096),
            _ => None,
        }
    }

    /// Gets the recommended PAC size based on the preamble length.
    pub fn recommended_pac_size(&self) -> PacSize {
        match self {
            PreambleLength::Symbols64 | PreambleLength::Symbols128 => PacSize::Pac8,
            PreambleLength::Symbols256 | PreambleLength::Symbols512 => PacSize::Pac16,
            _ => PacSize::Pac32,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Preamble acquisition chunk size, in symbols
pub enum PacSize {
    /// 4 symbols, for preambles of 128 symbols or less
    Pac4,
    /// 8 symbols, for preambles of 128 symbols or less
    #[default]
    Pac8,
    /// 16 symbols, for 256 and 512 symbol preambles
    Pac16,
    /// 32 symbols, for 1024 symbol preambles and longer
    Pac32,
}

impl PacSize {
    /// Number of symbols in one acquisition chunk
    pub fn symbols(&self) -> u32 {
        match self {
            PacSize::Pac4 => 4,
            PacSize::Pac8 => 8,
            PacSize::Pac16 => 16,
            PacSize::Pac32 => 32,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// An enum that allows the selection between different SFD sequences
pub enum SfdSequence {
    /// The standard 8 symbol sequence defined by the IEEE standard.
    Ieee,
    /// A non-standard 8 symbol sequence defined by Decawave.
    #[default]
    Decawave8,
    /// A non-standard 16 symbol sequence defined by Decawave.
    Decawave16,
    /// The 8 symbol sequence of IEEE 802.15.4z.
    Ieee4z,
}

impl SfdSequence {
    /// Length of the SFD in symbols
    pub fn symbols(&self) -> u32 {
        match self {
            SfdSequence::Decawave16 => 16,
            _ => 8,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Length of the scrambled timestamp sequence
pub enum StsLength {
    /// 32 symbols
    Symbols32,
    /// 64 symbols
    Symbols64,
    /// 128 symbols
    Symbols128,
    /// 256 symbols
    #[default]
    Symbols256,
    /// 512 symbols
    Symbols512,
    /// 1024 symbols
    Symbols1024,
    /// 2048 symbols
    Symbols2048,
}

impl StsLength {
    /// Number of STS symbols
    pub fn symbols(&self) -> u32 {
        match self {
            StsLength::Symbols32 => 32,
            StsLength::Symbols64 => 64,
            StsLength::Symbols128 => 128,
            StsLength::Symbols256 => 256,
            StsLength::Symbols512 => 512,
            StsLength::Symbols1024 => 1024,
            StsLength::Symbols2048 => 2048,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// All the available UWB channels.
pub enum UwbChannel {
    /// Channel 5
    /// - Center frequency: 6489.6 Mhz
    /// - Bandwidth: 499.2 Mhz
    /// - Preamble Codes (64 MHz PRF) : 9, 10, 11, 12
    Channel5,
    /// Channel 9
    /// - Center frequency: 7987.2 Mhz
    /// - Bandwidth: 499.2 Mhz
    /// - Preamble Codes (64 MHz PRF) : 9, 10, 11, 12
    #[default]
    Channel9,
}

/// PHY settings shared by every frame of the ranging exchange
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhyConfig {
    /// The channel that the radio transmits and listens at.
    pub channel: UwbChannel,
    /// Sets the bitrate of the transmission.
    pub bitrate: BitRate,
    /// The length of the preamble.
    pub preamble_length: PreambleLength,
    /// The preamble acquisition chunk size of the receiver.
    pub pac_size: PacSize,
    /// The preamble code, 1 to 24.
    ///
    /// Codes 1 to 8 are 16 MHz PRF codes, 9 to 24 are 64 MHz PRF codes. The
    /// PRF changes the symbol length of the synchronization header.
    pub preamble_code: u8,
    /// The SFD sequence that is used to transmit a frame.
    pub sfd_sequence: SfdSequence,
    /// The STS length, `None` if no STS is sent.
    pub sts_length: Option<StsLength>,
}

impl Default for PhyConfig {
    fn default() -> Self {
        PhyConfig {
            channel: UwbChannel::Channel9,
            bitrate: BitRate::Kbps6800,
            preamble_length: PreambleLength::Symbols64,
            pac_size: PacSize::Pac8,
            preamble_code: 9,
            sfd_sequence: SfdSequence::Decawave8,
            sts_length: Some(StsLength::Symbols256),
        }
    }
}

impl PhyConfig {
    /// Number of STS symbols, 0 if STS is disabled
    pub fn sts_symbols(&self) -> u32 {
        self.sts_length.map_or(0, |sts| sts.symbols())
    }

    /// SFD detection timeout in symbols
    ///
    /// preamble length + 1 + SFD length - PAC size
    ///
    /// ``` rust
    /// use dw3000_twr::configs::PhyConfig;
    ///
    /// assert_eq!(PhyConfig::default().sfd_timeout(), 64 + 1 + 8 - 8);
    /// ```
    pub fn sfd_timeout(&self) -> u16 {
        (self.preamble_length.symbols() + 1 + self.sfd_sequence.symbols()
            - self.pac_size.symbols()) as u16
    }
}

/// Timing of the superframe and of the tag's side of an exchange
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SuperframeConfig {
    /// Length of one slot, ms
    pub slot_period_ms: u16,
    /// Number of slots in one superframe
    pub num_slots: u16,
    /// Length of the superframe, ms
    pub sf_period_ms: u16,
    /// Delay between the end of the tag's poll and the node's response
    /// preamble, µs
    pub tag_reply_delay_us: u16,
    /// Delay between the tag's poll and final transmissions, µs
    pub tag_poll_tx_final_tx_us: u16,
}

impl Default for SuperframeConfig {
    fn default() -> Self {
        SuperframeConfig {
            slot_period_ms: 5,
            num_slots: 20,
            sf_period_ms: 100,
            tag_reply_delay_us: 700,
            tag_poll_tx_final_tx_us: 2000,
        }
    }
}

/// The complete configuration of a ranging node
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeConfig {
    /// PAN the node and its tags live in
    pub pan_id: u16,
    /// Short address of the node
    pub node_addr: u16,
    /// PHY settings
    pub phy: PhyConfig,
    /// Superframe settings
    pub superframe: SuperframeConfig,
    /// Delay between the end of a tag's blink and the node's ranging config
    /// preamble, µs
    pub ranging_config_delay_us: u32,
    /// How long a tag listens for the ranging config after its blink, µs
    pub ranging_config_rx_timeout_us: u16,
    /// Constant subtracted from every measured range, mm
    pub range_offset_mm: i16,
    /// Number of consecutive bad ranges before a tag is considered faulty
    pub faulty_ranges: u16,
    /// TX antenna delay in device time units
    pub antenna_delay_tx: u16,
    /// RX antenna delay in device time units
    pub antenna_delay_rx: u16,
    /// Position of the node itself, mm
    pub position_mm: Vec3,
}

/// What the radio is set up with before it sends or receives
///
/// Derived from a [`NodeConfig`] by [`NodeConfig::radio_setup`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct RadioSetup {
    pub phy: PhyConfig,
    pub pan_id: u16,
    /// Short address, `0xffff` while the device has none
    pub addr16: u16,
    /// TX antenna delay in device time units
    pub antenna_delay_tx: u16,
    /// RX antenna delay in device time units
    pub antenna_delay_rx: u16,
}

/// Antenna delay of 513.484 ns, in device time units
const DEFAULT_ANTENNA_DELAY: u16 = 32810;

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            pan_id: 0xDECA,
            node_addr: 0x0001,
            phy: PhyConfig::default(),
            superframe: SuperframeConfig::default(),
            ranging_config_delay_us: 150_000,
            ranging_config_rx_timeout_us: 500,
            range_offset_mm: 0,
            faulty_ranges: 5,
            antenna_delay_tx: DEFAULT_ANTENNA_DELAY,
            antenna_delay_rx: DEFAULT_ANTENNA_DELAY,
            position_mm: Vec3::new(0.0, 0.0, 1900.0),
        }
    }
}

impl NodeConfig {
    /// Checks the configuration for combinations that can't work
    ///
    /// Every known tag needs its own slot, and all slots need to fit into the
    /// superframe.
    pub fn validate(&self) -> Result<(), Error> {
        let sf = &self.superframe;

        if sf.slot_period_ms == 0 || sf.num_slots == 0 {
            return Err(Error::InvalidConfiguration);
        }
        if (sf.num_slots as usize) < KNOWN_TAG_LIST_SIZE {
            return Err(Error::InvalidConfiguration);
        }
        if (sf.sf_period_ms as u32) < sf.num_slots as u32 * sf.slot_period_ms as u32 {
            return Err(Error::InvalidConfiguration);
        }
        if !(1..=24).contains(&self.phy.preamble_code) || self.phy.bitrate == BitRate::Kbps110 {
            return Err(Error::InvalidConfiguration);
        }
        if self.faulty_ranges == 0 {
            return Err(Error::InvalidConfiguration);
        }

        Ok(())
    }

    /// The ranging config delay as device time
    pub fn ranging_config_delay(&self) -> Duration {
        Duration::from_micros(self.ranging_config_delay_us as f64)
    }

    /// Radio settings with the given PAN and short address
    pub fn radio_setup(&self, pan_id: u16, addr16: u16) -> RadioSetup {
        RadioSetup {
            phy: self.phy,
            pan_id,
            addr16,
            antenna_delay_tx: self.antenna_delay_tx,
            antenna_delay_rx: self.antenna_delay_rx,
        }
    }
}
