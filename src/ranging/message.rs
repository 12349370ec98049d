//! Messages of the slotted ranging exchange
//!
//! Every message travels as the payload of an IEEE 802.15.4 data frame. The
//! first payload byte is a function code telling the messages apart, the rest
//! is little-endian.
//!
//! A tag announces itself with a [`RangingMessage::Blink`]. A node that knows
//! the tag answers with a [`RangingConfig`], which assigns the tag a short
//! address and a slot. In its slot the tag sends a [`Poll`], the node answers
//! with a [`Response`] and the tag finishes with a [`Final`] that carries the
//! tag's timestamps of the exchange.

use byte::{
    ctx::{Bytes, LE},
    BytesExt, TryRead, TryWrite,
};
#[cfg(feature = "defmt")]
use defmt::Format;
use smoltcp::wire::{
    Ieee802154Address, Ieee802154Frame, Ieee802154FrameType, Ieee802154FrameVersion,
    Ieee802154Pan, Ieee802154Repr,
};

use crate::{time::Instant, Error};

/// Length of the FCS the radio appends to every frame
pub const FCS_LEN: usize = 2;

/// MAC header with short source and destination and a compressed PAN id
pub const SS_HEADER_LEN: usize = 9;
/// MAC header with a long destination, a short source and a compressed PAN id
pub const LS_HEADER_LEN: usize = 15;
/// MAC header of a blink: broadcast destination and the tag's long address
pub const BLINK_HEADER_LEN: usize = 15;

/// Payload lengths, function code included
pub const BLINK_LEN: usize = 1;
pub const RANGING_CONFIG_LEN: usize = 20;
pub const POLL_LEN: usize = 2;
pub const RESPONSE_LEN: usize = 12;
pub const FINAL_LEN: usize = 24;

/// Lengths of the frames on air, FCS included
pub const BLINK_FRAME_LEN: usize = BLINK_HEADER_LEN + BLINK_LEN + FCS_LEN;
pub const RANGING_CONFIG_FRAME_LEN: usize = LS_HEADER_LEN + RANGING_CONFIG_LEN + FCS_LEN;
pub const POLL_FRAME_LEN: usize = SS_HEADER_LEN + POLL_LEN + FCS_LEN;
pub const RESPONSE_FRAME_LEN: usize = SS_HEADER_LEN + RESPONSE_LEN + FCS_LEN;
pub const FINAL_FRAME_LEN: usize = SS_HEADER_LEN + FINAL_LEN + FCS_LEN;

/// Version field of the ranging config
pub const RANGING_CONFIG_VERSION: u8 = 0;

/// Function codes
pub mod fcode {
    pub const BLINK: u8 = 0xEE;
    pub const RANGING_CONFIG: u8 = 0x20;
    pub const POLL: u8 = 0x84;
    pub const RESPONSE: u8 = 0x72;
    pub const FINAL: u8 = 0x89;
}

/// A short or long MAC address
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Address {
    /// 16-bit short address
    Short(u16),
    /// 64-bit extended address
    Extended(u64),
}

impl Address {
    /// The short broadcast address
    pub const BROADCAST: Address = Address::Short(0xffff);

    fn from_mac(address: Ieee802154Address) -> Option<Self> {
        match address {
            Ieee802154Address::Short(bytes) => Some(Address::Short(u16::from_be_bytes(bytes))),
            Ieee802154Address::Extended(bytes) => {
                Some(Address::Extended(u64::from_be_bytes(bytes)))
            }
            Ieee802154Address::Absent => None,
        }
    }

    fn to_mac(self) -> Ieee802154Address {
        match self {
            Address::Short(addr) => Ieee802154Address::Short(addr.to_be_bytes()),
            Address::Extended(addr) => Ieee802154Address::Extended(addr.to_be_bytes()),
        }
    }
}

/// Ranging parameters sent from the node to a tag
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct RangingConfig {
    /// Short address the tag has to use from now on
    pub tag_addr: u16,
    pub version: u8,
    /// How much the tag has to shift its wake up to hit its slot, µs
    pub slot_corr_us: i32,
    pub sframe_period_ms: u16,
    pub poll_tx_to_final_tx_us: u16,
    /// Delay between the end of the poll and the start of the response, µs
    pub delay_rx_us: u16,
    pub poll_mult_fast: u16,
    pub poll_mult_slow: u16,
    pub mode: u16,
}

/// Start of an exchange, sent by the tag in its slot
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Poll {
    /// Running number of the exchange
    pub range_num: u8,
}

/// Answer of the node to a poll
///
/// Besides the slot correction, it carries the results of the previous
/// exchange with the same tag back to the tag.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Response {
    pub slot_corr_us: i32,
    /// Running number of the previous exchange
    pub range_num: u8,
    pub x_cm: i16,
    pub y_cm: i16,
    /// Clock offset between tag and node, hundredths of ppm
    pub clk_offset_pphm: i16,
}

/// Last message of an exchange, carrying the tag's timestamps
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Final {
    pub range_num: u8,
    pub poll_tx: Instant,
    pub response_rx: Instant,
    pub final_tx: Instant,
    /// Service flags of the tag
    pub flag: u8,
    /// Three values of the tag's choice
    ///
    /// Fixed units use them to send their own position in mm, mobile tags
    /// send accelerometer data.
    pub data: [i16; 3],
}

/// A message of the ranging exchange
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum RangingMessage {
    Blink,
    RangingConfig(RangingConfig),
    Poll(Poll),
    Response(Response),
    Final(Final),
}

impl RangingMessage {
    /// The function code of the message
    pub fn fcode(&self) -> u8 {
        match self {
            RangingMessage::Blink => fcode::BLINK,
            RangingMessage::RangingConfig(_) => fcode::RANGING_CONFIG,
            RangingMessage::Poll(_) => fcode::POLL,
            RangingMessage::Response(_) => fcode::RESPONSE,
            RangingMessage::Final(_) => fcode::FINAL,
        }
    }

    /// Length of the payload, function code included
    pub fn payload_len(&self) -> usize {
        match self {
            RangingMessage::Blink => BLINK_LEN,
            RangingMessage::RangingConfig(_) => RANGING_CONFIG_LEN,
            RangingMessage::Poll(_) => POLL_LEN,
            RangingMessage::Response(_) => RESPONSE_LEN,
            RangingMessage::Final(_) => FINAL_LEN,
        }
    }
}

/// A decoded frame of the ranging exchange
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct RangingFrame {
    /// MAC sequence number
    pub seq: u8,
    pub pan_id: u16,
    pub source: Address,
    pub destination: Address,
    pub message: RangingMessage,
}

impl RangingFrame {
    /// Decodes a received frame
    ///
    /// `data` is the frame as read from the radio. A trailing FCS is ignored.
    /// Frames that parse as IEEE 802.15.4 but don't carry a ranging message
    /// are reported as [`Error::NotTwrFrame`].
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let frame = Ieee802154Frame::new_checked(data)?;
        let repr = Ieee802154Repr::parse(&frame)?;

        if repr.frame_type != Ieee802154FrameType::Data {
            return Err(Error::NotTwrFrame);
        }

        let source = repr
            .src_addr
            .and_then(Address::from_mac)
            .ok_or(Error::NotTwrFrame)?;
        let destination = repr
            .dst_addr
            .and_then(Address::from_mac)
            .ok_or(Error::NotTwrFrame)?;
        let pan_id = repr
            .dst_pan_id
            .or(repr.src_pan_id)
            .map(|pan| pan.0)
            .ok_or(Error::NotTwrFrame)?;

        let payload = data.get(repr.buffer_len()..).ok_or(Error::NotTwrFrame)?;
        let message = payload
            .read_with::<RangingMessage>(&mut 0, ())
            .map_err(|error| match error {
                byte::Error::BadInput { .. } => Error::NotTwrFrame,
                error => Error::Frame(error),
            })?;

        Ok(RangingFrame {
            seq: repr.sequence_number.unwrap_or(0),
            pan_id,
            source,
            destination,
            message,
        })
    }

    /// Encodes the frame into `buffer`
    ///
    /// Room for the FCS is left at the end, the radio fills it in. Returns the
    /// length of the frame including the FCS.
    pub fn encode(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        let repr = Ieee802154Repr {
            frame_type: Ieee802154FrameType::Data,
            frame_version: Ieee802154FrameVersion::Ieee802154_2006,
            security_enabled: false,
            sequence_number: Some(self.seq),
            frame_pending: false,
            ack_request: false,
            pan_id_compression: true,
            dst_addr: Some(self.destination.to_mac()),
            src_addr: Some(self.source.to_mac()),
            dst_pan_id: Some(Ieee802154Pan(self.pan_id)),
            src_pan_id: None,
        };

        let header_len = repr.buffer_len();
        let len = header_len + self.message.payload_len() + FCS_LEN;
        if buffer.len() < len {
            return Err(Error::BufferTooSmall { required_len: len });
        }

        buffer[..len].fill(0);
        let mut frame = Ieee802154Frame::new_unchecked(&mut buffer[..]);
        repr.emit(&mut frame);

        self.message.try_write(&mut buffer[header_len..], ())?;

        Ok(len)
    }
}

fn read_instant(bytes: &[u8], offset: &mut usize) -> byte::Result<Instant> {
    let raw = bytes.read_with::<&[u8]>(offset, Bytes::Len(5))?;
    let mut ts = [0; 5];
    ts.copy_from_slice(raw);
    Ok(Instant::from_le_bytes(ts))
}

impl<'a> TryRead<'a, ()> for RangingMessage {
    fn try_read(bytes: &'a [u8], _: ()) -> byte::Result<(Self, usize)> {
        let offset = &mut 0;
        let fcode = bytes.read_with::<u8>(offset, LE)?;

        let message = match fcode {
            fcode::BLINK => RangingMessage::Blink,
            fcode::RANGING_CONFIG => RangingMessage::RangingConfig(RangingConfig {
                tag_addr: bytes.read_with(offset, LE)?,
                version: bytes.read_with(offset, LE)?,
                slot_corr_us: bytes.read_with(offset, LE)?,
                sframe_period_ms: bytes.read_with(offset, LE)?,
                poll_tx_to_final_tx_us: bytes.read_with(offset, LE)?,
                delay_rx_us: bytes.read_with(offset, LE)?,
                poll_mult_fast: bytes.read_with(offset, LE)?,
                poll_mult_slow: bytes.read_with(offset, LE)?,
                mode: bytes.read_with(offset, LE)?,
            }),
            fcode::POLL => RangingMessage::Poll(Poll {
                range_num: bytes.read_with(offset, LE)?,
            }),
            fcode::RESPONSE => RangingMessage::Response(Response {
                slot_corr_us: bytes.read_with(offset, LE)?,
                range_num: bytes.read_with(offset, LE)?,
                x_cm: bytes.read_with(offset, LE)?,
                y_cm: bytes.read_with(offset, LE)?,
                clk_offset_pphm: bytes.read_with(offset, LE)?,
            }),
            fcode::FINAL => RangingMessage::Final(Final {
                range_num: bytes.read_with(offset, LE)?,
                poll_tx: read_instant(bytes, offset)?,
                response_rx: read_instant(bytes, offset)?,
                final_tx: read_instant(bytes, offset)?,
                flag: bytes.read_with(offset, LE)?,
                data: [
                    bytes.read_with(offset, LE)?,
                    bytes.read_with(offset, LE)?,
                    bytes.read_with(offset, LE)?,
                ],
            }),
            _ => {
                return Err(byte::Error::BadInput {
                    err: "unknown function code",
                })
            }
        };

        Ok((message, *offset))
    }
}

impl TryWrite for RangingMessage {
    fn try_write(self, bytes: &mut [u8], _: ()) -> byte::Result<usize> {
        let offset = &mut 0;
        bytes.write_with(offset, self.fcode(), LE)?;

        match self {
            RangingMessage::Blink => {}
            RangingMessage::RangingConfig(rc) => {
                bytes.write_with(offset, rc.tag_addr, LE)?;
                bytes.write_with(offset, rc.version, LE)?;
                bytes.write_with(offset, rc.slot_corr_us, LE)?;
                bytes.write_with(offset, rc.sframe_period_ms, LE)?;
                bytes.write_with(offset, rc.poll_tx_to_final_tx_us, LE)?;
                bytes.write_with(offset, rc.delay_rx_us, LE)?;
                bytes.write_with(offset, rc.poll_mult_fast, LE)?;
                bytes.write_with(offset, rc.poll_mult_slow, LE)?;
                bytes.write_with(offset, rc.mode, LE)?;
            }
            RangingMessage::Poll(poll) => {
                bytes.write_with(offset, poll.range_num, LE)?;
            }
            RangingMessage::Response(resp) => {
                bytes.write_with(offset, resp.slot_corr_us, LE)?;
                bytes.write_with(offset, resp.range_num, LE)?;
                bytes.write_with(offset, resp.x_cm, LE)?;
                bytes.write_with(offset, resp.y_cm, LE)?;
                bytes.write_with(offset, resp.clk_offset_pphm, LE)?;
            }
            RangingMessage::Final(fin) => {
                bytes.write_with(offset, fin.range_num, LE)?;
                for ts in [fin.poll_tx, fin.response_rx, fin.final_tx] {
                    bytes.write(offset, &ts.to_le_bytes()[..])?;
                }
                bytes.write_with(offset, fin.flag, LE)?;
                for value in fin.data {
                    bytes.write_with(offset, value, LE)?;
                }
            }
        }

        Ok(*offset)
    }
}
