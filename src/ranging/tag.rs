//! The initiator state machine
//!
//! A tag blinks with its long address until a node answers with a ranging
//! config. From then on it wakes up once per superframe, polls in its slot
//! and sends the final as soon as the node's response is in. Every response
//! moves the next wake up so that the tag stays in the middle of its slot.
//! After too many polls without a response the tag blinks again.

use core::num::Wrapping;

#[cfg(feature = "defmt")]
use defmt::Format;

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, error, info, warn};
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use rand_core::RngCore;

use super::{
    message::{
        Address, Final, Poll, RangingConfig, RangingFrame, RangingMessage, Response,
        RANGING_CONFIG_VERSION,
    },
    node::RTC_TICK_NS,
    Radio, RxAfterTx,
};
use crate::{
    configs::NodeConfig,
    msg_time::MsgTimes,
    time::{us_to_symbols, Duration, Instant},
    Error,
};

/// Wake up period while blinking, ms
pub const BLINK_PERIOD_MS: u32 = 500;
/// The blink period is stretched by a random amount up to this, ms
pub const BLINK_JITTER_MS: u32 = BLINK_PERIOD_MS / 3;
/// Wake up of the first blink after start and after losing the node, ns
pub const FIRST_BLINK_NS: u32 = 10_000_000;

/// Short address of a tag that wasn't given one yet
pub const UNASSIGNED_ADDR: u16 = 0xffff;

/// Shortest time between poll and response the tag can turn around in, µs
const MIN_DELAY_RX_US: u16 = 100;
/// Shortest time between poll and final the tag can manage, µs
const MIN_POLL_TX_TO_FINAL_TX_US: u16 = 1500;

/// Largest frame the tag sends
const TX_BUFFER_LEN: usize = 127;

/// Whether the tag is looking for a node or ranging with one
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Mode {
    Blinking,
    Ranging,
}

/// What a wake up or a received frame led to
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum TagEvent {
    BlinkSent,
    PollSent { range_num: u8 },
    /// The poll multiplier skips this superframe
    PollSkipped,
    /// Too many polls went unanswered, the tag blinks again
    Rediscovery,
    /// A node gave the tag a short address and a slot
    Joined { node_addr16: u16, tag_addr16: u16 },
    FinalSent { range_num: u8 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TxState {
    Idle,
    BlinkSent,
    PollSent { poll_tx: Instant, range_num: u8 },
    FinalSent,
}

/// Ranging parameters the node sent in its ranging config
#[derive(Clone, Copy, Debug)]
struct Session {
    pan_id: u16,
    node_addr16: u16,
    tag_addr16: u16,
    sframe_period_ns: u32,
    delay_rx_sy: u32,
    poll_tx_to_final_tx: Duration,
    poll_mult_fast: u16,
    poll_mult_slow: u16,
}

/// A ranging tag
///
/// The tag doesn't own a timer. After every call, [`Tag::take_wakeup_ns`]
/// tells whether the RTC wake up has to be moved, and the RTC handler calls
/// [`Tag::on_wakeup`] when it fires.
pub struct Tag<R, G> {
    radio: R,
    rng: G,
    config: NodeConfig,
    msg_times: MsgTimes,
    addr64: u64,
    session: Option<Session>,
    tx_state: TxState,
    seq: Wrapping<u8>,
    range_num: Wrapping<u8>,
    sf_zero_rtc: u32,
    poll_count: u16,
    stationary: bool,
    stationary_now: bool,
    faulty_ranges: u16,
    late_tx_count: u32,
    response_rx_timeout_sy: u16,
    wakeup_ns: Option<u32>,
}

impl<R, G> Tag<R, G>
where
    R: Radio,
    G: RngCore,
{
    /// Creates a tag and sets up its radio for blinking
    ///
    /// The first blink is due [`FIRST_BLINK_NS`] from now.
    pub fn new(mut radio: R, mut rng: G, config: NodeConfig, addr64: u64) -> Result<Self, Error> {
        config.validate()?;
        radio.configure(&config.radio_setup(config.pan_id, UNASSIGNED_ADDR))?;

        let msg_times = MsgTimes::new(&config.phy);
        let response_rx_timeout_sy = (4 * msg_times.response.sy.max(msg_times.ranging_config.sy))
            .min(u16::MAX as u32) as u16;

        info!("tag {:x} starts blinking", addr64);

        Ok(Tag {
            radio,
            seq: Wrapping(rng.next_u32() as u8),
            rng,
            config,
            msg_times,
            addr64,
            session: None,
            tx_state: TxState::Idle,
            range_num: Wrapping(0),
            sf_zero_rtc: 0,
            poll_count: 0,
            stationary: false,
            stationary_now: false,
            faulty_ranges: 0,
            late_tx_count: 0,
            response_rx_timeout_sy,
            wakeup_ns: Some(FIRST_BLINK_NS),
        })
    }

    pub fn mode(&self) -> Mode {
        match self.session {
            Some(_) => Mode::Ranging,
            None => Mode::Blinking,
        }
    }

    /// Short address given by the node, if the tag is ranging
    pub fn addr16(&self) -> Option<u16> {
        self.session.map(|s| s.tag_addr16)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn msg_times(&self) -> &MsgTimes {
        &self.msg_times
    }

    /// Number of polls without response since the last completed exchange
    pub fn faulty_ranges(&self) -> u16 {
        self.faulty_ranges
    }

    /// Number of frames the radio didn't send
    pub fn late_tx_count(&self) -> u32 {
        self.late_tx_count
    }

    pub fn radio(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Releases the radio
    pub fn free(self) -> R {
        self.radio
    }

    /// Time until the next wake up, ns, if it changed since the last call
    pub fn take_wakeup_ns(&mut self) -> Option<u32> {
        self.wakeup_ns.take()
    }

    /// Tells the tag whether it is currently at rest
    ///
    /// A resting tag polls every `poll_mult_slow` superframes instead of every
    /// `poll_mult_fast`. It goes back to fast polling as soon as it moves.
    pub fn set_stationary(&mut self, stationary: bool) {
        self.stationary_now = stationary;
    }

    /// Handles the RTC wake up
    ///
    /// `rtc` is the RTC count at the wake up, it marks the start of the tag's
    /// superframe. Sends a blink or, if a poll is due, a poll.
    pub fn on_wakeup(&mut self, rtc: u32) -> Result<TagEvent, Error> {
        self.sf_zero_rtc = rtc;

        let Some(session) = self.session else {
            let jitter_ms = self.rng.next_u32() % (BLINK_JITTER_MS + 1);
            self.wakeup_ns = Some((BLINK_PERIOD_MS + jitter_ms) * 1_000_000);
            return self.send_blink();
        };
        self.wakeup_ns = Some(session.sframe_period_ns);

        if self.stationary && !self.stationary_now {
            self.stationary = false;
            self.poll_count = session.poll_mult_fast;
        }
        self.poll_count = self.poll_count.saturating_add(1);
        let mult = if self.stationary {
            session.poll_mult_slow
        } else {
            session.poll_mult_fast
        };
        if self.poll_count < mult {
            return Ok(TagEvent::PollSkipped);
        }
        self.poll_count = 0;
        self.stationary = self.stationary_now;

        // the receiver never reported back on the last poll
        if let TxState::PollSent { .. } = self.tx_state {
            self.faulty_ranges = self.faulty_ranges.saturating_add(1);
        }

        if self.faulty_ranges >= self.config.faulty_ranges {
            warn!(
                "{} polls without response, tag {:x} blinks again",
                self.faulty_ranges, self.addr64
            );
            self.rediscover()?;
            return Ok(TagEvent::Rediscovery);
        }

        self.send_poll(session)
    }

    /// Handles an RX timeout or RX error of the radio
    pub fn on_rx_timeout(&mut self) {
        if let TxState::PollSent { range_num, .. } = self.tx_state {
            self.faulty_ranges = self.faulty_ranges.saturating_add(1);
            debug!("no response to poll {}", range_num);
        }
        self.tx_state = TxState::Idle;
    }

    /// Handles a received frame
    ///
    /// `rx_time` is the RX timestamp of the frame, `rtc` the RTC count when it
    /// was received.
    pub fn handle_frame(&mut self, data: &[u8], rx_time: Instant, rtc: u32) -> Result<TagEvent, Error> {
        let frame = RangingFrame::decode(data)?;

        match (frame.message, frame.source) {
            (RangingMessage::RangingConfig(config), Address::Short(node_addr16))
                if self.is_for_me(frame.destination) =>
            {
                self.on_ranging_config(frame.pan_id, node_addr16, config, rtc)
            }
            (RangingMessage::Response(response), Address::Short(node_addr16))
                if self.is_for_me(frame.destination) =>
            {
                self.on_response(node_addr16, response, rx_time, rtc)
            }
            _ => Err(Error::NotTwrFrame),
        }
    }

    fn is_for_me(&self, destination: Address) -> bool {
        destination == Address::Extended(self.addr64)
            || self.addr16().map(Address::Short) == Some(destination)
    }

    fn on_ranging_config(
        &mut self,
        pan_id: u16,
        node_addr16: u16,
        config: RangingConfig,
        rtc: u32,
    ) -> Result<TagEvent, Error> {
        if config.version != RANGING_CONFIG_VERSION
            || config.delay_rx_us < MIN_DELAY_RX_US
            || config.poll_tx_to_final_tx_us < MIN_POLL_TX_TO_FINAL_TX_US
            || config.sframe_period_ms == 0
            || config.sframe_period_ms as u32 > u32::MAX / 1_000_000
        {
            warn!("ranging config from {:x} can't be used: {:?}", node_addr16, config);
            return Err(Error::IncompatibleRangingConfig);
        }

        self.radio
            .configure(&self.config.radio_setup(pan_id, config.tag_addr))?;

        let session = Session {
            pan_id,
            node_addr16,
            tag_addr16: config.tag_addr,
            sframe_period_ns: config.sframe_period_ms as u32 * 1_000_000,
            delay_rx_sy: us_to_symbols(config.delay_rx_us as f64) as u32,
            poll_tx_to_final_tx: Duration::from_micros(config.poll_tx_to_final_tx_us as f64),
            poll_mult_fast: config.poll_mult_fast,
            poll_mult_slow: config.poll_mult_slow,
        };
        self.session = Some(session);
        self.tx_state = TxState::Idle;
        self.schedule_slot(session.sframe_period_ns, rtc, config.slot_corr_us);

        info!(
            "tag {:x} ranges with node {:x} as {:x}",
            self.addr64, node_addr16, config.tag_addr
        );

        Ok(TagEvent::Joined {
            node_addr16,
            tag_addr16: config.tag_addr,
        })
    }

    fn on_response(
        &mut self,
        node_addr16: u16,
        response: Response,
        rx_time: Instant,
        rtc: u32,
    ) -> Result<TagEvent, Error> {
        let session = match self.session {
            Some(session) if session.node_addr16 == node_addr16 => session,
            _ => return Err(Error::NotTwrFrame),
        };
        let TxState::PollSent { poll_tx, range_num } = self.tx_state else {
            return Err(Error::NotTwrFrame);
        };
        self.tx_state = TxState::Idle;

        self.schedule_slot(session.sframe_period_ns, rtc, response.slot_corr_us);

        let at = (poll_tx + session.poll_tx_to_final_tx).delayed_tx();
        let final_tx = at + Duration::new(self.config.antenna_delay_tx as u64).unwrap_or_default();
        let position = self.config.position_mm;

        let message = RangingMessage::Final(Final {
            range_num,
            poll_tx,
            response_rx: rx_time,
            final_tx,
            flag: self.stationary as u8,
            data: [position.x as i16, position.y as i16, position.z as i16],
        });
        self.transmit(
            session.pan_id,
            Address::Short(session.tag_addr16),
            Address::Short(session.node_addr16),
            message,
            Some(at),
            None,
        )?;

        self.tx_state = TxState::FinalSent;
        self.faulty_ranges = 0;

        debug!("final {} to {:x}", range_num, node_addr16);

        Ok(TagEvent::FinalSent { range_num })
    }

    /// Moves the next wake up into the tag's slot
    ///
    /// `slot_corr_us` is how far off the slot the node saw the frame received
    /// at `rtc`.
    fn schedule_slot(&mut self, sframe_period_ns: u32, rtc: u32, slot_corr_us: i32) {
        let period = sframe_period_ns as i64;
        let since_sf_ns = (rtc.wrapping_sub(self.sf_zero_rtc) as f64 * RTC_TICK_NS) as i64;

        let mut next = period - since_sf_ns - slot_corr_us as i64 * 1000;
        let behind = period / 2 - next;
        if behind > 0 {
            next += (behind + period - 1) / period * period;
        }

        self.wakeup_ns = Some(next.min(u32::MAX as i64) as u32);
    }

    fn send_blink(&mut self) -> Result<TagEvent, Error> {
        let rx = RxAfterTx::Delayed {
            delay_sy: us_to_symbols(self.config.ranging_config_delay_us as f64) as u32,
            timeout_sy: us_to_symbols(self.config.ranging_config_rx_timeout_us as f64) as u16,
        };

        let sent = self.transmit(
            self.config.pan_id,
            Address::Extended(self.addr64),
            Address::BROADCAST,
            RangingMessage::Blink,
            None,
            Some(rx),
        );

        self.tx_state = match sent {
            Ok(_) => TxState::BlinkSent,
            Err(_) => TxState::Idle,
        };
        sent.map(|_| TagEvent::BlinkSent)
    }

    fn send_poll(&mut self, session: Session) -> Result<TagEvent, Error> {
        let range_num = self.range_num.0;
        self.range_num += Wrapping(1);

        let rx = RxAfterTx::Delayed {
            delay_sy: session.delay_rx_sy,
            timeout_sy: self.response_rx_timeout_sy,
        };

        let sent = self.transmit(
            session.pan_id,
            Address::Short(session.tag_addr16),
            Address::Short(session.node_addr16),
            RangingMessage::Poll(Poll { range_num }),
            None,
            Some(rx),
        );

        match sent {
            Ok(poll_tx) => {
                self.tx_state = TxState::PollSent { poll_tx, range_num };
                Ok(TagEvent::PollSent { range_num })
            }
            Err(e) => {
                self.tx_state = TxState::Idle;
                Err(e)
            }
        }
    }

    /// Forgets the node and starts blinking again
    fn rediscover(&mut self) -> Result<(), Error> {
        self.session = None;
        self.tx_state = TxState::Idle;
        self.faulty_ranges = 0;
        self.poll_count = 0;
        self.wakeup_ns = Some(FIRST_BLINK_NS);

        self.radio
            .configure(&self.config.radio_setup(self.config.pan_id, UNASSIGNED_ADDR))
    }

    /// Sends a frame, right away if `at` is `None`
    fn transmit(
        &mut self,
        pan_id: u16,
        source: Address,
        destination: Address,
        message: RangingMessage,
        at: Option<Instant>,
        rx: Option<RxAfterTx>,
    ) -> Result<Instant, Error> {
        let frame = RangingFrame {
            seq: self.seq.0,
            pan_id,
            source,
            destination,
            message,
        };
        self.seq += Wrapping(1);

        let mut buffer = [0; TX_BUFFER_LEN];
        let len = frame.encode(&mut buffer)?;

        let sent = match at {
            Some(at) => self.radio.send_delayed(&buffer[..len], at, rx),
            None => self.radio.send_now(&buffer[..len], rx),
        };
        if let Err(e) = &sent {
            self.late_tx_count += 1;
            warn!("{:?} not sent: {:?}", message, e);
        }

        sent
    }
}
