//! The responder state machine
//!
//! A node ranges with one tag at a time. The exchange with a tag starts with
//! its poll and ends with its final, anything in between that doesn't belong
//! to the exchange aborts it. The tag simply polls again in its next slot.

use core::num::Wrapping;

#[cfg(feature = "defmt")]
use defmt::Format;

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, error, info, warn};
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, error, info, warn};

use super::{
    message::{
        Address, Final, Poll, RangingConfig, RangingFrame, RangingMessage, Response,
        RANGING_CONFIG_VERSION,
    },
    twr::Timestamps,
    ConfigStore, Radio, RxAfterTx,
};
use crate::{
    configs::NodeConfig,
    geometry::Vec3,
    msg_time::MsgTimes,
    tag_list::{KnownTag, KnownTagList, TagDirectory, KNOWN_TAG_LIST_SIZE},
    time::{Duration, Instant},
    Error,
};

/// Length of one tick of the 32768 Hz RTC that times the superframe, ns
pub const RTC_TICK_NS: f64 = 1e9 / 32768.0;

/// Extra time the receiver waits for a final, symbols
const RX_RELAX_TIMEOUT_SY: u32 = 50;

/// Largest frame the node sends
const TX_BUFFER_LEN: usize = 127;

/// One completed exchange
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RangeResult {
    /// Short address of the tag
    pub addr16: u16,
    /// Running number of the exchange, as sent by the tag
    pub range_num: u8,
    /// Reception of the poll relative to the start of the superframe, µs
    pub res_time_us: u32,
    /// Measured range with the offset subtracted, mm
    pub dist_mm: f64,
    /// Clock offset of the tag, hundredths of ppm
    pub clock_offset_pphm: f64,
    /// Service flags sent by the tag
    pub flag: u8,
    /// Position the tag sent along with its final, mm
    pub origin_mm: Vec3,
}

/// What a received frame led to
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Event {
    /// A ranging config was scheduled for the tag
    RangingConfigSent { addr16: u16 },
    /// A response was scheduled and the receiver will be armed for the final
    ResponseSent { addr16: u16 },
    /// A tag that is not in the known list blinked
    ///
    /// `new` is false if the tag was in the discovered list already.
    TagDiscovered { addr64: u64, new: bool },
    /// An exchange was completed
    Range(RangeResult),
}

/// The exchange in progress
#[derive(Clone, Copy, Debug)]
struct Exchange {
    addr16: u16,
    poll_rx: Instant,
    poll_rtc: u32,
    response_tx: Instant,
}

/// Results of the last exchange with a tag, sent back in the next response
#[derive(Clone, Copy, Debug, Default)]
struct LastRange {
    range_num: u8,
    clock_offset_pphm: i16,
}

/// Microseconds the tag has to shift its wake up by to hit the middle of
/// `slot`, from the RTC count of a frame received from it
pub fn slot_correction_us(sf_zero_rtc: u32, rtc: u32, slot: u16, slot_period_ms: u16) -> i32 {
    let since_sf_ns = rtc.wrapping_sub(sf_zero_rtc) as f64 * RTC_TICK_NS;
    let slot_start_ns = 1e6 * slot as f64 * slot_period_ms as f64;

    ((since_sf_ns - slot_start_ns) / 1e3) as i32
}

fn time_since_superframe_us(sf_zero_rtc: u32, rtc: u32) -> u32 {
    (rtc.wrapping_sub(sf_zero_rtc) as f64 * RTC_TICK_NS / 1e3) as u32
}

/// A ranging node
pub struct Node<R> {
    radio: R,
    config: NodeConfig,
    msg_times: MsgTimes,
    directory: TagDirectory,
    seq: Wrapping<u8>,
    sf_zero_rtc: u32,
    exchange: Option<Exchange>,
    last_ranges: [LastRange; KNOWN_TAG_LIST_SIZE],
    late_tx_count: u32,
}

impl<R> Node<R>
where
    R: Radio,
{
    /// Creates a node and sets up its radio
    ///
    /// Fails with [`Error::InvalidConfiguration`] if `config` doesn't pass
    /// [`NodeConfig::validate`] or `known` doesn't pass
    /// [`KnownTagList::validate`].
    pub fn new(mut radio: R, config: NodeConfig, known: KnownTagList) -> Result<Self, Error> {
        config.validate()?;
        known.validate()?;
        radio.configure(&config.radio_setup(config.pan_id, config.node_addr))?;

        Ok(Node {
            radio,
            msg_times: MsgTimes::new(&config.phy),
            config,
            directory: TagDirectory::new(known),
            seq: Wrapping(0),
            sf_zero_rtc: 0,
            exchange: None,
            last_ranges: [LastRange::default(); KNOWN_TAG_LIST_SIZE],
            late_tx_count: 0,
        })
    }

    /// Creates a node from the configuration and tags in `store`
    pub fn from_store<S: ConfigStore>(radio: R, store: &mut S) -> Result<Self, Error> {
        let config = store.load_config()?;
        let known = store.load_known_tags()?;

        info!("node {:x} starts with {} known tags", config.node_addr, known.len());

        Node::new(radio, config, known)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn msg_times(&self) -> &MsgTimes {
        &self.msg_times
    }

    pub fn directory(&self) -> &TagDirectory {
        &self.directory
    }

    /// Number of delayed transmissions that were too late
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

    /// Marks the start of a new superframe
    ///
    /// Call this from the superframe timer with the RTC count at its expiry.
    /// Slot corrections and result times are relative to it.
    pub fn on_superframe_start(&mut self, rtc: u32) {
        self.sf_zero_rtc = rtc;
    }

    /// Handles a received frame
    ///
    /// `rx_time` is the RX timestamp of the frame, `rtc` the RTC count when it
    /// was received. Unless a reply was scheduled, the receiver is turned on
    /// again before this returns, also on errors.
    pub fn handle_frame(&mut self, data: &[u8], rx_time: Instant, rtc: u32) -> Result<Event, Error> {
        let result = self.process(data, rx_time, rtc);

        match result {
            Ok(Event::RangingConfigSent { .. }) | Ok(Event::ResponseSent { .. }) => {}
            _ => self.radio.rx_enable(),
        }

        result
    }

    fn process(&mut self, data: &[u8], rx_time: Instant, rtc: u32) -> Result<Event, Error> {
        let frame = match RangingFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.exchange = None;
                return Err(e);
            }
        };

        match (frame.message, frame.source) {
            (RangingMessage::Blink, Address::Extended(addr64)) => {
                self.on_blink(addr64, rx_time, rtc)
            }
            (RangingMessage::Poll(poll), Address::Short(addr16)) => {
                self.on_poll(addr16, poll, rx_time, rtc)
            }
            (RangingMessage::Final(fin), Address::Short(addr16)) => {
                self.on_final(addr16, fin, rx_time)
            }
            _ => {
                self.exchange = None;
                Err(Error::NotTwrFrame)
            }
        }
    }

    fn on_blink(&mut self, addr64: u64, rx_time: Instant, rtc: u32) -> Result<Event, Error> {
        // a blink interrupts any exchange in progress
        self.exchange = None;

        match self.directory.known.get64(addr64).copied() {
            Some(tag) => self.send_ranging_config(tag, Address::Extended(addr64), rx_time, rtc),
            None => {
                let new = self.directory.discovered.add(addr64)?;
                if new {
                    info!("new tag {:x} discovered", addr64);
                }
                Ok(Event::TagDiscovered { addr64, new })
            }
        }
    }

    fn on_poll(&mut self, addr16: u16, poll: Poll, rx_time: Instant, rtc: u32) -> Result<Event, Error> {
        let tag = *self.directory.known.get16(addr16).ok_or(Error::UnknownTag)?;

        let sent = if tag.req_update_pending {
            self.exchange = None;
            self.send_ranging_config(tag, Address::Short(addr16), rx_time, rtc)
        } else {
            self.send_response(tag, rx_time, rtc).map(|response_tx| {
                self.exchange = Some(Exchange {
                    addr16,
                    poll_rx: rx_time,
                    poll_rtc: rtc,
                    response_tx,
                });
                Event::ResponseSent { addr16 }
            })
        };

        match sent {
            Ok(event) => {
                if let Some(last) = self.last_range_mut(tag.slot) {
                    last.range_num = poll.range_num;
                }
                Ok(event)
            }
            Err(e) => {
                self.exchange = None;
                self.late_tx_count += 1;
                warn!("reply to {:x} not sent: {:?}", addr16, e);
                Err(e)
            }
        }
    }

    fn on_final(&mut self, addr16: u16, fin: Final, rx_time: Instant) -> Result<Event, Error> {
        let tag = *self.directory.known.get16(addr16).ok_or(Error::UnknownTag)?;

        let exchange = match self.exchange {
            Some(exchange) if exchange.addr16 == addr16 => exchange,
            _ => return Err(Error::UnexpectedTag),
        };
        self.exchange = None;

        let timestamps = Timestamps {
            tag_poll_tx: fin.poll_tx,
            tag_response_rx: fin.response_rx,
            tag_final_tx: fin.final_tx,
            node_poll_rx: exchange.poll_rx,
            node_response_tx: exchange.response_tx,
            node_final_rx: rx_time,
        };

        let twr = timestamps.compute(self.config.range_offset_mm).map_err(|e| {
            warn!("range to {:x} rejected", addr16);
            e
        })?;

        let clock_offset_pphm = twr
            .clock_offset_pphm
            .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        if let Some(last) = self.last_range_mut(tag.slot) {
            last.range_num = fin.range_num;
            last.clock_offset_pphm = clock_offset_pphm;
        }

        let [x, y, z] = fin.data;
        let result = RangeResult {
            addr16,
            range_num: fin.range_num,
            res_time_us: time_since_superframe_us(self.sf_zero_rtc, exchange.poll_rtc),
            dist_mm: twr.range_m * 1000.0,
            clock_offset_pphm: twr.clock_offset_pphm,
            flag: fin.flag,
            origin_mm: Vec3::new(x as f64, y as f64, z as f64),
        };

        debug!("range to {:x}: {} mm", addr16, result.dist_mm);

        Ok(Event::Range(result))
    }

    /// Sends a ranging config in reply to a blink or, if the tag's config
    /// changed, to a poll
    fn send_ranging_config(
        &mut self,
        tag: KnownTag,
        destination: Address,
        rx_time: Instant,
        rtc: u32,
    ) -> Result<Event, Error> {
        let times = &self.msg_times;
        let sf = &self.config.superframe;

        let delay_us = match destination {
            Address::Extended(_) => {
                self.config.ranging_config_delay_us + times.blink.phr_and_data_us
            }
            Address::Short(_) => sf.tag_reply_delay_us as u32 + times.poll.phr_and_data_us,
        } + times.ranging_config.preamble_us
            + times.ranging_config.sts_us;

        let message = RangingMessage::RangingConfig(RangingConfig {
            tag_addr: tag.addr16,
            version: RANGING_CONFIG_VERSION,
            slot_corr_us: slot_correction_us(self.sf_zero_rtc, rtc, tag.slot, sf.slot_period_ms),
            sframe_period_ms: sf.sf_period_ms,
            poll_tx_to_final_tx_us: sf.tag_poll_tx_final_tx_us,
            delay_rx_us: sf.tag_reply_delay_us,
            poll_mult_fast: tag.mult_fast,
            poll_mult_slow: tag.mult_slow,
            mode: tag.mode,
        });

        let at = (rx_time + Duration::from_micros(delay_us as f64)).delayed_tx();
        self.send(destination, message, at, RxAfterTx::Immediately)?;

        if let Some(known) = self.directory.known.get16_mut(tag.addr16) {
            known.req_update_pending = false;
        }

        debug!("ranging config for {:x} in slot {}", tag.addr16, tag.slot);

        Ok(Event::RangingConfigSent { addr16: tag.addr16 })
    }

    /// Sends a response to a poll and arms the receiver for the final
    ///
    /// Returns the TX timestamp of the response.
    fn send_response(&mut self, tag: KnownTag, poll_rx: Instant, rtc: u32) -> Result<Instant, Error> {
        let times = &self.msg_times;
        let sf = &self.config.superframe;
        let last = self
            .last_ranges
            .get((tag.slot as usize).wrapping_sub(1))
            .copied()
            .unwrap_or_default();

        let delay_us = sf.tag_reply_delay_us as u32
            + times.poll.phr_and_data_us
            + times.response.preamble_us
            + times.response.sts_us;
        let at = (poll_rx + Duration::from_micros(delay_us as f64)).delayed_tx();

        // the final's RMARKER arrives poll_tx_to_final_tx after the poll's
        let rx_delay_us = (sf.tag_poll_tx_final_tx_us as u32).saturating_sub(times.final_.preamble_us);
        let rx = RxAfterTx::At {
            time: poll_rx + Duration::from_micros(rx_delay_us as f64),
            timeout_sy: (times.final_.sy + RX_RELAX_TIMEOUT_SY) as u16,
        };

        let message = RangingMessage::Response(Response {
            slot_corr_us: slot_correction_us(self.sf_zero_rtc, rtc, tag.slot, sf.slot_period_ms),
            range_num: last.range_num,
            x_cm: 0,
            y_cm: 0,
            clk_offset_pphm: last.clock_offset_pphm,
        });

        self.send(Address::Short(tag.addr16), message, at, rx)
    }

    fn last_range_mut(&mut self, slot: u16) -> Option<&mut LastRange> {
        self.last_ranges.get_mut((slot as usize).wrapping_sub(1))
    }

    fn send(
        &mut self,
        destination: Address,
        message: RangingMessage,
        at: Instant,
        rx: RxAfterTx,
    ) -> Result<Instant, Error> {
        let frame = RangingFrame {
            seq: self.seq.0,
            pan_id: self.config.pan_id,
            source: Address::Short(self.config.node_addr),
            destination,
            message,
        };
        self.seq += Wrapping(1);

        let mut buffer = [0; TX_BUFFER_LEN];
        let len = frame.encode(&mut buffer)?;

        self.radio.send_delayed(&buffer[..len], at, Some(rx))
    }

    /// Adds a tag to the known list and saves the list
    pub fn add_tag<S: ConfigStore>(
        &mut self,
        store: &mut S,
        addr64: u64,
        addr16: u16,
        mult_fast: u16,
        mult_slow: u16,
        mode: u16,
    ) -> Result<KnownTag, Error> {
        let tag = *self
            .directory
            .known
            .add(addr64, addr16, mult_fast, mult_slow, mode)?;
        store.save_known_tags(&self.directory.known)?;

        Ok(tag)
    }

    /// Changes the ranging parameters of a known tag and saves the list
    ///
    /// The tag gets the new parameters in a ranging config instead of the
    /// response to its next poll.
    pub fn update_tag<S: ConfigStore>(
        &mut self,
        store: &mut S,
        addr64: u64,
        mult_fast: u16,
        mult_slow: u16,
        mode: u16,
    ) -> Result<KnownTag, Error> {
        let tag = self
            .directory
            .known
            .get64_mut(addr64)
            .ok_or(Error::UnknownTag)?;
        tag.mult_fast = mult_fast;
        tag.mult_slow = mult_slow;
        tag.mode = mode;
        tag.req_update_pending = true;
        let tag = *tag;

        store.save_known_tags(&self.directory.known)?;

        Ok(tag)
    }

    /// Removes a tag by its short address and saves the list
    pub fn delete_tag16<S: ConfigStore>(
        &mut self,
        store: &mut S,
        addr16: u16,
    ) -> Result<Option<KnownTag>, Error> {
        let tag = self.directory.known.del16(addr16);
        self.forget(tag);
        store.save_known_tags(&self.directory.known)?;

        Ok(tag)
    }

    /// Removes a tag by its long address and saves the list
    pub fn delete_tag64<S: ConfigStore>(
        &mut self,
        store: &mut S,
        addr64: u64,
    ) -> Result<Option<KnownTag>, Error> {
        let tag = self.directory.known.del64(addr64);
        self.forget(tag);
        store.save_known_tags(&self.directory.known)?;

        Ok(tag)
    }

    fn forget(&mut self, tag: Option<KnownTag>) {
        if let Some(tag) = tag {
            if let Some(last) = self.last_range_mut(tag.slot) {
                *last = LastRange::default();
            }
            if matches!(self.exchange, Some(e) if e.addr16 == tag.addr16) {
                self.exchange = None;
            }
        }
    }

    /// Opens a new discovery window by forgetting all discovered tags
    pub fn start_discovery(&mut self) {
        self.directory.discovered.clear();
    }

    /// Moves all discovered tags to the known list and saves the list
    ///
    /// The list is saved even if it filled up on the way.
    pub fn discovered_to_known<S: ConfigStore>(&mut self, store: &mut S) -> Result<usize, Error> {
        let added = self.directory.discovered_to_known();
        store.save_known_tags(&self.directory.known)?;

        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{configs::RadioSetup, ranging::message::FCS_LEN, time::TIME_MAX};

    const TAG64: u64 = 0x0102_0304_0506_0708;
    const TAG16: u16 = 0x0708;
    const ANTENNA_DELAY: u64 = 32810;

    #[derive(Default)]
    struct MockRadio {
        setup: Option<RadioSetup>,
        sent: Vec<(Vec<u8>, Instant, Option<RxAfterTx>)>,
        late: bool,
        rx_enabled: usize,
    }

    impl Radio for MockRadio {
        fn configure(&mut self, setup: &RadioSetup) -> Result<(), Error> {
            self.setup = Some(*setup);
            Ok(())
        }

        fn send_now(&mut self, frame: &[u8], rx: Option<RxAfterTx>) -> Result<Instant, Error> {
            self.sent.push((frame.to_vec(), Instant::default(), rx));
            Ok(Instant::default())
        }

        fn send_delayed(
            &mut self,
            frame: &[u8],
            at: Instant,
            rx: Option<RxAfterTx>,
        ) -> Result<Instant, Error> {
            if self.late {
                return Err(Error::DelayedTxLate);
            }
            self.sent.push((frame.to_vec(), at, rx));
            Ok(at + Duration::new(ANTENNA_DELAY).unwrap())
        }

        fn rx_enable(&mut self) {
            self.rx_enabled += 1;
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        config: NodeConfig,
        tags: KnownTagList,
        saves: usize,
    }

    impl ConfigStore for MemoryStore {
        fn load_config(&mut self) -> Result<NodeConfig, Error> {
            Ok(self.config)
        }

        fn save_config(&mut self, config: &NodeConfig) -> Result<(), Error> {
            self.config = *config;
            Ok(())
        }

        fn load_known_tags(&mut self) -> Result<KnownTagList, Error> {
            Ok(self.tags.clone())
        }

        fn save_known_tags(&mut self, tags: &KnownTagList) -> Result<(), Error> {
            self.tags = tags.clone();
            self.saves += 1;
            Ok(())
        }
    }

    fn node_with_tag() -> Node<MockRadio> {
        let mut known = KnownTagList::new();
        known.add(TAG64, TAG16, 1, 10, 1).unwrap();
        Node::new(MockRadio::default(), NodeConfig::default(), known).unwrap()
    }

    fn frame(source: Address, message: RangingMessage) -> Vec<u8> {
        let frame = RangingFrame {
            seq: 1,
            pan_id: 0xDECA,
            source,
            destination: Address::Short(0x0001),
            message,
        };
        let mut buffer = [0; 127];
        let len = frame.encode(&mut buffer).unwrap();
        buffer[..len].to_vec()
    }

    fn instant(value: u64) -> Instant {
        Instant::new(value & TIME_MAX).unwrap()
    }

    fn last_sent(node: &mut Node<MockRadio>) -> (RangingFrame, Instant, Option<RxAfterTx>) {
        let (data, at, rx) = node.radio().sent.last().cloned().unwrap();
        (RangingFrame::decode(&data).unwrap(), at, rx)
    }

    #[test]
    fn slot_correction() {
        // 164 ticks are 5.0049 ms
        assert_eq!(slot_correction_us(0, 164, 1, 5), 4);
        assert_eq!(slot_correction_us(u32::MAX - 10, 153, 1, 5), 4);
        assert_eq!(slot_correction_us(0, 0, 2, 5), -10_000);
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = NodeConfig::default();
        config.superframe.num_slots = 4;

        assert!(matches!(
            Node::new(MockRadio::default(), config, KnownTagList::new()),
            Err(Error::InvalidConfiguration)
        ));
    }

    #[test]
    fn stored_tag_with_bad_slot_is_refused() {
        for slot in [0, KNOWN_TAG_LIST_SIZE as u16 + 1] {
            let mut store = MemoryStore::default();
            store.tags.add(TAG64, TAG16, 1, 1, 0).unwrap();
            store.tags.get64_mut(TAG64).unwrap().slot = slot;

            assert!(
                matches!(
                    Node::from_store(MockRadio::default(), &mut store),
                    Err(Error::InvalidConfiguration)
                ),
                "slot {}",
                slot
            );
        }
    }

    #[test]
    fn radio_is_set_up_with_node_address() {
        let mut config = NodeConfig::default();
        config.node_addr = 0x0007;
        config.antenna_delay_rx = 16450;

        let mut node = Node::new(MockRadio::default(), config, KnownTagList::new()).unwrap();
        let setup = node.radio().setup.unwrap();

        assert_eq!(setup.addr16, 0x0007);
        assert_eq!(setup.pan_id, 0xDECA);
        assert_eq!(setup.phy, config.phy);
        assert_eq!(setup.antenna_delay_rx, 16450);
    }

    #[test]
    fn unknown_tag_blinks() {
        let mut node = node_with_tag();
        let blink = frame(Address::Extended(0xAAAA), RangingMessage::Blink);

        let event = node.handle_frame(&blink, instant(1000), 0).unwrap();
        assert_eq!(event, Event::TagDiscovered { addr64: 0xAAAA, new: true });

        let event = node.handle_frame(&blink, instant(2000), 0).unwrap();
        assert_eq!(event, Event::TagDiscovered { addr64: 0xAAAA, new: false });

        assert_eq!(node.directory().discovered.as_slice(), &[0xAAAA]);
        assert!(node.radio().sent.is_empty());
        assert_eq!(node.radio().rx_enabled, 2);
    }

    #[test]
    fn known_tag_blinks() {
        let mut node = node_with_tag();
        node.on_superframe_start(100);
        let rx_time = instant(0x12_3456_789a);

        let event = node
            .handle_frame(&frame(Address::Extended(TAG64), RangingMessage::Blink), rx_time, 264)
            .unwrap();
        assert_eq!(event, Event::RangingConfigSent { addr16: TAG16 });

        let times = *node.msg_times();
        let delay = 150_000
            + times.blink.phr_and_data_us
            + times.ranging_config.preamble_us
            + times.ranging_config.sts_us;
        let expected = (rx_time + Duration::from_micros(delay as f64)).delayed_tx();

        let (sent, at, rx) = last_sent(&mut node);
        assert_eq!(at, expected);
        assert_eq!(at.value() & 0x1ff, 0);
        assert_eq!(rx, Some(RxAfterTx::Immediately));
        assert_eq!(sent.destination, Address::Extended(TAG64));
        assert_eq!(sent.source, Address::Short(0x0001));

        let RangingMessage::RangingConfig(rc) = sent.message else {
            panic!("{:?}", sent.message);
        };
        assert_eq!(rc.tag_addr, TAG16);
        assert_eq!(rc.slot_corr_us, 4);
        assert_eq!(rc.sframe_period_ms, 100);
        assert_eq!(rc.poll_tx_to_final_tx_us, 2000);
        assert_eq!(rc.delay_rx_us, 700);
        assert_eq!((rc.poll_mult_fast, rc.poll_mult_slow, rc.mode), (1, 10, 1));
        assert_eq!(node.radio().rx_enabled, 0);
    }

    #[test]
    fn poll_from_unknown_tag() {
        let mut node = node_with_tag();
        let poll = frame(Address::Short(0x4242), RangingMessage::Poll(Poll { range_num: 1 }));

        assert!(matches!(
            node.handle_frame(&poll, instant(0), 0),
            Err(Error::UnknownTag)
        ));
        assert_eq!(node.radio().rx_enabled, 1);
    }

    #[test]
    fn poll_is_answered() {
        let mut node = node_with_tag();
        let poll_rx = instant(TIME_MAX - 1000);
        let poll = frame(Address::Short(TAG16), RangingMessage::Poll(Poll { range_num: 3 }));

        let event = node.handle_frame(&poll, poll_rx, 0).unwrap();
        assert_eq!(event, Event::ResponseSent { addr16: TAG16 });

        let times = *node.msg_times();
        let delay = 700 + times.poll.phr_and_data_us + times.response.preamble_us + times.response.sts_us;
        let (sent, at, rx) = last_sent(&mut node);

        assert_eq!(at, (poll_rx + Duration::from_micros(delay as f64)).delayed_tx());
        assert_eq!(
            rx,
            Some(RxAfterTx::At {
                time: poll_rx + Duration::from_micros((2000 - times.final_.preamble_us) as f64),
                timeout_sy: (times.final_.sy + 50) as u16,
            })
        );
        assert_eq!(sent.destination, Address::Short(TAG16));
        assert!(matches!(sent.message, RangingMessage::Response(_)));
    }

    #[test]
    fn pending_update_is_sent_instead_of_response() {
        let mut node = node_with_tag();
        let mut store = MemoryStore::default();
        node.update_tag(&mut store, TAG64, 2, 20, 0).unwrap();
        assert_eq!(store.saves, 1);

        let poll = frame(Address::Short(TAG16), RangingMessage::Poll(Poll { range_num: 3 }));
        let event = node.handle_frame(&poll, instant(5000), 0).unwrap();

        assert_eq!(event, Event::RangingConfigSent { addr16: TAG16 });
        let (sent, _, _) = last_sent(&mut node);
        assert_eq!(sent.destination, Address::Short(TAG16));
        let RangingMessage::RangingConfig(rc) = sent.message else {
            panic!("{:?}", sent.message);
        };
        assert_eq!((rc.poll_mult_fast, rc.poll_mult_slow, rc.mode), (2, 20, 0));
        assert!(!node.directory().known.get16(TAG16).unwrap().req_update_pending);

        // the next poll gets a response again
        let event = node.handle_frame(&poll, instant(9000), 0).unwrap();
        assert_eq!(event, Event::ResponseSent { addr16: TAG16 });
    }

    #[test]
    fn late_response_aborts_exchange() {
        let mut node = node_with_tag();
        node.radio().late = true;
        let poll = frame(Address::Short(TAG16), RangingMessage::Poll(Poll { range_num: 3 }));

        assert!(matches!(
            node.handle_frame(&poll, instant(0), 0),
            Err(Error::DelayedTxLate)
        ));
        assert_eq!(node.late_tx_count(), 1);
        assert_eq!(node.radio().rx_enabled, 1);

        let fin = frame(Address::Short(TAG16), RangingMessage::Final(Final::default()));
        assert!(matches!(
            node.handle_frame(&fin, instant(1000), 0),
            Err(Error::UnexpectedTag)
        ));
    }

    #[test]
    fn full_exchange() {
        let mut node = node_with_tag();
        node.on_superframe_start(1000);
        let tof = 1000;
        let tag_poll_tx = instant(5_000_000);
        let poll_rx = instant(900_000_000);

        let poll = frame(Address::Short(TAG16), RangingMessage::Poll(Poll { range_num: 7 }));
        node.handle_frame(&poll, poll_rx, 1000 + 328).unwrap();

        let (_, at, _) = last_sent(&mut node);
        let response_tx = at + Duration::new(ANTENNA_DELAY).unwrap();
        let db = response_tx.duration_since(poll_rx).value();
        let da = 60_000_000;

        let tag_response_rx = tag_poll_tx + Duration::new(2 * tof + db).unwrap();
        let fin = Final {
            range_num: 7,
            poll_tx: tag_poll_tx,
            response_rx: tag_response_rx,
            final_tx: tag_response_rx + Duration::new(da).unwrap(),
            flag: 0,
            data: [1500, -200, 2500],
        };
        let final_rx = response_tx + Duration::new(2 * tof + da).unwrap();

        let event = node
            .handle_frame(&frame(Address::Short(TAG16), RangingMessage::Final(fin)), final_rx, 2000)
            .unwrap();

        let Event::Range(result) = event else {
            panic!("{:?}", event);
        };
        assert_eq!(result.addr16, TAG16);
        assert_eq!(result.range_num, 7);
        assert!((result.dist_mm - 4690.36).abs() < 0.01, "{:?}", result);
        assert_eq!(result.origin_mm, Vec3::new(1500.0, -200.0, 2500.0));
        // 328 RTC ticks after the superframe started
        assert_eq!(result.res_time_us, 10_009);
        assert_eq!(node.radio().rx_enabled, 1);

        // the exchange is over
        assert!(matches!(
            node.handle_frame(&frame(Address::Short(TAG16), RangingMessage::Final(fin)), final_rx, 2000),
            Err(Error::UnexpectedTag)
        ));
    }

    #[test]
    fn final_from_other_tag() {
        let mut node = node_with_tag();
        node.directory.known.add(0xBBBB, 0x0BBB, 1, 1, 0).unwrap();

        let poll = frame(Address::Short(TAG16), RangingMessage::Poll(Poll { range_num: 1 }));
        node.handle_frame(&poll, instant(0), 0).unwrap();

        let fin = frame(Address::Short(0x0BBB), RangingMessage::Final(Final::default()));
        assert!(matches!(
            node.handle_frame(&fin, instant(1000), 0),
            Err(Error::UnexpectedTag)
        ));

        let fin = frame(Address::Short(0x0CCC), RangingMessage::Final(Final::default()));
        assert!(matches!(
            node.handle_frame(&fin, instant(1000), 0),
            Err(Error::UnknownTag)
        ));
    }

    #[test]
    fn other_frames_abort_exchange() {
        let mut node = node_with_tag();
        let poll = frame(Address::Short(TAG16), RangingMessage::Poll(Poll { range_num: 1 }));
        node.handle_frame(&poll, instant(0), 0).unwrap();

        let response = frame(Address::Short(TAG16), RangingMessage::Response(Response::default()));
        assert!(matches!(
            node.handle_frame(&response, instant(100), 0),
            Err(Error::NotTwrFrame)
        ));

        let mut fin = frame(Address::Short(TAG16), RangingMessage::Final(Final::default()));
        assert!(matches!(
            node.handle_frame(&fin, instant(1000), 0),
            Err(Error::UnexpectedTag)
        ));

        // unknown function code
        let idx = fin.len() - FCS_LEN - 24;
        fin[idx] = 0x55;
        assert!(matches!(
            node.handle_frame(&fin, instant(1000), 0),
            Err(Error::NotTwrFrame)
        ));
    }

    #[test]
    fn tag_management_is_saved() {
        let mut store = MemoryStore::default();
        store.tags.add(TAG64, TAG16, 1, 1, 0).unwrap();
        let mut node = Node::from_store(MockRadio::default(), &mut store).unwrap();
        assert_eq!(node.directory().known.len(), 1);

        let tag = node.add_tag(&mut store, 0xCAFE_0708, TAG16, 1, 2, 0).unwrap();
        assert_eq!(tag.addr16, TAG16 + 1);
        assert_eq!(tag.slot, 2);
        assert_eq!(store.tags.len(), 2);

        assert_eq!(node.delete_tag16(&mut store, TAG16).unwrap().map(|t| t.addr64), Some(TAG64));
        assert_eq!(node.delete_tag64(&mut store, 0xCAFE_0708).unwrap().map(|t| t.slot), Some(2));
        assert!(store.tags.is_empty());
        assert_eq!(node.delete_tag64(&mut store, 0xCAFE_0708).unwrap(), None);

        assert!(matches!(
            node.update_tag(&mut store, TAG64, 1, 1, 0),
            Err(Error::UnknownTag)
        ));
    }

    #[test]
    fn discovery_window() {
        let mut store = MemoryStore::default();
        let mut node = node_with_tag();
        for addr64 in [0x1111_0001, 0x2222_0002] {
            node.handle_frame(&frame(Address::Extended(addr64), RangingMessage::Blink), instant(0), 0)
                .unwrap();
        }

        node.start_discovery();
        assert!(node.directory().discovered.is_empty());

        node.handle_frame(&frame(Address::Extended(0x3333_0003), RangingMessage::Blink), instant(0), 0)
            .unwrap();
        assert_eq!(node.discovered_to_known(&mut store).unwrap(), 1);

        let tag = store.tags.get64(0x3333_0003).unwrap();
        assert_eq!(tag.addr16, 0x0003);
        assert!(tag.req_update_pending);
        assert!(node.directory().discovered.is_empty());
    }
}
