use dw3000_twr::{
    ranging::{node::RTC_TICK_NS, twr::SPEED_OF_LIGHT, Mode, RangingFrame, RangingMessage},
    Duration, Error, Event, Instant, KnownTagList, Node, NodeConfig, Radio, RadioSetup,
    RxAfterTx, Tag, TagEvent, Vec3,
};
use rand_core::RngCore;

const TAG64: u64 = 0x00AB_CDEF_0000_0042;
const TAG16: u16 = 0x0042;
const ANTENNA_DELAY: u64 = 32810;
/// How far the node's clock is ahead of the tag's, device time units
const CLOCK_OFFSET: u64 = 3_000_000_000;

/// Radio that sends every frame in time and keeps its TX timestamps
#[derive(Default)]
struct Air {
    setup: Option<RadioSetup>,
    now: Instant,
    sent: Vec<(Vec<u8>, Instant)>,
}

impl Radio for Air {
    fn configure(&mut self, setup: &RadioSetup) -> Result<(), Error> {
        self.setup = Some(*setup);
        Ok(())
    }

    fn send_now(&mut self, frame: &[u8], _rx: Option<RxAfterTx>) -> Result<Instant, Error> {
        let tx = self.now + Duration::new(ANTENNA_DELAY).unwrap();
        self.sent.push((frame.to_vec(), tx));
        Ok(tx)
    }

    fn send_delayed(
        &mut self,
        frame: &[u8],
        at: Instant,
        _rx: Option<RxAfterTx>,
    ) -> Result<Instant, Error> {
        let tx = at + Duration::new(ANTENNA_DELAY).unwrap();
        self.sent.push((frame.to_vec(), tx));
        Ok(tx)
    }

    fn rx_enable(&mut self) {}
}

struct Counter(u64);

impl RngCore for Counter {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.0 += 7;
        self.0
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

fn last_sent(radio: &Air) -> (Vec<u8>, Instant) {
    radio.sent.last().cloned().unwrap()
}

/// Tag frame sent at `tx` arrives at the node
fn to_node(tx: Instant, tof: Duration) -> Instant {
    tx + Duration::new(CLOCK_OFFSET).unwrap() + tof
}

/// Node frame sent at `tx` arrives at the tag
fn to_tag(tx: Instant, tof: Duration) -> Instant {
    tx - Duration::new(CLOCK_OFFSET).unwrap() + tof
}

#[test]
fn tag_joins_and_ranges_in_its_slot() {
    let _ = env_logger::builder().is_test(true).try_init();

    let distance_mm = 4000.0;
    let tof = Duration::new(
        (distance_mm / 1000.0 / SPEED_OF_LIGHT * 499.2e6 * 128.0f64).round() as u64,
    )
    .unwrap();

    let mut known = KnownTagList::new();
    known.add(TAG64, TAG16, 1, 1, 0).unwrap();
    let mut node = Node::new(Air::default(), NodeConfig::default(), known).unwrap();

    let mut tag_config = NodeConfig::default();
    tag_config.position_mm = Vec3::new(6000.0, 0.0, 2400.0);
    let mut tag = Tag::new(Air::default(), Counter(0), tag_config, TAG64).unwrap();

    // blink and ranging config, the RTC runs at the same count on both sides
    node.on_superframe_start(0);
    assert_eq!(tag.on_wakeup(1000).unwrap(), TagEvent::BlinkSent);
    let (blink, blink_tx) = last_sent(tag.radio());

    let event = node.handle_frame(&blink, to_node(blink_tx, tof), 1000).unwrap();
    assert_eq!(event, Event::RangingConfigSent { addr16: TAG16 });
    let (rc, rc_tx) = last_sent(node.radio());

    // 150 ms later
    let rc_rtc = 1000 + 4915;
    let event = tag.handle_frame(&rc, to_tag(rc_tx, tof), rc_rtc).unwrap();
    assert_eq!(
        event,
        TagEvent::Joined {
            node_addr16: 0x0001,
            tag_addr16: TAG16
        }
    );
    assert_eq!(tag.mode(), Mode::Ranging);
    assert_eq!(tag.radio().setup.unwrap().addr16, TAG16);

    // the tag wakes up at the start of slot 1 of a later superframe
    let wakeup_ns = tag.take_wakeup_ns().unwrap();
    let poll_rtc = rc_rtc + (wakeup_ns as f64 / RTC_TICK_NS).round() as u32;
    node.on_superframe_start(9830);

    tag.radio().now = Instant::new(50_000_000_000).unwrap();
    assert_eq!(tag.on_wakeup(poll_rtc).unwrap(), TagEvent::PollSent { range_num: 0 });
    let (poll, poll_tx) = last_sent(tag.radio());

    let event = node.handle_frame(&poll, to_node(poll_tx, tof), poll_rtc).unwrap();
    assert_eq!(event, Event::ResponseSent { addr16: TAG16 });
    let (response, response_tx) = last_sent(node.radio());

    let RangingMessage::Response(r) = RangingFrame::decode(&response).unwrap().message else {
        panic!("not a response");
    };
    assert!(r.slot_corr_us.abs() < 50, "{:?}", r);

    let event = tag
        .handle_frame(&response, to_tag(response_tx, tof), poll_rtc + 1)
        .unwrap();
    assert_eq!(event, TagEvent::FinalSent { range_num: 0 });
    let (fin, final_tx) = last_sent(tag.radio());

    let event = node
        .handle_frame(&fin, to_node(final_tx, tof), poll_rtc + 2)
        .unwrap();
    let Event::Range(result) = event else {
        panic!("{:?}", event);
    };
    assert_eq!(result.addr16, TAG16);
    assert_eq!(result.range_num, 0);
    assert!((result.dist_mm - distance_mm).abs() < 5.0, "{:?}", result);
    assert_eq!(result.origin_mm, Vec3::new(6000.0, 0.0, 2400.0));
    assert_eq!(tag.faulty_ranges(), 0);
}

#[test]
fn tag_blinks_again_when_the_node_forgets_it() {
    let mut known = KnownTagList::new();
    known.add(TAG64, TAG16, 1, 1, 0).unwrap();
    let mut node = Node::new(Air::default(), NodeConfig::default(), known).unwrap();
    let mut tag = Tag::new(Air::default(), Counter(0), NodeConfig::default(), TAG64).unwrap();
    let tof = Duration::new(100).unwrap();

    tag.on_wakeup(0).unwrap();
    let (blink, blink_tx) = last_sent(tag.radio());
    node.handle_frame(&blink, to_node(blink_tx, tof), 0).unwrap();
    let (rc, rc_tx) = last_sent(node.radio());
    tag.handle_frame(&rc, to_tag(rc_tx, tof), 4915).unwrap();

    assert_eq!(tag.mode(), Mode::Ranging);

    // the node restarts without the tag in its list
    let mut node = Node::new(Air::default(), NodeConfig::default(), KnownTagList::new()).unwrap();

    let faulty = tag.config().faulty_ranges;
    for i in 0..faulty {
        assert_eq!(tag.on_wakeup(0).unwrap(), TagEvent::PollSent { range_num: i as u8 });
        let (poll, poll_tx) = last_sent(tag.radio());
        assert!(matches!(
            node.handle_frame(&poll, to_node(poll_tx, tof), 0),
            Err(Error::UnknownTag)
        ));
        tag.on_rx_timeout();
    }

    assert_eq!(tag.on_wakeup(0).unwrap(), TagEvent::Rediscovery);
    assert_eq!(tag.on_wakeup(0).unwrap(), TagEvent::BlinkSent);
    let (blink, blink_tx) = last_sent(tag.radio());
    assert_eq!(
        node.handle_frame(&blink, to_node(blink_tx, tof), 0).unwrap(),
        Event::TagDiscovered {
            addr64: TAG64,
            new: true
        }
    );
}
