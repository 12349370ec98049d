//! Per-superframe handover of range results to the trilateration task
//!
//! Results are collected while the superframe runs. When the superframe
//! timer fires, the filled buffer is swapped out for an empty one inside a
//! critical section and handed to the lower priority [`TrilatTask`], so the
//! ranging path never waits for a solve. If the task hasn't picked up the
//! previous buffer by then, that buffer is replaced.

use core::{cell::RefCell, convert::Infallible, fmt::Write, mem};

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, error, info, warn};
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, error, info, warn};
#[allow(unused_imports)]
use num_traits::Float;

use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex},
    signal::Signal,
};
use heapless::{String, Vec};

use crate::{
    geometry::Vec3,
    ranging::RangeResult,
    trilat::{solve, Estimate, TrilatError},
    Error,
};

/// Number of ranges kept per superframe
pub const RESULT_BUFFER_SIZE: usize = 6;

/// Capacity of one report line
pub const REPORT_LINE_LEN: usize = 384;

/// One report line
pub type ReportLine = String<REPORT_LINE_LEN>;

/// The ranges measured during one superframe
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SuperframeResults {
    results: Vec<RangeResult, RESULT_BUFFER_SIZE>,
}

impl SuperframeResults {
    pub const fn new() -> Self {
        SuperframeResults {
            results: Vec::new(),
        }
    }

    /// Appends a result, fails with [`Error::ResultBufferFull`] if the buffer
    /// holds [`RESULT_BUFFER_SIZE`] results already
    pub fn push(&mut self, result: RangeResult) -> Result<(), Error> {
        self.results
            .push(result)
            .map_err(|_| Error::ResultBufferFull)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn as_slice(&self) -> &[RangeResult] {
        &self.results
    }
}

/// Double buffer between the ranging path and the trilateration task
///
/// Can live in a `static`, all methods take `&self`.
pub struct SuperframeHandoff {
    filling: Mutex<CriticalSectionRawMutex, RefCell<SuperframeResults>>,
    ready: Signal<CriticalSectionRawMutex, SuperframeResults>,
}

impl Default for SuperframeHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl SuperframeHandoff {
    pub const fn new() -> Self {
        SuperframeHandoff {
            filling: Mutex::new(RefCell::new(SuperframeResults::new())),
            ready: Signal::new(),
        }
    }

    /// Adds a result to the superframe in progress
    pub fn push(&self, result: RangeResult) -> Result<(), Error> {
        self.filling.lock(|filling| filling.borrow_mut().push(result))
    }

    /// Number of results collected in the superframe in progress
    pub fn pending(&self) -> usize {
        self.filling.lock(|filling| filling.borrow().len())
    }

    /// Ends the superframe and hands its results over
    ///
    /// Call from the superframe timer. Returns the number of results handed
    /// over.
    pub fn on_superframe(&self) -> usize {
        let results = self.filling.lock(|filling| mem::take(&mut *filling.borrow_mut()));
        let count = results.len();

        if self.ready.signaled() {
            warn!("trilateration is behind, results of the last superframe dropped");
        }
        self.ready.signal(results);

        debug!("superframe handover, {} results", count);
        count
    }

    /// Takes the results of the last superframe
    ///
    /// Returns `WouldBlock` until the next handover.
    pub fn try_receive(&self) -> nb::Result<SuperframeResults, Infallible> {
        self.ready.try_take().ok_or(nb::Error::WouldBlock)
    }

    /// Waits for the results of the next superframe
    pub async fn receive(&self) -> SuperframeResults {
        self.ready.wait().await
    }
}

/// Where report lines go, usually a UART or a USB CDC endpoint
pub trait ReportSink {
    /// Queues `line` for transmission
    ///
    /// Fails with [`Error::ReportOverflow`] if it doesn't fit. A failed line
    /// is dropped, nothing is retried.
    fn write_report(&mut self, line: &[u8]) -> Result<(), Error>;
}

/// Result of the trilateration of one superframe
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    /// A position was found
    Estimate(Estimate),
    /// The solver failed
    Failed(TrilatError),
    /// Less than three ranges, nothing to solve
    TooFewRanges(usize),
}

/// Runs the solver on the ranges of one superframe
///
/// Positions and ranges of the results are converted from mm to m.
pub fn estimate(results: &SuperframeResults) -> Outcome {
    let count = results.len();
    if count < 3 {
        return Outcome::TooFewRanges(count);
    }

    let anchors: Vec<Vec3, RESULT_BUFFER_SIZE> = results
        .as_slice()
        .iter()
        .map(|r| r.origin_mm / 1000.0)
        .collect();
    let ranges: Vec<f64, RESULT_BUFFER_SIZE> = results
        .as_slice()
        .iter()
        .map(|r| r.dist_mm / 1000.0)
        .collect();

    match solve(&anchors, &ranges) {
        Ok(estimate) => Outcome::Estimate(estimate),
        Err(e) => Outcome::Failed(e),
    }
}

/// Writes a fixed point number given in thousandths with `decimals` digits
fn write_milli<W: Write>(out: &mut W, milli: i64, decimals: u32) -> core::fmt::Result {
    let sign = if milli < 0 { "-" } else { "" };
    let abs = milli.unsigned_abs();
    let frac = (abs % 1000) / 10u64.pow(3 - decimals);

    write!(
        out,
        "{}{}.{:0width$}",
        sign,
        abs / 1000,
        frac,
        width = decimals as usize
    )
}

fn write_position<W: Write>(out: &mut W, position_milli: Vec3) -> core::fmt::Result {
    out.write_char('[')?;
    write_milli(out, position_milli.x.round() as i64, 2)?;
    out.write_char(',')?;
    write_milli(out, position_milli.y.round() as i64, 2)?;
    out.write_char(',')?;
    write_milli(out, position_milli.z.round() as i64, 2)?;
    out.write_char(']')
}

/// Formats the report line of one superframe
///
/// `res: aaaa[t.ttt][x.xx,y.yy,z.zz]=d.dd ... qf:NNN est[x.xx,y.yy,z.zz] \r\n`
/// with one entry per range: the tag's address, the time of the poll in the
/// superframe (ms), the position of the tag (m) and the range (m). Instead of
/// the estimate the line ends in `no_est, errno: N` if the solver failed, or
/// `no_trilat n: N` if there were too few ranges.
pub fn format_report(results: &SuperframeResults, outcome: &Outcome) -> Result<ReportLine, Error> {
    let mut line = ReportLine::new();
    write_report(&mut line, results, outcome).map_err(|_| Error::ReportOverflow)?;

    Ok(line)
}

fn write_report<W: Write>(out: &mut W, results: &SuperframeResults, outcome: &Outcome) -> core::fmt::Result {
    out.write_str("res: ")?;

    for result in results.as_slice() {
        write!(out, "{:04x}[", result.addr16)?;
        write_milli(out, result.res_time_us as i64, 3)?;
        out.write_char(']')?;
        write_position(out, result.origin_mm)?;
        out.write_char('=')?;
        write_milli(out, result.dist_mm.round() as i64, 2)?;
        out.write_char(' ')?;
    }

    match outcome {
        Outcome::Estimate(estimate) => {
            write!(out, "qf:{:3} est", estimate.quality)?;
            write_position(out, estimate.position * 1000.0)?;
            out.write_char(' ')?;
        }
        Outcome::Failed(e) => write!(out, "no_est, errno: {} ", e.code())?,
        Outcome::TooFewRanges(count) => write!(out, "no_trilat n:{:2} ", count)?,
    }

    out.write_str("\r\n")
}

/// The low priority task that turns ranges into positions
///
/// Wakes once per superframe, solves and writes the report line to its sink.
pub struct TrilatTask<'a, S> {
    handoff: &'a SuperframeHandoff,
    sink: S,
}

impl<'a, S> TrilatTask<'a, S>
where
    S: ReportSink,
{
    pub fn new(handoff: &'a SuperframeHandoff, sink: S) -> Self {
        TrilatTask { handoff, sink }
    }

    pub fn sink(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Solves the ranges of one superframe and reports the outcome
    pub fn process(&mut self, results: &SuperframeResults) -> Result<Outcome, Error> {
        let outcome = estimate(results);

        match &outcome {
            Outcome::Estimate(estimate) => info!(
                "position {} {} {}, qf {}",
                estimate.position.x, estimate.position.y, estimate.position.z, estimate.quality
            ),
            Outcome::Failed(e) => warn!("no position: {:?}", e),
            Outcome::TooFewRanges(_) => {}
        }

        let line = format_report(results, &outcome)?;
        self.sink.write_report(line.as_bytes())?;

        Ok(outcome)
    }

    /// Processes the last superframe if it was handed over already
    pub fn poll(&mut self) -> nb::Result<Outcome, Error> {
        let results = self.handoff.try_receive().map_err(|e| match e {
            nb::Error::WouldBlock => nb::Error::WouldBlock,
            nb::Error::Other(never) => match never {},
        })?;

        self.process(&results).map_err(nb::Error::Other)
    }

    /// Waits for the next superframe and processes it
    pub async fn run_once(&mut self) -> Result<Outcome, Error> {
        let results = self.handoff.receive().await;
        self.process(&results)
    }

    /// Processes superframes forever
    pub async fn run(&mut self) -> ! {
        loop {
            if let Err(e) = self.run_once().await {
                warn!("report dropped: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Lines(std::vec::Vec<std::string::String>);

    impl ReportSink for Lines {
        fn write_report(&mut self, line: &[u8]) -> Result<(), Error> {
            self.0.push(std::str::from_utf8(line).unwrap().into());
            Ok(())
        }
    }

    struct Full;

    impl ReportSink for Full {
        fn write_report(&mut self, _: &[u8]) -> Result<(), Error> {
            Err(Error::ReportOverflow)
        }
    }

    fn range(addr16: u16, origin_mm: Vec3, tag_mm: Vec3) -> RangeResult {
        RangeResult {
            addr16,
            range_num: 1,
            res_time_us: 5_000 * addr16 as u32 + 9,
            dist_mm: (tag_mm - origin_mm).norm(),
            clock_offset_pphm: 0.0,
            flag: 0,
            origin_mm,
        }
    }

    fn room(tag_mm: Vec3) -> SuperframeResults {
        let mut results = SuperframeResults::new();
        for (addr16, origin) in [
            (1, Vec3::new(0.0, 0.0, 2500.0)),
            (2, Vec3::new(6000.0, 0.0, 2400.0)),
            (3, Vec3::new(6000.0, 5000.0, 2600.0)),
            (4, Vec3::new(0.0, 5000.0, 2500.0)),
        ] {
            results.push(range(addr16, origin, tag_mm)).unwrap();
        }
        results
    }

    #[test]
    fn result_buffer_is_bounded() {
        let mut results = SuperframeResults::new();
        for i in 0..RESULT_BUFFER_SIZE as u16 {
            results.push(range(i, Vec3::ZERO, Vec3::ZERO)).unwrap();
        }

        assert!(matches!(
            results.push(range(7, Vec3::ZERO, Vec3::ZERO)),
            Err(Error::ResultBufferFull)
        ));
        assert_eq!(results.len(), RESULT_BUFFER_SIZE);
    }

    #[test]
    fn handover_swaps_buffers() {
        let handoff = SuperframeHandoff::new();

        assert!(matches!(handoff.try_receive(), Err(nb::Error::WouldBlock)));

        handoff.push(range(1, Vec3::ZERO, Vec3::ZERO)).unwrap();
        handoff.push(range(2, Vec3::ZERO, Vec3::ZERO)).unwrap();
        assert_eq!(handoff.on_superframe(), 2);
        assert_eq!(handoff.pending(), 0);

        handoff.push(range(3, Vec3::ZERO, Vec3::ZERO)).unwrap();

        let results = handoff.try_receive().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.as_slice()[1].addr16, 2);
        assert!(matches!(handoff.try_receive(), Err(nb::Error::WouldBlock)));
        assert_eq!(handoff.pending(), 1);
    }

    #[test]
    fn unread_results_are_replaced() {
        let handoff = SuperframeHandoff::new();

        handoff.push(range(1, Vec3::ZERO, Vec3::ZERO)).unwrap();
        handoff.on_superframe();
        handoff.on_superframe();

        assert!(handoff.try_receive().unwrap().is_empty());
    }

    #[test]
    fn report_with_estimate() {
        let tag = Vec3::new(2000.0, 3000.0, 1200.0);
        let results = room(tag);

        let outcome = estimate(&results);
        let Outcome::Estimate(estimate) = outcome else {
            panic!("{:?}", outcome);
        };
        assert!((estimate.position * 1000.0 - tag).norm() < 1.0, "{:?}", estimate);
        assert_eq!(estimate.quality, 32);

        let line = format_report(&results, &outcome).unwrap();
        assert_eq!(
            line.as_str(),
            "res: 0001[5.009][0.00,0.00,2.50]=3.83 \
             0002[10.009][6.00,0.00,2.40]=5.14 \
             0003[15.009][6.00,5.00,2.60]=4.68 \
             0004[20.009][0.00,5.00,2.50]=3.11 \
             qf: 32 est[2.00,3.00,1.20] \r\n"
        );
    }

    #[test]
    fn report_without_estimate() {
        let mut results = SuperframeResults::new();
        results
            .push(range(0x0a0b, Vec3::new(-1500.0, 20.0, 0.0), Vec3::new(0.0, 20.0, 0.0)))
            .unwrap();

        let line = format_report(&results, &estimate(&results)).unwrap();
        assert_eq!(line.as_str(), "res: 0a0b[12855.009][-1.50,0.02,0.00]=1.50 no_trilat n: 1 \r\n");

        let line = format_report(&results, &Outcome::Failed(TrilatError::NoSolution)).unwrap();
        assert!(line.ends_with("no_est, errno: -21 \r\n"));
    }

    #[test]
    fn task_reports_every_superframe() {
        let handoff = SuperframeHandoff::new();
        let mut task = TrilatTask::new(&handoff, Lines::default());

        assert!(matches!(task.poll(), Err(nb::Error::WouldBlock)));

        for result in room(Vec3::new(2000.0, 3000.0, 1200.0)).as_slice() {
            handoff.push(*result).unwrap();
        }
        handoff.on_superframe();
        assert!(matches!(task.poll(), Ok(Outcome::Estimate(_))));

        handoff.on_superframe();
        assert_eq!(task.poll().unwrap(), Outcome::TooFewRanges(0));

        assert_eq!(task.sink().0.len(), 2);
        assert_eq!(task.sink().0[1], "res: no_trilat n: 0 \r\n");
    }

    #[test]
    fn sink_overflow_is_reported() {
        let handoff = SuperframeHandoff::new();
        let mut task = TrilatTask::new(&handoff, Full);

        handoff.on_superframe();
        assert!(matches!(task.poll(), Err(nb::Error::Other(Error::ReportOverflow))));
    }

    #[tokio::test]
    async fn handover_between_tasks() {
        static HANDOFF: SuperframeHandoff = SuperframeHandoff::new();

        let consumer = tokio::spawn(async {
            let mut task = TrilatTask::new(&HANDOFF, Lines::default());
            for _ in 0..3 {
                task.run_once().await.unwrap();
            }
            task.sink.0
        });

        for count in 1..=3u16 {
            for addr16 in 0..count {
                HANDOFF.push(range(addr16, Vec3::ZERO, Vec3::ZERO)).unwrap();
            }
            HANDOFF.on_superframe();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let lines = consumer.await.unwrap();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("no_trilat n: 1 \r\n"));
        assert!(lines[1].ends_with("no_trilat n: 2 \r\n"));
        // three ranges from the same spot can't be solved
        assert!(lines[2].ends_with("no_est, errno: -21 \r\n"), "{}", lines[2]);
    }
}
