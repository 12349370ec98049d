//! Double-sided two-way ranging
//!
//! ```text
//!  tag                          node
//!  poll_tx  ----- poll ----->   poll_rx
//!                                 | Db
//!  response_rx <-- response --  response_tx
//!    | Da                         | Rb
//!  final_tx ----- final ---->   final_rx
//! ```
//!
//! `Ra` is the tag's round trip from poll to response, `Rb` the node's round
//! trip from response to final. The replies `Da` and `Db` don't need to be
//! equal, and the clock offset between tag and node cancels out to first
//! order.

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::{time::Instant, Error};

/// Speed of light in air, m/s
pub const SPEED_OF_LIGHT: f64 = 299_702_547.0;

/// Ranges above this are measurement errors, m
pub const MAX_RANGE_M: f64 = 2000.0;

/// Device time ticks per second
const TICKS_PER_SEC: f64 = 499.2e6 * 128.0;

/// The six timestamps of one exchange
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Timestamps {
    pub tag_poll_tx: Instant,
    pub tag_response_rx: Instant,
    pub tag_final_tx: Instant,
    pub node_poll_rx: Instant,
    pub node_response_tx: Instant,
    pub node_final_rx: Instant,
}

/// Outcome of one exchange
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Twr {
    /// Time of flight in device time ticks
    pub tof: i64,
    /// Clock offset of the tag relative to the node, hundredths of ppm
    pub clock_offset_pphm: f64,
    /// Range with the offset already subtracted, m
    pub range_m: f64,
}

impl Timestamps {
    /// Computes the time of flight and the range
    ///
    /// `range_offset_mm` is subtracted from the range, which doesn't go below
    /// zero. Returns [`Error::RangeOutOfBounds`] if the time of flight is
    /// negative or the uncorrected range exceeds [`MAX_RANGE_M`].
    pub fn compute(&self, range_offset_mm: i16) -> Result<Twr, Error> {
        let ra = self.tag_response_rx.duration_since(self.tag_poll_tx).value() as i128;
        let db = self.node_response_tx.duration_since(self.node_poll_rx).value() as i128;
        let rb = self.node_final_rx.duration_since(self.node_response_tx).value() as i128;
        let da = self.tag_final_tx.duration_since(self.tag_response_rx).value() as i128;

        let sum = ra + rb + da + db;
        if sum == 0 || da == 0 || db == 0 {
            return Err(Error::RangeOutOfBounds);
        }

        let tof = ((ra * rb - da * db) / sum) as i64;
        if tof < 0 {
            return Err(Error::RangeOutOfBounds);
        }
        let tof_f = tof as f64;

        let clock_offset_pphm = (((ra as f64 / 2.0) - tof_f) / db as f64
            - ((rb as f64 / 2.0) - tof_f) / da as f64)
            * 1e8;

        let range_m = tof_f * SPEED_OF_LIGHT / TICKS_PER_SEC;
        if range_m > MAX_RANGE_M {
            return Err(Error::RangeOutOfBounds);
        }

        Ok(Twr {
            tof,
            clock_offset_pphm,
            range_m: (range_m - range_offset_mm as f64 / 1000.0).max(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Duration, TIME_MAX};

    /// An exchange over `tof` ticks, the node's clock runs `ppm` faster
    fn exchange(tag_start: u64, node_start: u64, tof: u64, ppm: f64) -> Timestamps {
        let scale = |d: u64| Duration::new((d as f64 * (1.0 + ppm * 1e-6)) as u64).unwrap();
        let tag = |t: u64| Instant::new((tag_start + t) & TIME_MAX).unwrap();

        let db = 45_000_000;
        let da = 130_000_000;
        let node_poll_rx = Instant::new(node_start).unwrap();
        let node_response_tx = node_poll_rx + scale(db);
        let node_final_rx = node_response_tx + scale(tof + da + tof);

        Timestamps {
            tag_poll_tx: tag(0),
            tag_response_rx: tag(tof + db + tof),
            tag_final_tx: tag(tof + db + tof + da),
            node_poll_rx,
            node_response_tx,
            node_final_rx,
        }
    }

    #[test]
    fn symmetric_clocks() {
        let twr = exchange(1_000_000, 77_000_000_000, 1000, 0.0)
            .compute(0)
            .unwrap();

        assert_eq!(twr.tof, 1000);
        assert!((twr.range_m - 4.69036).abs() < 1e-5, "{:?}", twr);
        assert!(twr.clock_offset_pphm.abs() < 1.0);
    }

    #[test]
    fn range_offset_is_subtracted() {
        let twr = exchange(0, 5, 1000, 0.0).compute(190).unwrap();

        assert!((twr.range_m - 4.50036).abs() < 1e-5);
    }

    #[test]
    fn timestamps_wrap() {
        let twr = exchange(TIME_MAX - 50_000_000, TIME_MAX - 10, 2000, 0.0)
            .compute(0)
            .unwrap();

        assert_eq!(twr.tof, 2000);
    }

    #[test]
    fn clock_offset_cancels() {
        let twr = exchange(0, 1_000, 640, 5.0).compute(0).unwrap();

        assert!((twr.tof - 640).abs() < 2, "{:?}", twr);
        // the node runs fast, so the tag is 5 ppm slow
        assert!((twr.clock_offset_pphm + 500.0).abs() < 1.0, "{:?}", twr);
    }

    #[test]
    fn too_far() {
        let twr = exchange(0, 0, 500_000, 0.0).compute(0);

        assert!(matches!(twr, Err(Error::RangeOutOfBounds)));
    }

    #[test]
    fn negative_time_of_flight() {
        let mut timestamps = exchange(0, 1_000, 100, 0.0);
        // the final arrives earlier than the replies allow
        timestamps.node_final_rx = timestamps.node_final_rx - Duration::new(1_000).unwrap();

        assert!(matches!(
            timestamps.compute(0),
            Err(Error::RangeOutOfBounds)
        ));
    }

    #[test]
    fn offset_doesnt_make_range_negative() {
        let twr = exchange(0, 1_000, 10, 0.0).compute(190).unwrap();

        assert_eq!(twr.tof, 10);
        assert_eq!(twr.range_m, 0.0);
    }

    #[test]
    fn empty_exchange() {
        assert!(matches!(
            Timestamps::default().compute(0),
            Err(Error::RangeOutOfBounds)
        ));
    }
}
