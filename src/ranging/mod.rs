//! Slotted two-way ranging
//!
//! The [`Node`] answers tags in their slots of the superframe. It never
//! starts an exchange on its own, every transmission is a delayed reply to a
//! frame it just received. The [`Tag`] is the other side: it blinks until a
//! node takes it in, then polls once per superframe in its slot. The radio and
//! the persistent storage are reached through the [`Radio`] and
//! [`ConfigStore`] traits.

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::{
    configs::{NodeConfig, RadioSetup},
    tag_list::KnownTagList,
    time::Instant,
    Error,
};

pub mod message;
pub mod node;
pub mod tag;
pub mod twr;

pub use message::{Address, RangingFrame, RangingMessage};
pub use node::{Event, Node, RangeResult};
pub use tag::{Mode, Tag, TagEvent};
pub use twr::Timestamps;

/// When to turn on the receiver after a transmission
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum RxAfterTx {
    /// Right after the frame was sent, without timeout
    Immediately,
    /// At a fixed device time
    At {
        time: Instant,
        /// How long to listen, in PHY symbols
        timeout_sy: u16,
    },
    /// A number of PHY symbols after the end of the frame
    Delayed { delay_sy: u32, timeout_sy: u16 },
}

/// The UWB transceiver, as far as the ranging layer needs it
pub trait Radio {
    /// Applies the PHY settings, the address and the antenna delays
    ///
    /// Called before the first frame is sent and whenever the address
    /// changes.
    fn configure(&mut self, setup: &RadioSetup) -> Result<(), Error>;

    /// Sends `frame` right away and waits until it left
    ///
    /// Returns the TX timestamp of the frame.
    fn send_now(&mut self, frame: &[u8], rx: Option<RxAfterTx>) -> Result<Instant, Error>;

    /// Sends `frame` so that its RMARKER leaves the antenna at `at`
    ///
    /// `at` is already rounded to the resolution of delayed transmissions.
    /// Returns the TX timestamp the radio will report for the frame. If the
    /// radio can't make it in time, [`Error::DelayedTxLate`] is returned and
    /// nothing is sent.
    fn send_delayed(
        &mut self,
        frame: &[u8],
        at: Instant,
        rx: Option<RxAfterTx>,
    ) -> Result<Instant, Error>;

    /// Turns the receiver on right away, without timeout
    fn rx_enable(&mut self);
}

/// Persistent storage of the node's configuration and its known tags
///
/// The store is read when the node starts and written whenever the known tag
/// list changes.
pub trait ConfigStore {
    fn load_config(&mut self) -> Result<NodeConfig, Error>;

    fn save_config(&mut self, config: &NodeConfig) -> Result<(), Error>;

    fn load_known_tags(&mut self) -> Result<KnownTagList, Error>;

    fn save_known_tags(&mut self, tags: &KnownTagList) -> Result<(), Error>;
}
