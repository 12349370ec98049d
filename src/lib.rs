//! Slotted two-way ranging and trilateration for DW3000 based nodes
//!
//! A node answers tags in their slots of a fixed superframe with
//! double-sided two-way ranging ([`ranging`]). The ranges of one superframe
//! are handed over to a lower priority task ([`superframe`]) that estimates a
//! position from them ([`trilat`]) and reports it. The tags' side of the
//! exchange is the [`Tag`] state machine.
//!
//! The radio, persistent storage and the report channel are outside of this
//! crate. They are reached through the [`Radio`], [`ConfigStore`] and
//! [`ReportSink`] traits, so the crate runs on any executor and any target.
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod configs;
pub mod error;
pub mod geometry;
pub mod msg_time;
pub mod ranging;
pub mod superframe;
pub mod tag_list;
pub mod time;
pub mod trilat;

/// Redirection of nb::block
pub mod block {
    pub use nb::block;
}

pub use crate::{
    block::block,
    configs::{NodeConfig, PhyConfig, RadioSetup, SuperframeConfig},
    error::Error,
    geometry::Vec3,
    msg_time::MsgTimes,
    ranging::{ConfigStore, Event, Node, Radio, RangeResult, RxAfterTx, Tag, TagEvent},
    superframe::{ReportSink, SuperframeHandoff, SuperframeResults, TrilatTask},
    tag_list::{KnownTag, KnownTagList, TagDirectory},
    time::{Duration, Instant},
    trilat::{Estimate, TrilatError, TrilatSolver},
};
