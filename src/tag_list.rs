//! Known and discovered tags
//!
//! A node keeps two lists. The known list is persistent and gives every tag a
//! slot in the superframe and a unique short address. The discovered list is
//! transient and collects the long addresses of tags heard blinking while
//! they were not known yet.

use core::fmt::Write;

#[cfg(feature = "defmt")]
use defmt::Format;
#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, error, info, warn};
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, error, info, warn};

use crate::Error;

/// Capacity of the known tag list and of the discovered tag list
pub const KNOWN_TAG_LIST_SIZE: usize = 20;

/// Ranging multipliers and mode given to tags promoted from the discovered list
const D2K_MULT_FAST: u16 = 1;
const D2K_MULT_SLOW: u16 = 2;
const D2K_MODE: u16 = 1;

/// Length of one tag object in the known list JSON
const JSON_TAG_LEN: usize = 86;
/// `,\r\n` between two tag objects
const JSON_SEPARATOR_LEN: usize = 3;

/// A tag in the known list
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KnownTag {
    /// Slot in the superframe, 1-based
    pub slot: u16,
    /// Short address, unique within the list
    pub addr16: u16,
    /// Long address, unique within the list
    pub addr64: u64,
    /// Ranging rate multiplier while moving
    pub mult_fast: u16,
    /// Ranging rate multiplier while stationary
    pub mult_slow: u16,
    /// Mode bits, bit 0 enables IMU assisted ranging on the tag
    pub mode: u16,
    /// The tag has to be sent a new ranging config on its next poll
    pub req_update_pending: bool,
}

/// The persistent list of tags the node ranges with
///
/// Entries can have gaps. The slot of an entry is its index plus one.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KnownTagList {
    tags: [Option<KnownTag>; KNOWN_TAG_LIST_SIZE],
}

impl KnownTagList {
    /// Creates an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tags in the list
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// `true` if the list holds no tag
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the tags, ordered by slot
    pub fn iter(&self) -> impl Iterator<Item = &KnownTag> {
        self.tags.iter().flatten()
    }

    /// Looks a tag up by its short address
    pub fn get16(&self, addr16: u16) -> Option<&KnownTag> {
        self.iter().find(|tag| tag.addr16 == addr16)
    }

    /// Looks a tag up by its short address for modification
    pub fn get16_mut(&mut self, addr16: u16) -> Option<&mut KnownTag> {
        self.tags.iter_mut().flatten().find(|tag| tag.addr16 == addr16)
    }

    /// Looks a tag up by its long address
    pub fn get64(&self, addr64: u64) -> Option<&KnownTag> {
        self.iter().find(|tag| tag.addr64 == addr64)
    }

    /// Looks a tag up by its long address for modification
    pub fn get64_mut(&mut self, addr64: u64) -> Option<&mut KnownTag> {
        self.tags.iter_mut().flatten().find(|tag| tag.addr64 == addr64)
    }

    /// Returns the first free slot, 1-based, or `None` if the list is full
    pub fn free_slot(&self) -> Option<u16> {
        self.tags
            .iter()
            .position(Option::is_none)
            .map(|index| index as u16 + 1)
    }

    /// Adds a tag to the list
    ///
    /// If a tag with the same long address is in the list already, that tag
    /// is returned unchanged. If `addr16` is taken by another tag, the next
    /// free short address above it is used instead.
    pub fn add(
        &mut self,
        addr64: u64,
        addr16: u16,
        mult_fast: u16,
        mult_slow: u16,
        mode: u16,
    ) -> Result<&mut KnownTag, Error> {
        if let Some(index) = self.position64(addr64) {
            return self.tags[index].as_mut().ok_or(Error::KnownListFull);
        }

        let slot = self.free_slot().ok_or(Error::KnownListFull)?;

        let mut unique16 = addr16;
        while self.get16(unique16).is_some() {
            unique16 = unique16.wrapping_add(1);
        }
        if unique16 != addr16 {
            warn!(
                "short address {:x} taken, tag {:x} gets {:x}",
                addr16, addr64, unique16
            );
        }

        info!("tag {:x} added to slot {}", addr64, slot);

        let entry = &mut self.tags[slot as usize - 1];
        *entry = Some(KnownTag {
            slot,
            addr16: unique16,
            addr64,
            mult_fast,
            mult_slow,
            mode,
            req_update_pending: false,
        });

        entry.as_mut().ok_or(Error::KnownListFull)
    }

    /// Removes the tag with the given short address, returns it if it was found
    pub fn del16(&mut self, addr16: u16) -> Option<KnownTag> {
        let index = self.tags.iter().position(|tag| matches!(tag, Some(t) if t.addr16 == addr16))?;
        self.remove(index)
    }

    /// Removes the tag with the given long address, returns it if it was found
    pub fn del64(&mut self, addr64: u64) -> Option<KnownTag> {
        let index = self.position64(addr64)?;
        self.remove(index)
    }

    /// Checks a list read back from persistent storage
    ///
    /// Every tag has to sit in the entry of its slot, and no two tags may
    /// share a short or a long address.
    pub fn validate(&self) -> Result<(), Error> {
        for (index, tag) in self.tags.iter().enumerate() {
            let Some(tag) = tag else {
                continue;
            };

            let same16 = self.iter().filter(|t| t.addr16 == tag.addr16).count();
            let same64 = self.iter().filter(|t| t.addr64 == tag.addr64).count();
            if tag.slot as usize != index + 1 || same16 > 1 || same64 > 1 {
                error!("tag {:x} in slot {} is inconsistent", tag.addr64, tag.slot);
                return Err(Error::InvalidConfiguration);
            }
        }

        Ok(())
    }

    /// Empties the list
    pub fn clear(&mut self) {
        self.tags = [None; KNOWN_TAG_LIST_SIZE];
    }

    /// Writes the list as a length-prefixed JSON object
    ///
    /// `JSxxxx{"KList":[{...},\r\n{...}]}\r\n` where `xxxx` is the length of
    /// the JSON object in hex.
    pub fn write_json<W: Write>(&self, out: &mut W) -> Result<(), Error> {
        let size = self.len();
        let mut json_len = r#"{"KList":["#.len() + "]}".len();
        if size > 0 {
            json_len += (JSON_TAG_LEN + JSON_SEPARATOR_LEN) * size - JSON_SEPARATOR_LEN;
        }

        write!(out, "JS{:04X}{{\"KList\":[", json_len).map_err(|_| Error::ReportOverflow)?;
        for (i, tag) in self.iter().enumerate() {
            write!(
                out,
                "{{\"slot\":\"{:04X}\",\"a64\":\"{:016X}\",\"a16\":\"{:04X}\",\"F\":\"{:04X}\",\"S\":\"{:04X}\",\"M\":\"{:04X}\"}}",
                tag.slot, tag.addr64, tag.addr16, tag.mult_fast, tag.mult_slow, tag.mode
            )
            .map_err(|_| Error::ReportOverflow)?;
            if i + 1 < size {
                out.write_str(",\r\n").map_err(|_| Error::ReportOverflow)?;
            }
        }
        out.write_str("]}\r\n").map_err(|_| Error::ReportOverflow)
    }

    fn position64(&self, addr64: u64) -> Option<usize> {
        self.tags
            .iter()
            .position(|tag| matches!(tag, Some(t) if t.addr64 == addr64))
    }

    fn remove(&mut self, index: usize) -> Option<KnownTag> {
        let tag = self.tags[index].take()?;
        info!("tag {:x} deleted from slot {}", tag.addr64, tag.slot);
        Some(tag)
    }
}

/// Long addresses of tags heard while they were not in the known list
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiscoveredTags {
    tags: heapless::Vec<u64, KNOWN_TAG_LIST_SIZE>,
}

impl DiscoveredTags {
    /// Creates an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tag, returns `false` if it was in the list already
    pub fn add(&mut self, addr64: u64) -> Result<bool, Error> {
        if self.tags.contains(&addr64) {
            return Ok(false);
        }

        self.tags
            .push(addr64)
            .map_err(|_| Error::DiscoveredListFull)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.tags
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }

    /// Writes the list as a length-prefixed JSON object
    ///
    /// `JSxxxx{"DList":[ "addr64",\r\n"addr64"]}\r\n`
    pub fn write_json<W: Write>(&self, out: &mut W) -> Result<(), Error> {
        let size = self.len();
        let mut json_len = r#"{"DList":[ "#.len() + "]}".len();
        if size > 0 {
            json_len += (18 + JSON_SEPARATOR_LEN) * size - JSON_SEPARATOR_LEN;
        }

        write!(out, "JS{:04X}{{\"DList\":[ ", json_len).map_err(|_| Error::ReportOverflow)?;
        for (i, addr64) in self.tags.iter().enumerate() {
            write!(out, "\"{:016X}\"", addr64).map_err(|_| Error::ReportOverflow)?;
            if i + 1 < size {
                out.write_str(",\r\n").map_err(|_| Error::ReportOverflow)?;
            }
        }
        out.write_str("]}\r\n").map_err(|_| Error::ReportOverflow)
    }
}

/// Both tag lists of a node
#[derive(Clone, Debug, Default)]
pub struct TagDirectory {
    pub known: KnownTagList,
    pub discovered: DiscoveredTags,
}

impl TagDirectory {
    /// Creates a directory from a known list loaded from persistent storage
    pub fn new(known: KnownTagList) -> Self {
        TagDirectory {
            known,
            discovered: DiscoveredTags::new(),
        }
    }

    /// Moves every discovered tag to the known list
    ///
    /// The short address of a promoted tag is the low half of its long
    /// address. Every promoted tag gets a new ranging config on its next poll.
    /// The discovered list is cleared even if the known list fills up.
    pub fn discovered_to_known(&mut self) -> Result<usize, Error> {
        let mut added = 0;
        let mut result = Ok(());

        for &addr64 in self.discovered.as_slice() {
            match self
                .known
                .add(addr64, addr64 as u16, D2K_MULT_FAST, D2K_MULT_SLOW, D2K_MODE)
            {
                Ok(tag) => {
                    tag.req_update_pending = true;
                    added += 1;
                }
                Err(e) => {
                    error!("cannot add tag {:x}: known list is full", addr64);
                    result = Err(e);
                    break;
                }
            }
        }

        self.discovered.clear();
        result.map(|_| added)
    }
}
