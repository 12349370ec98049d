use core::fmt::{self, Display, Formatter};

#[cfg(feature = "defmt")]
use defmt::Format;

/// An error that can occur while ranging, handing results over or reporting
#[derive(Debug)]
pub enum Error {
    /// Ranging payload could not be decoded or encoded
    Frame(byte::Error),

    /// The IEEE 802.15.4 MAC frame was malformed
    Mac(smoltcp::wire::Error),

    /// The frame is not part of a ranging exchange
    NotTwrFrame,

    /// The sender is not in the known tag list
    UnknownTag,

    /// A final message arrived from a tag the node is not currently ranging to
    UnexpectedTag,

    /// The known tag list has no free slot left
    KnownListFull,

    /// The discovered tag list has no free entry left
    DiscoveredListFull,

    /// The result buffer of the current superframe is full
    ResultBufferFull,

    /// A delayed frame could not be sent in time
    ///
    /// The exchange with the tag is dropped. The tag will poll again in its
    /// next slot.
    DelayedTxLate,

    /// The computed range is larger than any range the radio can measure
    RangeOutOfBounds,

    /// The reporting channel could not take the report
    ///
    /// The report is lost, the next superframe produces a new one.
    ReportOverflow,

    /// Buffer too small
    BufferTooSmall {
        /// Indicates how large a buffer would have been required
        required_len: usize,
    },

    /// The configuration was not valid. Some combinations of settings are not
    /// allowed.
    InvalidConfiguration,

    /// The configuration store could not be read or written
    Store,

    /// A ranging config asks for a version or timing the tag can't do
    IncompatibleRangingConfig,
}

impl From<byte::Error> for Error {
    fn from(error: byte::Error) -> Self {
        Error::Frame(error)
    }
}

impl From<smoltcp::wire::Error> for Error {
    fn from(error: smoltcp::wire::Error) -> Self {
        Error::Mac(error)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

// `byte::Error` has no `defmt::Format` implementation, so this can't be
// derived.
#[cfg(feature = "defmt")]
impl Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::Frame(error) => defmt::write!(f, "Frame({:?})", defmt::Debug2Format(error)),
            Error::Mac(error) => defmt::write!(f, "Mac({:?})", error),
            Error::NotTwrFrame => defmt::write!(f, "NotTwrFrame"),
            Error::UnknownTag => defmt::write!(f, "UnknownTag"),
            Error::UnexpectedTag => defmt::write!(f, "UnexpectedTag"),
            Error::KnownListFull => defmt::write!(f, "KnownListFull"),
            Error::DiscoveredListFull => defmt::write!(f, "DiscoveredListFull"),
            Error::ResultBufferFull => defmt::write!(f, "ResultBufferFull"),
            Error::DelayedTxLate => defmt::write!(f, "DelayedTxLate"),
            Error::RangeOutOfBounds => defmt::write!(f, "RangeOutOfBounds"),
            Error::ReportOverflow => defmt::write!(f, "ReportOverflow"),
            Error::BufferTooSmall { required_len } => {
                defmt::write!(f, "BufferTooSmall {{ required_len: {:?} }}", required_len,)
            }
            Error::InvalidConfiguration => defmt::write!(f, "InvalidConfiguration"),
            Error::Store => defmt::write!(f, "Store"),
            Error::IncompatibleRangingConfig => defmt::write!(f, "IncompatibleRangingConfig"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_debug() {
        let error = Error::BufferTooSmall { required_len: 42 };

        assert_eq!(format!("{}", error), "BufferTooSmall { required_len: 42 }");
        assert_eq!(format!("{}", Error::UnknownTag), "UnknownTag");
    }

    #[test]
    fn converts_codec_errors() {
        let error: Error = byte::Error::Incomplete.into();
        assert!(matches!(error, Error::Frame(byte::Error::Incomplete)));

        let error: Error = smoltcp::wire::Error.into();
        assert!(matches!(error, Error::Mac(_)));
    }
}
