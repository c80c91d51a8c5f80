use core::fmt;

pub use bt_hci::param::Status;

/// Parameter that failed validation.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    AdvertisingType,
    Interval,
    OwnAddressType,
    PeerAddressType,
    ChannelMap,
    FilterPolicy,
    DataLength,
    Address,
    RpaTimeout,
}

/// Link layer command errors.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A parameter was out of range.
    InvalidParams(Param),
    /// The command is not allowed in the current state.
    CommandDisallowed,
    /// The requested feature is not supported.
    Unsupported,
    /// A table is full.
    MemCapacity,
    /// No connection with the given handle.
    UnknownConnection,
}

impl Error {
    /// HCI status code reported for this error.
    pub const fn status(&self) -> Status {
        match self {
            Error::InvalidParams(_) => Status::INVALID_HCI_PARAMETERS,
            Error::CommandDisallowed => Status::CMD_DISALLOWED,
            Error::Unsupported => Status::UNSUPPORTED,
            Error::MemCapacity => Status::MEMORY_CAPACITY_EXCEEDED,
            Error::UnknownConnection => Status::UNKNOWN_CONN_IDENTIFIER,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidParams(p) => write!(f, "invalid parameter: {:?}", p),
            Error::CommandDisallowed => f.write_str("command disallowed"),
            Error::Unsupported => f.write_str("unsupported feature or parameter value"),
            Error::MemCapacity => f.write_str("memory capacity exceeded"),
            Error::UnknownConnection => f.write_str("unknown connection identifier"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Error::InvalidParams(Param::Interval).status().into_inner(), 0x12);
        assert_eq!(Error::CommandDisallowed.status().into_inner(), 0x0C);
        assert_eq!(Error::Unsupported.status().into_inner(), 0x11);
        assert_eq!(Error::MemCapacity.status().into_inner(), 0x07);
        assert_eq!(Error::UnknownConnection.status().into_inner(), 0x02);
        assert_eq!(Status::ADV_TIMEOUT.into_inner(), 0x3C);
        assert!(Error::CommandDisallowed.status().to_result().is_err());
    }
}
