//! Names of the collaborator operations, carried by store failures.

use std::fmt;

/// Progress store or stream source operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Taking the exclusive reservation for a listener.
    Reserve,
    /// Persisting a listener's applied sequence number.
    Save,
    /// Dropping a listener's reservation.
    Release,
    /// Reading a listener's applied sequence number without reserving.
    Current,
    /// Rewinding a listener's applied sequence number to zero.
    Reset,
    /// Reading events from a stream.
    Load,
    /// Appending events to a stream.
    Append,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserve => write!(f, "reserve"),
            Self::Save => write!(f, "save"),
            Self::Release => write!(f, "release"),
            Self::Current => write!(f, "current"),
            Self::Reset => write!(f, "reset"),
            Self::Load => write!(f, "load"),
            Self::Append => write!(f, "append"),
        }
    }
}
