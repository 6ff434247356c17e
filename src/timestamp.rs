//! `OplogTimestamp` wraps a BSON timestamp `(seconds, ordinal)` pair so that
//! checkpoints and event batches can compare and take the maximum of
//! timestamps directly instead of re-deriving MongoDB's ordering ad hoc.

use std::cmp::Ordering;
use std::fmt;

use mongodb::bson::{self, Bson};

/// A totally ordered MongoDB oplog timestamp: `(seconds, ordinal)`.
///
/// Timestamps compare first by `seconds` and then by `ordinal`, matching the
/// ordering MongoDB itself uses for `ts` in the oplog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OplogTimestamp {
    seconds: u32,
    ordinal: u32,
}

impl OplogTimestamp {
    /// The timestamp that compares less than every real oplog timestamp;
    /// used as the initial resume position when no checkpoint and no
    /// configured `initial_timestamp` exist.
    pub const MIN: OplogTimestamp = OplogTimestamp {
        seconds: 0,
        ordinal: 0,
    };

    /// Construct a timestamp directly from its components.
    pub fn new(seconds: u32, ordinal: u32) -> Self {
        OplogTimestamp { seconds, ordinal }
    }

    /// Convert from a raw BSON timestamp as found in an oplog entry's `ts` field.
    pub fn from_bson(ts: bson::Timestamp) -> Self {
        OplogTimestamp {
            seconds: ts.time,
            ordinal: ts.increment,
        }
    }

    /// Convert back into a BSON timestamp suitable for a query filter or a
    /// checkpoint document.
    pub fn to_bson(self) -> bson::Timestamp {
        bson::Timestamp {
            time: self.seconds,
            increment: self.ordinal,
        }
    }

    /// Convert into the `Bson` value stored in checkpoint/filter documents.
    pub fn into_bson_value(self) -> Bson {
        Bson::Timestamp(self.to_bson())
    }
}

impl PartialOrd for OplogTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OplogTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.seconds, self.ordinal).cmp(&(other.seconds, other.ordinal))
    }
}

impl fmt::Display for OplogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.ordinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_seconds_then_ordinal() {
        let a = OplogTimestamp::new(100, 5);
        let b = OplogTimestamp::new(100, 6);
        let c = OplogTimestamp::new(101, 0);

        assert!(a < b);
        assert!(b < c);
        assert!(OplogTimestamp::MIN < a);
    }

    #[test]
    fn round_trips_through_bson() {
        let ts = OplogTimestamp::new(42, 3);
        let bson = ts.to_bson();

        assert_eq!(OplogTimestamp::from_bson(bson), ts);
    }
}
