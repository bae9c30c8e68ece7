use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use applier_base::{err, Error};

// Ticks are the master's monotonic log ordinal. Zero means "none": a
// just-initialized state store has never seen a tick and every comparison
// against it should fall out the way "nothing happened yet" would suggest.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Tick(pub u64);

impl Tick {
    pub const NONE: Tick = Tick(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Tick {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        s.parse::<u64>()
            .map(Tick)
            .map_err(|_| err("tick overflow or malformed decimal"))
    }
}

// The master's identity. Captured on first handshake; a mismatch on any
// later handshake is fatal (`MasterChanged`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServerId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        s.parse::<u64>()
            .map(ServerId)
            .map_err(|_| err("server id overflow or malformed decimal"))
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CollectionId(pub u64);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct IndexId(pub u64);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        s.parse::<u64>()
            .map(TransactionId)
            .map_err(|_| err("transaction id overflow or malformed decimal"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn tick_parses_strict_decimal() {
        assert_eq!("1000".parse::<Tick>().unwrap(), Tick(1000));
        assert!("not-a-tick".parse::<Tick>().is_err());
        assert!("-1".parse::<Tick>().is_err());
    }

    #[test]
    fn tick_overflow_is_rejected() {
        // u64::MAX + 1
        assert!("18446744073709551616".parse::<Tick>().is_err());
    }

    #[test]
    fn tick_none_is_zero() {
        assert!(Tick::NONE.is_none());
        assert!(!Tick(1).is_none());
    }
}
