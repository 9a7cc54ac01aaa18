//! Core type definitions for the segment engine.

use std::fmt;

/// The type of a record within a segment.
///
/// Record types determine decoding only; every record is byte-addressable
/// in the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// A map leaf record.
    Leaf = 0,
    /// A map branch record.
    Branch = 1,
    /// A list bucket record.
    Bucket = 2,
    /// A list record.
    List = 3,
    /// A node record.
    Node = 4,
    /// A template record.
    Template = 5,
    /// A string or binary value record.
    Value = 6,
    /// A raw block of bytes.
    Block = 7,
}

impl RecordType {
    /// Returns the wire byte of this record type.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a record type from its wire byte.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Leaf),
            1 => Some(Self::Branch),
            2 => Some(Self::Bucket),
            3 => Some(Self::List),
            4 => Some(Self::Node),
            5 => Some(Self::Template),
            6 => Some(Self::Value),
            7 => Some(Self::Block),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Leaf => "leaf",
            Self::Branch => "branch",
            Self::Bucket => "bucket",
            Self::List => "list",
            Self::Node => "node",
            Self::Template => "template",
            Self::Value => "value",
            Self::Block => "block",
        };
        f.write_str(name)
    }
}

/// The garbage-collection generation a segment was written in.
///
/// Generations increase monotonically with each compaction cycle; the
/// writer pool retires buffered writers whose generation has gone stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u32);

impl Generation {
    /// Creates a new generation tag.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw generation number.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next generation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_roundtrip() {
        for byte in 0u8..8 {
            let ty = RecordType::from_u8(byte).unwrap();
            assert_eq!(ty.as_u8(), byte);
        }
        assert_eq!(RecordType::from_u8(8), None);
    }

    #[test]
    fn generation_ordering() {
        let g = Generation::new(3);
        assert!(g < g.next());
        assert_eq!(g.next().as_u32(), 4);
    }
}
