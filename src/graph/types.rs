//! Core type definitions for stored records

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical identity of a stored record: `#cluster:position`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct RecordId {
    cluster: i32,
    position: i64,
}

impl RecordId {
    pub fn new(cluster: i32, position: i64) -> Self {
        RecordId { cluster, position }
    }

    pub fn cluster(&self) -> i32 {
        self.cluster
    }

    pub fn position(&self) -> i64 {
        self.position
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

impl From<(i32, i64)> for RecordId {
    fn from((cluster, position): (i32, i64)) -> Self {
        RecordId::new(cluster, position)
    }
}

/// Direction of a relation hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Out,
    In,
    Both,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Out => Direction::In,
            Direction::In => Direction::Out,
            Direction::Both => Direction::Both,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "out"),
            Direction::In => write!(f, "in"),
            Direction::Both => write!(f, "both"),
        }
    }
}
