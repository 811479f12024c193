//! Fragment record produced by readout sources.
//!
//! A [`Fragment`] is immutable once produced. It carries the logical event number
//! (`sequence_id`), the physical stream it came from (`fragment_id`), the producer
//! clock `timestamp`, a [`FragmentKind`], and a payload.
//!
//! Container fragments wrap zero or more fragments plus a `missing_data` flag and are
//! how the Buffer and Window delivery modes hand a request's data downstream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical event number; the unit of monotonic delivery ordering.
pub type SequenceId = u64;
/// Physical readout stream within one sequence id.
pub type FragmentId = u16;
/// Producer clock value, monotonic but not necessarily gap-free.
pub type Timestamp = u64;

/// Bytes accounted for every fragment header, in addition to its payload.
pub const FRAGMENT_HEADER_BYTES: usize = 32;

/// Type tag of a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    /// Producer data
    Data,
    /// Placeholder for a sequence id with no data
    Empty,
    /// Wrapper around other fragments
    Container,
    /// Sentinel marking the end of a data stream
    EndOfData,
}

impl std::fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FragmentKind::Data => "data",
            FragmentKind::Empty => "empty",
            FragmentKind::Container => "container",
            FragmentKind::EndOfData => "end_of_data",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Bytes(Bytes),
    Container {
        fragments: Vec<Fragment>,
        missing_data: bool,
    },
}

/// One binary record with sequence id, fragment id, timestamp, kind and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    sequence_id: SequenceId,
    fragment_id: FragmentId,
    timestamp: Timestamp,
    kind: FragmentKind,
    payload: Payload,
}

impl Fragment {
    /// Create a data fragment.
    pub fn data(
        sequence_id: SequenceId,
        fragment_id: FragmentId,
        timestamp: Timestamp,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            sequence_id,
            fragment_id,
            timestamp,
            kind: FragmentKind::Data,
            payload: Payload::Bytes(payload.into()),
        }
    }

    /// Create an empty placeholder fragment.
    pub fn empty(sequence_id: SequenceId, fragment_id: FragmentId, timestamp: Timestamp) -> Self {
        Self {
            sequence_id,
            fragment_id,
            timestamp,
            kind: FragmentKind::Empty,
            payload: Payload::Bytes(Bytes::new()),
        }
    }

    /// Create an end-of-data sentinel.
    pub fn end_of_data(
        sequence_id: SequenceId,
        fragment_id: FragmentId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            sequence_id,
            fragment_id,
            timestamp,
            kind: FragmentKind::EndOfData,
            payload: Payload::Bytes(Bytes::new()),
        }
    }

    /// Create a container wrapping `fragments`.
    pub fn container(
        sequence_id: SequenceId,
        fragment_id: FragmentId,
        timestamp: Timestamp,
        fragments: Vec<Fragment>,
        missing_data: bool,
    ) -> Self {
        Self {
            sequence_id,
            fragment_id,
            timestamp,
            kind: FragmentKind::Container,
            payload: Payload::Container {
                fragments,
                missing_data,
            },
        }
    }

    /// Logical event number.
    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    /// Readout stream identifier.
    pub fn fragment_id(&self) -> FragmentId {
        self.fragment_id
    }

    /// Producer clock value.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Type tag.
    pub fn kind(&self) -> FragmentKind {
        self.kind
    }

    /// Raw payload, `None` for containers.
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Container { .. } => None,
        }
    }

    /// Fragments held by a container; empty for every other kind.
    pub fn contained(&self) -> &[Fragment] {
        match &self.payload {
            Payload::Container { fragments, .. } => fragments,
            Payload::Bytes(_) => &[],
        }
    }

    /// Whether a container was assembled from an incomplete window.
    pub fn missing_data(&self) -> bool {
        matches!(
            self.payload,
            Payload::Container {
                missing_data: true,
                ..
            }
        )
    }

    /// Consume a container and return its fragments.
    pub fn into_contained(self) -> Vec<Fragment> {
        match self.payload {
            Payload::Container { fragments, .. } => fragments,
            Payload::Bytes(_) => Vec::new(),
        }
    }

    /// Copy of this fragment stamped with a different sequence id and timestamp.
    ///
    /// The payload is reference counted, so the copy does not duplicate the bytes.
    pub fn restamped(&self, sequence_id: SequenceId, timestamp: Timestamp) -> Self {
        Self {
            sequence_id,
            timestamp,
            ..self.clone()
        }
    }

    /// Accounted size: header plus payload, recursively for containers.
    pub fn size_bytes(&self) -> usize {
        FRAGMENT_HEADER_BYTES
            + match &self.payload {
                Payload::Bytes(bytes) => bytes.len(),
                Payload::Container { fragments, .. } => {
                    fragments.iter().map(Fragment::size_bytes).sum()
                }
            }
    }
}
