use std::ops::Bound;

use chrono::{DateTime, Utc};

use crate::{DomainEventStream, Version};

/// Which slice of one aggregate's log a load covers.
///
/// Both variants are read in ascending version order; the event-time variant
/// only filters, it never reorders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRange {
    /// Streams with `head <= version <= tail`.
    Versions { head: Version, tail: Version },

    /// Streams whose event time lies within `(head, tail]` or `[head, tail]`.
    EventTimes {
        head: Bound<DateTime<Utc>>,
        tail: DateTime<Utc>,
    },
}

impl LoadRange {
    /// Creates a version range; `Version::MAX` as tail means unbounded.
    pub fn versions(head: Version, tail: Version) -> Self {
        LoadRange::Versions { head, tail }
    }

    /// Creates an event-time range with an inclusive tail.
    pub fn event_times(head: Bound<DateTime<Utc>>, tail: DateTime<Utc>) -> Self {
        LoadRange::EventTimes { head, tail }
    }

    /// Returns true if no stream can ever match.
    pub fn is_empty(&self) -> bool {
        match self {
            LoadRange::Versions { head, tail } => head > tail,
            LoadRange::EventTimes { head, tail } => match head {
                Bound::Included(head) => head > tail,
                Bound::Excluded(head) => head >= tail,
                Bound::Unbounded => false,
            },
        }
    }

    /// Returns true if the stream falls inside this range.
    pub fn contains(&self, stream: &DomainEventStream) -> bool {
        match self {
            LoadRange::Versions { head, tail } => {
                stream.version >= *head && stream.version <= *tail
            }
            LoadRange::EventTimes { head, tail } => {
                let after_head = match head {
                    Bound::Included(head) => stream.event_time >= *head,
                    Bound::Excluded(head) => stream.event_time > *head,
                    Bound::Unbounded => true,
                };
                after_head && stream.event_time <= *tail
            }
        }
    }

    /// Lower version bound, used to seed paging cursors.
    pub fn min_version(&self) -> Version {
        match self {
            LoadRange::Versions { head, .. } => *head,
            LoadRange::EventTimes { .. } => Version::first(),
        }
    }
}

impl std::fmt::Display for LoadRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadRange::Versions { head, tail } if *tail == Version::MAX => {
                write!(f, "versions[{head}..]")
            }
            LoadRange::Versions { head, tail } => write!(f, "versions[{head}..={tail}]"),
            LoadRange::EventTimes { head, tail } => match head {
                Bound::Included(head) => write!(f, "event_times[{head}..={tail}]"),
                Bound::Excluded(head) => write!(f, "event_times({head}..={tail}]"),
                Bound::Unbounded => write!(f, "event_times[..={tail}]"),
            },
        }
    }
}
