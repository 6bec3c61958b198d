//! Pre-filtered entry subsets attached to dataset elements.

use serde::{Deserialize, Serialize};

/// A pre-filtered subset of entries attached to one element.
///
/// Two shapes exist: a sparse entry list addressed by ordinal, and a dense
/// event list mapping ordinal to entry number. Both are carved the same way
/// when packets are built: an element's `(first, num)` range indexes into
/// the list by ordinal, not into the raw file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryList {
    /// Sparse entry list, random access by ordinal.
    Entries {
        /// Entry numbers in ascending order.
        entries: Vec<i64>,
    },
    /// Dense event list, ordinal to entry number.
    Events {
        /// Entry numbers in event order.
        events: Vec<i64>,
    },
}

impl EntryList {
    /// Number of entries in this list.
    pub fn count(&self) -> i64 {
        match self {
            EntryList::Entries { entries } => entries.len() as i64,
            EntryList::Events { events } => events.len() as i64,
        }
    }

    /// Entry number at `ordinal`, if in range.
    pub fn get(&self, ordinal: i64) -> Option<i64> {
        if ordinal < 0 {
            return None;
        }
        match self {
            EntryList::Entries { entries } => entries.get(ordinal as usize).copied(),
            EntryList::Events { events } => events.get(ordinal as usize).copied(),
        }
    }

    /// Carve the `[first, first + num)` ordinal range into a new list of the
    /// same shape.
    ///
    /// Out-of-range bounds are clamped to the list; an empty carve yields an
    /// empty list.
    pub fn slice(&self, first: i64, num: i64) -> EntryList {
        let lo = first.max(0) as usize;
        let take = |v: &Vec<i64>| -> Vec<i64> {
            let hi = lo.saturating_add(num.max(0) as usize).min(v.len());
            if lo >= v.len() {
                Vec::new()
            } else {
                v[lo..hi].to_vec()
            }
        };
        match self {
            EntryList::Entries { entries } => EntryList::Entries {
                entries: take(entries),
            },
            EntryList::Events { events } => EntryList::Events {
                events: take(events),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_clamps_to_list_bounds() {
        let list = EntryList::Entries {
            entries: vec![2, 5, 9, 11, 30],
        };
        assert_eq!(list.count(), 5);
        assert_eq!(
            list.slice(1, 3),
            EntryList::Entries {
                entries: vec![5, 9, 11]
            }
        );
        assert_eq!(list.slice(4, 10).count(), 1);
        assert_eq!(list.slice(7, 2).count(), 0);
    }

    #[test]
    fn event_list_keeps_shape_through_slice() {
        let list = EntryList::Events {
            events: vec![40, 10, 20],
        };
        match list.slice(0, 2) {
            EntryList::Events { events } => assert_eq!(events, vec![40, 10]),
            other => panic!("unexpected shape: {other:?}"),
        }
    }
}
