//! One file's worth of work: location, object, entry range, attachments.

use std::cmp::Ordering;

use pfw_common::{PfwError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::entry_list::EntryList;

/// Locality key for elements whose URL does not name a remote file host.
pub const NO_HOST: &str = "no-host";

/// URL schemes whose host component names the node serving the file.
///
/// Everything else (plain paths, `file:`, unknown schemes) is treated as
/// having no usable locality information.
pub const REMOTE_FILE_SCHEMES: &[&str] = &["nfs", "data"];

/// A companion element processed in lockstep with its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendElement {
    /// The companion element.
    pub element: DatasetElement,
    /// Alias under which the companion is addressed.
    pub alias: String,
}

/// Descriptor of one file's work unit.
///
/// Built by the dataset builder, completed by startup validation (entry
/// total, clamped range, cumulative offset), then treated as immutable by
/// the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetElement {
    /// File URL.
    pub file_url: String,
    /// Object to process inside the file.
    pub object_name: String,
    /// Directory inside the file holding the object.
    pub directory: String,
    /// First entry of the range.
    pub first: i64,
    /// Number of entries in the range; `-1` means all remaining.
    pub num: i64,
    /// Absolute position of this element within the flattened stream.
    ///
    /// Holds the per-file entry count transiently during validation; the
    /// final validation pass rewrites it to the cumulative offset.
    pub dataset_offset: i64,
    /// Optional pre-filtered entry subset.
    pub entry_list: Option<EntryList>,
    /// Whether the element passed validation.
    pub valid: bool,
    /// Authoritative entry total of the file; `-1` until validated.
    pub entries: i64,
    /// Companion elements processed in lockstep.
    #[serde(default)]
    pub friends: Vec<FriendElement>,
}

impl DatasetElement {
    /// Create an element, clamping out-of-contract range attributes.
    pub fn new(file_url: &str, object_name: &str, directory: &str, first: i64, num: i64) -> Self {
        let first = if first < 0 {
            warn!(
                file_url,
                first, "first must be >= 0, setting to 0"
            );
            0
        } else {
            first
        };
        let num = if num < -1 {
            warn!(file_url, num, "num must be >= -1, setting to -1");
            -1
        } else {
            num
        };
        Self {
            file_url: file_url.to_string(),
            object_name: object_name.to_string(),
            directory: directory.to_string(),
            first,
            num,
            dataset_offset: 0,
            entry_list: None,
            valid: false,
            entries: -1,
            friends: Vec::new(),
        }
    }

    /// Resolve the locality key for this element.
    ///
    /// Remote file schemes keep their URL host; anything else maps to the
    /// [`NO_HOST`] sentinel.
    pub fn host(&self) -> String {
        match Url::parse(&self.file_url) {
            Ok(url) if REMOTE_FILE_SCHEMES.contains(&url.scheme()) => url
                .host_str()
                .map(str::to_string)
                .unwrap_or_else(|| NO_HOST.to_string()),
            _ => NO_HOST.to_string(),
        }
    }

    /// Clamp the range against an authoritative entry total and mark the
    /// element valid.
    ///
    /// Mirrors the reply handling of the startup validator for callers that
    /// already know the total.
    pub fn validate_entries(&mut self, entries: i64) -> Result<()> {
        if self.first >= entries {
            return Err(PfwError::ValidationFailed(format!(
                "{}: only {} entries with first entry requested as {}",
                self.file_url, entries, self.first
            )));
        }
        if self.num == -1 {
            self.num = entries - self.first;
        } else if self.num > entries - self.first {
            return Err(PfwError::ValidationFailed(format!(
                "{}: only {} entries starting at {}, {} requested",
                self.file_url,
                entries - self.first,
                self.first,
                self.num
            )));
        }
        self.entries = entries;
        self.valid = true;
        Ok(())
    }

    /// Validate against an already-validated element for the same object.
    ///
    /// A validated element re-validated against itself is a no-op.
    pub fn validate_against(&mut self, other: &DatasetElement) -> Result<()> {
        if !other.valid {
            return Err(PfwError::InvalidInput(
                "element to validate against is not valid".to_string(),
            ));
        }
        if self.file_url != other.file_url
            || self.directory != other.directory
            || self.object_name != other.object_name
        {
            return Err(PfwError::InvalidInput(format!(
                "elements do not refer to the same object: {} vs {}",
                self.file_url, other.file_url
            )));
        }
        self.validate_entries(other.first + other.num)
    }

    /// Order by file URL, then by first entry.
    pub fn compare(&self, other: &DatasetElement) -> Ordering {
        self.file_url
            .cmp(&other.file_url)
            .then(self.first.cmp(&other.first))
    }

    /// Attach a companion element under `alias`.
    pub fn add_friend(&mut self, element: DatasetElement, alias: &str) {
        self.friends.push(FriendElement {
            element,
            alias: alias.to_string(),
        });
    }

    /// Entries contributed by this element to the flattened stream.
    ///
    /// An attached entry list overrides the raw range.
    pub fn effective_entries(&self) -> i64 {
        match &self.entry_list {
            Some(list) => list.count(),
            None => self.num.max(0),
        }
    }
}
