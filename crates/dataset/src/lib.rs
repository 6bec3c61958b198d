//! Dataset model and wire codecs for packflow.
//!
//! Architecture role:
//! - element descriptors consumed by the scheduler (file URL, object,
//!   entry range, optional entry list, friend elements);
//! - host resolution mapping element URLs to locality keys;
//! - the dual on-wire dataset form (legacy v3 binary and the modern
//!   versioned JSON body).
//!
//! Key modules:
//! - [`element`]
//! - [`entry_list`]
//! - [`dataset`]
//! - [`codec`]

pub mod codec;
pub mod dataset;
pub mod element;
pub mod entry_list;

pub use codec::{decode_dataset, encode_dataset, LEGACY_VERSION, WIRE_VERSION};
pub use dataset::{Dataset, IdentityResolver, UrlResolver};
pub use element::{DatasetElement, FriendElement, NO_HOST, REMOTE_FILE_SCHEMES};
pub use entry_list::EntryList;
