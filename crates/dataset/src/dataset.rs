//! Ordered element collections and the end-point lookup seam.

use pfw_common::{PfwError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::element::DatasetElement;
use crate::entry_list::EntryList;

/// Resolves element URLs to end-point URLs before scheduling.
///
/// Lookup is delegated so deployments can plug redirectors or catalog
/// services in front of the scheduler.
pub trait UrlResolver {
    /// Resolve one file URL to its end-point form.
    fn resolve(&self, file_url: &str) -> Result<String>;
}

/// Pass-through resolver for datasets that already carry end-point URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

impl UrlResolver for IdentityResolver {
    fn resolve(&self, file_url: &str) -> Result<String> {
        Ok(file_url.to_string())
    }
}

/// An immutable input sequence of elements plus dataset-wide attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Dataset name.
    pub name: String,
    /// Default object name for elements that do not override it.
    pub object_name: String,
    /// Default directory for elements that do not override it.
    pub directory: String,
    /// Whether the named objects are entry trees (as opposed to key counts).
    pub is_tree: bool,
    /// Optional dataset-level entry list overriding the element totals.
    pub entry_list: Option<EntryList>,
    /// Encode in the legacy v3 wire form when set.
    ///
    /// Set automatically when a dataset was decoded from a v3 payload so
    /// replies stay readable by the old peer.
    #[serde(default)]
    pub write_v3: bool,
    pub(crate) elements: Vec<DatasetElement>,
}

impl Dataset {
    /// Create an empty dataset.
    pub fn new(name: &str, object_name: &str, directory: &str, is_tree: bool) -> Self {
        Self {
            name: name.to_string(),
            object_name: object_name.to_string(),
            directory: directory.to_string(),
            is_tree,
            entry_list: None,
            write_v3: false,
            elements: Vec::new(),
        }
    }

    /// Append one element.
    pub fn add(&mut self, element: DatasetElement) {
        self.elements.push(element);
    }

    /// Elements in insertion order.
    pub fn elements(&self) -> &[DatasetElement] {
        &self.elements
    }

    /// Mutable elements in insertion order.
    pub fn elements_mut(&mut self) -> &mut [DatasetElement] {
        &mut self.elements
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the dataset has no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Remove the element at `index`, returning it.
    pub fn remove(&mut self, index: usize) -> DatasetElement {
        self.elements.remove(index)
    }

    /// Resolve every element URL through `resolver`.
    ///
    /// Failures surface as [`PfwError::LookupFailed`] naming the first URL
    /// that could not be resolved.
    pub fn lookup(&mut self, resolver: &dyn UrlResolver) -> Result<()> {
        for e in &mut self.elements {
            match resolver.resolve(&e.file_url) {
                Ok(resolved) => {
                    if resolved != e.file_url {
                        debug!(from = %e.file_url, to = %resolved, "resolved end-point url");
                        e.file_url = resolved;
                    }
                }
                Err(err) => {
                    return Err(PfwError::LookupFailed(format!(
                        "{}: {err}",
                        e.file_url
                    )));
                }
            }
        }
        Ok(())
    }

    /// Attach `friends` to this dataset under `alias`.
    ///
    /// The friend set must either match this dataset element-for-element or
    /// contain a single element shared by all.
    pub fn add_friend(&mut self, friends: &Dataset, alias: &str) -> Result<()> {
        if friends.is_empty() {
            return Err(PfwError::InvalidInput(
                "friend dataset has no elements".to_string(),
            ));
        }
        if friends.len() != self.len() && friends.len() != 1 {
            return Err(PfwError::InvalidInput(format!(
                "friend dataset has {} elements while this one has {}",
                friends.len(),
                self.len()
            )));
        }
        if friends.len() == 1 {
            let shared = &friends.elements[0];
            for e in &mut self.elements {
                e.add_friend(shared.clone(), alias);
            }
        } else {
            for (e, f) in self.elements.iter_mut().zip(friends.elements.iter()) {
                e.add_friend(f.clone(), alias);
            }
        }
        Ok(())
    }

    /// Sum of entries the elements contribute to the flattened stream.
    ///
    /// A dataset-level entry list overrides the element totals.
    pub fn total_entries(&self) -> i64 {
        if let Some(list) = &self.entry_list {
            return list.count();
        }
        let total: i64 = self.elements.iter().map(|e| e.effective_entries()).sum();
        if self.elements.iter().any(|e| e.num == -1 && e.entry_list.is_none()) {
            warn!("total requested over unvalidated open-range elements");
        }
        total
    }
}
