//! Dispatch table: API key and version range to command factory.
//!
//! The table is built once at startup and shared read-only between all
//! connections as `Arc<DispatchTable>`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kafka_protocol::messages::ApiKey;

use crate::handlers::api_versions::{ApiVersionsCommand, API_VERSIONS_VERSIONS};
use crate::handlers::metadata::{MetadataCommand, METADATA_VERSIONS};
use crate::upstream::UpstreamConfiguration;

use super::command::Command;
use super::envelope::RequestEnvelope;

/// Inclusive range of protocol versions a handler supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedVersions {
    /// Lowest supported version.
    pub min: i16,
    /// Highest supported version.
    pub max: i16,
}

impl SupportedVersions {
    /// Create a version range.
    #[must_use]
    pub const fn new(min: i16, max: i16) -> Self {
        Self { min, max }
    }

    /// Whether `version` falls inside the range.
    #[must_use]
    pub fn contains(&self, version: i16) -> bool {
        (self.min..=self.max).contains(&version)
    }
}

/// What a factory may consult while building a command.
pub struct DispatchContext<'a> {
    /// The table the command was dispatched from.
    pub table: &'a DispatchTable,
    /// Upstream topology.
    pub configuration: &'a Arc<dyn UpstreamConfiguration>,
}

/// Builds a command from an envelope.
///
/// Returns `None` if the envelope body is not the one the factory handles.
/// Factories must not block.
pub type CommandFactory = fn(&RequestEnvelope, &DispatchContext<'_>) -> Option<Command>;

/// A single table entry.
#[derive(Clone, Copy)]
pub struct DispatchEntry {
    /// The API key served.
    pub api_key: ApiKey,
    /// Versions served.
    pub versions: SupportedVersions,
    factory: CommandFactory,
}

impl DispatchEntry {
    /// Build a command for `envelope`.
    #[must_use]
    pub fn create(
        &self,
        envelope: &RequestEnvelope,
        context: &DispatchContext<'_>,
    ) -> Option<Command> {
        (self.factory)(envelope, context)
    }
}

impl fmt::Debug for DispatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEntry")
            .field("api_key", &self.api_key)
            .field("versions", &self.versions)
            .finish_non_exhaustive()
    }
}

/// Immutable mapping from API key to handler.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    entries: BTreeMap<i16, DispatchEntry>,
}

impl DispatchTable {
    /// Start building a table.
    #[must_use]
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    /// The handlers this proxy ships with.
    #[must_use]
    pub fn standard() -> Self {
        Self::builder()
            .register(ApiKey::Metadata, METADATA_VERSIONS, MetadataCommand::create)
            .register(
                ApiKey::ApiVersions,
                API_VERSIONS_VERSIONS,
                ApiVersionsCommand::create,
            )
            .build()
    }

    /// Find the entry serving `api_key` at `api_version`.
    #[must_use]
    pub fn lookup(&self, api_key: i16, api_version: i16) -> Option<&DispatchEntry> {
        self.entries
            .get(&api_key)
            .filter(|entry| entry.versions.contains(api_version))
    }

    /// Find the entry for `api_key` regardless of version.
    #[must_use]
    pub fn entry(&self, api_key: i16) -> Option<&DispatchEntry> {
        self.entries.get(&api_key)
    }

    /// Supported API keys and their versions, ordered by API key.
    pub fn supported_apis(&self) -> impl Iterator<Item = (i16, SupportedVersions)> + '_ {
        self.entries.iter().map(|(key, entry)| (*key, entry.versions))
    }

    /// Number of registered API keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no API key is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder for [`DispatchTable`]. Registration only happens here, before the
/// table is shared.
#[derive(Debug, Default)]
pub struct DispatchTableBuilder {
    entries: BTreeMap<i16, DispatchEntry>,
}

impl DispatchTableBuilder {
    /// Register `factory` for `api_key`. A later registration for the same
    /// key replaces the earlier one.
    #[must_use]
    pub fn register(
        mut self,
        api_key: ApiKey,
        versions: SupportedVersions,
        factory: CommandFactory,
    ) -> Self {
        self.entries.insert(
            api_key as i16,
            DispatchEntry {
                api_key,
                versions,
                factory,
            },
        );
        self
    }

    /// Freeze the table.
    #[must_use]
    pub fn build(self) -> DispatchTable {
        DispatchTable {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_versions_contains() {
        let versions = SupportedVersions::new(1, 4);

        assert!(!versions.contains(0));
        assert!(versions.contains(1));
        assert!(versions.contains(4));
        assert!(!versions.contains(5));
    }

    #[test]
    fn test_standard_table() {
        let table = DispatchTable::standard();

        assert_eq!(table.len(), 2);
        assert!(table.lookup(ApiKey::Metadata as i16, 0).is_some());
        assert!(table.lookup(ApiKey::Metadata as i16, 12).is_some());
        assert!(table.lookup(ApiKey::ApiVersions as i16, 3).is_some());
    }

    #[test]
    fn test_lookup_rejects_out_of_range_version() {
        let table = DispatchTable::standard();

        assert!(table.lookup(ApiKey::Metadata as i16, 13).is_none());
        assert!(table.lookup(ApiKey::ApiVersions as i16, -1).is_none());
        // The entry itself still exists
        assert!(table.entry(ApiKey::Metadata as i16).is_some());
    }

    #[test]
    fn test_lookup_unregistered_key() {
        let table = DispatchTable::standard();

        assert!(table.lookup(ApiKey::ListOffsets as i16, 0).is_none());
        assert!(table.lookup(ApiKey::Produce as i16, 3).is_none());
        assert!(table.lookup(9999, 0).is_none());
    }

    #[test]
    fn test_supported_apis_ordered_by_key() {
        let table = DispatchTable::standard();
        let apis: Vec<_> = table.supported_apis().collect();

        assert_eq!(
            apis,
            vec![
                (ApiKey::Metadata as i16, METADATA_VERSIONS),
                (ApiKey::ApiVersions as i16, API_VERSIONS_VERSIONS),
            ]
        );
    }

    #[test]
    fn test_later_registration_replaces_earlier() {
        let table = DispatchTable::builder()
            .register(
                ApiKey::Metadata,
                SupportedVersions::new(0, 1),
                MetadataCommand::create,
            )
            .register(
                ApiKey::Metadata,
                SupportedVersions::new(4, 9),
                MetadataCommand::create,
            )
            .build();

        assert_eq!(table.len(), 1);
        assert!(table.lookup(ApiKey::Metadata as i16, 0).is_none());
        assert!(table.lookup(ApiKey::Metadata as i16, 4).is_some());
    }

    #[test]
    fn test_empty_table() {
        let table = DispatchTable::builder().build();
        assert!(table.is_empty());
        assert_eq!(table.supported_apis().count(), 0);
    }
}
