//! Migration file registry
//!
//! Migration files are named `<version>.<description>.json`. The version is
//! the leading digit run and must be unique within a directory.

use crate::error::{MigrateError, MigrateResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Leading version prefix of any migration filename
static VERSION_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\.").unwrap());

/// Allowed description of a new migration
static DESCRIPTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z-]+$").unwrap());

/// Shape of a generated migration filename, also enforced on tracking records
pub const CANONICAL_FILENAME_PATTERN: &str = r"^\d+\.[a-z-]+\.json$";

static CANONICAL_FILENAME: Lazy<Regex> = Lazy::new(|| Regex::new(CANONICAL_FILENAME_PATTERN).unwrap());

/// Extension of migration files
pub const MIGRATION_EXTENSION: &str = "json";

/// A migration file with its parsed version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationFile {
    pub version: u64,
    pub filename: String,
}

impl MigrationFile {
    pub fn parse(filename: &str) -> MigrateResult<Self> {
        Ok(Self {
            version: parse_version(filename)?,
            filename: filename.to_string(),
        })
    }

    /// `<version>.<description>.json`
    pub fn file_name_for(version: u64, description: &str) -> String {
        format!("{}.{}.{}", version, description, MIGRATION_EXTENSION)
    }
}

/// Version encoded in the filename's leading digits
pub fn parse_version(filename: &str) -> MigrateResult<u64> {
    VERSION_PREFIX
        .captures(filename)
        .and_then(|caps| caps.get(1))
        .and_then(|digits| digits.as_str().parse::<u64>().ok())
        .ok_or_else(|| MigrateError::InvalidFilename(filename.to_string()))
}

/// Parse every filename and sort ascending by version.
///
/// Fails on the first invalid name or repeated version, before anything is
/// returned.
pub fn order_by_version<I, S>(filenames: I) -> MigrateResult<Vec<MigrationFile>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let files = filenames
        .into_iter()
        .map(|name| MigrationFile::parse(name.as_ref()))
        .collect::<MigrateResult<Vec<_>>>()?;

    let mut seen = HashSet::new();
    for file in &files {
        if !seen.insert(file.version) {
            return Err(MigrateError::DuplicateVersion(file.version));
        }
    }

    let mut files = files;
    files.sort_by_key(|f| f.version);
    Ok(files)
}

/// Every entry of `directory`, validated and ordered by version
pub async fn load_ordered(directory: &Path) -> MigrateResult<Vec<MigrationFile>> {
    let mut entries = tokio::fs::read_dir(directory).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    order_by_version(names)
}

/// One past the highest version in `directory` (1 for an empty directory)
pub async fn next_version(directory: &Path) -> MigrateResult<u64> {
    let files = load_ordered(directory).await?;
    let latest = files.last().map(|f| f.version).unwrap_or(0);
    latest
        .checked_add(1)
        .ok_or(MigrateError::VersionOverflow(latest))
}

pub fn is_valid_description(description: &str) -> bool {
    DESCRIPTION.is_match(description)
}

pub fn is_canonical_filename(filename: &str) -> bool {
    CANONICAL_FILENAME.is_match(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn versions(files: &[MigrationFile]) -> Vec<u64> {
        files.iter().map(|f| f.version).collect()
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.create-db.json").unwrap(), 1);
        assert_eq!(parse_version("015.mix-db.json").unwrap(), 15);
        // Only the prefix matters here; shape is checked elsewhere
        assert_eq!(parse_version("7.Whatever_Name.txt").unwrap(), 7);
    }

    #[test]
    fn test_parse_version_rejects_bad_prefix() {
        let err = parse_version("normal-file.json").unwrap_err();
        assert_eq!(err.to_string(), "Invalid migration filename normal-file.json");
        assert!(parse_version("1-create-db.json").is_err());
        assert!(parse_version(".1.json").is_err());
        assert!(parse_version("99999999999999999999999.too-big.json").is_err());
    }

    #[test]
    fn test_order_by_version_is_numeric() {
        let files = order_by_version(["15.mix-db.json", "2.update-something-in-db.json", "1.create-db.json"]).unwrap();
        assert_eq!(versions(&files), vec![1, 2, 15]);
        assert_eq!(files[2].filename, "15.mix-db.json");
    }

    #[test]
    fn test_order_by_version_rejects_duplicates() {
        let err = order_by_version(["1.create-db.json", "1.other.json"]).unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateVersion(1)));
        assert_eq!(err.to_string(), "Duplicated migration version 1");
    }

    #[test]
    fn test_invalid_name_wins_over_later_entries() {
        let err = order_by_version(["normal-file.json", "1.a.json", "1.b.json"]).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidFilename(_)));
    }

    #[test]
    fn test_description_and_canonical_shape() {
        assert!(is_valid_description("any-name"));
        assert!(!is_valid_description("Any_Name"));
        assert!(!is_valid_description(""));
        assert!(!is_valid_description("name2"));

        assert!(is_canonical_filename("16.any-name.json"));
        assert!(!is_canonical_filename("16.any-name.js"));
        assert!(!is_canonical_filename("any-name.json"));
        assert_eq!(MigrationFile::file_name_for(16, "any-name"), "16.any-name.json");
    }

    #[tokio::test]
    async fn test_load_and_next_version() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_version(dir.path()).await.unwrap(), 1);

        for name in ["2.b.json", "10.c.json", "1.a.json"] {
            std::fs::write(dir.path().join(name), "[]\n").unwrap();
        }
        let files = load_ordered(dir.path()).await.unwrap();
        assert_eq!(versions(&files), vec![1, 2, 10]);
        assert_eq!(next_version(dir.path()).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_next_version_overflow() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{}.last.json", u64::MAX)), "[]\n").unwrap();

        let err = next_version(dir.path()).await.unwrap_err();
        assert!(matches!(err, MigrateError::VersionOverflow(v) if v == u64::MAX));
        assert_eq!(err.code(), "VERSION_OVERFLOW");
        assert!(!err.to_string().contains(".json"));
    }

    #[tokio::test]
    async fn test_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_ordered(&dir.path().join("missing")).await;
        assert!(matches!(result, Err(MigrateError::Io(_))));
    }
}
