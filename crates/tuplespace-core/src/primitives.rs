//! # Engine Primitives
//!
//! Fixed constants compiled into the engine: on-disk format marker, shard
//! placement policy and file names.

/// On-disk namespace format, major component.
///
/// A different major version is rejected at startup.
pub const FORMAT_MAJOR: u64 = 2;

/// On-disk namespace format, minor component written by this engine.
pub const FORMAT_MINOR: u64 = 1;

/// Oldest minor version still readable.
///
/// Minor 0 rows carry no protection domain; they are reported as
/// `ProtectionId::UNKNOWN`.
pub const LEGACY_FORMAT_MINOR: u64 = 0;

/// Hex segment widths used to split an environment id into shard directories.
///
/// `ab/cde/f012/3456/<full id>` keeps per-directory fan-out bounded.
pub const SHARD_WIDTHS: [usize; 4] = [2, 3, 4, 4];

/// Directory under the data root holding every environment's tuple table.
pub const ENVIRONMENTS_DIR: &str = "envs";

/// File name of the namespace index database.
pub const NAMESPACE_FILE: &str = "namespace.redb";

/// File name of an environment's tuple table inside its shard directory.
pub const TUPLE_TABLE_FILE: &str = "tuples.redb";

/// Marker file guarding a shard directory while the environment is created.
///
/// Startup recovery treats any directory still holding this marker as an
/// interrupted create.
pub const LOCK_MARKER_FILE: &str = "CREATING.lock";

/// Resource kind accepted by `Engine::bind`.
pub const STORAGE_RESOURCE_KIND: &str = "storage";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_widths_cover_less_than_an_id() {
        // 32 hex digits in a 128-bit id
        assert!(SHARD_WIDTHS.iter().sum::<usize>() < 32);
    }

    #[test]
    fn format_marker_is_two_one() {
        assert_eq!((FORMAT_MAJOR, FORMAT_MINOR), (2, 1));
    }
}
