//! Segment-scoped trash locations.
//!
//! An object at `p` is trashed to `trash/seg{N}/p`. The mapping keeps the
//! full relative path so it can always be reversed.

pub const TRASH_ROOT: &str = "trash";

/// Prefix under which segment `segnum` keeps trashed objects.
pub fn trash_prefix(segnum: u64) -> String {
    format!("{TRASH_ROOT}/seg{segnum}/")
}

pub fn trash_path(path: &str, segnum: u64) -> String {
    format!("{}{}", trash_prefix(segnum), path)
}

/// Regular location of a trashed object, or `None` when `trashed` is not in
/// this segment's trash.
pub fn untrash_path(trashed: &str, segnum: u64) -> Option<String> {
    trashed
        .strip_prefix(trash_prefix(segnum).as_str())
        .map(str::to_string)
}
