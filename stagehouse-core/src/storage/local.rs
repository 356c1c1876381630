//! Filesystem-backed operator.

use opendal::Operator;
use std::path::Path;

/// Directory under the root that holds in-flight writes. Bucket names may
/// not start with a dot, so it never shows up in a listing.
const ATOMIC_WRITE_DIR: &str = ".tmp";

/// Operator rooted at `root`. Each write lands in [`ATOMIC_WRITE_DIR`] and is
/// renamed into place.
pub fn build_fs_operator(root: &Path) -> opendal::Result<Operator> {
    let staging = root.join(ATOMIC_WRITE_DIR);
    let builder = opendal::services::Fs::default()
        .root(&root.to_string_lossy())
        .atomic_write_dir(&staging.to_string_lossy());
    Ok(Operator::new(builder)?.finish())
}
