//! A minimal filesystem-backed share indexer.
//!
//! The core never walks the filesystem itself (see
//! [`tigerhub_common::share::ShareIndex`]); this is the one concrete indexer
//! the client crate ships, building an [`InMemoryShareIndex`] by recursively
//! hashing every regular file under a directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::warn;

use tigerhub_common::share::{InMemoryShareIndex, ShareEntry};
use tigerhub_common::tth::Tth;

/// Flatten every indexed alias into the single [`InMemoryShareIndex`] the
/// engine serves uploads from. Aliases are indexed independently (so
/// re-indexing one doesn't require re-reading every other alias's files)
/// and merged here each time one of them changes.
pub fn merge(aliases: &HashMap<String, InMemoryShareIndex>) -> InMemoryShareIndex {
    let mut merged = InMemoryShareIndex::new();
    for index in aliases.values() {
        for path in index.paths() {
            if let Some(entry) = index.by_path(path) {
                merged.insert(path, entry.clone());
            }
        }
    }
    merged
}

/// Recursively index `root`, mapping every regular file to a virtual path
/// rooted at `/alias/...`.
///
/// Unreadable entries (permission errors, broken symlinks) are skipped with
/// a warning rather than failing the whole index.
pub fn index_directory(alias: &str, root: &Path) -> InMemoryShareIndex {
    let mut index = InMemoryShareIndex::new();
    let base = format!("/{alias}");
    walk(root, &base, &mut index);
    index
}

fn walk(dir: &Path, virtual_prefix: &str, index: &mut InMemoryShareIndex) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("skipping unreadable directory {dir:?}: {err}");
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skipping unreadable directory entry in {dir:?}: {err}");
                continue;
            }
        };
        let path: PathBuf = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let virtual_path = format!("{virtual_prefix}/{name}");
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(err) => {
                warn!("skipping {path:?}: {err}");
                continue;
            }
        };
        if file_type.is_dir() {
            walk(&path, &virtual_path, index);
        } else if file_type.is_file() {
            match std::fs::read(&path) {
                Ok(data) => {
                    index.insert(virtual_path, ShareEntry { size: data.len() as u64, tth: Tth::of(&data), local_path: path });
                }
                Err(err) => warn!("skipping unreadable file {path:?}: {err}"),
            }
        }
    }
}
