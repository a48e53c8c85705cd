//! Parsing and serializing the bz2-compressed XML file-list a peer's share
//! is advertised as (`files.xml.bz2`). Compression/decompression lives in the
//! transfer engine; this module only deals with the XML tree itself.

use serde::{Deserialize, Serialize};

use crate::share::ShareIndex;
use crate::tth::Tth;

/// One child of a `<Directory>` or the document root: either a nested
/// directory or a leaf file. Tagged by element name via quick-xml's `$value`
/// convention, mirroring how `<FileListing>` mixes the two freely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    /// A `<Directory Name="...">...</Directory>` element.
    Directory(DirectoryNode),
    /// A `<File Name="..." Size="..." TTH="..."/>` element.
    File(FileNode),
}

/// A directory, possibly containing further directories and files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryNode {
    /// Directory name, as the last path component.
    #[serde(rename = "@Name")]
    pub name: String,
    /// Children, in document order.
    #[serde(rename = "$value", default)]
    pub children: Vec<Node>,
}

/// A file leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    /// File name, as the last path component.
    #[serde(rename = "@Name")]
    pub name: String,
    /// Size in bytes.
    #[serde(rename = "@Size")]
    pub size: u64,
    /// Base32-encoded Tiger-Tree-Hash root.
    #[serde(rename = "@TTH")]
    pub tth: String,
}

/// The `<FileListing>` document root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "FileListing")]
pub struct FileListDocument {
    /// File-list format version; always `1` for the documents this crate writes.
    #[serde(rename = "@Version", default = "default_version")]
    pub version: u32,
    /// The virtual path this listing is rooted at.
    #[serde(rename = "@Base", default = "default_base")]
    pub base: String,
    /// Top-level directories and files.
    #[serde(rename = "$value", default)]
    pub children: Vec<Node>,
}

fn default_version() -> u32 {
    1
}

fn default_base() -> String {
    "/".to_string()
}

/// A parsed file-list, exposing path-based lookup.
#[derive(Debug, Clone)]
pub struct FileList {
    document: FileListDocument,
}

/// One match returned by [`FileList::get_file`]/[`FileList::get_directory`].
#[derive(Debug, Clone)]
pub struct FileListEntry {
    /// Full virtual path, e.g. `/alias/inner folder/test file.txt`.
    pub path: String,
    /// Size in bytes. `0` for directories (NMDC doesn't transport directory sizes).
    pub size: u64,
    /// Tiger-Tree-Hash, for files.
    pub tth: Option<Tth>,
    /// Whether this entry is a directory.
    pub is_dir: bool,
}

/// A malformed file-list document.
#[derive(Debug, thiserror::Error)]
pub enum FileListError {
    /// The XML failed to parse.
    #[error("malformed file list xml: {0}")]
    Xml(#[from] quick_xml::DeError),
    /// A `File` element carried a TTH that isn't valid base32.
    #[error("invalid TTH in file list: {0}")]
    InvalidTth(String),
}

impl FileList {
    /// Parse a file-list document from its decompressed XML bytes.
    pub fn parse(xml: &str) -> Result<Self, FileListError> {
        let document: FileListDocument = quick_xml::de::from_str(xml)?;
        Ok(Self { document })
    }

    /// Serialize back to XML, e.g. to answer an `ADCGET file files.xml.bz2`.
    pub fn to_xml(&self) -> Result<String, FileListError> {
        Ok(quick_xml::se::to_string(&self.document)?)
    }

    /// Build a file list from a live share index, rooted at `base`.
    pub fn from_share(share: &dyn ShareIndex, base: &str) -> Self {
        let mut root: Vec<Node> = Vec::new();
        for path in share.paths() {
            let entry = share.by_path(path).expect("path came from share.paths()");
            insert_path(&mut root, path, entry.size, &entry.tth.to_base32());
        }
        FileList {
            document: FileListDocument {
                version: 1,
                base: base.to_string(),
                children: root,
            },
        }
    }

    /// Look up a file by its full virtual path.
    pub fn get_file(&self, path: &str) -> Option<FileListEntry> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        find(&self.document.children, &components, String::new())
            .filter(|e| !e.is_dir)
    }

    /// Look up a directory by its full virtual path.
    pub fn get_directory(&self, path: &str) -> Option<FileListEntry> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        find(&self.document.children, &components, String::new())
            .filter(|e| e.is_dir)
    }
}

fn insert_path(root: &mut Vec<Node>, path: &str, size: u64, tth_b32: &str) {
    let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        return;
    }
    let file_name = components.pop().unwrap();
    let mut children = root;
    for dir_name in components {
        let idx = children.iter().position(|n| matches!(n, Node::Directory(d) if d.name == dir_name));
        let idx = match idx {
            Some(idx) => idx,
            None => {
                children.push(Node::Directory(DirectoryNode {
                    name: dir_name.to_string(),
                    children: Vec::new(),
                }));
                children.len() - 1
            }
        };
        children = match &mut children[idx] {
            Node::Directory(d) => &mut d.children,
            Node::File(_) => unreachable!("index came from a Directory match"),
        };
    }
    children.push(Node::File(FileNode {
        name: file_name.to_string(),
        size,
        tth: tth_b32.to_string(),
    }));
}

fn find(children: &[Node], components: &[&str], path_so_far: String) -> Option<FileListEntry> {
    let (head, tail) = components.split_first()?;
    for node in children {
        match node {
            Node::Directory(d) if d.name == *head => {
                let path = format!("{path_so_far}/{}", d.name);
                if tail.is_empty() {
                    return Some(FileListEntry {
                        path,
                        size: 0,
                        tth: None,
                        is_dir: true,
                    });
                }
                return find(&d.children, tail, path);
            }
            Node::File(f) if f.name == *head && tail.is_empty() => {
                let path = format!("{path_so_far}/{}", f.name);
                return Some(FileListEntry {
                    path,
                    size: f.size,
                    tth: Tth::parse(&f.tth),
                    is_dir: false,
                });
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::{InMemoryShareIndex, ShareEntry};
    use std::path::PathBuf;

    #[test]
    fn round_trips_a_nested_tree() {
        let mut share = InMemoryShareIndex::new();
        let data = vec![b'A'; 10_000];
        share.insert(
            "/inner folder/test file.txt",
            ShareEntry {
                size: 10_000,
                tth: Tth::of(&data),
                local_path: PathBuf::from("/tmp/test file.txt"),
            },
        );

        let list = FileList::from_share(&share, "/aliasname");
        let xml = list.to_xml().unwrap();
        let parsed = FileList::parse(&xml).unwrap();

        let file = parsed.get_file("/inner folder/test file.txt").unwrap();
        assert_eq!(file.size, 10_000);
        assert_eq!(file.tth.unwrap().to_base32(), Tth::of(&data).to_base32());
        assert!(!file.is_dir);

        let dir = parsed.get_directory("/inner folder").unwrap();
        assert!(dir.is_dir);
    }

    #[test]
    fn missing_path_is_none() {
        let list = FileList {
            document: FileListDocument {
                version: 1,
                base: "/".into(),
                children: Vec::new(),
            },
        };
        assert!(list.get_file("/nope").is_none());
    }
}
