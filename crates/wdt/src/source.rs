/// Source tree enumeration and block partitioning for the sender.
///
/// Every regular file under the root becomes one or more blocks of at most
/// `block_size` bytes. Blocks are the unit of work handed to connection
/// workers, so a single large file is spread across all connections.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::error::{Result, WdtError};

/// One regular file found under the source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the root, `/`-separated.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
}

/// A contiguous byte range of one file.
#[derive(Debug, Clone)]
pub struct Block {
    pub file: Arc<FileEntry>,
    pub offset: u64,
    pub len: u64,
}

impl Block {
    /// Open the file and position it at the block start.
    pub fn open(&self) -> Result<File> {
        let mut file = File::open(&self.file.absolute_path).map_err(|e| self.read_error(e))?;
        if self.offset > 0 {
            file.seek(SeekFrom::Start(self.offset))
                .map_err(|e| self.read_error(e))?;
        }
        Ok(file)
    }

    pub fn read_error(&self, source: std::io::Error) -> WdtError {
        WdtError::SourceRead {
            path: self.file.absolute_path.display().to_string(),
            source,
        }
    }
}

/// Result of walking a source tree.
#[derive(Debug, Default)]
pub struct SourceListing {
    pub files: Vec<Arc<FileEntry>>,
    pub blocks: Vec<Block>,
}

impl SourceListing {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Walk `root` and split its files into blocks. `block_size` of `None`
/// sends every file as a single block.
pub fn enumerate(root: &Path, block_size: Option<u64>) -> Result<SourceListing> {
    let meta = std::fs::metadata(root).map_err(|e| WdtError::SourceRead {
        path: root.display().to_string(),
        source: e,
    })?;
    if !meta.is_dir() {
        return Err(WdtError::SourceRead {
            path: root.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
        });
    }

    let mut listing = SourceListing::default();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| root.display().to_string());
            WdtError::SourceRead {
                path,
                source: e.into(),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|e| WdtError::SourceRead {
                path: entry.path().display().to_string(),
                source: e.into(),
            })?
            .len();
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| WdtError::InvalidPath(entry.path().display().to_string()))?;

        let file = Arc::new(FileEntry {
            relative_path: to_wire_path(relative)?,
            absolute_path: entry.path().to_path_buf(),
            size,
        });
        split_into_blocks(&file, block_size, &mut listing.blocks);
        listing.files.push(file);
    }

    Ok(listing)
}

fn split_into_blocks(file: &Arc<FileEntry>, block_size: Option<u64>, out: &mut Vec<Block>) {
    let step = block_size.unwrap_or(u64::MAX).max(1);
    if file.size == 0 {
        out.push(Block {
            file: file.clone(),
            offset: 0,
            len: 0,
        });
        return;
    }
    let mut offset = 0;
    while offset < file.size {
        let len = step.min(file.size - offset);
        out.push(Block {
            file: file.clone(),
            offset,
            len,
        });
        offset += len;
    }
}

/// Convert a relative filesystem path to the `/`-separated form sent on the
/// wire.
pub fn to_wire_path(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s),
                None => return Err(WdtError::InvalidPath(relative.display().to_string())),
            },
            _ => return Err(WdtError::InvalidPath(relative.display().to_string())),
        }
    }
    if parts.is_empty() {
        return Err(WdtError::InvalidPath(relative.display().to_string()));
    }
    Ok(parts.join("/"))
}

/// Resolve a wire path under `root`, refusing anything that would escape it.
pub fn resolve_wire_path(root: &Path, wire: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    let mut any = false;
    for part in wire.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return Err(WdtError::InvalidPath(wire.to_string()));
        }
        let p = Path::new(part);
        if !matches!(p.components().next(), Some(Component::Normal(_))) || p.components().count() != 1
        {
            return Err(WdtError::InvalidPath(wire.to_string()));
        }
        out.push(part);
        any = true;
    }
    if !any {
        return Err(WdtError::InvalidPath(wire.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;

    #[test]
    fn splits_files_into_blocks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.bin"), vec![1u8; 25]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/empty"), b"").unwrap();
        fs::write(dir.path().join("sub/small"), b"abc").unwrap();

        let listing = enumerate(dir.path(), Some(10)).unwrap();
        let names: Vec<_> = listing.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["big.bin", "sub/empty", "sub/small"]);
        assert_eq!(listing.total_bytes(), 28);

        let ranges: Vec<_> = listing
            .blocks
            .iter()
            .map(|b| (b.file.relative_path.as_str(), b.offset, b.len))
            .collect();
        assert_eq!(
            ranges,
            vec![
                ("big.bin", 0, 10),
                ("big.bin", 10, 10),
                ("big.bin", 20, 5),
                ("sub/empty", 0, 0),
                ("sub/small", 0, 3),
            ]
        );
        let mut tail = Vec::new();
        listing.blocks[2].open().unwrap().read_to_end(&mut tail).unwrap();
        assert_eq!(tail, vec![1u8; 5]);
    }

    #[test]
    fn whole_file_blocks_without_block_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), vec![0u8; 1000]).unwrap();
        let listing = enumerate(dir.path(), None).unwrap();
        assert_eq!(listing.blocks.len(), 1);
        assert_eq!(listing.blocks[0].len, 1000);
    }

    #[test]
    fn missing_root_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = enumerate(&dir.path().join("nope"), None).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::ByteSourceReadError);
    }

    #[test]
    fn wire_paths_stay_under_root() {
        let root = Path::new("/dst");
        assert_eq!(
            resolve_wire_path(root, "a/b.txt").unwrap(),
            PathBuf::from("/dst/a/b.txt")
        );
        for bad in ["", "/etc/passwd", "../x", "a/../../x", "a//b", "./a", "a\\b"] {
            assert!(resolve_wire_path(root, bad).is_err(), "{bad:?} accepted");
        }
    }
}
