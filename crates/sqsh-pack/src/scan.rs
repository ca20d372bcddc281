//! Host directory scanning.
//!
//! Walks a directory tree with `lstat` semantics and materializes it as
//! image nodes. Timestamps and extended attributes are only carried over
//! when the corresponding flag asks for them; `one_file_system` prunes
//! entries on other devices instead of descending.

use sqsh_error::{Result, SqshError};
use sqsh_tree::{Defaults, FileData, NodeData, NodeSpec, Tree};
use sqsh_types::{pack_devno, unpack_rdev};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use tracing::warn;
use walkdir::WalkDir;

/// Scanner behavior toggles, defaulting to all off.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanFlags {
    /// Carry source mtimes instead of the default timestamp.
    pub keep_time: bool,
    /// Read and pack extended attributes.
    pub keep_xattr: bool,
    /// Do not cross device boundaries.
    pub one_file_system: bool,
}

/// Read a path's xattrs, skipping namespaces SquashFS cannot encode.
fn node_xattrs(path: &Path) -> std::io::Result<Vec<(String, Vec<u8>)>> {
    let mut pairs = Vec::new();
    for name in xattr::list(path)? {
        let Some(key) = name.to_str().map(str::to_owned) else {
            warn!(
                target: "sqsh::scan",
                event = "xattr_skipped",
                path = %path.display(),
                reason = "non-UTF-8 key"
            );
            continue;
        };
        if !sqsh_xattr::prefix_is_supported(&key) {
            warn!(
                target: "sqsh::scan",
                event = "xattr_skipped",
                path = %path.display(),
                key = %key,
                reason = "unsupported namespace"
            );
            continue;
        }
        if let Some(value) = xattr::get(path, &name)? {
            pairs.push((key, value));
        }
    }
    Ok(pairs)
}

/// Scan `root` into the tree. The scanned directory becomes the image root.
pub fn scan_directory(
    root: &Path,
    tree: &mut Tree,
    defaults: &Defaults,
    flags: ScanFlags,
) -> Result<()> {
    let root_dev = std::fs::symlink_metadata(root)?.dev();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |entry| {
            if !flags.one_file_system {
                return true;
            }
            entry
                .metadata()
                .map(|meta| meta.dev() == root_dev)
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry.map_err(|err| SqshError::format(format!("scanning source: {err}")))?;
        let metadata = entry
            .metadata()
            .map_err(|err| SqshError::format(format!("stat {}: {err}", entry.path().display())))?;

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| SqshError::tree("scanned entry escapes the source root"))?;
        let image_path = format!("/{}", relative.to_string_lossy());

        let file_type = metadata.file_type();
        let data = if file_type.is_dir() {
            NodeData::empty_dir()
        } else if file_type.is_file() {
            NodeData::File(FileData {
                size: metadata.len(),
                source: Some(entry.path().to_path_buf()),
                ..FileData::default()
            })
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            NodeData::Symlink {
                target: target.to_string_lossy().into_owned(),
            }
        } else if file_type.is_block_device() || file_type.is_char_device() {
            let (major, minor) = unpack_rdev(metadata.rdev());
            let devno = pack_devno(major, minor);
            if file_type.is_block_device() {
                NodeData::BlockDev { devno }
            } else {
                NodeData::CharDev { devno }
            }
        } else if file_type.is_fifo() {
            NodeData::Fifo
        } else if file_type.is_socket() {
            NodeData::Socket
        } else {
            warn!(
                target: "sqsh::scan",
                event = "entry_skipped",
                path = %entry.path().display()
            );
            continue;
        };

        let mtime = if flags.keep_time {
            u32::try_from(metadata.mtime().max(0)).unwrap_or(u32::MAX)
        } else {
            defaults.mtime
        };
        let xattrs = if flags.keep_xattr && !file_type.is_symlink() {
            node_xattrs(entry.path())?
        } else {
            Vec::new()
        };

        tree.insert(
            &image_path,
            NodeSpec {
                permissions: (metadata.mode() & 0o7777) as u16,
                uid: metadata.uid(),
                gid: metadata.gid(),
                mtime,
                xattrs,
                data,
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn scan(root: &Path, flags: ScanFlags) -> Tree {
        let mut tree = Tree::new(Defaults::default());
        scan_directory(root, &mut tree, &Defaults::default(), flags).unwrap();
        tree
    }

    #[test]
    fn scans_files_dirs_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/data.txt"), b"payload").unwrap();
        symlink("sub/data.txt", dir.path().join("link")).unwrap();

        let tree = scan(dir.path(), ScanFlags::default());
        let file = tree.lookup("/sub/data.txt").expect("file scanned");
        let NodeData::File(data) = &tree.node(file).data else {
            panic!("expected a file");
        };
        assert_eq!(data.size, 7);
        assert!(data.source.is_some());

        let link = tree.lookup("/link").expect("symlink scanned");
        let NodeData::Symlink { target } = &tree.node(link).data else {
            panic!("expected a symlink");
        };
        assert_eq!(target, "sub/data.txt");
    }

    #[test]
    fn root_attributes_come_from_the_source_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tree = scan(dir.path(), ScanFlags::default());
        let root = tree.node(tree.root());
        // The scan visits the root itself (depth 0) and applies its
        // uid/gid; on any host that is the current user.
        let meta = std::fs::metadata(dir.path()).unwrap();
        assert_eq!(root.uid, meta.uid());
        assert_eq!(root.gid, meta.gid());
    }

    #[test]
    fn default_mtime_applies_without_keep_time() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();

        let tree = scan(dir.path(), ScanFlags::default());
        let f = tree.lookup("/f").unwrap();
        assert_eq!(tree.node(f).mtime, 0);

        let kept = scan(
            dir.path(),
            ScanFlags {
                keep_time: true,
                ..ScanFlags::default()
            },
        );
        let f = kept.lookup("/f").unwrap();
        assert_ne!(kept.node(f).mtime, 0);
    }
}
