//! Layer archives.
//!
//! Overlayfs records deletions as 0/0 character devices and opaque directories
//! with the `trusted.overlay.opaque` xattr. Layer tarballs use the AUFS
//! convention instead (`.wh.<name>` and `.wh..wh..opq`), so export and apply
//! translate between the two.

use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thinimage_core::error::{Result, ThinError};
use thinimage_core::{ThinImage, THIN_MARKER};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";
const OPAQUE_XATTR: &str = "trusted.overlay.opaque";

/// Kind of a filesystem change, numbered like the engine's change types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(into = "u8")]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
}

impl From<ChangeKind> for u8 {
    fn from(kind: ChangeKind) -> u8 {
        match kind {
            ChangeKind::Modify => 0,
            ChangeKind::Add => 1,
            ChangeKind::Delete => 2,
        }
    }
}

/// One changed path, absolute inside the container filesystem.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Change {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Kind")]
    pub kind: ChangeKind,
}

fn is_whiteout(meta: &std::fs::Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

fn is_opaque(path: &Path) -> bool {
    matches!(xattr::get(path, OPAQUE_XATTR), Ok(Some(v)) if v == b"y")
}

/// Every entry under `root` as (relative path, metadata), parents first.
fn walk(root: &Path) -> Result<Vec<(PathBuf, std::fs::Metadata)>> {
    let mut out = Vec::new();
    walk_into(root, root, &mut out)?;
    Ok(out)
}

fn walk_into(root: &Path, current: &Path, out: &mut Vec<(PathBuf, std::fs::Metadata)>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(current)
        .map_err(|e| ThinError::Driver(format!("failed to read {}: {}", current.display(), e)))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        let relative = path
            .strip_prefix(root)
            .map_err(|e| ThinError::Driver(format!("bad path {}: {}", path.display(), e)))?
            .to_path_buf();
        let is_dir = meta.is_dir();
        out.push((relative, meta));
        if is_dir {
            walk_into(root, &path, out)?;
        }
    }
    Ok(())
}

fn empty_file_header(mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(0);
    header.set_mode(mode);
    header.set_mtime(0);
    header
}

fn whiteout_name(relative: &Path) -> PathBuf {
    let name = relative
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let whiteout = format!("{}{}", WHITEOUT_PREFIX, name);
    match relative.parent() {
        Some(parent) => parent.join(whiteout),
        None => PathBuf::from(whiteout),
    }
}

/// Write the content of a diff directory as a layer tarball.
pub fn export_diff<W: Write>(diff_dir: &Path, writer: W) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for (relative, meta) in walk(diff_dir)? {
        let full = diff_dir.join(&relative);
        if is_whiteout(&meta) {
            let mut header = empty_file_header(0o644);
            builder.append_data(&mut header, whiteout_name(&relative), std::io::empty())?;
            continue;
        }
        if meta.is_dir() {
            builder.append_dir(&relative, &full)?;
            if is_opaque(&full) {
                let mut header = empty_file_header(0o644);
                builder.append_data(&mut header, relative.join(OPAQUE_MARKER), std::io::empty())?;
            }
            continue;
        }
        builder.append_path_with_name(&full, &relative)?;
    }

    builder.finish()?;
    Ok(())
}

/// Write a descriptor as a single-file layer tarball carrying the thin marker.
pub fn export_thin<W: Write>(thin: &ThinImage, writer: W) -> Result<()> {
    let json = thin.to_json()?;
    let mut builder = tar::Builder::new(writer);
    let mut header = empty_file_header(0o644);
    header.set_size(json.len() as u64);
    builder.append_data(&mut header, THIN_MARKER, json.as_slice())?;
    builder.finish()?;
    Ok(())
}

/// Tar `diff_dir` into `out` and return the sha256 of the tarball (hex).
pub fn export_diff_to_file(diff_dir: &Path, out: &Path) -> Result<String> {
    let file = std::fs::File::create(out)?;
    let mut hashing = HashingWriter::new(file);
    export_diff(diff_dir, &mut hashing)?;
    let (mut file, digest) = hashing.finish();
    file.flush()?;
    Ok(digest)
}

/// Writer computing a sha256 of everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(target_os = "linux")]
fn make_whiteout(path: &Path) -> Result<()> {
    use nix::sys::stat::{mknod, Mode, SFlag};

    if let Ok(meta) = std::fs::symlink_metadata(path) {
        if meta.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
    }
    mknod(path, SFlag::S_IFCHR, Mode::empty(), 0)
        .map_err(|e| ThinError::Driver(format!("failed to create whiteout {}: {}", path.display(), e)))
}

#[cfg(not(target_os = "linux"))]
fn make_whiteout(path: &Path) -> Result<()> {
    Err(ThinError::Driver(format!(
        "whiteouts are only supported on Linux: {}",
        path.display()
    )))
}

fn make_opaque(dir: &Path) -> Result<()> {
    xattr::set(dir, OPAQUE_XATTR, b"y")
        .map_err(|e| ThinError::Driver(format!("failed to mark {} opaque: {}", dir.display(), e)))
}

fn outside_layer(path: &Path) -> ThinError {
    ThinError::Driver(format!("layer entry escapes the layer directory: {}", path.display()))
}

/// Path of a tar entry made of normal components only.
fn entry_relative(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(outside_layer(path)),
        }
    }
    Ok(out)
}

/// Create `root/relative` one component at a time, refusing to pass through symlinks.
fn layer_dir(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut dir = root.to_path_buf();
    for part in relative.iter() {
        dir.push(part);
        match std::fs::symlink_metadata(&dir) {
            Ok(meta) if meta.file_type().is_symlink() || !meta.is_dir() => {
                return Err(outside_layer(relative));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => std::fs::create_dir(&dir)?,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(dir)
}

/// Unpack a layer tarball into `diff_dir`, returning the bytes of content applied.
///
/// Entries with `..`, absolute paths, or whiteouts reached through a symlink
/// fail the whole apply.
pub fn apply_diff<R: Read>(reader: R, diff_dir: &Path) -> Result<u64> {
    std::fs::create_dir_all(diff_dir)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut size = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry_relative(&entry.path()?)?;
        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let parent = relative.parent().map(Path::to_path_buf).unwrap_or_default();

        if name == OPAQUE_MARKER {
            make_opaque(&layer_dir(diff_dir, &parent)?)?;
            continue;
        }
        if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            if target.is_empty() || target == "." || target == ".." {
                return Err(outside_layer(&relative));
            }
            let dir = layer_dir(diff_dir, &parent)?;
            make_whiteout(&dir.join(target))?;
            continue;
        }

        size += entry.header().size()?;
        entry.unpack_in(diff_dir)?;
    }
    Ok(size)
}

/// Changes of `upper` relative to the lower directories (newest first).
pub fn changes(lower: &[PathBuf], upper: &Path) -> Result<Vec<Change>> {
    let in_lower = |relative: &Path| {
        lower
            .iter()
            .any(|l| std::fs::symlink_metadata(l.join(relative)).is_ok())
    };

    let mut out = Vec::new();
    for (relative, meta) in walk(upper)? {
        let path = format!("/{}", relative.display());
        let kind = if is_whiteout(&meta) {
            ChangeKind::Delete
        } else if in_lower(&relative) {
            // Directories that only exist because a child changed are not changes.
            if meta.is_dir() && !is_opaque(&upper.join(&relative)) {
                continue;
            }
            ChangeKind::Modify
        } else {
            ChangeKind::Add
        };
        out.push(Change { path, kind });
    }
    Ok(out)
}

/// Bytes used by regular files under `dir`.
pub fn dir_size(dir: &Path) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    Ok(walk(dir)?
        .iter()
        .filter(|(_, meta)| meta.is_file())
        .map(|(_, meta)| meta.len())
        .sum())
}
