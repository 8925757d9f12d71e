//! Tar extraction into a capability-scoped directory.
//!
//! Supports plain and gzip-compressed archives (detected by magic bytes),
//! directory, regular file, symlink and hard-link entries, and
//! `strip_components`. Entries that would escape the destination are skipped.

use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::PermissionsExt;
use cap_std::fs_utf8::Dir;
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const DIRECTORY_MODE: u32 = 0o755;
const EXECUTABLE_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// Counts reported after an extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Entries written to the destination.
    pub extracted: usize,
    /// Entries skipped: unsafe paths, paths emptied by stripping, or
    /// unsupported entry types.
    pub skipped: usize,
}

/// Extract `reader` into `dest`, removing `strip_components` leading path
/// segments from every entry.
///
/// # Errors
///
/// Returns the first I/O error raised while reading the archive or writing
/// an entry.
pub fn extract_archive<R: Read>(
    reader: R,
    dest: &Dir,
    strip_components: u32,
) -> io::Result<ExtractSummary> {
    let mut buffered = BufReader::new(reader);
    let is_gzip = buffered.fill_buf()?.starts_with(&GZIP_MAGIC);
    let stream: Box<dyn Read + '_> = if is_gzip {
        Box::new(GzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };

    let mut archive = Archive::new(stream);
    let mut summary = ExtractSummary::default();

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let Some(relative) = stripped_path(&entry.path()?, strip_components) else {
            summary.skipped += 1;
            continue;
        };

        let entry_type = entry.header().entry_type();
        let written = match entry_type {
            EntryType::Directory => {
                unpack_directory(dest, &relative)?;
                true
            }
            EntryType::Regular | EntryType::Continuous => {
                let mode = entry.header().mode()?;
                unpack_file(dest, &relative, &mut entry, mode)?;
                true
            }
            EntryType::Symlink => match entry.link_name()? {
                Some(target) => {
                    unpack_symlink(dest, &relative, &target)?;
                    true
                }
                None => false,
            },
            EntryType::Link => {
                let target = entry
                    .link_name()?
                    .and_then(|link| stripped_path(&link, strip_components));
                match target {
                    Some(source) => {
                        unpack_hard_link(dest, &relative, &source)?;
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        };

        if written {
            summary.extracted += 1;
        } else {
            tracing::debug!(path = %relative, ?entry_type, "skipping archive entry");
            summary.skipped += 1;
        }
    }

    Ok(summary)
}

/// Normalise an archive path and drop `strip` leading segments.
///
/// Returns `None` for paths containing `..`, absolute roots, non-UTF-8
/// segments, or nothing left after stripping.
fn stripped_path(path: &Path, strip: u32) -> Option<Utf8PathBuf> {
    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    let skip = usize::try_from(strip).ok()?;
    let kept: Utf8PathBuf = segments.into_iter().skip(skip).collect();
    if kept.as_str().is_empty() {
        None
    } else {
        Some(kept)
    }
}

fn ensure_parent(dest: &Dir, relative: &Utf8Path) -> io::Result<()> {
    match relative.parent() {
        Some(parent) if !parent.as_str().is_empty() => dest.create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Remove whatever currently occupies `relative`, including broken symlinks.
fn clear_destination(dest: &Dir, relative: &Utf8Path) -> io::Result<()> {
    match dest.symlink_metadata(relative) {
        Ok(metadata) if metadata.is_dir() => dest.remove_dir_all(relative),
        Ok(_) => dest.remove_file(relative),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

fn set_mode(dest: &Dir, relative: &Utf8Path, mode: u32) -> io::Result<()> {
    dest.set_permissions(relative, cap_std::fs::Permissions::from_mode(mode))
}

fn unpack_directory(dest: &Dir, relative: &Utf8Path) -> io::Result<()> {
    if let Ok(metadata) = dest.symlink_metadata(relative) {
        if !metadata.is_dir() {
            dest.remove_file(relative)?;
        }
    }
    dest.create_dir_all(relative)?;
    set_mode(dest, relative, DIRECTORY_MODE)
}

fn unpack_file(
    dest: &Dir,
    relative: &Utf8Path,
    contents: &mut impl Read,
    header_mode: u32,
) -> io::Result<()> {
    ensure_parent(dest, relative)?;
    clear_destination(dest, relative)?;

    let mut file = dest.create(relative)?;
    io::copy(contents, &mut file)?;
    drop(file);

    let mode = if header_mode & 0o111 == 0 {
        FILE_MODE
    } else {
        EXECUTABLE_MODE
    };
    set_mode(dest, relative, mode)
}

fn unpack_symlink(dest: &Dir, relative: &Utf8Path, target: &Path) -> io::Result<()> {
    let target_str = target.to_str().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("symlink target for '{relative}' is not UTF-8"),
        )
    })?;
    ensure_parent(dest, relative)?;
    clear_destination(dest, relative)?;
    dest.symlink(target_str, relative)
}

fn unpack_hard_link(dest: &Dir, relative: &Utf8Path, source: &Utf8Path) -> io::Result<()> {
    ensure_parent(dest, relative)?;
    clear_destination(dest, relative)?;
    dest.hard_link(source, dest, relative)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use camino::Utf8PathBuf;
    use cap_std::ambient_authority;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use rstest::{fixture, rstest};
    use tar::{Builder, Header};
    use tempfile::TempDir;

    use super::*;

    fn io_error(message: impl Into<String>) -> io::Error {
        io::Error::other(message.into())
    }

    fn temp_destination() -> io::Result<(TempDir, Dir)> {
        let temp_dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf())
            .map_err(|_| io_error("tempdir path should be UTF-8"))?;
        let dir = Dir::open_ambient_dir(&path, ambient_authority())?;
        Ok((temp_dir, dir))
    }

    #[fixture]
    fn destination() -> io::Result<(TempDir, Dir)> {
        temp_destination()
    }

    fn append_dir(builder: &mut Builder<Vec<u8>>, path: &str) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, io::empty())
    }

    fn append_file(
        builder: &mut Builder<Vec<u8>>,
        path: &str,
        contents: &[u8],
        mode: u32,
    ) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(u64::try_from(contents.len()).map_err(io::Error::other)?);
        header.set_mode(mode);
        header.set_cksum();
        builder.append_data(&mut header, path, contents)
    }

    fn append_symlink(builder: &mut Builder<Vec<u8>>, path: &str, target: &str) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, path, target)
    }

    /// Nested directories, a plain file, an executable and a symlink, all
    /// under `prefix`.
    fn sample_archive(prefix: &str) -> io::Result<Vec<u8>> {
        let mut builder = Builder::new(Vec::new());
        if !prefix.is_empty() {
            append_dir(&mut builder, prefix)?;
        }
        append_dir(&mut builder, &format!("{prefix}etc/"))?;
        append_dir(&mut builder, &format!("{prefix}usr/bin/"))?;
        append_file(&mut builder, &format!("{prefix}etc/motd"), b"welcome\n", 0o644)?;
        append_file(&mut builder, &format!("{prefix}usr/bin/busybox"), b"#!/bin/sh\n", 0o755)?;
        append_symlink(&mut builder, &format!("{prefix}usr/bin/sh"), "busybox")?;
        builder.into_inner()
    }

    fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes)?;
        encoder.finish()
    }

    fn mode_of(dir: &Dir, path: &str) -> io::Result<u32> {
        Ok(dir.metadata(path)?.permissions().mode() & 0o777)
    }

    /// Sorted listing of every path below `dir` with a kind marker.
    fn snapshot(dir: &Dir, prefix: &Utf8Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in dir.entries()? {
            let entry = entry?;
            let name = entry.file_name()?;
            let path = prefix.join(&name);
            let kind = entry.file_type()?;
            if kind.is_symlink() {
                out.push(format!("L {path} -> {}", dir.read_link(&name)?));
            } else if kind.is_dir() {
                out.push(format!("D {path}"));
                snapshot(&dir.open_dir(&name)?, &path, out)?;
            } else {
                out.push(format!("F {path} {}", dir.read_to_string(&name)?));
            }
        }
        out.sort();
        Ok(())
    }

    #[rstest]
    fn extracts_tree_preserving_exec_bit(
        destination: io::Result<(TempDir, Dir)>,
    ) -> io::Result<()> {
        let (_guard, dest) = destination?;
        let archive = sample_archive("")?;

        let summary = extract_archive(archive.as_slice(), &dest, 0)?;

        assert_eq!(summary.extracted, 5);
        assert_eq!(dest.read_to_string("etc/motd")?, "welcome\n");
        assert_eq!(mode_of(&dest, "etc/motd")?, 0o644);
        assert_eq!(mode_of(&dest, "usr/bin/busybox")?, 0o755);
        assert_eq!(dest.read_link("usr/bin/sh")?.as_str(), "busybox");
        Ok(())
    }

    #[rstest]
    fn replaces_pre_existing_broken_symlink(
        destination: io::Result<(TempDir, Dir)>,
    ) -> io::Result<()> {
        let (_guard, dest) = destination?;
        dest.create_dir_all("usr/bin")?;
        dest.symlink("missing-target", "usr/bin/sh")?;

        extract_archive(sample_archive("")?.as_slice(), &dest, 0)?;

        assert_eq!(dest.read_link("usr/bin/sh")?.as_str(), "busybox");
        assert_eq!(dest.read_to_string("usr/bin/sh")?, "#!/bin/sh\n");
        Ok(())
    }

    #[rstest]
    fn strip_components_matches_unprefixed_archive() -> io::Result<()> {
        let (_prefixed_guard, prefixed) = temp_destination()?;
        let (_plain_guard, plain) = temp_destination()?;

        extract_archive(sample_archive("node-v22.1.0/")?.as_slice(), &prefixed, 1)?;
        extract_archive(sample_archive("")?.as_slice(), &plain, 0)?;

        let mut left = Vec::new();
        let mut right = Vec::new();
        snapshot(&prefixed, Utf8Path::new(""), &mut left)?;
        snapshot(&plain, Utf8Path::new(""), &mut right)?;
        assert_eq!(left, right);
        assert!(!left.is_empty());
        Ok(())
    }

    #[rstest]
    fn detects_gzip_by_magic_bytes(destination: io::Result<(TempDir, Dir)>) -> io::Result<()> {
        let (_guard, dest) = destination?;
        let compressed = gzip(&sample_archive("")?)?;

        extract_archive(compressed.as_slice(), &dest, 0)?;

        assert_eq!(dest.read_to_string("etc/motd")?, "welcome\n");
        Ok(())
    }

    #[rstest]
    #[case("../escape", 0, None)]
    #[case("/etc/passwd", 0, None)]
    #[case("top/", 1, None)]
    #[case("./top/bin/sh", 1, Some("bin/sh"))]
    #[case("a/b/c", 2, Some("c"))]
    fn stripped_path_normalises_entries(
        #[case] input: &str,
        #[case] strip: u32,
        #[case] expected: Option<&str>,
    ) {
        let result = stripped_path(Path::new(input), strip);
        assert_eq!(result.as_deref().map(Utf8Path::as_str), expected);
    }
}
