//! Shared filesystem helpers built on `cap-std` and `camino`.
//!
//! The transfer engine uses these helpers to create output files and their
//! parent folders, derive per-tile output paths and open import log files.
#![forbid(unsafe_code)]

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8};
use cartage_core::{ImportLogMode, TileNameSuffixMode, tiling::insert_name_suffix};
use std::io;
use std::path::Component;

/// Open a UTF-8 file path for reading using ambient authority.
///
/// # Errors
/// Returns the underlying IO error when the file cannot be opened.
pub fn open_utf8_file(path: &Utf8Path) -> io::Result<fs_utf8::File> {
    fs_utf8::File::open_ambient(path, ambient_authority())
}

/// Resolve an ambient directory for the given path and return the directory with the file name.
///
/// # Errors
/// Fails when `path` has no file name or its parent cannot be opened.
pub fn open_dir_and_file(path: &Utf8Path) -> io::Result<(fs_utf8::Dir, String)> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::other("target should include a file name"))?
        .to_owned();
    let dir = fs_utf8::Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, file_name))
}

/// Ensure the parent directory for `path` exists, handling absolute paths safely for cap-std.
///
/// # Errors
/// Returns the IO error raised while creating a missing ancestor.
pub fn ensure_parent_dir(path: &Utf8Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir(parent)
}

/// Create `dir` and every missing ancestor.
///
/// # Errors
/// Returns the IO error raised while creating a missing ancestor.
pub fn ensure_dir(dir: &Utf8Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir == Utf8Path::new("/") {
        return Ok(());
    }
    let (base_dir, relative) = base_dir_and_relative(dir)?;
    if relative.as_os_str().is_empty() {
        return Ok(());
    }
    base_dir.create_dir_all(&relative)
}

/// Return whether a path exists and is a regular file using capability-based IO.
///
/// # Errors
/// Fails when the parent directory cannot be opened or the metadata lookup
/// fails for a reason other than a missing file.
pub fn file_is_file(path: &Utf8Path) -> io::Result<bool> {
    let (dir, name) = open_dir_and_file(path)?;
    match dir.metadata(name.as_str()) {
        Ok(meta) => Ok(meta.is_file()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Check that `path` can receive an output file.
///
/// Creates the parent directory when missing and rejects targets that are
/// existing directories or read-only files.
///
/// # Errors
/// Returns an IO error describing why the target is unusable.
pub fn check_writable(path: &Utf8Path) -> io::Result<()> {
    ensure_parent_dir(path)?;
    let (dir, name) = open_dir_and_file(path)?;
    match dir.metadata(name.as_str()) {
        Ok(meta) if meta.is_dir() => Err(io::Error::other(format!(
            "output path {path} is a directory"
        ))),
        Ok(meta) if meta.permissions().readonly() => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("output file {path} is read-only"),
        )),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let parent = dir.dir_metadata()?;
            if parent.permissions().readonly() {
                Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("output folder of {path} is read-only"),
                ))
            } else {
                Ok(())
            }
        }
        Err(err) => Err(err),
    }
}

/// Create (or truncate) the output file at `path`, creating its parent
/// folders first.
///
/// # Errors
/// Returns the IO error raised while creating folders or the file.
pub fn create_output_file(path: &Utf8Path) -> io::Result<fs_utf8::File> {
    ensure_parent_dir(path)?;
    let (dir, name) = open_dir_and_file(path)?;
    dir.create(name.as_str())
}

/// Output path of one tile.
///
/// The tile folder is `{parent}/{prefix}_{suffix}`; with
/// [`TileNameSuffixMode::SameAsPath`] the file name also carries the
/// suffix, inserted before its first `.`.
///
/// # Examples
/// ```
/// use camino::Utf8Path;
/// use cartage_core::TileNameSuffixMode;
/// use cartage_fs::tile_output_path;
///
/// let path = tile_output_path(
///     Utf8Path::new("out/city.jsonl"),
///     "tile",
///     "0_1",
///     TileNameSuffixMode::SameAsPath,
/// );
/// assert_eq!(path.as_str(), "out/tile_0_1/city_0_1.jsonl");
/// ```
#[must_use]
pub fn tile_output_path(
    output: &Utf8Path,
    prefix: &str,
    suffix: &str,
    name_suffix: TileNameSuffixMode,
) -> Utf8PathBuf {
    let parent = output.parent().unwrap_or_else(|| Utf8Path::new(""));
    let file_name = output.file_name().unwrap_or_default();
    let folder = parent.join(format!("{prefix}_{suffix}"));
    match name_suffix {
        TileNameSuffixMode::None => folder.join(file_name),
        TileNameSuffixMode::SameAsPath => folder.join(insert_name_suffix(file_name, suffix)),
    }
}

/// Folder next to `output` receiving exported binary payloads.
#[must_use]
pub fn payload_folder(output: &Utf8Path, folder_name: &str) -> Utf8PathBuf {
    output
        .parent()
        .unwrap_or_else(|| Utf8Path::new(""))
        .join(folder_name)
}

/// Open the import log at `path` according to `mode`.
///
/// [`ImportLogMode::Unique`] inserts a timestamp into the file name and
/// never touches an existing file; [`ImportLogMode::Append`] appends to an
/// existing log and [`ImportLogMode::Truncate`] replaces it. Returns the
/// path actually opened.
///
/// # Errors
/// Returns the IO error raised while creating folders or the file.
pub fn open_import_log(
    path: &Utf8Path,
    mode: ImportLogMode,
) -> io::Result<(Utf8PathBuf, fs_utf8::File)> {
    ensure_parent_dir(path)?;
    let (dir, name) = open_dir_and_file(path)?;
    let mut options = OpenOptions::new();
    options.write(true);
    let file_name = match mode {
        ImportLogMode::Unique => {
            options.create_new(true);
            unique_name(&dir, &name)?
        }
        ImportLogMode::Append => {
            options.create(true).append(true);
            name
        }
        ImportLogMode::Truncate => {
            options.create(true).truncate(true);
            name
        }
    };
    let file = dir.open_with(file_name.as_str(), &options)?;
    let opened = path.with_file_name(file_name);
    Ok((opened, file))
}

fn unique_name(dir: &fs_utf8::Dir, name: &str) -> io::Result<String> {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let stamped = insert_name_suffix(name, &stamp);
    if !dir.exists(stamped.as_str()) {
        return Ok(stamped);
    }
    (1..1000_u32)
        .map(|n| insert_name_suffix(name, &format!("{stamp}_{n}")))
        .find(|candidate| !dir.exists(candidate.as_str()))
        .ok_or_else(|| io::Error::other(format!("no unique log file name for {name}")))
}

/// Split an absolute or relative parent path into an ambient base directory and a relative suffix.
///
/// # Errors
/// Fails for non-UTF-8 prefixes or when the base directory cannot be opened.
pub fn base_dir_and_relative(parent: &Utf8Path) -> io::Result<(fs_utf8::Dir, Utf8PathBuf)> {
    let std_parent = parent.as_std_path();

    let (base, relative) = match std_parent.components().next() {
        // Windows absolute path with a drive or UNC prefix.
        Some(Component::Prefix(prefix)) => {
            let prefix_str = prefix
                .as_os_str()
                .to_str()
                .ok_or_else(|| io::Error::other("non-UTF-8 path prefix"))?;

            let base = Utf8PathBuf::from(prefix_str).join(std::path::MAIN_SEPARATOR.to_string());
            let relative = std_parent
                .strip_prefix(base.as_std_path())
                .or_else(|_| std_parent.strip_prefix(prefix.as_os_str()))
                .map_err(|_| io::Error::other("failed to strip prefix from parent path"))?
                .to_path_buf();
            (base, relative)
        }
        Some(Component::RootDir) => {
            let base = Utf8PathBuf::from(std::path::MAIN_SEPARATOR.to_string());
            let relative = std_parent
                .strip_prefix(base.as_std_path())
                .map_err(|_| io::Error::other("failed to strip root from absolute path"))?
                .to_path_buf();
            (base, relative)
        }
        _ => (Utf8PathBuf::from("."), std_parent.to_path_buf()),
    };

    let dir = fs_utf8::Dir::open_ambient_dir(&base, ambient_authority())?;
    let relative_utf8 = Utf8PathBuf::from_path_buf(relative)
        .map_err(|_| io::Error::other("non-UTF-8 parent path"))?;

    Ok((dir, relative_utf8))
}

#[cfg(test)]
mod tests;
