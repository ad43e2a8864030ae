//! Unpacking of downloaded server archives.
//!
//! A single top-level directory shared by every entry is hoisted, so
//! `server-1.3.0/bin/run` lands at `<dest>/bin/run`.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Format implied by a file name or URL, if any.
    pub fn detect(name: &str) -> Option<Self> {
        let name = name
            .split(['?', '#'])
            .next()
            .unwrap_or(name)
            .to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// Split an entry path into safe components.
///
/// Returns `None` on traversal (`..`) or absolute components.
fn entry_components(raw_path: &str) -> Option<Vec<String>> {
    let normalized = raw_path.replace('\\', "/");
    if normalized.starts_with('/') {
        return None;
    }
    let mut components = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            _ => components.push(part.to_string()),
        }
    }
    Some(components)
}

/// Common top-level directory of all entries, if every entry lives under it.
fn common_top_dir(paths: &[Vec<String>]) -> Option<String> {
    let candidate = paths.first()?.first()?;
    if !paths.iter().all(|path| path.first() == Some(candidate)) {
        return None;
    }
    paths
        .iter()
        .any(|path| path.len() > 1)
        .then(|| candidate.to_string())
}

fn output_path(dest_dir: &Path, components: &[String], top_dir: Option<&str>) -> Option<PathBuf> {
    let skip = usize::from(top_dir.is_some() && components.first().map(String::as_str) == top_dir);
    let rest = &components[skip..];
    if rest.is_empty() {
        return None;
    }
    let mut out = dest_dir.to_path_buf();
    for component in rest {
        if Path::new(component)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        out.push(component);
    }
    Some(out)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(mode) = mode {
        if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)) {
            log::warn!("Failed to set permissions on {path:?}: {error}");
        }
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) {}

fn write_entry<R: io::Read>(
    out_path: &Path,
    is_dir: bool,
    reader: &mut R,
    mode: Option<u32>,
) -> Result<()> {
    if is_dir {
        fs::create_dir_all(out_path)
            .map_err(|e| AppError::io(format!("Failed to create {out_path:?}: {e}")))?;
        return Ok(());
    }
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io(format!("Failed to create {parent:?}: {e}")))?;
    }
    let mut outfile = fs::File::create(out_path)
        .map_err(|e| AppError::io(format!("Failed to create {out_path:?}: {e}")))?;
    io::copy(reader, &mut outfile)
        .map_err(|e| AppError::download(format!("Failed to unpack {out_path:?}: {e}")))?;
    set_mode(out_path, mode);
    Ok(())
}

fn open_tar_gz(archive_path: &Path) -> Result<tar::Archive<flate2::read::GzDecoder<fs::File>>> {
    let file = fs::File::open(archive_path)
        .map_err(|e| AppError::io(format!("Failed to open {archive_path:?}: {e}")))?;
    Ok(tar::Archive::new(flate2::read::GzDecoder::new(file)))
}

fn tar_entry_path<R: io::Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry
        .path()
        .map_err(|e| AppError::download(format!("Bad archive entry: {e}")))?;
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| AppError::download(format!("Archive entry path is not UTF-8: {path:?}")))
}

pub fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let mut all_paths = Vec::new();
    for entry in open_tar_gz(archive_path)?
        .entries()
        .map_err(|e| AppError::download(e.to_string()))?
    {
        let entry = entry.map_err(|e| AppError::download(e.to_string()))?;
        if let Some(components) = entry_components(&tar_entry_path(&entry)?) {
            if !components.is_empty() {
                all_paths.push(components);
            }
        }
    }
    let top_dir = common_top_dir(&all_paths);

    let mut archive = open_tar_gz(archive_path)?;
    for entry in archive
        .entries()
        .map_err(|e| AppError::download(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| AppError::download(e.to_string()))?;
        let raw = tar_entry_path(&entry)?;
        let Some(components) = entry_components(&raw) else {
            return Err(AppError::download(format!(
                "Archive contains unsafe entry path: {raw:?}"
            )));
        };

        let entry_type = entry.header().entry_type();
        if !entry_type.is_dir() && !entry_type.is_file() {
            log::warn!("Skipping unsupported archive entry {raw:?} ({entry_type:?})");
            continue;
        }
        let Some(out_path) = output_path(dest_dir, &components, top_dir.as_deref()) else {
            continue;
        };
        let mode = entry.header().mode().ok();
        write_entry(&out_path, entry_type.is_dir(), &mut entry, mode)?;
    }
    Ok(())
}

pub fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)
        .map_err(|e| AppError::io(format!("Failed to open {archive_path:?}: {e}")))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| AppError::download(e.to_string()))?;

    let all_paths: Vec<Vec<String>> = archive
        .file_names()
        .filter_map(entry_components)
        .filter(|components| !components.is_empty())
        .collect();
    let top_dir = common_top_dir(&all_paths);

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| AppError::download(e.to_string()))?;
        let name = entry.name().to_string();
        let Some(components) = entry_components(&name) else {
            return Err(AppError::download(format!(
                "Archive contains unsafe entry path: {name:?}"
            )));
        };
        let Some(out_path) = output_path(dest_dir, &components, top_dir.as_deref()) else {
            continue;
        };
        let is_dir = entry.is_dir();
        let mode = entry.unix_mode();
        write_entry(&out_path, is_dir, &mut entry, mode)?;
    }
    Ok(())
}

/// Unpack `archive_path` into `dest_dir` according to `format`.
pub fn unpack(archive_path: &Path, dest_dir: &Path, format: ArchiveFormat) -> Result<()> {
    fs::create_dir_all(dest_dir)
        .map_err(|e| AppError::io(format!("Failed to create {dest_dir:?}: {e}")))?;
    match format {
        ArchiveFormat::TarGz => extract_tar_gz(archive_path, dest_dir),
        ArchiveFormat::Zip => extract_zip(archive_path, dest_dir),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn detects_format_from_url() {
        assert_eq!(
            ArchiveFormat::detect("https://x/server-1.0.tar.gz?token=1"),
            Some(ArchiveFormat::TarGz)
        );
        assert_eq!(ArchiveFormat::detect("a.TGZ"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect("a.zip"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect("server.jar"), None);
    }

    #[test]
    fn tar_gz_hoists_single_top_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("server.tar.gz");
        write_tar_gz(
            &archive,
            &[
                ("server-1.3.0/bin/run.sh", b"#!/bin/sh\n"),
                ("server-1.3.0/README", b"hi"),
            ],
        );

        let dest = tmp.path().join("out");
        unpack(&archive, &dest, ArchiveFormat::TarGz).unwrap();
        assert!(dest.join("bin/run.sh").is_file());
        assert_eq!(fs::read_to_string(dest.join("README")).unwrap(), "hi");
        assert!(!dest.join("server-1.3.0").exists());
    }

    #[test]
    fn tar_gz_without_common_dir_is_kept_as_is() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("flat.tgz");
        write_tar_gz(&archive, &[("a/x", b"1"), ("b", b"2")]);

        let dest = tmp.path().join("out");
        unpack(&archive, &dest, ArchiveFormat::TarGz).unwrap();
        assert!(dest.join("a/x").is_file());
        assert!(dest.join("b").is_file());
    }

    #[test]
    fn zip_hoists_single_top_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("server.zip");
        let mut writer = zip::ZipWriter::new(fs::File::create(&archive).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("pkg/server.bin", options).unwrap();
        writer.write_all(b"elf").unwrap();
        writer.start_file("pkg/conf/server.cfg", options).unwrap();
        writer.write_all(b"port=1").unwrap();
        writer.finish().unwrap();

        let dest = tmp.path().join("out");
        unpack(&archive, &dest, ArchiveFormat::Zip).unwrap();
        assert_eq!(fs::read(dest.join("server.bin")).unwrap(), b"elf");
        assert!(dest.join("conf/server.cfg").is_file());
    }

    #[test]
    fn traversal_entries_are_rejected() {
        assert!(entry_components("../etc/passwd").is_none());
        assert!(entry_components("/abs").is_none());
        assert_eq!(
            entry_components("./a//b").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
