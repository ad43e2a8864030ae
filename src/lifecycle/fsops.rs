//! Directory moves used by deploy, backup and restore.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{AppError, Result};

#[cfg(unix)]
fn is_cross_device(error: &io::Error) -> bool {
    error.raw_os_error() == Some(nix::libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_error: &io::Error) -> bool {
    false
}

/// Recursive copy preserving symlinks, used when a rename crosses devices.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| AppError::io(e.to_string()))?;
        let target = if relative.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(relative)
        };
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", target, e)))?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            {
                let link = fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(link, &target)?;
            }
            #[cfg(not(unix))]
            log::warn!("Skipping symlink {:?}", entry.path());
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|e| AppError::io(format!("Failed to copy {:?}: {}", entry.path(), e)))?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Move one entry, renaming when possible and copying across devices.
fn move_entry(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            log::debug!("Cross-device move of {:?}, copying", src);
            copy_tree(src, dst)?;
            remove_path(src)
                .map_err(|e| AppError::io(format!("Failed to remove {:?}: {}", src, e)))
        }
        Err(e) => Err(AppError::io(format!(
            "Failed to move {:?} to {:?}: {}",
            src, dst, e
        ))),
    }
}

/// Move every entry of `src` into `dst`, skipping names in `exclude`.
///
/// Stops at the first failure. The returned error is accompanied by the
/// entries already moved so the caller can undo them.
pub fn move_contents(
    src: &Path,
    dst: &Path,
    exclude: &[&str],
) -> std::result::Result<Vec<PathBuf>, (AppError, Vec<PathBuf>)> {
    let mut moved = Vec::new();
    if let Err(e) = fs::create_dir_all(dst) {
        return Err((
            AppError::io(format!("Failed to create {:?}: {}", dst, e)),
            moved,
        ));
    }
    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) => {
            return Err((
                AppError::io(format!("Failed to read {:?}: {}", src, e)),
                moved,
            ))
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => return Err((AppError::from(e), moved)),
        };
        let name = entry.file_name();
        if exclude.iter().any(|x| name == *x) {
            continue;
        }
        let target = dst.join(&name);
        if fs::symlink_metadata(&target).is_ok() {
            return Err((
                AppError::io(format!("{:?} already exists", target)),
                moved,
            ));
        }
        if let Err(e) = move_entry(&entry.path(), &target) {
            return Err((e, moved));
        }
        moved.push(PathBuf::from(name));
    }
    Ok(moved)
}

/// Move the named entries from `src` back into `dst`, logging failures.
pub fn move_back(src: &Path, dst: &Path, names: &[PathBuf]) {
    for name in names {
        if let Err(e) = move_entry(&src.join(name), &dst.join(name)) {
            log::error!("Failed to move {:?} back to {:?}: {}", name, dst, e);
        }
    }
}

/// Remove everything inside `dir`, keeping `dir` itself.
pub fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        remove_path(&path).map_err(|e| AppError::io(format!("Failed to remove {:?}: {}", path, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_all_but_excluded() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("data/world")).unwrap();
        fs::write(src.join("data/world/level.dat"), "lvl").unwrap();
        fs::write(src.join("server.jar"), "jar").unwrap();
        fs::write(src.join(".marker"), "").unwrap();

        let dst = tmp.path().join("dst");
        let moved = move_contents(&src, &dst, &[".marker"]).map_err(|(e, _)| e).unwrap();
        assert_eq!(moved.len(), 2);
        assert_eq!(fs::read_to_string(dst.join("data/world/level.dat")).unwrap(), "lvl");
        assert!(dst.join("server.jar").is_file());
        assert!(src.join(".marker").exists());
        assert!(!src.join("server.jar").exists());
    }

    #[test]
    fn existing_target_stops_the_move() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("a"), "new").unwrap();
        fs::write(dst.join("a"), "old").unwrap();

        let (err, moved) = move_contents(&src, &dst, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        assert!(moved.is_empty());
        assert_eq!(fs::read_to_string(dst.join("a")).unwrap(), "old");
    }

    #[test]
    fn copy_tree_preserves_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("x/y")).unwrap();
        fs::write(src.join("x/y/z"), "z").unwrap();
        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("x/y/z")).unwrap(), "z");
    }

    #[test]
    fn clear_dir_keeps_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("d/sub")).unwrap();
        fs::write(tmp.path().join("d/f"), "").unwrap();
        clear_dir(&tmp.path().join("d")).unwrap();
        assert!(tmp.path().join("d").is_dir());
        assert_eq!(fs::read_dir(tmp.path().join("d")).unwrap().count(), 0);
    }
}
