use anyhow::{Context, Result};
use base64::Engine as _;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {:?}", path))
}

/// Write bytes so that the destination is either the complete new content or
/// untouched: write a sibling `.tmp`, flush + fsync, then rename over.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_from(path, &mut std::io::Cursor::new(bytes))
}

/// Streaming variant of [`write_atomic`]; the reader is drained through a
/// fixed buffer so large files never sit in memory.
pub fn write_atomic_from<R: Read>(path: &Path, reader: &mut R) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("destination has no parent: {:?}", path))?;
    ensure_dir(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".kiln-write")
        .suffix(".tmp")
        .tempfile_in(parent)
        .with_context(|| format!("create temp file next to {:?}", path))?;

    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buf).context("read while staging write")?;
        if read == 0 {
            break;
        }
        tmp.write_all(&buf[..read])
            .with_context(|| format!("write temp for {:?}", path))?;
    }
    tmp.flush()?;
    tmp.as_file().sync_all().context("sync temp file")?;

    // persist() renames within the same directory, so this never crosses
    // devices
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("rename temp into place: {:?}", path))?;
    Ok(())
}

/// Rename a file, falling back to copy+sync+unlink when the rename crosses
/// filesystems.
pub fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            fs::copy(src, dest).with_context(|| format!("copy {:?} -> {:?}", src, dest))?;
            let f = fs::File::open(dest)?;
            f.sync_all().context("sync copied file")?;
            fs::remove_file(src).with_context(|| format!("unlink source {:?}", src))?;
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("rename {:?} -> {:?}", src, dest)),
    }
}

/// Rename a directory with the same cross-device fallback.
pub fn move_dir(src: &Path, dest: &Path) -> Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device(&err) => {
            copy_dir_recursive(src, dest)?;
            fs::remove_dir_all(src).with_context(|| format!("remove source dir {:?}", src))?;
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("move dir {:?} -> {:?}", src, dest)),
    }
}

pub fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<()> {
    ensure_dir(dest)?;
    for entry in fs::read_dir(src).with_context(|| format!("read dir {:?}", src))? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {:?} -> {:?}", entry.path(), target))?;
        }
    }
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).with_context(|| format!("remove dir {:?}", path))?;
    }
    Ok(())
}

/// Encode a local file as a `data:` URL for the UI. Only used for pack art,
/// so the mime table covers images plus a binary fallback.
pub fn read_as_data_url(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("read {:?}", path))?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    };
    let payload = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{};base64,{}", mime, payload))
}

fn is_cross_device(err: &std::io::Error) -> bool {
    #[cfg(target_family = "unix")]
    {
        err.raw_os_error() == Some(18)
    }

    #[cfg(not(target_family = "unix"))]
    {
        // ERROR_NOT_SAME_DEVICE
        err.raw_os_error() == Some(17)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_creates_parents_and_content() {
        let tmp = tempdir().unwrap();
        let dest = tmp.path().join("a/b/c.json");
        write_atomic(&dest, b"{\"ok\":true}").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"{\"ok\":true}");
    }

    #[test]
    fn write_atomic_replaces_existing() {
        let tmp = tempdir().unwrap();
        let dest = tmp.path().join("f.txt");
        write_atomic(&dest, b"old").unwrap();
        write_atomic(&dest, b"new").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let tmp = tempdir().unwrap();
        let dest = tmp.path().join("f.txt");
        write_atomic(&dest, b"data").unwrap();
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn move_dir_moves_whole_tree() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("nested/file.txt"), b"x").unwrap();

        let dest = tmp.path().join("dest");
        move_dir(&src, &dest).unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(dest.join("nested/file.txt")).unwrap(), b"x");
    }

    #[test]
    fn data_url_sniffs_png() {
        let tmp = tempdir().unwrap();
        let logo = tmp.path().join("logo.png");
        fs::write(&logo, [0x89, b'P', b'N', b'G']).unwrap();
        let url = read_as_data_url(&logo).unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }
}
