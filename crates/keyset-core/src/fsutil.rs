//! Owner-only filesystem helpers shared by the file-backed vault and event log.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Seek, SeekFrom, Write},
    path::Path,
};

use fs2::FileExt;
use rand::{RngCore, rngs::OsRng};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

pub fn ensure_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

pub fn open_private(path: &Path, options: &mut OpenOptions) -> io::Result<File> {
    #[cfg(unix)]
    options.mode(0o600);
    let file = options.open(path)?;
    #[cfg(unix)]
    {
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms)?;
    }
    Ok(file)
}

pub fn tighten_permissions(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Overwrite the file with random bytes in fixed-size chunks, sync, then unlink it.
/// Returns bytes overwritten.
pub fn shred(path: &Path) -> io::Result<u64> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    FileExt::lock_exclusive(&file)?;
    let size = file.metadata()?.len();

    let mut writer = BufWriter::new(&file);
    writer.seek(SeekFrom::Start(0))?;
    let mut buffer = vec![0u8; 8192];
    let mut remaining = size;
    while remaining > 0 {
        let chunk = remaining.min(buffer.len() as u64) as usize;
        OsRng.fill_bytes(&mut buffer[..chunk]);
        writer.write_all(&buffer[..chunk])?;
        remaining -= chunk as u64;
    }
    writer.flush()?;
    drop(writer);
    file.sync_all()?;
    FileExt::unlock(&file)?;
    drop(file);

    fs::remove_file(path)?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn shred_removes_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("secret.json");
        fs::write(&path, b"very secret bytes").expect("write");
        let overwritten = shred(&path).expect("shred");
        assert_eq!(overwritten, 17);
        assert!(!path.exists());
    }

    #[test]
    fn shred_handles_files_larger_than_one_buffer_many_times_over() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("bulky.json");
        let size = 17 * 1024 * 1024 + 3;
        fs::write(&path, vec![0x5a; size]).expect("write");
        assert_eq!(shred(&path).expect("shred"), size as u64);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn private_dir_is_owner_only() {
        let dir = TempDir::new().expect("tempdir");
        let nested = dir.path().join("vault");
        ensure_private_dir(&nested).expect("dir");
        let mode = fs::metadata(&nested).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}
