//! in-flight blob files
//!
//! on Linux the preferred path is an anonymous `O_TMPFILE` file that gets a
//! directory entry only at commit time, via `linkat` through
//! `/proc/self/fd`. filesystems that reject the flag flip a process-wide
//! switch and all later writers use named temp files in `tmp/` with a
//! rename commit. both paths end with a read-only file in `blobs/`; a
//! destination that already exists counts as success (dedup).

use std::fs::{File, Permissions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::Mode;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{hash_reader, SizedRef};

const RO_PERM: u32 = 0o444;

static NO_TMPFILE: AtomicBool = AtomicBool::new(false);

nix::ioctl_write_int!(ficlone, 0x94, 9);

pub(super) enum TmpFile {
    Anon { file: File },
    Named { file: tempfile::NamedTempFile },
}

impl TmpFile {
    /// create a new in-flight file under `root`, preferring `O_TMPFILE`
    pub(super) fn create(root: &Path, tmp_dir: &Path) -> Result<TmpFile> {
        if !NO_TMPFILE.load(Ordering::Relaxed) {
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true)
                .custom_flags((OFlag::O_TMPFILE | OFlag::O_CLOEXEC).bits())
                .mode(0o600);
            match opts.open(root) {
                Ok(file) => return Ok(TmpFile::Anon { file }),
                Err(e) => match e.raw_os_error() {
                    // the kernel or filesystem does not understand the flag;
                    // remember and stop retrying
                    Some(code)
                        if code == nix::errno::Errno::EISDIR as i32
                            || code == nix::errno::Errno::EOPNOTSUPP as i32
                            || code == nix::errno::Errno::EINVAL as i32 =>
                    {
                        NO_TMPFILE.store(true, Ordering::Relaxed);
                    }
                    _ => return Err(Error::from_io(e, root)),
                },
            }
        }
        let file = tempfile::Builder::new()
            .prefix("blob_")
            .tempfile_in(tmp_dir)
            .with_path(tmp_dir)?;
        Ok(TmpFile::Named { file })
    }

    /// give the blob its final read-only name; existing destination = dedup
    pub(super) fn commit(self, dest: &Path) -> Result<()> {
        match self {
            TmpFile::Anon { file } => {
                file.sync_all().with_path(dest)?;
                nix::sys::stat::fchmod(file.as_raw_fd(), Mode::from_bits_truncate(RO_PERM))
                    .map_err(|e| Error::from_io(e.into(), dest))?;
                let proc_path = PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd()));
                match nix::unistd::linkat(
                    None::<std::os::fd::RawFd>,
                    proc_path.as_path(),
                    None::<std::os::fd::RawFd>,
                    dest,
                    AtFlags::AT_SYMLINK_FOLLOW,
                ) {
                    Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
                    Err(e) => Err(Error::from_io(e.into(), dest)),
                }
            }
            TmpFile::Named { file } => {
                file.as_file().sync_all().with_path(dest)?;
                std::fs::set_permissions(file.path(), Permissions::from_mode(RO_PERM))
                    .with_path(file.path())?;
                file.into_temp_path()
                    .persist(dest)
                    .map_err(|e| Error::from_io(e.error, dest))?;
                Ok(())
            }
        }
    }
}

impl Write for TmpFile {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        match self {
            TmpFile::Anon { file } => file.write(p),
            TmpFile::Named { file } => file.write(p),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TmpFile::Anon { file } => file.flush(),
            TmpFile::Named { file } => file.flush(),
        }
    }
}

/// clone `src` into a fresh temp file under `tmp_dir` reusing filesystem
/// blocks, hash the clone, and report where it can be committed from
///
/// tries the `FICLONE` ioctl first and falls back to
/// `cp --reflink=always`. returns [`Error::CloneUnsupported`] when the
/// filesystem cannot clone at all.
pub(super) fn clone_file(src: &Path, tmp_dir: &Path) -> Result<(tempfile::NamedTempFile, SizedRef)> {
    let mut tmp = tempfile::Builder::new()
        .prefix("blob_")
        .tempfile_in(tmp_dir)
        .with_path(tmp_dir)?;

    let cloned = {
        let inp = File::open(src).with_path(src)?;
        unsafe { ficlone(tmp.as_file().as_raw_fd(), inp.as_raw_fd() as u64) }.is_ok()
    };
    if !cloned {
        let status = Command::new("cp")
            .arg("--reflink=always")
            .arg(src)
            .arg(tmp.path())
            .status()
            .with_path(src)?;
        if !status.success() {
            return Err(Error::CloneUnsupported);
        }
    }

    // hash the clone, not the source: the clone is a stable snapshot
    let file = tmp.as_file_mut();
    file.seek(SeekFrom::Start(0)).with_path(src)?;
    let sr = hash_reader(file)?;
    Ok((tmp, sr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tmpfile_commit() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_dir = dir.path().join("tmp");
        std::fs::create_dir(&tmp_dir).unwrap();

        let mut f = TmpFile::create(dir.path(), &tmp_dir).unwrap();
        f.write_all(b"content").unwrap();
        let dest = dir.path().join("blob");
        f.commit(&dest).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"content");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);
    }

    #[test]
    fn test_tmpfile_commit_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_dir = dir.path().join("tmp");
        std::fs::create_dir(&tmp_dir).unwrap();
        let dest = dir.path().join("blob");

        let mut a = TmpFile::create(dir.path(), &tmp_dir).unwrap();
        a.write_all(b"same").unwrap();
        a.commit(&dest).unwrap();

        let mut b = TmpFile::create(dir.path(), &tmp_dir).unwrap();
        b.write_all(b"same").unwrap();
        b.commit(&dest).unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"same");
    }

    #[test]
    fn test_tmpfile_discard_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_dir = dir.path().join("tmp");
        std::fs::create_dir(&tmp_dir).unwrap();

        {
            let mut f = TmpFile::create(dir.path(), &tmp_dir).unwrap();
            f.write_all(b"dropped").unwrap();
        }
        assert!(std::fs::read_dir(&tmp_dir).unwrap().next().is_none());
    }
}
