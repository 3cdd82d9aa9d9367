use std::fs::File as StdFile;
#[cfg(unix)]
use std::os::unix::fs::FileExt as StdFileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt as StdFileExt;
use std::sync::Arc;

use fs2::FileExt;
use log::warn;
use perm_lib::{FileReader, FsError, FsResult};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::file::MutFile;

const SCRATCH_PREFIX: &str = "camli-";

fn read_at_once(file: &StdFile, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    #[cfg(unix)]
    {
        StdFileExt::read_at(file, buf, offset)
    }
    #[cfg(windows)]
    {
        StdFileExt::seek_read(file, buf, offset)
    }
}

fn write_at_once(file: &StdFile, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    #[cfg(unix)]
    {
        StdFileExt::write_at(file, buf, offset)
    }
    #[cfg(windows)]
    {
        StdFileExt::seek_write(file, buf, offset)
    }
}

fn write_at_all(file: &StdFile, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = write_at_once(file, buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_at returned zero",
            ));
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

/// Private, exclusively owned byte region backing an open-for-write
/// file. The temp file deletes itself when the scratch drops, on every
/// exit path including failed construction.
struct Scratch {
    file: NamedTempFile,
}

impl Scratch {
    fn create() -> FsResult<Self> {
        let file = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempfile()
            .map_err(|e| FsError::IoError(format!("create scratch failed: {}", e)))?;
        match file.as_file().try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(FsError::IoError("scratch file already locked".to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        Ok(Self { file })
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        read_at_once(self.file.as_file(), buf, offset)
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        write_at_all(self.file.as_file(), offset, buf)
    }

    fn set_len(&self, size: u64) -> std::io::Result<()> {
        self.file.as_file().set_len(size)
    }

    fn sync(&self) -> std::io::Result<()> {
        self.file.as_file().sync_all()
    }

    /// Independent streaming reader over the scratch bytes.
    fn reader(&self) -> FsResult<FileReader> {
        let clone = self.file.as_file().try_clone()?;
        Ok(Box::pin(tokio::fs::File::from_std(clone)))
    }
}

/// An open, writable file. Reads and writes go to the scratch; the
/// store only sees the result when the handle commits.
pub struct WriteHandle {
    file: Arc<MutFile>,
    scratch: Option<Scratch>,
}

impl WriteHandle {
    /// Allocate a fresh scratch, seeded with `seed`'s bytes if given.
    pub(crate) async fn new(file: Arc<MutFile>, seed: Option<FileReader>) -> FsResult<Self> {
        let scratch = Scratch::create()?;
        if let Some(mut reader) = seed {
            let mut buf = [0u8; 8192];
            let mut offset = 0u64;
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                scratch.write_all_at(&buf[..n], offset)?;
                offset += n as u64;
            }
        }
        Ok(Self {
            file,
            scratch: Some(scratch),
        })
    }

    pub fn file(&self) -> &Arc<MutFile> {
        &self.file
    }

    fn scratch(&self) -> FsResult<&Scratch> {
        self.scratch.as_ref().ok_or_else(|| {
            FsError::InvalidState("operation on a released write handle".to_string())
        })
    }

    /// Read up to `size` bytes at `offset`. Reading past the end is a
    /// short read, not an error.
    pub fn read(&self, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let scratch = self.scratch()?;
        let mut buf = vec![0u8; size];
        let mut read_total = 0usize;
        while read_total < size {
            let n = scratch.read_at(&mut buf[read_total..], offset + read_total as u64)?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        buf.truncate(read_total);
        Ok(buf)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let scratch = self.scratch()?;
        scratch.write_all_at(data, offset)?;
        self.file.set_size_at_least(offset + data.len() as u64);
        Ok(data.len())
    }

    /// Truncate the scratch to exactly `size`. The file node's reported
    /// size is reconciled by the next Setattr or Release.
    pub fn truncate(&self, size: u64) -> FsResult<()> {
        self.scratch()?.set_len(size)?;
        Ok(())
    }

    /// Upload the scratch as a file blob and rebind the file node to it.
    async fn commit(&self) -> FsResult<()> {
        let scratch = self.scratch()?;
        let mut reader = scratch.reader()?;
        reader.seek(SeekFrom::Start(0)).await?;
        let name = self.file.name();
        let (content, size) = self
            .file
            .fs()
            .files()
            .write_file_from_reader(&name, &mut reader)
            .await?;
        self.file.set_content(content, size).await
    }

    /// Commit the pending bytes without closing the handle; the scratch
    /// stays usable for further writes.
    pub async fn fsync(&self) -> FsResult<()> {
        self.scratch()?.sync()?;
        self.commit().await
    }

    /// Commit and tear down. The scratch is removed on every outcome;
    /// after this, all operations on the handle fail.
    pub async fn release(&mut self) -> FsResult<()> {
        if self.scratch.is_none() {
            return Err(FsError::InvalidState(
                "release on an already released write handle".to_string(),
            ));
        }
        let result = self.commit().await;
        if let Err(err) = &result {
            warn!("release {}: {}", self.file.permanode(), err);
        }
        self.scratch = None;
        result
    }
}
