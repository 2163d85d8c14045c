//! Plain file I/O, synchronous and asynchronous.
//!
//! The mmap'd data file is handled by [`crate::cache`]; this module is for
//! the append-only journal file, which is read and written through ordinary
//! positioned reads/writes rather than mapped.
//!
//! There's no portable `OVERLAPPED`-style async file API in the ecosystem
//! this crate targets, so "async" here means a single background worker
//! thread draining a job queue and replying on a oneshot channel. It's
//! enough to get journal writes off the caller's thread without pulling in
//! a full async runtime.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::error::{Result, StorageError};

fn io_err(e: io::Error) -> StorageError {
    StorageError::FileError(e)
}

/// Synchronous positioned I/O on a single file handle.
pub struct FileIo {
    file: File,
}

impl FileIo {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        self.file.read_exact(buf).map_err(io_err)
    }

    /// Read up to `len` bytes at `offset`, returning however many were
    /// actually transferred before hitting EOF rather than erroring. The
    /// caller decides whether a short result is acceptable.
    pub fn read_at_upto(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        let mut buf = vec![0u8; len];
        let mut total = 0;
        while total < len {
            let n = self.file.read(&mut buf[total..]).map_err(io_err)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        self.file.write_all(buf).map_err(io_err)
    }

    pub fn resize(&mut self, new_len: u64) -> Result<()> {
        self.file.set_len(new_len).map_err(io_err)
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata().map_err(io_err)?.len())
    }

    pub fn sync_all(&self) -> Result<()> {
        self.file.sync_all().map_err(io_err)
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(io_err)
    }

    pub fn get_ref(&self) -> &File {
        &self.file
    }
}

enum Job {
    Read {
        offset: u64,
        len: usize,
        reply: mpsc::Sender<Result<Vec<u8>>>,
    },
    Write {
        offset: u64,
        bytes: Vec<u8>,
        reply: mpsc::Sender<Result<()>>,
    },
    Shutdown,
}

/// A handle to the background file-I/O worker thread.
///
/// Dropping the last handle signals the worker to exit and joins it, so a
/// `AsyncFileIo` going out of scope never leaks a thread.
pub struct AsyncFileIo {
    jobs: mpsc::Sender<Job>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncFileIo {
    pub fn spawn(file: File) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name("storage-file-io".into())
            .spawn(move || {
                let mut io = FileIo::new(file);
                for job in rx {
                    match job {
                        Job::Read { offset, len, reply } => {
                            let result = io.read_at_upto(offset, len);
                            let _ = reply.send(result);
                        }
                        Job::Write {
                            offset,
                            bytes,
                            reply,
                        } => {
                            let result = io.write_at(offset, &bytes);
                            let _ = reply.send(result);
                        }
                        Job::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn file I/O worker thread");
        Self {
            jobs: tx,
            worker: Some(worker),
        }
    }

    /// Submit a read; returns a handle to wait on for completion.
    pub fn read_async(&self, offset: u64, len: usize) -> AsyncReadReq {
        let (tx, rx) = mpsc::channel();
        // The worker thread only ever exits via our own Drop, so while this
        // handle is alive the send cannot fail.
        let _ = self.jobs.send(Job::Read {
            offset,
            len,
            reply: tx,
        });
        AsyncReadReq {
            reply: rx,
            expected_len: len,
        }
    }

    /// Submit a write; returns a handle to wait on for completion.
    pub fn write_async(&self, offset: u64, bytes: Vec<u8>) -> AsyncWriteReq {
        let (tx, rx) = mpsc::channel();
        let _ = self.jobs.send(Job::Write {
            offset,
            bytes,
            reply: tx,
        });
        AsyncWriteReq { reply: rx }
    }
}

impl Drop for AsyncFileIo {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// A pending asynchronous read. Call [`AsyncReadReq::wait`] to block for the
/// result.
pub struct AsyncReadReq {
    reply: mpsc::Receiver<Result<Vec<u8>>>,
    expected_len: usize,
}

impl AsyncReadReq {
    /// Blocks for the worker's reply and validates it transferred the full
    /// requested length, surfacing `BadArgument` on a short transfer (a read
    /// past end of file) rather than silently handing back a short buffer.
    pub fn wait(self) -> Result<Vec<u8>> {
        let buf = self
            .reply
            .recv()
            .unwrap_or_else(|_| Err(StorageError::Wedged))?;
        if buf.len() != self.expected_len {
            return Err(StorageError::BadArgument(format!(
                "short read: requested {} bytes, got {}",
                self.expected_len,
                buf.len()
            )));
        }
        Ok(buf)
    }
}

/// A pending asynchronous write. Call [`AsyncWriteReq::wait`] to block for
/// completion.
pub struct AsyncWriteReq {
    reply: mpsc::Receiver<Result<()>>,
}

impl AsyncWriteReq {
    pub fn wait(self) -> Result<()> {
        self.reply
            .recv()
            .unwrap_or_else(|_| Err(StorageError::Wedged))
    }
}
