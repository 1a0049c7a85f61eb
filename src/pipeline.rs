//! Upload ingestion.
//!
//! Every uploaded file gets a producer thread that reads it one chunk at a
//! time into pinned scratch chunks and queues them, a few at most, for a
//! single writer thread. The writer is the only one touching the package and
//! takes the files in order, streaming each one's chunks into its entry. Drained
//! chunks go back to their producer, so a file never has more than
//! `INFLIGHT_CHUNKS` chunks in memory no matter its size. The caller waits on
//! a barrier that each file releases only once the writer has appended and
//! flushed it, then finishes the package. Nothing reaches the cipher or the
//! store until every file is in, and any failure discards the whole upload.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::sync::WaitGroup;
use log::{debug, info};

use crate::buf::fill_buf;
use crate::buffer::{parse_download_limit, SecureBuffer};
use crate::crypto;
use crate::duration;
use crate::error::Error;
use crate::memory::Scratch;
use crate::pack::{Packager, DEFAULT_CHUNK_SIZE, DEFAULT_COMPRESSION_LEVEL};
use crate::store::SecureStore;

pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 512 * 1024 * 1024;

/// Chunks of one file that may be read ahead of the writer.
pub const INFLIGHT_CHUNKS: usize = 4;

/// One named file of an upload, `size` is its length as declared by the
/// uploader and must match what `source` yields.
pub struct FileUpload {
    pub name: String,
    pub size: u64,
    source: Box<dyn Read + Send>,
}

impl FileUpload {
    pub fn new<R: Read + Send + 'static>(name: impl Into<String>, size: u64, source: R) -> Self {
        FileUpload {
            name: name.into(),
            size,
            source: Box::new(source),
        }
    }

    /// Opens `path`, the entry is named after its last component.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::parse("file name", &path.display().to_string()))?
            .to_string();

        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(FileUpload::new(name, size, file))
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub chunk_size: usize,
    pub max_upload_size: u64,
    pub compression_level: i32,
    // An empty password is no password
    pub password: Option<String>,
    pub expiration: Option<String>,
    pub download_limit: Option<String>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            password: None,
            expiration: None,
            download_limit: None,
        }
    }
}

enum Piece {
    Chunk { data: Scratch, len: usize },
    // The file's share of the barrier, released by the writer
    End(WaitGroup),
}

// The writer's end of one file's queue
struct Queue {
    name: String,
    size: u64,
    pieces: Receiver<Piece>,
    spare: Sender<Scratch>,
}

/// Packages `files` into a single archive, entries in the order given.
///
/// The declared sizes are checked against `max_upload_size` before anything
/// is read.
pub fn package(files: Vec<FileUpload>, options: &UploadOptions) -> Result<Scratch, Error> {
    let declared = files
        .iter()
        .try_fold(0u64, |total, file| total.checked_add(file.size));
    match declared {
        Some(total) if total <= options.max_upload_size => (),
        _ => return Err(Error::UploadTooLarge(options.max_upload_size)),
    }

    let packager = Packager::new(
        Scratch::with_capacity(0),
        options.chunk_size,
        options.compression_level,
    )?;
    let barrier = WaitGroup::new();

    thread::scope(|scope| {
        let mut queues = Vec::with_capacity(files.len());
        let mut producers: Vec<ScopedJoinHandle<'_, Result<(), Error>>> =
            Vec::with_capacity(files.len());

        for file in files {
            let (tx, pieces) = bounded::<Piece>(INFLIGHT_CHUNKS);
            let (spare, recycled) = bounded::<Scratch>(INFLIGHT_CHUNKS);
            queues.push(Queue {
                name: file.name,
                size: file.size,
                pieces,
                spare,
            });

            let done = barrier.clone();
            let source = file.source;
            let chunk_size = options.chunk_size;
            producers.push(scope.spawn(move || stage(source, chunk_size, tx, recycled, done)));
        }

        let writer = scope.spawn(move || drain(packager, queues));

        // Every file is either flushed into the package or abandoned
        barrier.wait();

        let written = join(writer);
        let staged = producers.into_iter().map(join).collect();
        let packager = settle(written, staged)?;

        debug!("All {} files packaged", packager.count());
        packager.finish()
    })
}

fn stage(
    mut source: Box<dyn Read + Send>,
    chunk_size: usize,
    tx: Sender<Piece>,
    recycled: Receiver<Scratch>,
    done: WaitGroup,
) -> Result<(), Error> {
    let mut allocated = 0;
    let mut total: u64 = 0;

    loop {
        let mut data = if allocated < INFLIGHT_CHUNKS {
            allocated += 1;
            Scratch::zeroed(chunk_size)
        } else {
            recycled.recv().map_err(|_| writer_stopped())?
        };

        let (eof, len) = fill_buf(&mut source, &mut data)?;
        if len > 0 {
            tx.send(Piece::Chunk { data, len })
                .map_err(|_| writer_stopped())?;
            total += len as u64;
        }
        if eof {
            break;
        }
    }
    debug!("Staged a file of {} bytes", total);

    tx.send(Piece::End(done)).map_err(|_| writer_stopped())
}

fn writer_stopped() -> Error {
    Error::PipelineError("package writer stopped")
}

// The sequential writer, releases each file's barrier only after its flush
fn drain(mut packager: Packager<Scratch>, queues: Vec<Queue>) -> Result<Packager<Scratch>, Error> {
    for queue in queues {
        let mut incoming = Incoming {
            queue: &queue,
            current: None,
            pos: 0,
            done: None,
        };

        // Reads up to the end mark, the size check needs it
        packager.append(&queue.name, queue.size, &mut incoming)?;

        match incoming.done.take() {
            Some(done) => drop(done),
            None => return Err(Error::PipelineError("file ended without its end mark")),
        }
    }
    Ok(packager)
}

// Reads one file's chunks off its queue
struct Incoming<'a> {
    queue: &'a Queue,
    current: Option<(Scratch, usize)>,
    pos: usize,
    done: Option<WaitGroup>,
}

impl Read for Incoming<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if let Some((data, len)) = &self.current {
                if self.pos < *len {
                    let n = buf.len().min(len - self.pos);
                    buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
            }

            // Hand the drained chunk back to its producer
            if let Some((data, _)) = self.current.take() {
                let _ = self.queue.spare.try_send(data);
            }
            if self.done.is_some() {
                return Ok(0);
            }

            match self.queue.pieces.recv() {
                Ok(Piece::Chunk { data, len }) => {
                    self.current = Some((data, len));
                    self.pos = 0;
                }
                Ok(Piece::End(done)) => {
                    self.done = Some(done);
                    return Ok(0);
                }
                Err(_) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "file producer stopped",
                    ))
                }
            }
        }
    }
}

fn join<T>(handle: ScopedJoinHandle<'_, Result<T, Error>>) -> Result<T, Error> {
    handle
        .join()
        .map_err(|_| Error::PipelineError("upload worker panicked"))?
}

// A failure on either side stops the other one, report the cause
fn settle(
    written: Result<Packager<Scratch>, Error>,
    staged: Vec<Result<(), Error>>,
) -> Result<Packager<Scratch>, Error> {
    let mut stopped = None;

    for result in staged {
        match result {
            Ok(()) => (),
            Err(Error::PipelineError(why)) => {
                stopped.get_or_insert(Error::PipelineError(why));
            }
            Err(e) => return Err(e),
        }
    }

    match (written, stopped) {
        (Err(e), _) => Err(e),
        (Ok(_), Some(e)) => Err(e),
        (Ok(packager), None) => Ok(packager),
    }
}

/// Runs a whole upload: package, encrypt if a password is set, then register
/// the result under a fresh handle.
///
/// Options are validated before any file is read. On any failure nothing is
/// left in the store.
pub fn ingest(
    store: &SecureStore,
    files: Vec<FileUpload>,
    options: &UploadOptions,
) -> Result<Arc<SecureBuffer>, Error> {
    if files.is_empty() {
        return Err(Error::parse("upload", "no files"));
    }

    let expiration = options
        .expiration
        .as_deref()
        .map(duration::parse)
        .transpose()?;
    let download_limit = options
        .download_limit
        .as_deref()
        .map(parse_download_limit)
        .transpose()?;
    let password = options.password.as_deref().filter(|p| !p.is_empty());

    let count = files.len();
    let buffer = {
        let plain = package(files, options)?;
        let name = store.unique_name();

        // Plaintext stays pinned into the buffer, or is wiped at the end of
        // this block once sealed
        match password {
            Some(password) => SecureBuffer::new(name, crypto::encrypt(&plain, password)?, true)?,
            None => SecureBuffer::from_scratch(name, plain, false)?,
        }
    };

    if let Some(expiration) = expiration {
        buffer.expire_in(expiration);
    }
    if let Some(limit) = download_limit {
        buffer.limit_downloads(limit);
    }

    let buffer = store.add(buffer)?;
    info!(
        "Stored an upload of {} files ({} bytes, encrypted: {})",
        count,
        buffer.len(),
        buffer.is_encrypted()
    );
    Ok(buffer)
}
