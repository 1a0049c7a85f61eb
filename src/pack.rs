use std::io::{Read, Write};

use log::debug;
use tar::{Archive, EntryType, Header};
use time::OffsetDateTime;
use zstd::stream::read::Decoder;
use zstd::stream::write::Encoder;

use crate::buf::{fill_buf, for_each_chunk};
use crate::error::Error;
use crate::memory::Scratch;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

// For the download handler's headers
pub const CONTENT_TYPE: &str = "application/zstd";
pub const EXTENSION: &str = "tar.zst";

const BLOCK_SIZE: u64 = 512;
const ZEROES: [u8; 512] = [0; 512];

/// Streams named files into one `.tar.zst` package.
///
/// Every file is copied `chunk_size` bytes at a time through a pinned chunk
/// into its own tar entry, and the compressor is flushed once the entry is
/// complete so its bytes are visible in the writer right away.
pub struct Packager<W: Write> {
    inner: Encoder<'static, W>,
    chunk: Scratch,
    count: u32,
}

impl<W: Write> Packager<W> {
    pub fn new(writer: W, chunk_size: usize, level: i32) -> Result<Self, Error> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::parse("chunk size", &chunk_size.to_string()));
        }

        let mut inner = Encoder::new(writer, level)?;
        inner.include_checksum(true)?;

        Ok(Packager {
            inner,
            chunk: Scratch::zeroed(chunk_size),
            count: 0,
        })
    }

    /// Number of files appended so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Appends `size` bytes read from `reader` as the entry `name`.
    ///
    /// The tar header carries the size up front, a reader yielding less or
    /// more than `size` bytes fails the entry.
    pub fn append<R: Read>(&mut self, name: &str, size: u64, reader: &mut R) -> Result<u64, Error> {
        let header = header(name, size)?;
        self.inner.write_all(header.as_bytes())?;

        let inner = &mut self.inner;
        let len = for_each_chunk(
            &mut reader.by_ref().take(size),
            &mut self.chunk,
            |data| -> Result<(), Error> {
                inner.write_all(data)?;
                Ok(())
            },
        )?;

        if len < size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file is shorter than its declared size",
            )
            .into());
        }
        if fill_buf(reader, &mut [0u8; 1])?.1 > 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "file is longer than its declared size",
            )
            .into());
        }

        let padding = (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE;
        self.inner.write_all(&ZEROES[..padding as usize])?;

        // Push the compressed bytes out before moving onto the next file
        self.inner.flush()?;
        self.count += 1;

        debug!("Packed entry #{} ({} bytes)", self.count, len);
        Ok(len)
    }

    /// Writes the end of archive marker and hands back the writer.
    pub fn finish(mut self) -> Result<W, Error> {
        self.inner.write_all(&ZEROES)?;
        self.inner.write_all(&ZEROES)?;
        Ok(self.inner.finish()?)
    }
}

fn header(name: &str, size: u64) -> Result<Header, Error> {
    if name.is_empty() {
        return Err(Error::parse("file name", name));
    }

    let mut header = Header::new_gnu();
    header
        .set_path(name)
        .map_err(|_| Error::parse("file name", name))?;
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(OffsetDateTime::now_utc().unix_timestamp().max(0) as u64);
    header.set_cksum();
    Ok(header)
}

#[derive(Debug, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Decompresses a `.tar.zst` package into its regular file entries.
///
/// Reads the stream to its end so the zstd checksum is always verified.
pub fn unpack<R: Read>(reader: R) -> Result<Vec<Entry>, Error> {
    let mut archive = Archive::new(Decoder::new(reader)?);
    let mut entries: Vec<Entry> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();

        if entry.header().entry_type() != EntryType::Regular {
            debug!("Skipping {:?} entry {}", entry.header().entry_type(), name);
            continue;
        }

        let size = entry.size();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        if data.len() as u64 != size {
            return Err(Error::ArchiveError("truncated entry"));
        }

        entries.push(Entry { name, data });
    }

    std::io::copy(&mut archive.into_inner(), &mut std::io::sink())?;
    Ok(entries)
}
