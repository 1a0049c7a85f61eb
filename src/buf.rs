use std::io::Read;

/// Reads until `buf` is full or the reader hits EoF.
///
/// Returns `(eof, len)`, `eof` is only true once a read returned 0 bytes.
pub fn fill_buf<R: Read>(data: &mut R, buf: &mut [u8]) -> std::io::Result<(bool, usize)> {
    let mut buf_read = 0;

    while buf_read < buf.len() {
        match data.read(&mut buf[buf_read..]) {
            Ok(0) => return Ok((true, buf_read)),
            Ok(x) => buf_read += x,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
    }
    Ok((false, buf_read))
}

/// Feeds `reader` through `chunk` one chunk at a time, handing every filled
/// slice to `sink`. Returns the total amount of bytes read.
pub fn for_each_chunk<R, F, E>(reader: &mut R, chunk: &mut [u8], mut sink: F) -> Result<u64, E>
where
    R: Read,
    F: FnMut(&[u8]) -> Result<(), E>,
    E: From<std::io::Error>,
{
    let mut total: u64 = 0;

    loop {
        match fill_buf(reader, chunk)? {
            (true, 0) => break,
            (eof, len) => {
                sink(&chunk[..len])?;
                total += len as u64;

                if eof {
                    break;
                }
            }
        }
    }
    Ok(total)
}
