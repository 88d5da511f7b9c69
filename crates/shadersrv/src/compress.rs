//! Deflate helpers. Every compressed blob on the wire and in the cache is a
//! 4-byte little-endian uncompressed-length header followed by a zlib stream.

use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::error::ServerError;

pub fn deflate(raw: &[u8]) -> Result<Vec<u8>, ServerError> {
    let mut out = Vec::with_capacity(raw.len() / 2 + 8);
    out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    let mut encoder = ZlibEncoder::new(out, Compression::default());
    encoder
        .write_all(raw)
        .map_err(|source| ServerError::Compress { source })?;
    encoder
        .finish()
        .map_err(|source| ServerError::Compress { source })
}

pub fn inflate(data: &[u8]) -> Result<Vec<u8>, ServerError> {
    if data.len() < 4 {
        return Err(ServerError::Decompress);
    }
    let expected = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let mut out = Vec::with_capacity(expected);
    let mut decoder = ZlibDecoder::new(&data[4..]);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| ServerError::Decompress)?;
    if out.len() != expected {
        return Err(ServerError::Decompress);
    }
    Ok(out)
}
