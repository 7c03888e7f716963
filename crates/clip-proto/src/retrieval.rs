use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of every length / count field on the wire.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Upper bound for a single read call while draining an image payload.
pub const READ_CHUNK_BYTES: usize = 4096;

pub const DEFAULT_PORT: u16 = 8990;

/// Largest payload an `int32` length prefix can announce.
pub const MAX_WIRE_LEN: usize = i32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("negative length prefix on the wire: {0}")]
    NegativeLength(i32),
    #[error("declared length {declared} exceeds limit of {max} bytes")]
    TooLarge { declared: usize, max: usize },
    #[error("value {0} does not fit an int32 field")]
    Oversize(usize),
}

/// Host/port of the image server. One connection per request, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: DEFAULT_PORT }
    }
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// `host:port`, bracketing bare IPv6 literals.
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr())
    }
}

/// Decode a big-endian `int32` length prefix.
pub fn parse_length(raw: [u8; LENGTH_PREFIX_BYTES]) -> Result<usize, FrameError> {
    let v = i32::from_be_bytes(raw);
    if v < 0 {
        return Err(FrameError::NegativeLength(v));
    }
    Ok(v as usize)
}

/// Reject a declared length above `max` before anything is allocated for it.
pub fn check_length(declared: usize, max: usize) -> Result<usize, FrameError> {
    if declared > max {
        return Err(FrameError::TooLarge { declared, max });
    }
    Ok(declared)
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), FrameError> {
    if len > MAX_WIRE_LEN {
        return Err(FrameError::Oversize(len));
    }
    buf.put_i32(len as i32);
    Ok(())
}

/// Server -> client framing for one image.
pub fn encode_image(blob: &[u8]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + blob.len());
    put_len(&mut buf, blob.len())?;
    buf.put_slice(blob);
    Ok(buf.freeze())
}

/// One "find images like this one" request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalRequest {
    query_image: Bytes,
    requested_count: u32,
}

impl RetrievalRequest {
    pub fn new(query_image: impl Into<Bytes>, requested_count: u32) -> Result<Self, FrameError> {
        let query_image = query_image.into();
        if query_image.len() > MAX_WIRE_LEN {
            return Err(FrameError::Oversize(query_image.len()));
        }
        if requested_count as usize > MAX_WIRE_LEN {
            return Err(FrameError::Oversize(requested_count as usize));
        }
        Ok(Self { query_image, requested_count })
    }

    pub fn query_image(&self) -> &Bytes {
        &self.query_image
    }

    pub fn requested_count(&self) -> u32 {
        self.requested_count
    }

    /// Client -> server bytes: `len | image | count`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 * LENGTH_PREFIX_BYTES + self.query_image.len());
        // both fields were range-checked in `new`
        buf.put_i32(self.query_image.len() as i32);
        buf.put_slice(&self.query_image);
        buf.put_i32(self.requested_count as i32);
        buf.freeze()
    }

    /// Server side: pull a complete request off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the request is still
    /// incomplete.
    pub fn decode(buf: &mut BytesMut, max_query: usize) -> Result<Option<Self>, FrameError> {
        if buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let mut raw = [0u8; LENGTH_PREFIX_BYTES];
        raw.copy_from_slice(&buf[..LENGTH_PREFIX_BYTES]);
        let query_len = check_length(parse_length(raw)?, max_query)?;

        let total = 2 * LENGTH_PREFIX_BYTES + query_len;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_BYTES);
        let query_image = buf.split_to(query_len).freeze();
        let count = buf.get_i32();
        if count < 0 {
            return Err(FrameError::NegativeLength(count));
        }
        Ok(Some(Self { query_image, requested_count: count as u32 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_is_big_endian() {
        let req = RetrievalRequest::new(vec![0xAA, 0xBB, 0xCC], 10).unwrap();
        assert_eq!(
            req.encode().as_ref(),
            &[0, 0, 0, 3, 0xAA, 0xBB, 0xCC, 0, 0, 0, 10]
        );
    }

    #[test]
    fn empty_query_and_zero_count() {
        let req = RetrievalRequest::new(Bytes::new(), 0).unwrap();
        assert_eq!(req.encode().as_ref(), &[0u8; 8]);
    }

    #[test]
    fn count_must_fit_int32() {
        let err = RetrievalRequest::new(vec![1u8], u32::MAX).unwrap_err();
        assert_eq!(err, FrameError::Oversize(u32::MAX as usize));
    }

    #[test]
    fn decode_waits_for_complete_request() {
        let wire = RetrievalRequest::new(vec![7u8; 20], 3).unwrap().encode();

        let mut buf = BytesMut::from(&wire[..10]);
        assert_eq!(RetrievalRequest::decode(&mut buf, 1024).unwrap(), None);
        assert_eq!(buf.len(), 10);

        buf.extend_from_slice(&wire[10..]);
        buf.extend_from_slice(b"tail");
        let req = RetrievalRequest::decode(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(req.query_image().as_ref(), &[7u8; 20]);
        assert_eq!(req.requested_count(), 3);
        assert_eq!(buf.as_ref(), b"tail");
    }

    #[test]
    fn decode_rejects_bad_prefixes() {
        let mut neg = BytesMut::from(&(-5i32).to_be_bytes()[..]);
        assert_eq!(RetrievalRequest::decode(&mut neg, 1024), Err(FrameError::NegativeLength(-5)));

        let mut big = BytesMut::from(&2048i32.to_be_bytes()[..]);
        assert_eq!(
            RetrievalRequest::decode(&mut big, 1024),
            Err(FrameError::TooLarge { declared: 2048, max: 1024 })
        );
    }

    #[test]
    fn image_frame_prefix() {
        let framed = encode_image(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(parse_length(framed[..4].try_into().unwrap()).unwrap(), 5);
        assert_eq!(&framed[4..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn endpoint_addr() {
        assert_eq!(Endpoint::default().addr(), "127.0.0.1:8990");
        assert_eq!(Endpoint::new("::1", 9000).addr(), "[::1]:9000");
        assert_eq!(Endpoint::new("images.local", 1).to_string(), "images.local:1");
    }
}
