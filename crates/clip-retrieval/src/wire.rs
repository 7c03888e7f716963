use bytes::BytesMut;
use clip_proto::{check_length, parse_length, RetrievalRequest, LENGTH_PREFIX_BYTES, READ_CHUNK_BYTES};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{RetrievalError, RetrievedImage};

// Start small; a hostile prefix must not reserve memory it never sends.
const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub max_message: usize,
    pub read_timeout: Option<Duration>,
}

enum Chunk {
    Bytes(usize),
    Closed,
    Stalled,
}

async fn read_chunk<R: AsyncRead + Unpin>(
    r: &mut R,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> io::Result<Chunk> {
    let res = match timeout {
        Some(t) => match tokio::time::timeout(t, r.read(buf)).await {
            Ok(res) => res,
            Err(_) => return Ok(Chunk::Stalled),
        },
        None => r.read(buf).await,
    };
    match res {
        Ok(0) => Ok(Chunk::Closed),
        Ok(n) => Ok(Chunk::Bytes(n)),
        Err(e) if is_disconnect(&e) => Ok(Chunk::Closed),
        Err(e) => Err(e),
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::UnexpectedEof
    )
}

pub(crate) async fn send_request<W: AsyncWrite + Unpin>(w: &mut W, req: &RetrievalRequest) -> io::Result<()> {
    w.write_all(&req.encode()).await?;
    w.flush().await
}

/// Read up to `count` length-prefixed images.
///
/// The stream ending before a prefix finishes the request early with what was
/// received. Ending (or stalling) inside a payload keeps the short blob and stops.
pub(crate) async fn receive_images<R: AsyncRead + Unpin>(
    r: &mut R,
    count: u32,
    limits: Limits,
) -> Result<Vec<RetrievedImage>, RetrievalError> {
    let mut images = Vec::with_capacity(count.min(64) as usize);
    let mut chunk = [0u8; READ_CHUNK_BYTES];

    for index in 0..count {
        let mut raw = [0u8; LENGTH_PREFIX_BYTES];
        let mut got = 0;
        while got < LENGTH_PREFIX_BYTES {
            match read_chunk(r, &mut raw[got..], limits.read_timeout)
                .await
                .map_err(|source| RetrievalError::Receive { index, source })?
            {
                Chunk::Bytes(n) => got += n,
                Chunk::Closed | Chunk::Stalled => break,
            }
        }
        if got < LENGTH_PREFIX_BYTES {
            debug!("retrieval: server stopped after {} of {} images", index, count);
            return Ok(images);
        }

        let declared = parse_length(raw)?;
        let declared = check_length(declared, limits.max_message).map_err(|_| RetrievalError::MessageTooLarge {
            index,
            declared,
            max: limits.max_message,
        })?;

        let mut buf = BytesMut::with_capacity(declared.min(INITIAL_CAPACITY));
        let mut cut = None;
        while buf.len() < declared {
            let want = (declared - buf.len()).min(READ_CHUNK_BYTES);
            match read_chunk(r, &mut chunk[..want], limits.read_timeout)
                .await
                .map_err(|source| RetrievalError::Receive { index, source })?
            {
                Chunk::Bytes(n) => buf.extend_from_slice(&chunk[..n]),
                Chunk::Closed => {
                    cut = Some("closed");
                    break;
                }
                Chunk::Stalled => {
                    cut = Some("stalled");
                    break;
                }
            }
        }

        let bytes = buf.freeze();
        if let Some(why) = cut {
            warn!(
                "retrieval: image {} truncated, stream {} after {}/{} bytes",
                index,
                why,
                bytes.len(),
                declared
            );
            images.push(RetrievedImage { bytes, declared_len: declared });
            return Ok(images);
        }
        images.push(RetrievedImage { bytes, declared_len: declared });
    }
    Ok(images)
}
