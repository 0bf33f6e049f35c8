use std::io::{self, ErrorKind};

use rmp_serde::{from_slice, Serializer};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body either side will accept.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 4;

pub fn encode_frame<T: Serialize>(msg: &T) -> io::Result<Vec<u8>> {
    // Serialize straight into the output after a placeholder length prefix.
    let mut framed = Vec::with_capacity(512);
    framed.extend_from_slice(&[0u8; HEADER_LEN]);
    msg.serialize(&mut Serializer::new(&mut framed))
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    let payload_len = framed.len() - HEADER_LEN;
    if payload_len > MAX_FRAME_LEN {
        return Err(io::Error::new(ErrorKind::InvalidData, "frame too large"));
    }
    let len = u32::try_from(payload_len)
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "frame too large"))?;
    framed[..HEADER_LEN].copy_from_slice(&len.to_be_bytes());
    Ok(framed)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> io::Result<T> {
    if bytes.len() < HEADER_LEN {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "missing frame header"));
    }
    let len = frame_len(&bytes[..HEADER_LEN])?;
    if bytes.len() < HEADER_LEN + len {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "incomplete frame"));
    }
    let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
    from_slice(payload).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the connection
/// cleanly before the first header byte.
pub async fn read_frame<T, R>(reader: &mut R) -> io::Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated frame header"));
        }
        filled += read;
    }
    let len = frame_len(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    from_slice(&payload).map(Some).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

pub async fn write_frame<T, W>(writer: &mut W, msg: &T) -> io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let framed = encode_frame(msg)?;
    writer.write_all(&framed).await?;
    writer.flush().await
}

fn frame_len(header: &[u8]) -> io::Result<usize> {
    let mut len_buf = [0u8; HEADER_LEN];
    len_buf.copy_from_slice(header);
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN),
        ));
    }
    Ok(len)
}
