use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use trisa_protocol::codec::{read_frame, write_frame};
use trisa_protocol::{SecureEnvelope, StreamFrame, StreamReply, StreamStatus};

use crate::error::TransportError;

/// Bidirectional envelope stream seen by the `TransferStream` handler.
#[async_trait]
pub trait EnvelopeStream: Send {
    /// Next inbound envelope; `Ok(None)` once the client closed its half.
    async fn recv(&mut self) -> Result<Option<SecureEnvelope>, TransportError>;

    async fn send(&mut self, envelope: SecureEnvelope) -> Result<(), TransportError>;
}

/// [`EnvelopeStream`] over a framed byte stream.
///
/// A client `Cancel` frame fires `cancel` so the handler observes the
/// cancellation the same way as a server-side abort.
pub struct FramedEnvelopeStream<R, W> {
    reader: R,
    writer: W,
    cancel: CancellationToken,
}

impl<R, W> FramedEnvelopeStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, cancel: CancellationToken) -> Self {
        Self { reader, writer, cancel }
    }

    /// Writes the terminal status frame and closes the write half.
    pub async fn finish(&mut self, status: &StreamStatus) -> io::Result<()> {
        write_frame(&mut self.writer, &StreamReply::Closed(status.clone())).await?;
        self.writer.shutdown().await
    }
}

#[async_trait]
impl<R, W> EnvelopeStream for FramedEnvelopeStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<SecureEnvelope>, TransportError> {
        match read_frame::<StreamFrame, _>(&mut self.reader).await? {
            Some(StreamFrame::Envelope(envelope)) => Ok(Some(envelope)),
            Some(StreamFrame::CloseSend) => Ok(None),
            Some(StreamFrame::Cancel) => {
                self.cancel.cancel();
                Err(TransportError::Cancelled)
            }
            None => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed without close-send",
            ))),
        }
    }

    /// Gives up with [`TransportError::Cancelled`] once the stream is
    /// cancelled, even if the peer stopped reading.
    async fn send(&mut self, envelope: SecureEnvelope) -> Result<(), TransportError> {
        let reply = StreamReply::Envelope(envelope);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            written = write_frame(&mut self.writer, &reply) => Ok(written?),
        }
    }
}
