use preset_proto::protocol::{Command, Frame, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

/// A bound connection to the daemon.  The daemon counts it as an attached
/// client until it is dropped.
pub struct DaemonConnection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
}

impl DaemonConnection {
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| anyhow::anyhow!("cannot reach daemon at {}: {}", address, e))?;
        Ok(Self {
            stream,
            read_buffer: Vec::with_capacity(4096),
        })
    }

    pub async fn send_command(&mut self, cmd: Command) -> anyhow::Result<()> {
        let encoded = Message::Command(cmd).encode()?;
        self.stream.write_all(&encoded).await?;
        Ok(())
    }

    /// Next whole message, or `None` once the daemon closes the connection.
    pub async fn next_message(&mut self) -> anyhow::Result<Option<Message>> {
        let mut buf = [0u8; 4096];
        loop {
            match Message::next_frame(&self.read_buffer) {
                Frame::Message(msg, consumed) => {
                    self.read_buffer.drain(..consumed);
                    return Ok(Some(msg));
                }
                Frame::Malformed(consumed, err) => {
                    self.read_buffer.drain(..consumed);
                    warn!("skipping malformed frame from daemon: {}", err);
                    continue;
                }
                Frame::Oversized(len) => {
                    anyhow::bail!("daemon sent a {} byte frame, over the limit", len)
                }
                Frame::Incomplete => {}
            }

            let n = self
                .stream
                .read(&mut buf)
                .await
                .map_err(|e| anyhow::anyhow!("Read error: {}", e))?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buffer.extend_from_slice(&buf[..n]);
        }
    }
}
