use anyhow::Context;
use station_proto::protocol::{Broadcast, Command, FrameError, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub struct DaemonConnection {
    stream: TcpStream,
    read_buffer: Vec<u8>,
}

impl DaemonConnection {
    pub async fn connect(address: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .with_context(|| format!("connecting to station-daemon at {}", address))?;
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

    /// Next broadcast from the daemon, or `None` once it hangs up.
    pub async fn next_broadcast(&mut self) -> anyhow::Result<Option<Broadcast>> {
        let mut buf = [0u8; 4096];
        loop {
            match Message::next_frame(&self.read_buffer) {
                Ok(Some((msg, consumed))) => {
                    self.read_buffer.drain(..consumed);
                    match msg {
                        Message::Broadcast(b) => return Ok(Some(b)),
                        Message::Command(cmd) => {
                            debug!("ignoring command from daemon: {:?}", cmd);
                            continue;
                        }
                    }
                }
                Ok(None) => {}
                Err(FrameError::Malformed { consumed, error }) => {
                    warn!("skipping undecodable frame from daemon: {}", error);
                    self.read_buffer.drain(..consumed);
                    continue;
                }
                Err(e @ FrameError::TooLarge(_)) => {
                    return Err(e).context("reading from station-daemon");
                }
            }

            let n = self
                .stream
                .read(&mut buf)
                .await
                .context("reading from station-daemon")?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buffer.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use station_proto::protocol::{StationState, PROTOCOL_VERSION};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reads_split_frames_and_sends_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = Message::Broadcast(Broadcast::Hello {
                protocol_version: PROTOCOL_VERSION,
                daemon_rev: 4,
                state: StationState {
                    rev: 4,
                    ..Default::default()
                },
            })
            .encode()
            .unwrap();
            let notice = Message::Broadcast(Broadcast::Notice {
                message: "Audio focus denied".into(),
            })
            .encode()
            .unwrap();
            // first frame split across two writes, second glued to its tail
            stream.write_all(&hello[..3]).await.unwrap();
            stream.flush().await.unwrap();
            let mut rest = hello[3..].to_vec();
            rest.extend_from_slice(&notice);
            stream.write_all(&rest).await.unwrap();

            let mut buf = vec![0u8; 256];
            let n = stream.read(&mut buf).await.unwrap();
            let (msg, _) = Message::decode(&buf[..n]).unwrap();
            matches!(msg, Message::Command(Command::Play))
        });

        let mut conn = DaemonConnection::connect(&addr).await.unwrap();
        assert!(matches!(
            conn.next_broadcast().await.unwrap(),
            Some(Broadcast::Hello { daemon_rev: 4, .. })
        ));
        assert!(matches!(
            conn.next_broadcast().await.unwrap(),
            Some(Broadcast::Notice { .. })
        ));
        conn.send_command(Command::Play).await.unwrap();
        assert!(server.await.unwrap());
        assert!(conn.next_broadcast().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let body = br#"{"broadcast":"Lyrics"}"#;
            let mut frames = (body.len() as u32).to_be_bytes().to_vec();
            frames.extend_from_slice(body);
            frames.extend(
                Message::Broadcast(Broadcast::Notice {
                    message: "Failed to load stream".into(),
                })
                .encode()
                .unwrap(),
            );
            stream.write_all(&frames).await.unwrap();
        });

        let mut conn = DaemonConnection::connect(&addr).await.unwrap();
        assert!(matches!(
            conn.next_broadcast().await.unwrap(),
            Some(Broadcast::Notice { message }) if message == "Failed to load stream"
        ));
    }
}
