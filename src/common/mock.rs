use bytes::Bytes;
use rand::distributions::{Alphanumeric, DistString};

use crate::net::mux::{MuxConfig, MuxSession};

pub type MockPayload = Bytes;

/// Size of the in-memory pipe between the two endpoints. Smaller than most
/// test frames so writers really do block on the reader.
const PIPE_BUF_SIZE: usize = 8 * 1024;

/// A connected (client, server) pair of sessions over an in-memory pipe.
pub fn session_pair(config: MuxConfig) -> (MuxSession, MuxSession) {
    let (client_io, server_io) = tokio::io::duplex(PIPE_BUF_SIZE);

    let client = MuxSession::client(client_io, config.clone());
    let server = MuxSession::server(server_io, config);

    (client, server)
}

pub fn payload(len: usize) -> MockPayload {
    let mut rng = rand::thread_rng();
    let s = Alphanumeric.sample_string(&mut rng, len);
    MockPayload::from(s)
}

#[cfg(test)]
pub mod tests {
    use crate::common::mock;
    use crate::net::mux::MuxConfig;
    use crate::net::{RecvChannel, SendChannel, Session};

    pub fn payload_len_iter() -> impl Iterator<Item = usize> {
        [1, 10, 100, 1000, 1500, 2000, 5000, 10_000, 100_000].into_iter()
    }

    #[tokio::test]
    async fn channel() {
        for len in payload_len_iter() {
            let (client, server) = mock::session_pair(MuxConfig::default());

            let sent = mock::payload(len);
            let to_send = sent.clone();
            let writer = tokio::spawn(async move {
                let mut send = server.open_uni().await.unwrap();
                send.write_all(&to_send).await.unwrap();
                send.finish().await.unwrap();
                server
            });

            let mut recv = client.accept_uni().await.unwrap();
            let mut received = Vec::new();
            let mut buf = vec![0u8; 4096];
            while let Some(n) = recv.read(&mut buf).await.unwrap() {
                received.extend_from_slice(&buf[..n]);
            }
            let _server = writer.await.unwrap();

            assert_eq!(received.len(), len);
            assert_eq!(&received[..], &sent[..]);
        }
    }
}
