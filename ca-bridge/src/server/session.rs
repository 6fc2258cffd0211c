//! CAM server connection handling.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dvbapi_protocol::{
    decode_request, decode_server_hello, encode_client_hello, skip_to_next_opcode, Request,
    ServerHello,
};

use crate::bridge::CaBridge;
use crate::error::BridgeError;
use crate::platform::{BridgeEvent, EventSink};

/// One connection from the CAM server.
pub struct Session<S> {
    /// Connection counter, used as log prefix.
    id: u64,
    stream: S,
    bridge: Arc<CaBridge>,
    read_buf: BytesMut,
    events_tx: EventSink,
    events_rx: mpsc::UnboundedReceiver<BridgeEvent>,
    cancel: CancellationToken,
    handshake_timeout: Duration,
    disconnect_reason: Option<&'static str>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: u64,
        stream: S,
        bridge: Arc<CaBridge>,
        cancel: CancellationToken,
        handshake_timeout: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            stream,
            bridge,
            read_buf: BytesMut::with_capacity(8192),
            events_tx,
            events_rx,
            cancel,
            handshake_timeout,
            disconnect_reason: None,
        }
    }

    /// Run the session until the peer disconnects, shutdown is requested or
    /// an error ends it. The bridge is attached only while this runs.
    pub async fn run(&mut self) -> Result<(), BridgeError> {
        let hello = self.handshake().await?;
        info!(
            "[Session {}] Connected to {} (protocol {})",
            self.id, hello.server_name, hello.protocol_version
        );

        let result = self.serve().await;
        self.cleanup();
        result
    }

    async fn handshake(&mut self) -> Result<ServerHello, BridgeError> {
        self.send_message(encode_client_hello()).await?;

        let cancel = self.cancel.clone();
        let timeout = self.handshake_timeout;
        tokio::select! {
            _ = cancel.cancelled() => Err(BridgeError::Handshake("shutdown requested".to_string())),
            result = tokio::time::timeout(timeout, self.read_server_hello()) => {
                result.map_err(|_| {
                    BridgeError::Handshake(format!("no server info within {:?}", timeout))
                })?
            }
        }
    }

    async fn read_server_hello(&mut self) -> Result<ServerHello, BridgeError> {
        loop {
            match decode_server_hello(&mut self.read_buf) {
                Ok(Some(hello)) => return Ok(hello),
                Ok(None) => {}
                Err(e) => return Err(BridgeError::Handshake(e.to_string())),
            }
            if self.fill_read_buf().await? == 0 {
                return Err(BridgeError::Handshake(
                    "connection closed before server info".to_string(),
                ));
            }
        }
    }

    async fn serve(&mut self) -> Result<(), BridgeError> {
        let initial = self.bridge.attach(self.events_tx.clone())?;
        self.send_all(initial).await?;

        let cancel = self.cancel.clone();
        loop {
            // Handle everything already buffered first
            while let Some(request) = self.next_request() {
                let out = self.bridge.dispatch(request)?;
                self.send_all(out).await?;
            }

            let mut tmp_buf = [0u8; 4096];
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.disconnect_reason = Some("shutdown");
                    break;
                }

                Some(event) = self.events_rx.recv() => {
                    trace!("[Session {}] Event: {:?}", self.id, event);
                    let out = self.bridge.handle_event(event)?;
                    self.send_all(out).await?;
                }

                result = self.stream.read(&mut tmp_buf) => {
                    let n = result?;
                    if n == 0 {
                        self.disconnect_reason = Some("peer_disconnect");
                        break;
                    }
                    self.read_buf.extend_from_slice(&tmp_buf[..n]);
                }
            }
        }
        Ok(())
    }

    /// Decode the next buffered request, skipping over unknown opcodes.
    fn next_request(&mut self) -> Option<Request> {
        loop {
            match decode_request(&mut self.read_buf) {
                Ok(request) => {
                    if let Some(request) = &request {
                        debug!("[Session {}] Received: {:?}", self.id, request);
                    }
                    return request;
                }
                // Only an unknown opcode fails to decode.
                Err(e) => {
                    let skipped = skip_to_next_opcode(&mut self.read_buf);
                    warn!("[Session {}] {}, skipped {} bytes", self.id, e, skipped);
                }
            }
        }
    }

    async fn fill_read_buf(&mut self) -> std::io::Result<usize> {
        let mut tmp_buf = [0u8; 4096];
        let n = self.stream.read(&mut tmp_buf).await?;
        self.read_buf.extend_from_slice(&tmp_buf[..n]);
        Ok(n)
    }

    async fn send_all(&mut self, messages: Vec<Bytes>) -> std::io::Result<()> {
        for message in messages {
            self.send_message(message).await?;
        }
        Ok(())
    }

    async fn send_message(&mut self, message: Bytes) -> std::io::Result<()> {
        trace!(
            "[Session {}] Sending {} bytes: {:02X?}",
            self.id,
            message.len(),
            &message[..message.len().min(16)]
        );
        self.stream.write_all(&message).await?;
        self.stream.flush().await
    }

    fn cleanup(&mut self) {
        self.bridge.detach();
        // Drop events queued by collaborators before the detach.
        while self.events_rx.try_recv().is_ok() {}
        info!(
            "[Session {}] Detached ({})",
            self.id,
            self.disconnect_reason.unwrap_or("error")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::{Call, MockPlatform};
    use crate::bridge::{BridgeConfig, ProfileKey};
    use crate::platform::SectionTag;
    use dvbapi_protocol::{
        encode_ca_pmt, encode_request, encode_server_hello, psi, ListManagement,
        PMT_FILTER_INDEX,
    };
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    struct Harness {
        mock: Arc<MockPlatform>,
        cancel: CancellationToken,
        peer: DuplexStream,
        task: JoinHandle<Result<(), BridgeError>>,
    }

    fn start(timeout: Duration) -> Harness {
        let mock = MockPlatform::new();
        mock.set_bank(ProfileKey::main(0), 0);
        let bridge = CaBridge::new(BridgeConfig::default(), mock.clone(), mock.clone()).unwrap();
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let mut session = Session::new(1, local, Arc::new(bridge), cancel.clone(), timeout);
        let task = tokio::spawn(async move { session.run().await });
        Harness {
            mock,
            cancel,
            peer,
            task,
        }
    }

    async fn handshake(peer: &mut DuplexStream) {
        let expected = encode_client_hello();
        let mut hello = vec![0u8; expected.len()];
        peer.read_exact(&mut hello).await.unwrap();
        assert_eq!(hello, expected.to_vec());
        let reply = encode_server_hello(&ServerHello {
            protocol_version: 2,
            server_name: "test-server".to_string(),
        });
        peer.write_all(&reply).await.unwrap();
    }

    async fn wait_for(mock: &MockPlatform, pred: impl Fn(&[Call]) -> bool) {
        for _ in 0..200 {
            if pred(&mock.calls()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached, calls: {:?}", mock.calls());
    }

    #[tokio::test]
    async fn test_pmt_flow_over_socket() {
        let mut h = start(Duration::from_secs(5));
        handshake(&mut h.peer).await;
        wait_for(&h.mock, |c| c.contains(&Call::SubscribeTune(ProfileKey::main(0)))).await;

        h.mock.emit(BridgeEvent::TuneSuccess {
            profile: ProfileKey::main(0),
            program_number: 0x1234,
            service_id: 3,
        });
        let pmt = Bytes::from(psi::build_pmt(0x1234, &[], &[(0x02, 0x100)]));
        h.mock.emit(BridgeEvent::Section {
            tag: SectionTag {
                slot: 0,
                filter_index: PMT_FILTER_INDEX,
            },
            data: pmt.clone(),
        });

        let expected = encode_ca_pmt(ListManagement::Only, &pmt, 0).unwrap();
        let mut received = vec![0u8; expected.len()];
        h.peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected.to_vec());

        drop(h.peer);
        h.task.await.unwrap().unwrap();
        assert!(h.mock.calls().contains(&Call::Disable(0)));
    }

    #[tokio::test]
    async fn test_resyncs_after_unknown_opcode() {
        let mut h = start(Duration::from_secs(5));
        handshake(&mut h.peer).await;
        wait_for(&h.mock, |c| c.contains(&Call::SubscribeTune(ProfileKey::main(0)))).await;

        h.mock.emit(BridgeEvent::TuneSuccess {
            profile: ProfileKey::main(0),
            program_number: 0x1234,
            service_id: 1,
        });
        wait_for(&h.mock, |c| c.contains(&Call::Enable(0))).await;

        let mut bytes = vec![0x12, 0x34, 0x56, 0x78, 0x00];
        bytes.extend_from_slice(&encode_request(&Request::SetDescrambler {
            slot: 0,
            index: 0,
            parity: 1,
            control_word: [7; 8],
        }));
        h.peer.write_all(&bytes).await.unwrap();

        let mut expected = [0u8; 16];
        expected[8..].copy_from_slice(&[7; 8]);
        wait_for(&h.mock, |c| c.contains(&Call::InstallCw(0, expected))).await;

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_mismatch_aborts() {
        let mut h = start(Duration::from_secs(5));
        let mut hello = vec![0u8; encode_client_hello().len()];
        h.peer.read_exact(&mut hello).await.unwrap();
        h.peer
            .write_all(&[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00])
            .await
            .unwrap();

        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Handshake(_)));
        assert!(!err.is_fatal());
        assert!(h.mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let h = start(Duration::from_millis(50));
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Handshake(_)));
        drop(h.peer);
    }

    #[tokio::test]
    async fn test_out_of_range_key_set_is_fatal() {
        let mut h = start(Duration::from_secs(5));
        handshake(&mut h.peer).await;
        h.peer
            .write_all(&encode_request(&Request::SetDescrambler {
                slot: 9,
                index: 0,
                parity: 0,
                control_word: [0; 8],
            }))
            .await
            .unwrap();

        let err = h.task.await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert!(h
            .mock
            .calls()
            .iter()
            .any(|c| matches!(c, Call::UnsubscribeTune(_))));
    }
}
