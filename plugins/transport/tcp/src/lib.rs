//! TCP transport speaking newline-delimited JSON to a broker bridge.
//!
//! Every connection starts with a one-line handshake naming the operation
//! (`subscribe` or `publish`) and the credentials. After a positive reply a
//! subscription receives one record per line, and a publisher writes
//! `{"topic": .., "value": ..}` frames that the bridge acknowledges one by one.

mod framing;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use vitals_api::{
    ConsumerSettings, ErrorKind, InboundStream, Message, OutboundPublisher, SecuritySettings,
    Transport, TransportError,
};

pub use framing::{FramedReader, LinesFraming};

/// Connects to `address` for each subscription or publisher it opens.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    address: String,
    security: SecuritySettings,
    framing: LinesFraming,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>, security: SecuritySettings) -> Self {
        Self {
            address: address.into(),
            security,
            framing: LinesFraming::default(),
        }
    }

    /// Reject inbound lines longer than `max` bytes (0 = unlimited).
    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.framing = LinesFraming::new(max);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn handshake<'a>(&'a self, op: Op, consumer: Option<(&'a str, &'a ConsumerSettings)>) -> Handshake<'a> {
        let sasl = self.security.protocol.uses_sasl();
        Handshake {
            op,
            topic: consumer.map(|(t, _)| t),
            group_id: consumer.map(|(_, s)| s.group_id.as_str()),
            auto_offset_reset: consumer.map(|(_, s)| s.auto_offset_reset.as_str()),
            enable_auto_commit: consumer.map(|(_, s)| s.enable_auto_commit),
            security_protocol: self.security.protocol.as_str(),
            sasl_mechanism: sasl.then_some(self.security.mechanism.as_str()),
            username: sasl.then_some(self.security.username.as_str()),
            password: sasl.then_some(self.security.password.as_str()),
        }
    }

    /// Open a connection and complete the handshake.
    async fn connect(&self, request: &Handshake<'_>) -> Result<Connection, TransportError> {
        if self.security.protocol.uses_tls() {
            return Err(TransportError::config(format!(
                "security protocol {} needs TLS, which this transport does not support",
                self.security.protocol
            )));
        }

        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| TransportError::from(e).with_context(format!("TCP connect to {}", self.address)))?;
        let (read, write) = stream.into_split();
        let mut conn = Connection {
            reader: FramedReader::new(read, self.framing),
            writer: write,
            framing: self.framing,
        };

        let line = serde_json::to_vec(request)?;
        conn.write_frame(&line).await?;

        let reply = conn.read_reply().await.map_err(|e| e.with_context("handshake"))?;
        if !reply.ok {
            let reason = reply.error.unwrap_or_else(|| "handshake rejected".to_string());
            return Err(TransportError::auth(reason));
        }

        tracing::info!(addr = %self.address, op = request.op.as_str(), "tcp transport connected");
        Ok(conn)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum Op {
    Subscribe,
    Publish,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Subscribe => "subscribe",
            Op::Publish => "publish",
        }
    }
}

#[derive(Serialize)]
struct Handshake<'a> {
    op: Op,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_offset_reset: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_auto_commit: Option<bool>,
    security_protocol: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sasl_mechanism: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    topic: &'a str,
    value: &'a RawValue,
}

struct Connection {
    reader: FramedReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    framing: LinesFraming,
}

impl Connection {
    async fn write_frame(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut buf = Vec::with_capacity(data.len() + 1);
        self.framing.encode(data, &mut buf);
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply, TransportError> {
        match self.reader.next_frame().await? {
            Some(line) => Ok(serde_json::from_slice(&line)?),
            None => Err(TransportError::closed("connection closed before reply")),
        }
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        settings: &'a ConsumerSettings,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn InboundStream>, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            let request = self.handshake(Op::Subscribe, Some((topic, settings)));
            let conn = self
                .connect(&request)
                .await
                .map_err(|e| e.with_context(format!("subscribe '{topic}'")))?;
            Ok(Box::new(TcpSubscription {
                topic: topic.to_string(),
                conn,
                position: 0,
                ended: false,
                closed: false,
            }) as Box<dyn InboundStream>)
        })
    }

    fn publisher(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn OutboundPublisher>, TransportError>> + Send + '_>>
    {
        Box::pin(async move {
            let request = self.handshake(Op::Publish, None);
            let conn = self
                .connect(&request)
                .await
                .map_err(|e| e.with_context("open publisher"))?;
            Ok(Box::new(TcpPublisher {
                conn,
                pending: Vec::new(),
                closed: false,
            }) as Box<dyn OutboundPublisher>)
        })
    }
}

// ---------------------------------------------------------------------------
// InboundStream: one record per line
// ---------------------------------------------------------------------------

pub struct TcpSubscription {
    topic: String,
    conn: Connection,
    /// Lines received on this connection so far.
    position: u64,
    /// Set once the connection has failed or reached EOF.
    ended: bool,
    closed: bool,
}

impl InboundStream for TcpSubscription {
    fn recv(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<Message, TransportError>>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Some(Err(TransportError::closed("subscription already closed")));
            }
            if self.ended {
                return None;
            }
            loop {
                match self.conn.reader.next_frame().await {
                    // Blank lines are keep-alives.
                    Ok(Some(line)) if line.iter().all(u8::is_ascii_whitespace) => continue,
                    Ok(Some(line)) => {
                        let message = Message::new(self.topic.as_str(), line).with_offset(self.position);
                        self.position += 1;
                        return Some(Ok(message));
                    }
                    Ok(None) => {
                        tracing::debug!(topic = %self.topic, "broker closed subscription");
                        self.ended = true;
                        return None;
                    }
                    // An oversized line is skipped; the connection is still usable.
                    Err(e) if e.kind() == ErrorKind::Format => {
                        return Some(Err(e.with_context(format!("read '{}'", self.topic))));
                    }
                    // Any other read failure leaves the socket unusable and
                    // nothing reconnects it.
                    Err(e) => {
                        self.ended = true;
                        return Some(Err(TransportError::closed(format!(
                            "read '{}': connection lost: {e}",
                            self.topic
                        ))));
                    }
                }
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::logic("subscription closed twice"));
            }
            self.closed = true;
            if self.ended {
                return Ok(());
            }
            self.conn.shutdown().await
        })
    }
}

// ---------------------------------------------------------------------------
// OutboundPublisher: frames written on flush, one ack per frame
// ---------------------------------------------------------------------------

pub struct TcpPublisher {
    conn: Connection,
    /// Encoded frames with the topic each one targets.
    pending: Vec<(String, Vec<u8>)>,
    closed: bool,
}

/// Fold line breaks to spaces. Outside string literals JSON whitespace is
/// insignificant, and inside them raw line breaks are not allowed, so the
/// value is unchanged.
fn single_line(payload: Vec<u8>) -> Vec<u8> {
    if !payload.iter().any(|&b| b == b'\n' || b == b'\r') {
        return payload;
    }
    payload
        .into_iter()
        .map(|b| if b == b'\n' || b == b'\r' { b' ' } else { b })
        .collect()
}

impl OutboundPublisher for TcpPublisher {
    fn send(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::closed("publisher already closed"));
            }
            let text = String::from_utf8(single_line(payload))?;
            let value = RawValue::from_string(text)?;
            let frame = serde_json::to_vec(&OutboundFrame {
                topic: &topic,
                value: &value,
            })?;
            self.pending.push((topic, frame));
            Ok(())
        })
    }

    fn flush(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let pending = std::mem::take(&mut self.pending);
            for (_, frame) in &pending {
                self.conn.write_frame(frame).await?;
            }
            // Read every ack so none is left on the socket for the next flush.
            let mut rejected = None;
            for (topic, _) in &pending {
                let reply = self
                    .conn
                    .read_reply()
                    .await
                    .map_err(|e| e.with_context(format!("ack for '{topic}'")))?;
                if !reply.ok && rejected.is_none() {
                    let reason = reply.error.unwrap_or_else(|| "negative ack".to_string());
                    rejected = Some(TransportError::io(format!(
                        "broker rejected record for '{topic}': {reason}"
                    )));
                }
            }
            rejected.map_or(Ok(()), Err)
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return Err(TransportError::logic("publisher closed twice"));
            }
            self.closed = true;
            let flushed = self.flush().await;
            let shut = self.conn.shutdown().await;
            flushed.and(shut)
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use vitals_api::{ErrorKind, OffsetReset, SecurityProtocol};

    use super::*;

    fn consumer() -> ConsumerSettings {
        ConsumerSettings {
            group_id: "vitals_health_group".into(),
            auto_offset_reset: OffsetReset::Earliest,
            enable_auto_commit: true,
        }
    }

    fn sasl(user: &str, password: &str) -> SecuritySettings {
        SecuritySettings {
            username: user.into(),
            password: password.into(),
            ..SecuritySettings::default()
        }
    }

    /// Accept one connection, record the handshake, answer it, then hand the
    /// socket to `after`.
    async fn bridge<F, Fut>(reply: Value, after: F) -> (String, tokio::task::JoinHandle<Value>)
    where
        F: FnOnce(BufReader<TcpStream>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            let hello: Value = serde_json::from_str(&line).unwrap();
            let mut out = serde_json::to_vec(&reply).unwrap();
            out.push(b'\n');
            socket.get_mut().write_all(&out).await.unwrap();
            after(socket).await;
            hello
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn subscribe_sends_credentials_and_yields_lines() {
        let (addr, bridge) = bridge(json!({"ok": true}), |mut socket| async move {
            socket
                .get_mut()
                .write_all(b"{\"heart_rate\":75}\n\n{\"heart_rate\":\"fast\"}\r\n")
                .await
                .unwrap();
        })
        .await;

        let transport = TcpTransport::new(addr, sasl("relay", "s3cret"));
        let settings = consumer();
        let mut sub = transport.subscribe("vitals_input", &settings).await.unwrap();

        let first = sub.recv().await.unwrap().unwrap();
        assert_eq!(first.topic, "vitals_input");
        assert_eq!(first.payload, b"{\"heart_rate\":75}");
        assert_eq!(first.offset, Some(0));
        let second = sub.recv().await.unwrap().unwrap();
        assert_eq!(second.payload, b"{\"heart_rate\":\"fast\"}");
        assert_eq!(second.offset, Some(1));
        assert!(sub.recv().await.is_none());
        sub.close().await.unwrap();

        let hello = bridge.await.unwrap();
        assert_eq!(hello["op"], "subscribe");
        assert_eq!(hello["topic"], "vitals_input");
        assert_eq!(hello["group_id"], "vitals_health_group");
        assert_eq!(hello["auto_offset_reset"], "earliest");
        assert_eq!(hello["enable_auto_commit"], true);
        assert_eq!(hello["security_protocol"], "SASL_PLAINTEXT");
        assert_eq!(hello["sasl_mechanism"], "PLAIN");
        assert_eq!(hello["username"], "relay");
        assert_eq!(hello["password"], "s3cret");
    }

    #[tokio::test]
    async fn plaintext_handshake_omits_credentials() {
        let (addr, bridge) = bridge(json!({"ok": true}), |_| async {}).await;
        let security = SecuritySettings {
            protocol: SecurityProtocol::Plaintext,
            ..sasl("relay", "s3cret")
        };
        let transport = TcpTransport::new(addr, security);
        let mut publisher = transport.publisher().await.unwrap();

        let hello = bridge.await.unwrap();
        assert_eq!(hello["op"], "publish");
        assert_eq!(hello["security_protocol"], "PLAINTEXT");
        assert!(hello.get("username").is_none());
        assert!(hello.get("password").is_none());
        assert!(hello.get("topic").is_none());
        let _ = publisher.close().await;
    }

    #[tokio::test]
    async fn rejected_handshake_is_auth_error() {
        let (addr, bridge) =
            bridge(json!({"ok": false, "error": "invalid credentials"}), |_| async {}).await;
        let transport = TcpTransport::new(addr, sasl("relay", "wrong"));
        let settings = consumer();

        let err = transport.subscribe("vitals_input", &settings).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.to_string().contains("invalid credentials"));
        assert!(err.to_string().contains("subscribe 'vitals_input'"));
        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::new(addr, SecuritySettings::default());
        let err = transport.publisher().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("TCP connect"));
    }

    #[tokio::test]
    async fn tls_protocols_are_unsupported() {
        let security = SecuritySettings {
            protocol: SecurityProtocol::SaslSsl,
            ..SecuritySettings::default()
        };
        let transport = TcpTransport::new("127.0.0.1:1", security);
        let err = transport.publisher().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("TLS"));
    }

    #[tokio::test]
    async fn flush_waits_for_ack_and_keeps_payload_bytes() {
        let (addr, bridge) = bridge(json!({"ok": true}), |mut socket| async move {
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            let frame: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(frame["topic"], "healthy_vitals");
            assert!(line.contains(r#""value":{"oxygen":98,  "body_temp":98.0}"#));
            socket.get_mut().write_all(b"{\"ok\":true}\n").await.unwrap();

            line.clear();
            socket.read_line(&mut line).await.unwrap();
            socket
                .get_mut()
                .write_all(b"{\"ok\":false,\"error\":\"topic is read-only\"}\n")
                .await
                .unwrap();
        })
        .await;

        let transport = TcpTransport::new(addr, SecuritySettings::default());
        let mut publisher = transport.publisher().await.unwrap();

        publisher
            .send("healthy_vitals", b"{\"oxygen\":98,\n \"body_temp\":98.0}".to_vec())
            .await
            .unwrap();
        publisher.flush().await.unwrap();

        publisher
            .send("unhealthy_vitals", b"{\"oxygen\":80}".to_vec())
            .await
            .unwrap();
        let err = publisher.flush().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("unhealthy_vitals"));
        assert!(err.to_string().contains("topic is read-only"));

        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn rejected_frame_does_not_leave_stale_acks() {
        let (addr, bridge) = bridge(json!({"ok": true}), |mut socket| async move {
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            socket.read_line(&mut line).await.unwrap();
            socket
                .get_mut()
                .write_all(b"{\"ok\":false,\"error\":\"quota exceeded\"}\n{\"ok\":true}\n")
                .await
                .unwrap();

            line.clear();
            socket.read_line(&mut line).await.unwrap();
            socket.get_mut().write_all(b"{\"ok\":true}\n").await.unwrap();
        })
        .await;

        let transport = TcpTransport::new(addr, SecuritySettings::default());
        let mut publisher = transport.publisher().await.unwrap();

        publisher.send("unhealthy_vitals", b"{\"oxygen\":80}".to_vec()).await.unwrap();
        publisher.send("healthy_vitals", b"{\"oxygen\":98}".to_vec()).await.unwrap();
        let err = publisher.flush().await.unwrap_err();
        assert!(err.to_string().contains("unhealthy_vitals"));
        assert!(err.to_string().contains("quota exceeded"));

        publisher.send("healthy_vitals", b"{\"oxygen\":99}".to_vec()).await.unwrap();
        publisher.flush().await.unwrap();

        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn reset_connection_ends_subscription_as_closed() {
        let (addr, bridge) = bridge(json!({"ok": true}), |socket| async move {
            // Let the client consume the handshake reply before the reset.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            #[allow(deprecated)]
            socket.get_ref().set_linger(Some(std::time::Duration::ZERO)).unwrap();
            drop(socket);
        })
        .await;

        let transport = TcpTransport::new(addr, SecuritySettings::default());
        let settings = consumer();
        let mut sub = transport.subscribe("vitals_input", &settings).await.unwrap();

        let err = sub.recv().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert!(err.to_string().contains("read 'vitals_input'"));
        assert!(sub.recv().await.is_none());
        sub.close().await.unwrap();

        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn send_rejects_non_json_payload() {
        let (addr, _bridge) = bridge(json!({"ok": true}), |_| async {}).await;
        let transport = TcpTransport::new(addr, SecuritySettings::default());
        let mut publisher = transport.publisher().await.unwrap();
        let err = publisher.send("healthy_vitals", b"not json".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
