//! TCP transport: accepting and dialling connections, and driving them.
//!
//! Every connection is driven by its own task, so its codec state is only ever touched from one place. The
//! driver reads frames into a [`ProtocolHandler`], writes whatever is queued through
//! [`Connection::send`](crate::Connection::send), and tears everything down when either side closes.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn, Instrument};

use crate::{
    config::ConnectionConfig,
    connection::{Connection, OutboundReceiver},
    handler::ProtocolHandler,
    listener::ProtocolListener,
    message::{MessageCodec, MultiplexerMessage},
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A TCP server handing every accepted connection to a shared listener.
pub struct Server<L> {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ConnectionConfig,
    handler: ProtocolHandler<L>,
}

impl<L: ProtocolListener> Server<L> {
    /// Binds a server to `addr`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: ConnectionConfig,
        listener: Arc<L>,
    ) -> io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        info!(%local_addr, "listening");
        Ok(Server {
            listener: tcp,
            local_addr,
            config,
            handler: ProtocolHandler::new(listener),
        })
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, spawning a task for each one.
    pub async fn run(self) {
        let Server {
            listener,
            local_addr,
            config,
            handler,
        } = self;

        let mut incoming = TcpListenerStream::new(listener);
        while let Some(accepted) = incoming.next().await {
            match accepted {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(config.nodelay()) {
                        debug!(error = %err, "failed to set TCP_NODELAY");
                    }
                    let peer_addr = stream.peer_addr().ok();
                    spawn_connection(stream, peer_addr, config, handler.clone());
                }
                Err(err) => {
                    warn!(%local_addr, error = %err, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Runs the server on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

impl<L: ProtocolListener> std::fmt::Debug for Server<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("config", &self.config)
            .field("handler", &self.handler)
            .finish()
    }
}

/// Dials `addr` and drives the resulting connection with `listener`.
pub async fn connect<L: ProtocolListener>(
    addr: impl ToSocketAddrs,
    config: ConnectionConfig,
    listener: Arc<L>,
) -> io::Result<Connection> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(config.nodelay())?;
    let peer_addr = stream.peer_addr().ok();
    Ok(spawn_connection(
        stream,
        peer_addr,
        config,
        ProtocolHandler::new(listener),
    ))
}

/// Drives an established byte stream as a connection on a new task.
///
/// The returned connection is open. Closing it flushes the messages already queued, then shuts the stream
/// down.
pub fn spawn_connection<S, L>(
    stream: S,
    peer_addr: Option<SocketAddr>,
    config: ConnectionConfig,
    handler: ProtocolHandler<L>,
) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    L: ProtocolListener,
{
    let (connection, outbound) = Connection::new(peer_addr, config.outbound_capacity());
    let span = tracing::debug_span!("connection", id = %connection.id());
    tokio::spawn(
        drive(
            stream,
            connection.clone(),
            outbound,
            config,
            handler,
        )
        .instrument(span),
    );
    connection
}

async fn drive<S, L>(
    stream: S,
    connection: Connection,
    mut outbound: OutboundReceiver,
    config: ConnectionConfig,
    handler: ProtocolHandler<L>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    L: ProtocolListener,
{
    handler.channel_open(&connection);
    handler.channel_connected(&connection);

    let codec = MessageCodec::from_config(&config);
    let (reader, writer) = tokio::io::split(stream);
    let mut inbound = FramedRead::new(reader, codec.clone());
    let mut sink = FramedWrite::new(writer, codec);

    let mut flush_queued = false;
    loop {
        tokio::select! {
            biased;
            _ = connection.closed() => {
                flush_queued = true;
                break;
            }
            frame = inbound.next() => match frame {
                Some(Ok(message)) => handler.message_received(message, &connection),
                Some(Err(err)) => {
                    handler.exception_caught(&connection, err.into());
                    break;
                }
                None => {
                    trace!("peer closed the stream");
                    break;
                }
            },
            Some(message) = outbound.recv() => {
                handler.write_requested(&message, &connection);
                // A peer that stops reading must not keep a closed connection alive.
                tokio::select! {
                    biased;
                    written = sink.send(message) => {
                        if let Err(err) = written {
                            handler.exception_caught(&connection, err.into());
                            break;
                        }
                    }
                    _ = connection.closed() => {
                        flush_queued = true;
                        break;
                    }
                }
            }
        }
    }

    connection.close();

    let shutdown = async {
        if flush_queued {
            while let Ok(message) = outbound.try_recv() {
                handler.write_requested(&message, &connection);
                if let Err(err) = sink.feed(message).await {
                    debug!(error = %err, "dropping queued messages");
                    break;
                }
            }
        }
        SinkExt::<MultiplexerMessage>::close(&mut sink).await
    };
    match tokio::time::timeout(config.close_timeout(), shutdown).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => trace!(error = %err, "failed to shut down stream"),
        Err(_) => debug!(
            timeout = ?config.close_timeout(),
            "peer is not reading, dropping unsent messages"
        ),
    }
    drop(sink);
    drop(inbound);

    handler.channel_disconnected(&connection);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::BytesMut;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Encoder;

    use super::*;

    #[derive(Default)]
    struct Log {
        events: Mutex<Vec<String>>,
    }

    impl Log {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl ProtocolListener for Log {
        fn message_received(&self, message: MultiplexerMessage, connection: &Connection) {
            self.push(format!("message {}", message.id));
            if message.kind == 666 {
                connection.close();
            }
        }

        fn channel_open(&self, _: &Connection) {
            self.push("open".to_string());
        }

        fn channel_connected(&self, _: &Connection) {
            self.push("connected".to_string());
        }

        fn channel_disconnected(&self, connection: &Connection) {
            self.push(format!("disconnected open={}", connection.is_open()));
        }
    }

    fn encode(messages: &[MultiplexerMessage]) -> BytesMut {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        for message in messages {
            codec.encode(message, &mut buf).unwrap();
        }
        buf
    }

    async fn wait_disconnected(log: &Log) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !log.events().iter().any(|e| e.starts_with("disconnected")) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection did not disconnect");
    }

    #[tokio::test]
    async fn events_follow_the_stream() {
        let log = Arc::new(Log::default());
        let (local, mut remote) = duplex(1024);
        let connection = spawn_connection(
            local,
            None,
            ConnectionConfig::default(),
            ProtocolHandler::new(log.clone()),
        );

        let bytes = encode(&[
            MultiplexerMessage::new(110, "a").with_id(1),
            MultiplexerMessage::new(110, "b").with_id(2),
        ]);
        remote.write_all(&bytes).await.unwrap();
        drop(remote);

        wait_disconnected(&log).await;
        assert!(!connection.is_open());
        assert_eq!(
            log.events(),
            [
                "open",
                "connected",
                "message 1",
                "message 2",
                "disconnected open=false"
            ]
        );
    }

    #[tokio::test]
    async fn queued_messages_are_flushed_on_close() {
        let log = Arc::new(Log::default());
        let (local, mut remote) = duplex(64 * 1024);
        let connection = spawn_connection(
            local,
            None,
            ConnectionConfig::default(),
            ProtocolHandler::new(log.clone()),
        );

        for id in 0..3 {
            connection
                .try_send(MultiplexerMessage::new(110, "queued").with_id(id))
                .unwrap();
        }
        connection.close();

        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        let expected = encode(&[
            MultiplexerMessage::new(110, "queued").with_id(0),
            MultiplexerMessage::new(110, "queued").with_id(1),
            MultiplexerMessage::new(110, "queued").with_id(2),
        ]);
        assert_eq!(received, expected.to_vec());
        wait_disconnected(&log).await;
    }

    #[tokio::test]
    async fn corrupted_frame_closes_the_connection() {
        let log = Arc::new(Log::default());
        let (local, mut remote) = duplex(1024);
        let connection = spawn_connection(
            local,
            None,
            ConnectionConfig::default(),
            ProtocolHandler::new(log.clone()),
        );

        let mut bytes = encode(&[MultiplexerMessage::new(110, "payload").with_id(1)]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        remote.write_all(&bytes).await.unwrap();

        wait_disconnected(&log).await;
        assert!(!connection.is_open());
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(!log.events().iter().any(|event| event.starts_with("message")));
    }

    #[tokio::test]
    async fn no_message_after_listener_closes() {
        let log = Arc::new(Log::default());
        let (local, mut remote) = duplex(1024);
        let connection = spawn_connection(
            local,
            None,
            ConnectionConfig::default(),
            ProtocolHandler::new(log.clone()),
        );

        let bytes = encode(&[
            MultiplexerMessage::new(666, "bye").with_id(1),
            MultiplexerMessage::new(110, "late").with_id(2),
        ]);
        remote.write_all(&bytes).await.unwrap();

        wait_disconnected(&log).await;
        assert!(!connection.is_open());
        let events = log.events();
        assert!(!events.contains(&"message 2".to_string()), "{events:?}");
        assert_eq!(
            events.iter().filter(|e| e.starts_with("disconnected")).count(),
            1
        );
    }

    fn stalled_peer_config() -> ConnectionConfig {
        ConnectionConfig::default().with_close_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn close_interrupts_a_blocked_write() {
        let log = Arc::new(Log::default());
        // The remote end is kept open but never read.
        let (local, _remote) = duplex(64);
        let connection = spawn_connection(
            local,
            None,
            stalled_peer_config(),
            ProtocolHandler::new(log.clone()),
        );

        for id in 0..4 {
            connection
                .try_send(MultiplexerMessage::new(110, vec![0u8; 4096]).with_id(id))
                .unwrap();
        }
        // Let the driver get stuck writing the first message.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.events().iter().all(|e| !e.starts_with("disconnected")));

        connection.close();
        wait_disconnected(&log).await;
        assert_eq!(log.events().last().unwrap(), "disconnected open=false");
    }

    #[tokio::test]
    async fn flush_after_close_gives_up_on_a_stalled_peer() {
        let log = Arc::new(Log::default());
        let (local, _remote) = duplex(64);
        let connection = spawn_connection(
            local,
            None,
            stalled_peer_config(),
            ProtocolHandler::new(log.clone()),
        );

        for id in 0..4 {
            connection
                .try_send(MultiplexerMessage::new(110, vec![0u8; 4096]).with_id(id))
                .unwrap();
        }
        connection.close();

        wait_disconnected(&log).await;
        assert_eq!(
            log.events()
                .iter()
                .filter(|e| e.starts_with("disconnected"))
                .count(),
            1
        );
    }
}
