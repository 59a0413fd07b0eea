//! One WebSocket to one relay
//!
//! A [`Connection`] is a pair of frame channels. For a real socket a
//! service task pumps frames between the socket and the channels; in test
//! mode the in-process mock relay drives the same channels directly.
//! Either side closing tears the whole connection down, which the owning
//! relay observes as a failed [`Connection::read_message`].

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::channel::{Channel, ChannelOptions, RecvError, TrySendError};
use crate::config::Config;
use crate::context::{CancelHandle, Context};
use crate::error::{Error, Result};
use crate::metrics::{Counter, Metrics};
use crate::mock;
use crate::nip11::RelayInformation;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Connection {
    url: String,
    send: Channel<String>,
    recv: Channel<String>,
    cancel: CancelHandle,
    test_mode: bool,
    served_info: Option<RelayInformation>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("test_mode", &self.test_mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Opens the transport for `url`. Cancelling `ctx` closes it.
    pub async fn open(
        url: &str,
        ctx: &Context,
        config: &Config,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let (ctx, cancel) = Context::with_cancel(ctx);
        let capacity = config.connection_queue_capacity;
        let send = Channel::with_options(
            capacity,
            ChannelOptions::from_config(config, Arc::clone(&metrics), "conn-send"),
        );
        let recv = Channel::with_options(
            capacity,
            ChannelOptions::from_config(config, Arc::clone(&metrics), "conn-recv"),
        );

        if config.test_mode {
            let served_info = mock::attach(url, &send, &recv)?;
            tracing::debug!(url, "attached to mock relay");
            return Ok(Self {
                url: url.to_string(),
                send,
                recv,
                cancel,
                test_mode: true,
                served_info,
            });
        }

        let handshake = tokio_tungstenite::connect_async(url);
        let (ws, _response) = tokio::time::timeout(config.connect_timeout, handshake)
            .await
            .map_err(|_| Error::ConnectionFailed(format!("{url}: handshake timed out")))?
            .map_err(|e| Error::ConnectionFailed(format!("{url}: {e}")))?;
        tracing::debug!(url, "websocket connected");

        tokio::spawn(service(
            ws,
            send.clone(),
            recv.clone(),
            ctx,
            url.to_string(),
            metrics,
        ));

        Ok(Self {
            url: url.to_string(),
            send,
            recv,
            cancel,
            test_mode: false,
            served_info: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }

    /// NIP-11 document handed over by an in-process mock at attach time
    pub fn served_info(&self) -> Option<&RelayInformation> {
        self.served_info.as_ref()
    }

    /// Queues one frame without waiting.
    pub fn write_message(&self, frame: String) -> Result<()> {
        match self.send.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(TrySendError::Closed(_)) => Err(Error::Disconnected),
        }
    }

    /// Next incoming frame; `Disconnected` once the connection is gone.
    pub async fn read_message(&self) -> Result<String> {
        self.recv.recv().await.map_err(|e| match e {
            RecvError::Closed => Error::Disconnected,
            RecvError::Cancelled => Error::Cancelled,
        })
    }

    pub fn send_channel(&self) -> &Channel<String> {
        &self.send
    }

    pub fn recv_channel(&self) -> &Channel<String> {
        &self.recv
    }

    pub fn is_closed(&self) -> bool {
        self.recv.is_closed()
    }

    /// Idempotent; buffered incoming frames stay readable.
    pub fn close(&self) {
        self.cancel.cancel();
        self.send.close();
        self.recv.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn service(
    ws: WsStream,
    send: Channel<String>,
    recv: Channel<String>,
    ctx: Context,
    url: String,
    metrics: Arc<Metrics>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outgoing = send.recv() => match outgoing {
                Ok(frame) => {
                    if let Err(err) = sink.send(Message::Text(frame.into())).await {
                        tracing::warn!(%url, %err, "websocket write failed");
                        break;
                    }
                }
                Err(_) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::debug!(%url, "dropping non-utf8 binary frame");
                            metrics.incr(Counter::InvalidFrames);
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(%url, ?frame, "relay closed websocket");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::warn!(%url, %err, "websocket read failed");
                        break;
                    }
                    None => break,
                };
                if recv.send_with_context(text, &ctx).await.is_err() {
                    break;
                }
            }
        }
    }
    send.close();
    recv.close();
    tracing::debug!(%url, "websocket service stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConfig, MockRelay};

    #[tokio::test]
    async fn test_mode_connection_talks_to_mock() {
        let mock = MockRelay::start("ws://conn-basic.mock", MockConfig::default()).unwrap();
        let config = Config::default().with_test_mode(true);
        let conn = Connection::open(
            "ws://conn-basic.mock",
            &Context::background(),
            &config,
            Metrics::global(),
        )
        .await
        .unwrap();
        assert!(conn.is_test_mode());

        conn.write_message(r#"["REQ","s",{"kinds":[1]}]"#.to_string())
            .unwrap();
        let reply = conn.read_message().await.unwrap();
        assert_eq!(reply, r#"["EOSE","s"]"#);
        assert_eq!(mock.stats().subscriptions_received, 1);

        conn.close();
        assert!(matches!(
            conn.write_message("[]".to_string()),
            Err(Error::Disconnected)
        ));
        assert!(matches!(conn.read_message().await, Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn missing_mock_fails_to_connect() {
        let config = Config::default().with_test_mode(true);
        let err = Connection::open(
            "ws://nobody-home.mock",
            &Context::background(),
            &config,
            Metrics::global(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn unreachable_socket_fails_fast() {
        let config = Config::default().with_connect_timeout(std::time::Duration::from_secs(2));
        let err = Connection::open(
            "ws://127.0.0.1:1",
            &Context::background(),
            &config,
            Metrics::global(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
    }
}
