use super::{Channel, ChannelReader, ChannelWriter, Connector};
use crate::error::AgentError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for `ws://` and `wss://` servers
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Channel, AgentError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| AgentError::Connection(format!("WebSocket connect to {} failed: {}", url, e)))?;
        debug!("WebSocket handshake complete: status={}", response.status());

        let (sink, stream) = stream.split();
        Ok(Channel::new(
            Box::new(WsReader { stream }),
            Box::new(WsWriter { sink }),
        ))
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl ChannelReader for WsReader {
    async fn next_text(&mut self) -> Option<Result<String, AgentError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => {
                    return Some(Err(AgentError::Connection(format!(
                        "WebSocket read failed: {}",
                        e
                    ))))
                }
            };

            match message {
                Message::Text(text) => return Some(Ok(text.as_str().to_owned())),
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => return Some(Ok(text.to_owned())),
                    Err(_) => warn!("Dropping non-UTF-8 binary frame: {} bytes", data.len()),
                },
                Message::Close(frame) => {
                    debug!("Received close frame: {:?}", frame);
                    return None;
                }
                // Control frames are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl ChannelWriter for WsWriter {
    async fn send_text(&mut self, text: String) -> Result<(), AgentError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| AgentError::Send(format!("WebSocket write failed: {}", e)))
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        self.sink
            .close()
            .await
            .map_err(|e| AgentError::Send(format!("WebSocket close failed: {}", e)))
    }
}
