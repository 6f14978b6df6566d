//! WebSocket transport (client side) built on tokio-tungstenite.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::auth::Credentials;
use crate::error::Result;

use super::transport::{drain_unsent, Connector, Outbound, Transport, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to `ws://` / `wss://` endpoints, attaching credentials to the
/// upgrade request.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url:         String,
    credentials: Credentials,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        WsConnector { url: url.into(), credentials }
    }

    pub fn url(&self) -> &str { &self.url }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Transport>> {
        let url = self.url.clone();
        let credentials = self.credentials.clone();
        Box::pin(async move { open(&url, &credentials).await })
    }
}

async fn open(url: &str, credentials: &Credentials) -> Result<Transport> {
    let mut req = url.into_client_request()?;
    credentials.apply(req.headers_mut())?;

    debug!("WS: connecting to {url}");
    let (ws, response) = connect_async(req).await?;
    info!("WS: connected to {url} ({})", response.status());

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(ws, out_rx, in_tx));
    Ok(Transport::new(out_tx, in_rx))
}

/// Shuttle frames between the socket and the transport channels until either
/// side goes away. Dropping the outgoing sender closes the socket cleanly.
/// When the socket goes first, messages not yet written are reported back
/// ahead of the final event.
async fn pump(
    ws:           WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Outbound>,
    incoming:     mpsc::UnboundedSender<TransportEvent>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut unsent = Vec::new();
    let end = loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(item) => {
                    if let Err(e) = sink.send(Message::Text(item.payload().to_owned())).await {
                        if let Outbound::Message(msg) = item {
                            unsent.push(msg);
                        }
                        break Some(TransportEvent::Error(e.to_string()));
                    }
                }
                None => {
                    debug!("WS: client closed the link");
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    break None;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if incoming.send(TransportEvent::Frame(text)).is_err() {
                        break None;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if incoming.send(TransportEvent::Frame(text)).is_err() {
                            break None;
                        }
                    }
                    Err(_) => warn!("WS: non-UTF-8 binary frame dropped"),
                },
                Some(Ok(Message::Ping(p))) => {
                    let _ = sink.send(Message::Pong(p)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    break Some(TransportEvent::Closed { code, reason });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(TransportEvent::Error(e.to_string())),
                None => {
                    break Some(TransportEvent::Closed {
                        code:   None,
                        reason: "stream ended".into(),
                    });
                }
            },
        }
    };

    let Some(end) = end else { return };
    unsent.extend(drain_unsent(&mut outgoing));
    if !unsent.is_empty() {
        warn!("WS: {} message(s) not written before the socket went away", unsent.len());
        let _ = incoming.send(TransportEvent::Unsent(unsent));
    }
    let _ = incoming.send(end);
}
