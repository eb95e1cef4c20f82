use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, ServerMessage};
use super::{Relay, RelayError, Subscription};
use crate::signal::SignalEnvelope;
use crate::types::Topic;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum WsCommand {
    Send(String),
    Subscribe {
        topic: Topic,
        tx: mpsc::UnboundedSender<SignalEnvelope>,
        reply: oneshot::Sender<()>,
    },
    /// A local subscription was dropped
    Release(Topic),
}

type Subscribers = HashMap<Topic, Vec<mpsc::UnboundedSender<SignalEnvelope>>>;

fn frame(msg: &ClientMessage) -> Result<Message, serde_json::Error> {
    Ok(Message::text(serde_json::to_string(msg)?))
}

/// Forget closed local subscribers of `topic`; once none is left, tell the
/// server. Returns false if the connection is gone.
async fn prune(sink: &mut SplitSink<WsStream, Message>, topics: &mut Subscribers, topic: &Topic) -> bool {
    let Some(subscribers) = topics.get_mut(topic) else {
        return true;
    };
    subscribers.retain(|tx| !tx.is_closed());
    if !subscribers.is_empty() {
        return true;
    }

    topics.remove(topic);
    debug!("Last local subscriber left {}, unsubscribing", topic);
    match frame(&ClientMessage::Unsubscribe { topic: topic.clone() }) {
        Ok(frame) => sink.send(frame).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode unsubscribe: {}", e);
            true
        }
    }
}

async fn ws_relay_actor(ws: WsStream, mut rx: mpsc::UnboundedReceiver<WsCommand>) {
    let (mut sink, mut stream) = ws.split();
    let mut topics = Subscribers::new();
    let mut awaiting_ack: HashMap<Topic, Vec<oneshot::Sender<()>>> = HashMap::new();

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    let _ = sink.close().await;
                    break;
                };
                match cmd {
                    WsCommand::Send(text) => {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            warn!("Relay send failed: {}", e);
                            break;
                        }
                    }
                    WsCommand::Subscribe { topic, tx, reply } => {
                        let first = !topics.contains_key(&topic);
                        topics.entry(topic.clone()).or_default().push(tx);

                        if first {
                            let frame = match frame(&ClientMessage::Subscribe { topic: topic.clone() }) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    warn!("Failed to encode subscribe for {}: {}", topic, e);
                                    continue;
                                }
                            };
                            if let Err(e) = sink.send(frame).await {
                                warn!("Relay subscribe failed: {}", e);
                                break;
                            }
                            awaiting_ack.entry(topic).or_default().push(reply);
                        } else if let Some(waiters) = awaiting_ack.get_mut(&topic) {
                            waiters.push(reply);
                        } else {
                            let _ = reply.send(());
                        }
                    }
                    WsCommand::Release(topic) => {
                        if !prune(&mut sink, &mut topics, &topic).await {
                            break;
                        }
                    }
                }
            }

            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Relay connection closed by server");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Relay WebSocket error: {}", e);
                        break;
                    }
                };

                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::Subscribed { topic }) => {
                        for waiter in awaiting_ack.remove(&topic).unwrap_or_default() {
                            let _ = waiter.send(());
                        }
                    }
                    Ok(ServerMessage::Broadcast { topic, envelope }) => {
                        let Some(envelope) = SignalEnvelope::from_value(envelope) else {
                            continue;
                        };
                        let Some(subscribers) = topics.get(&topic) else {
                            continue;
                        };
                        for tx in subscribers {
                            let _ = tx.send(envelope.clone());
                        }
                        if !prune(&mut sink, &mut topics, &topic).await {
                            break;
                        }
                    }
                    Ok(ServerMessage::Error { message }) => warn!("Relay server error: {}", message),
                    Err(e) => debug!("Unrecognized relay frame: {}", e),
                }
            }
        }
    }
}

/// `Relay` over one WebSocket connection to a [`RelayServer`](super::RelayServer).
#[derive(Clone)]
pub struct WsRelay {
    tx: mpsc::UnboundedSender<WsCommand>,
}

impl WsRelay {
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        info!("Connected to relay at {}", url);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(ws_relay_actor(ws, rx));
        Ok(Self { tx })
    }
}

#[async_trait]
impl Relay for WsRelay {
    async fn publish(&self, topic: &Topic, envelope: SignalEnvelope) -> Result<(), RelayError> {
        let msg = ClientMessage::Publish {
            topic: topic.clone(),
            envelope: serde_json::to_value(&envelope)?,
        };
        let text = serde_json::to_string(&msg)?;
        self.tx.send(WsCommand::Send(text)).map_err(|_| RelayError::Closed)
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch = tx.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WsCommand::Subscribe {
                topic: topic.clone(),
                tx,
                reply: reply_tx,
            })
            .map_err(|_| RelayError::Closed)?;
        reply_rx.await.map_err(|_| RelayError::Closed)?;

        let commands = self.tx.downgrade();
        let released = topic.clone();
        tokio::spawn(async move {
            watch.closed().await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(WsCommand::Release(released));
            }
        });
        Ok(Subscription::new(topic.clone(), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayClient, RelayServer};
    use crate::signal::SignalKind;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    async fn start_server() -> String {
        let server = RelayServer::bind_local().await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn envelopes_travel_through_the_server() {
        let url = start_server().await;
        let first: Arc<dyn Relay> = Arc::new(WsRelay::connect(&url).await.unwrap());
        let second: Arc<dyn Relay> = Arc::new(WsRelay::connect(&url).await.unwrap());
        let topic = Topic::from("matchmaking-signaling");

        let a1 = RelayClient::attach(first, topic.clone(), "a1".into()).await.unwrap();
        let b2 = RelayClient::attach(second, topic.clone(), "b2".into()).await.unwrap();
        let inbox = b2.set_handler();

        a1.publish(&"b2".into(), SignalKind::Ready, Value::Null).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.from.as_str(), "a1");
        assert_eq!(got.kind, SignalKind::Ready);
    }

    #[tokio::test]
    async fn malformed_envelopes_are_dropped() {
        let url = start_server().await;
        let relay = WsRelay::connect(&url).await.unwrap();
        let topic = Topic::from("t");
        let mut subscription = relay.subscribe(&topic).await.unwrap();

        let bogus = serde_json::to_string(&ClientMessage::Publish {
            topic: topic.clone(),
            envelope: serde_json::json!({"from": "x", "to": "y", "type": "unknown"}),
        })
        .unwrap();
        relay.tx.send(WsCommand::Send(bogus)).unwrap();
        relay
            .publish(&topic, SignalEnvelope::new("a1".into(), "b2".into(), SignalKind::Offer, Value::Null))
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.kind, SignalKind::Offer);
    }

    #[tokio::test]
    async fn second_local_subscriber_shares_the_topic() {
        let url = start_server().await;
        let relay = WsRelay::connect(&url).await.unwrap();
        let topic = Topic::from("t");
        let mut one = relay.subscribe(&topic).await.unwrap();
        let mut two = relay.subscribe(&topic).await.unwrap();

        relay
            .publish(&topic, SignalEnvelope::new("a1".into(), "b2".into(), SignalKind::Ready, Value::Null))
            .await
            .unwrap();

        for sub in [&mut one, &mut two] {
            let got = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
            assert!(got.is_some());
        }
    }

    /// Accepts one connection, acks subscribes and reports every client frame.
    async fn recording_server() -> (String, mpsc::UnboundedReceiver<ClientMessage>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let msg: ClientMessage = serde_json::from_str(&text).unwrap();
                if let ClientMessage::Subscribe { topic } = &msg {
                    let ack = ServerMessage::Subscribed { topic: topic.clone() };
                    ws.send(Message::text(serde_json::to_string(&ack).unwrap())).await.unwrap();
                }
                let _ = tx.send(msg);
            }
        });
        (url, rx)
    }

    #[tokio::test]
    async fn dropping_last_subscription_unsubscribes() {
        let (url, mut frames) = recording_server().await;
        let relay = WsRelay::connect(&url).await.unwrap();
        let topic = Topic::from("t");

        let one = relay.subscribe(&topic).await.unwrap();
        let two = relay.subscribe(&topic).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), frames.recv()).await.unwrap();
        assert!(matches!(first, Some(ClientMessage::Subscribe { .. })));

        drop(one);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(frames.try_recv().is_err());

        drop(two);
        let next = tokio::time::timeout(Duration::from_secs(5), frames.recv()).await.unwrap();
        assert!(matches!(next, Some(ClientMessage::Unsubscribe { topic }) if topic.as_str() == "t"));
    }

    #[tokio::test]
    async fn connect_to_missing_server_fails() {
        let err = WsRelay::connect("ws://127.0.0.1:1").await.err().unwrap();
        assert!(matches!(err, RelayError::Transport(_)));
    }
}
