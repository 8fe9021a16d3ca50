//! WebSocket adapter for [`Channel`]
// (c) 2024 Ross Younger

use futures_util::{stream::SplitSink, SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message as WsMessage, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Channel, Envelope, Message};

/// Messages buffered in each direction between the socket and the channel
const PUMP_DEPTH: usize = 16;

impl From<Message> for WsMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => WsMessage::text(text),
            Message::Binary(data) => WsMessage::binary(data),
        }
    }
}

/// Wraps an established WebSocket connection as a [`Channel`].
///
/// Two pump tasks are spawned: one reads frames from the socket, one writes queued messages to it.
/// Each send on the channel completes once the writer has handed its frame to the socket.
/// Protocol-level frames (ping, pong) are handled by the WebSocket library.
/// When the channel is closed, queued outbound messages are flushed and a Close frame is sent.
pub fn attach<S>(ws: WebSocketStream<S>) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<Envelope>(PUMP_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<Envelope>(PUMP_DEPTH);
    let shutdown = CancellationToken::new();

    let reader_shutdown = shutdown.clone();
    let _reader = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                () = reader_shutdown.cancelled() => break,
                frame = stream.next() => frame,
            };
            let msg = match frame {
                None => break,
                Some(Err(e)) => {
                    debug!("websocket read failed: {e}");
                    break;
                }
                Some(Ok(WsMessage::Text(text))) => Message::Text(text.as_str().to_owned()),
                Some(Ok(WsMessage::Binary(data))) => Message::Binary(data),
                Some(Ok(WsMessage::Close(reason))) => {
                    trace!("peer closed websocket: {reason:?}");
                    break;
                }
                Some(Ok(_)) => continue,
            };
            if in_tx.send(msg.into()).await.is_err() {
                // nobody is listening any more
                break;
            }
        }
    });

    let writer = tokio::spawn(write_pump(sink, out_rx, shutdown.clone()));
    Channel::from_parts(out_tx, in_rx, shutdown, Some(writer), true)
}

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut rx: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        // Queued messages take priority over shutdown, so close() flushes them
        let Envelope { msg, written } = tokio::select! {
            biased;
            envelope = rx.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
            () = shutdown.cancelled() => break,
        };
        if let Err(e) = sink.send(msg.into()).await {
            debug!("websocket write failed: {e}");
            return;
        }
        if let Some(written) = written {
            // the sender may have given up waiting
            let _ = written.send(());
        }
    }
    if let Err(e) = sink.close().await {
        trace!("websocket close: {e}");
    }
}
