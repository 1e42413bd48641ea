//! Chat sample built on `lanlink-net`.
//!
//! A chat line travels as a `Data` frame whose payload is a single
//! length-prefixed string.  The server side is a [`ChatRelay`]: every line a
//! client sends is forwarded to every *other* connected client.

use std::sync::{Arc, Weak};

use lanlink_core::{Frame, IncomingMessage, MessageKind, OutgoingMessage, ProtocolError};
use lanlink_net::{
    Client, MessageDispatcher, NetError, NetEvent, ReceivedMessage, Server, SubscriptionId,
};
use tracing::{debug, info};

/// Default chat endpoint.
pub const DEFAULT_CHAT_ADDR: &str = "127.0.0.1:6695";

/// Builds the frame for one chat line.
pub fn encode_line(text: &str) -> Result<Frame, ProtocolError> {
    let mut msg = OutgoingMessage::data();
    msg.write_str(text);
    msg.finish()
}

/// Reads a chat line back.  Returns `None` for non-`Data` frames.
pub fn decode_line(message: &mut IncomingMessage) -> Option<Result<String, ProtocolError>> {
    (message.kind() == MessageKind::Data).then(|| message.read_string())
}

/// Calls `on_line` for every chat line arriving on connections the client
/// opens from now on.
///
/// Register before [`Client::connect`]: the handler is installed when the
/// connection is added, ahead of its receive worker, so lines the server
/// sends right after accepting are not lost.
pub fn subscribe_lines<F>(client: &Client, on_line: F) -> SubscriptionId
where
    F: Fn(String) + Send + Sync + 'static,
{
    let on_line = Arc::new(on_line);
    client.events().subscribe(move |event| {
        if let NetEvent::ConnectionAdded(connection) = event {
            let on_line = Arc::clone(&on_line);
            connection.set_message_handler(Arc::new(move |mut received: ReceivedMessage| {
                match decode_line(&mut received.message) {
                    Some(Ok(text)) => on_line(text),
                    Some(Err(e)) => debug!("dropping malformed chat line: {e}"),
                    None => {}
                }
            }));
        }
    })
}

/// Relays chat lines between the clients of a [`Server`].
///
/// Messages from all connections are handled in arrival order on one
/// dispatcher thread.  Dropping the relay unsubscribes it and stops the
/// dispatcher.
pub struct ChatRelay {
    server: Arc<Server>,
    dispatcher: MessageDispatcher,
    subscription: SubscriptionId,
}

impl ChatRelay {
    /// Hooks the relay into `server`.  Connections accepted from now on are
    /// relayed; existing ones are left alone.
    pub fn attach(server: Arc<Server>) -> Result<Self, NetError> {
        let relay_target: Weak<Server> = Arc::downgrade(&server);
        let dispatcher = MessageDispatcher::new(move |message| {
            if let Some(server) = relay_target.upgrade() {
                relay(&server, message);
            }
        });
        dispatcher.start()?;

        let handler = dispatcher.message_handler();
        let subscription = server.events().subscribe(move |event| {
            if let NetEvent::ConnectionAdded(connection) = event {
                connection.set_message_handler(Arc::clone(&handler));
            }
        });

        Ok(Self {
            server,
            dispatcher,
            subscription,
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn pending(&self) -> usize {
        self.dispatcher.pending()
    }
}

impl Drop for ChatRelay {
    fn drop(&mut self) {
        self.server.events().unsubscribe(self.subscription);
        self.dispatcher.stop();
    }
}

fn relay(server: &Server, mut received: ReceivedMessage) {
    let sender = received.connection_id;
    let text = match decode_line(&mut received.message) {
        Some(Ok(text)) => text,
        Some(Err(e)) => {
            debug!("dropping malformed chat line from {sender}: {e}");
            return;
        }
        None => return,
    };
    info!("{sender}: {text}");
    match encode_line(&text) {
        Ok(frame) => server.send_to_all_except(&frame, sender),
        Err(e) => debug!("cannot re-encode chat line: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_encodes_as_data_string() {
        // Arrange / Act
        let frame = encode_line("hello").unwrap();

        // Assert
        assert_eq!(frame.kind(), MessageKind::Data);
        let mut incoming = frame.to_incoming();
        assert_eq!(decode_line(&mut incoming).unwrap().unwrap(), "hello");
    }

    #[test]
    fn test_probe_frames_are_not_chat_lines() {
        let mut probe = Frame::empty(MessageKind::IsAlive).to_incoming();
        assert!(decode_line(&mut probe).is_none());
    }

    #[test]
    fn test_truncated_line_is_an_error() {
        let mut incoming = IncomingMessage::new(MessageKind::Data, vec![10, 0, 0, 0, b'h']);
        assert!(decode_line(&mut incoming).unwrap().is_err());
    }
}
