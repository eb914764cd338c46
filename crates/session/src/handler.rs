//! Message handler trait.

use sowlink_message::Message;

use crate::error::HandlerError;

/// Receives messages routed to a subscription, query or command.
///
/// Handlers run on the session's receive task and must not block. A
/// handler that cannot take a message right now returns
/// [`HandlerError::StreamFull`] and is offered the same message again.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message.
    fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self(message)
    }
}
