//! Matches replies to the calls waiting for them.
//!
//! # Routing
//!
//! The server answers commands strictly in the order it received them, so a
//! client that sends one command at a time needs nothing more than a FIFO
//! queue: the next reply belongs to the oldest pending call.
//!
//! When commands carry a request id the server echoes it, and a reply is
//! routed by id instead.  Both modes can coexist on one connection: a reply
//! whose id matches a keyed call goes to that call, any other reply goes to
//! the head of the FIFO queue.
//!
//! # Undecodable replies
//!
//! A reply frame that cannot be decoded still consumes the call it answers,
//! otherwise every later FIFO reply would land on the wrong caller.
//! [`Correlator::fail_next`] completes that call with
//! [`CallFailure::Malformed`].
//!
//! # Closing
//!
//! [`Correlator::fail_all`] completes every pending call with a
//! `connection_closed` error and refuses new registrations.  A call can
//! therefore never wait on a transport that is gone.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;
use tracing::{debug, warn};
use wcp_core::{ErrorKind, RequestId, Response, ScMessage, WcpError};

/// Why a call did not receive a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// The server answered with an `error` message, or the connection closed.
    Remote(WcpError),
    /// The reply frame arrived but could not be decoded.
    Malformed(String),
}

impl CallFailure {
    /// Protocol error kind, when the failure carries one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote(err) => Some(err.kind()),
            Self::Malformed(_) => None,
        }
    }
}

/// What a pending call eventually receives.
pub type Reply = Result<Response, CallFailure>;

/// Pending calls of one connection.
#[derive(Debug, Default)]
pub struct Correlator {
    fifo: VecDeque<oneshot::Sender<Reply>>,
    keyed: HashMap<RequestId, oneshot::Sender<Reply>>,
    closed: bool,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call and returns the receiver its reply will arrive on.
    ///
    /// Must be called in the same order the commands are written to the
    /// transport.
    ///
    /// # Errors
    ///
    /// Returns a `connection_closed` error once [`fail_all`](Self::fail_all)
    /// has run.
    pub fn register(&mut self, id: Option<RequestId>) -> Result<oneshot::Receiver<Reply>, WcpError> {
        if self.closed {
            return Err(WcpError::connection_closed().with_id(id));
        }
        let (tx, rx) = oneshot::channel();
        match id {
            Some(id) => {
                if self.keyed.insert(id, tx).is_some() {
                    warn!(id, "request id reused while still pending; earlier call dropped");
                }
            }
            None => self.fifo.push_back(tx),
        }
        Ok(rx)
    }

    /// Completes the call `message` answers.
    ///
    /// Returns the message back when it is not a reply (an event) or when no
    /// call is waiting for it.
    pub fn resolve(&mut self, message: ScMessage) -> Result<(), ScMessage> {
        if !matches!(message, ScMessage::Response { .. } | ScMessage::Error(_)) {
            return Err(message);
        }
        let id = message.request_id();
        let Some(waiter) = self.take_waiter(id) else {
            return Err(message);
        };

        let reply: Reply = match message {
            ScMessage::Error(err) => Err(CallFailure::Remote(err)),
            ScMessage::Response { response, .. } => Ok(response),
            other => return Err(other),
        };
        if waiter.send(reply).is_err() {
            // The caller gave up (timeout or dropped future).
            debug!(?id, "reply arrived for an abandoned call");
        }
        Ok(())
    }

    /// Completes the call an undecodable reply frame answered with
    /// [`CallFailure::Malformed`].
    ///
    /// `id` is whatever request id could still be read from the frame.
    /// Returns `false` when no call was waiting.
    pub fn fail_next(&mut self, id: Option<RequestId>, reason: impl Into<String>) -> bool {
        let Some(waiter) = self.take_waiter(id) else {
            return false;
        };
        if waiter.send(Err(CallFailure::Malformed(reason.into()))).is_err() {
            debug!(?id, "malformed reply arrived for an abandoned call");
        }
        true
    }

    fn take_waiter(&mut self, id: Option<RequestId>) -> Option<oneshot::Sender<Reply>> {
        id.and_then(|id| self.keyed.remove(&id))
            .or_else(|| self.fifo.pop_front())
    }

    /// Fails every pending call with `connection_closed` and refuses new
    /// registrations.  Returns the number of calls failed.
    pub fn fail_all(&mut self) -> usize {
        self.closed = true;
        let mut failed = 0;
        for tx in self.fifo.drain(..) {
            let _ = tx.send(Err(CallFailure::Remote(WcpError::connection_closed())));
            failed += 1;
        }
        for (id, tx) in self.keyed.drain() {
            let _ = tx.send(Err(CallFailure::Remote(
                WcpError::connection_closed().with_id(Some(id)),
            )));
            failed += 1;
        }
        failed
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.fifo.len() + self.keyed.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wcp_core::Event;

    fn list(names: &[&str]) -> Response {
        Response::GetItemList {
            item_list: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_fifo_replies_complete_calls_in_order() {
        // Arrange
        let mut c = Correlator::new();
        let first = c.register(None).unwrap();
        let second = c.register(None).unwrap();

        // Act
        c.resolve(ScMessage::response(list(&["a"]), None)).unwrap();
        c.resolve(ScMessage::response(Response::Ack, None)).unwrap();

        // Assert
        assert_eq!(first.await.unwrap(), Ok(list(&["a"])));
        assert_eq!(second.await.unwrap(), Ok(Response::Ack));
        assert_eq!(c.pending(), 0);
    }

    #[tokio::test]
    async fn test_keyed_replies_route_by_id_regardless_of_order() {
        // Arrange
        let mut c = Correlator::new();
        let seven = c.register(Some(7)).unwrap();
        let eight = c.register(Some(8)).unwrap();

        // Act: replies arrive in reverse order
        c.resolve(ScMessage::response(Response::Ack, Some(8))).unwrap();
        c.resolve(ScMessage::response(list(&["x"]), Some(7))).unwrap();

        // Assert
        assert_eq!(seven.await.unwrap(), Ok(list(&["x"])));
        assert_eq!(eight.await.unwrap(), Ok(Response::Ack));
    }

    #[tokio::test]
    async fn test_error_reply_completes_call_with_error() {
        let mut c = Correlator::new();
        let rx = c.register(None).unwrap();

        c.resolve(ScMessage::Error(WcpError::not_ready())).unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NotReady));
    }

    #[test]
    fn test_event_is_handed_back() {
        // Arrange
        let mut c = Correlator::new();
        let _rx = c.register(None).unwrap();
        let event = ScMessage::event(Event::WaveformsLoaded {
            source: "a.vcd".into(),
        });

        // Act
        let returned = c.resolve(event.clone());

        // Assert: the pending call is untouched
        assert_eq!(returned, Err(event));
        assert_eq!(c.pending(), 1);
    }

    #[test]
    fn test_unsolicited_reply_is_handed_back() {
        let mut c = Correlator::new();

        let returned = c.resolve(ScMessage::response(Response::Ack, Some(3)));

        assert_eq!(returned, Err(ScMessage::response(Response::Ack, Some(3))));
    }

    #[tokio::test]
    async fn test_unknown_id_falls_back_to_fifo_head() {
        // Arrange: an error for a frame the server could not read an id from
        let mut c = Correlator::new();
        let rx = c.register(None).unwrap();

        // Act
        c.resolve(ScMessage::Error(WcpError::invalid_arguments(None, "bad")))
            .unwrap();

        // Assert
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_fail_all_completes_every_call_with_connection_closed() {
        // Arrange
        let mut c = Correlator::new();
        let fifo = c.register(None).unwrap();
        let keyed = c.register(Some(1)).unwrap();

        // Act
        let failed = c.fail_all();

        // Assert
        assert_eq!(failed, 2);
        assert_eq!(
            fifo.await.unwrap().unwrap_err().kind(),
            Some(ErrorKind::ConnectionClosed)
        );
        let keyed_err = keyed.await.unwrap().unwrap_err();
        assert_eq!(
            keyed_err,
            CallFailure::Remote(WcpError::connection_closed().with_id(Some(1)))
        );
    }

    #[test]
    fn test_register_after_close_is_rejected() {
        let mut c = Correlator::new();
        c.fail_all();

        let err = c.register(None).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        assert!(c.is_closed());
    }

    #[test]
    fn test_reply_for_abandoned_call_is_consumed() {
        // Arrange: caller dropped its receiver (e.g. after a timeout)
        let mut c = Correlator::new();
        drop(c.register(None).unwrap());
        let next = c.register(None).unwrap();

        // Act: the first reply still belongs to the abandoned call
        c.resolve(ScMessage::response(Response::Ack, None)).unwrap();
        c.resolve(ScMessage::response(list(&["b"]), None)).unwrap();

        // Assert
        assert_eq!(
            tokio_test::block_on(next).unwrap(),
            Ok(list(&["b"]))
        );
    }

    #[tokio::test]
    async fn test_fail_next_consumes_fifo_head_so_later_replies_stay_aligned() {
        // Arrange
        let mut c = Correlator::new();
        let first = c.register(None).unwrap();
        let second = c.register(None).unwrap();

        // Act: the first reply could not be decoded, the second is fine
        let failed = c.fail_next(None, "missing field `item_list`");
        c.resolve(ScMessage::response(Response::Ack, None)).unwrap();

        // Assert
        assert!(failed);
        assert_eq!(
            first.await.unwrap(),
            Err(CallFailure::Malformed("missing field `item_list`".into()))
        );
        assert_eq!(second.await.unwrap(), Ok(Response::Ack));
    }

    #[tokio::test]
    async fn test_fail_next_prefers_keyed_call() {
        let mut c = Correlator::new();
        let fifo = c.register(None).unwrap();
        let keyed = c.register(Some(4)).unwrap();

        assert!(c.fail_next(Some(4), "bad"));

        assert_eq!(keyed.await.unwrap(), Err(CallFailure::Malformed("bad".into())));
        assert_eq!(c.pending(), 1);
        drop(fifo);
    }

    #[test]
    fn test_fail_next_without_pending_call_reports_false() {
        let mut c = Correlator::new();

        assert!(!c.fail_next(Some(2), "bad"));
    }
}
