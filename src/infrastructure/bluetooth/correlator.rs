//! Request/response correlation and notification routing.
//!
//! Both tables are keyed by opcode and owned by the driver task, so no
//! locking happens here.

use crate::infrastructure::bluetooth::error::{RingError, TimeoutKind};
use crate::infrastructure::bluetooth::protocol::{Frame, Packet};
use crate::infrastructure::bluetooth::timer::Timer;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// A complete response to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    /// The frame that completed the response.
    pub frame: Frame,
    /// Every payload of the response, ordered by packet index.
    pub packets: Vec<Packet>,
}

pub type ResponseSender = oneshot::Sender<Result<Response, RingError>>;

struct PendingRequest {
    id: u64,
    reply: ResponseSender,
    // dropping the request aborts its timeout
    _timeout: Timer,
}

/// At most one outstanding request per opcode.
#[derive(Default)]
pub struct Correlator {
    pending: HashMap<u8, PendingRequest>,
    next_id: u64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request.
    ///
    /// `arm_timeout` receives the request id so its expiry can be matched
    /// against the request it was armed for. A second request for an opcode
    /// that is already pending is rejected through `reply`.
    pub fn register(
        &mut self,
        opcode: u8,
        reply: ResponseSender,
        arm_timeout: impl FnOnce(u64) -> Timer,
    ) -> Result<u64, RingError> {
        if self.pending.contains_key(&opcode) {
            let err = RingError::RequestInFlight { opcode };
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        }

        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            opcode,
            PendingRequest {
                id,
                reply,
                _timeout: arm_timeout(id),
            },
        );
        trace!("request {} registered for opcode {:#04x}", id, opcode);
        Ok(id)
    }

    pub fn is_pending(&self, opcode: u8) -> bool {
        self.pending.contains_key(&opcode)
    }

    pub fn pending_id(&self, opcode: u8) -> Option<u64> {
        self.pending.get(&opcode).map(|request| request.id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn resolve(&mut self, response: Response) -> bool {
        match self.pending.remove(&response.opcode) {
            Some(request) => {
                debug!(
                    "request {} for opcode {:#04x} resolved ({} packets)",
                    request.id,
                    response.opcode,
                    response.packets.len()
                );
                let _ = request.reply.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Reject a request whose timeout fired.
    ///
    /// Ignored unless `id` is still the pending request for `opcode`.
    pub fn expire(&mut self, opcode: u8, id: u64) -> bool {
        if self.pending_id(opcode) != Some(id) {
            return false;
        }
        self.fail(opcode, RingError::ProtocolTimeout(TimeoutKind::Response { opcode }))
    }

    pub fn fail(&mut self, opcode: u8, err: RingError) -> bool {
        match self.pending.remove(&opcode) {
            Some(request) => {
                debug!("request {} for opcode {:#04x} failed: {}", request.id, opcode, err);
                let _ = request.reply.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding request. Returns the opcodes that were pending.
    pub fn reject_all(&mut self, err: RingError) -> Vec<u8> {
        self.pending
            .drain()
            .map(|(opcode, request)| {
                let _ = request.reply.send(Err(err.clone()));
                opcode
            })
            .collect()
    }
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("next_id", &self.next_id)
            .finish()
    }
}

pub type Listener = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Per-opcode notification listeners for unsolicited frames.
#[derive(Default)]
pub struct NotificationRouter {
    listeners: HashMap<u8, Vec<(ListenerId, Listener)>>,
    next_id: u64,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, opcode: u8, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.entry(opcode).or_default().push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, opcode: u8, id: ListenerId) -> bool {
        let Some(entries) = self.listeners.get_mut(&opcode) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.listeners.remove(&opcode);
        }
        removed
    }

    /// Invoke every listener registered for the frame's opcode.
    ///
    /// Returns how many listeners saw the frame.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        let Some(entries) = self.listeners.get(&frame.opcode()) else {
            return 0;
        };
        for (_, listener) in entries {
            listener(*frame);
        }
        entries.len()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

impl fmt::Debug for NotificationRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationRouter")
            .field(
                "listeners",
                &self
                    .listeners
                    .iter()
                    .map(|(opcode, entries)| (*opcode, entries.len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn response(opcode: u8) -> Response {
        let frame = Frame::encode(opcode, &[0x42]).unwrap();
        Response {
            opcode,
            frame,
            packets: vec![frame.payload()],
        }
    }

    fn idle_timer() -> Timer {
        let (tx, _rx) = mpsc::unbounded_channel::<()>();
        Timer::after(Duration::from_secs(3600), tx, ())
    }

    #[tokio::test]
    async fn test_resolve_delivers_response_once() {
        let mut correlator = Correlator::new();
        let (tx, rx) = oneshot::channel();
        correlator.register(0x03, tx, |_| idle_timer()).unwrap();
        assert!(correlator.is_pending(0x03));

        assert!(correlator.resolve(response(0x03)));
        assert!(!correlator.resolve(response(0x03)));
        assert_eq!(rx.await.unwrap().unwrap().packets[0][0], 0x42);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_second_request_for_same_opcode_rejected() {
        let mut correlator = Correlator::new();
        let (first_tx, _first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        let first = correlator.register(0x15, first_tx, |_| idle_timer()).unwrap();

        let err = correlator.register(0x15, second_tx, |_| idle_timer()).unwrap_err();
        assert_eq!(err, RingError::RequestInFlight { opcode: 0x15 });
        assert_eq!(second_rx.await.unwrap(), Err(RingError::RequestInFlight { opcode: 0x15 }));
        assert_eq!(correlator.pending_id(0x15), Some(first));
    }

    #[tokio::test]
    async fn test_stale_expiry_is_ignored() {
        let mut correlator = Correlator::new();
        let (tx, _rx) = oneshot::channel();
        let id = correlator.register(0x15, tx, |_| idle_timer()).unwrap();

        assert!(!correlator.expire(0x15, id + 1));
        assert!(correlator.is_pending(0x15));

        assert!(correlator.expire(0x15, id));
        assert!(!correlator.is_pending(0x15));
    }

    #[tokio::test]
    async fn test_expire_reports_timeout() {
        let mut correlator = Correlator::new();
        let (tx, rx) = oneshot::channel();
        let id = correlator.register(0x44, tx, |_| idle_timer()).unwrap();
        correlator.expire(0x44, id);
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err, RingError::ProtocolTimeout(TimeoutKind::Response { opcode: 0x44 }));
    }

    #[tokio::test]
    async fn test_reject_all() {
        let mut correlator = Correlator::new();
        let (a_tx, a_rx) = oneshot::channel();
        let (b_tx, b_rx) = oneshot::channel();
        correlator.register(0x03, a_tx, |_| idle_timer()).unwrap();
        correlator.register(0x15, b_tx, |_| idle_timer()).unwrap();

        let mut opcodes = correlator.reject_all(RingError::ManagerDestroyed);
        opcodes.sort();
        assert_eq!(opcodes, vec![0x03, 0x15]);
        assert_eq!(a_rx.await.unwrap(), Err(RingError::ManagerDestroyed));
        assert_eq!(b_rx.await.unwrap(), Err(RingError::ManagerDestroyed));
    }

    #[test]
    fn test_router_dispatch_and_unsubscribe() {
        let mut router = NotificationRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let first = router.subscribe(0x1E, Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = hits.clone();
        router.subscribe(0x1E, Arc::new(move |frame| {
            assert_eq!(frame.opcode(), 0x1E);
            counter.fetch_add(10, Ordering::SeqCst);
        }));

        let live = Frame::encode(0x1E, &[72]).unwrap();
        assert_eq!(router.dispatch(&live), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert!(router.unsubscribe(0x1E, first));
        assert!(!router.unsubscribe(0x1E, first));
        assert_eq!(router.dispatch(&live), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 21);

        let housekeeping = Frame::encode(0x73, &[]).unwrap();
        assert_eq!(router.dispatch(&housekeeping), 0);
    }
}
