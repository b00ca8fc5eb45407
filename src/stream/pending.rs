// src/stream/pending.rs

use std::collections::HashMap;
use tokio::sync::oneshot;

use super::errors::{Result, StreamError};
use super::message::{Request, RequestId, ResponseSlot};

/// Fired once the response for a pending call has been copied onto its slot.
pub type Completion = oneshot::Sender<()>;

/// An outbound request still waiting for its response.
#[derive(Debug)]
pub struct PendingCall {
    pub request: Request,
    pub slot: ResponseSlot,
    pub completion: Completion,
    /// How many times recovery has pushed this request again.
    pub resent: u32,
    /// Registration order within the owning table.
    seq: u64,
}

impl PendingCall {
    pub fn new(request: Request, slot: ResponseSlot, completion: Completion) -> Self {
        PendingCall {
            request,
            slot,
            completion,
            resent: 0,
            seq: 0,
        }
    }

    pub fn id(&self) -> &RequestId {
        self.request.id()
    }
}

/// Pending calls keyed by request id. Notifications never land here.
#[derive(Debug, Default)]
pub struct PendingCallTable {
    calls: HashMap<RequestId, PendingCall>,
    next_seq: u64,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects an id that is still pending; the existing entry is kept.
    pub fn register(&mut self, mut call: PendingCall) -> Result<()> {
        let id = call.id().clone();
        if self.calls.contains_key(&id) {
            return Err(StreamError::DuplicateRegistration(id));
        }
        call.seq = self.next_seq;
        self.next_seq += 1;
        self.calls.insert(id, call);
        Ok(())
    }

    pub fn take(&mut self, id: &RequestId) -> Option<PendingCall> {
        self.calls.remove(id)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Snapshot of the original requests in registration order. Collected up
    /// front, so later mutation of the table does not affect the returned
    /// sequence.
    pub fn entries(&self) -> impl Iterator<Item = Request> {
        let mut calls: Vec<&PendingCall> = self.calls.values().collect();
        calls.sort_by_key(|call| call.seq);
        let snapshot: Vec<Request> = calls.into_iter().map(|call| call.request.clone()).collect();
        snapshot.into_iter()
    }

    /// Bumps the resend counter of each id still pending and returns the
    /// highest counter among them. Ids resolved in the meantime are skipped.
    pub fn record_resent(&mut self, ids: &[RequestId]) -> u32 {
        ids.iter()
            .filter_map(|id| {
                self.calls.get_mut(id).map(|call| {
                    call.resent += 1;
                    call.resent
                })
            })
            .max()
            .unwrap_or(0)
    }

    pub fn resent_count(&self, id: &RequestId) -> Option<u32> {
        self.calls.get(id).map(|call| call.resent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: i64) -> (PendingCall, oneshot::Receiver<()>) {
        let request = Request::with_id(RequestId::from(id), "test", None);
        let slot = ResponseSlot::for_request(&request);
        let (tx, rx) = oneshot::channel();
        (PendingCall::new(request, slot, tx), rx)
    }

    #[test]
    fn test_register_and_take() {
        let mut table = PendingCallTable::new();
        let (call, _rx) = pending(1);
        table.register(call).unwrap();

        assert!(table.contains(&RequestId::from(1)));
        assert_eq!(table.len(), 1);

        let taken = table.take(&RequestId::from(1)).expect("entry should exist");
        assert_eq!(taken.id(), &RequestId::from(1));
        assert!(table.is_empty());
        assert!(table.take(&RequestId::from(1)).is_none());
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut table = PendingCallTable::new();
        let (first, _rx1) = pending(7);
        let (second, _rx2) = pending(7);

        table.register(first).unwrap();
        match table.register(second) {
            Err(StreamError::DuplicateRegistration(id)) => assert_eq!(id, RequestId::from(7)),
            other => panic!("expected duplicate registration, got {:?}", other),
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_entries_is_a_snapshot() {
        let mut table = PendingCallTable::new();
        let mut receivers = Vec::new();
        for id in 1..=3 {
            let (call, rx) = pending(id);
            receivers.push(rx);
            table.register(call).unwrap();
        }

        let entries = table.entries();
        table.take(&RequestId::from(2));
        assert_eq!(entries.count(), 3);

        // Restartable: a fresh call sees the current state.
        assert_eq!(table.entries().count(), 2);
    }

    #[test]
    fn test_entries_follow_registration_order() {
        let mut table = PendingCallTable::new();
        let mut receivers = Vec::new();
        let order = [42, 7, 19, 3, 88, 1, 56];
        for id in order {
            let (call, rx) = pending(id);
            receivers.push(rx);
            table.register(call).unwrap();
        }
        table.take(&RequestId::from(19));

        let ids: Vec<RequestId> = table.entries().map(|request| request.id().clone()).collect();
        let expected: Vec<RequestId> = [42, 7, 3, 88, 1, 56]
            .into_iter()
            .map(RequestId::from)
            .collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_record_resent_counts_per_entry() {
        let mut table = PendingCallTable::new();
        let (first, _rx1) = pending(1);
        let (second, _rx2) = pending(2);
        table.register(first).unwrap();
        table.register(second).unwrap();

        let both = [RequestId::from(1), RequestId::from(2)];
        assert_eq!(table.record_resent(&both), 1);
        assert_eq!(table.record_resent(&[RequestId::from(2), RequestId::from(9)]), 2);

        assert_eq!(table.resent_count(&RequestId::from(1)), Some(1));
        assert_eq!(table.resent_count(&RequestId::from(2)), Some(2));
        assert_eq!(table.resent_count(&RequestId::from(9)), None);

        let taken = table.take(&RequestId::from(2)).unwrap();
        assert_eq!(taken.resent, 2);
        assert_eq!(table.record_resent(&[]), 0);
    }
}
