//! Per-user push sessions.
//!
//! Each connected WebSocket registers a flume sender under its user number;
//! `send` is best-effort — a failed delivery drops the session so a dead
//! socket cannot accumulate a backlog. A reconnect simply replaces the
//! previous session.

use dashmap::DashMap;
use serde_json::Value;

use wk_core::types::UserNo;
use wk_game::CompletionEvent;

use crate::protocol::push_message;

#[derive(Default)]
pub struct PushChannel {
    sessions: DashMap<UserNo, flume::Sender<String>>,
}

impl PushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the receiving end for the socket's
    /// forward loop. An existing session for the user is replaced.
    pub fn connect(&self, user_no: UserNo) -> flume::Receiver<String> {
        let (tx, rx) = flume::unbounded();
        self.sessions.insert(user_no, tx);
        rx
    }

    pub fn disconnect(&self, user_no: UserNo) {
        self.sessions.remove(&user_no);
    }

    pub fn is_connected(&self, user_no: UserNo) -> bool {
        self.sessions.contains_key(&user_no)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Deliver one message to one user. Returns false (and drops the
    /// session) when the user is absent or their socket is gone.
    pub fn send(&self, user_no: UserNo, message: &Value) -> bool {
        let Some(tx) = self.sessions.get(&user_no).map(|e| e.value().clone()) else {
            return false;
        };
        if tx.send(message.to_string()).is_err() {
            self.sessions.remove(&user_no);
            return false;
        }
        true
    }

    /// Deliver a completion event as a typed push message.
    pub fn send_event(&self, event: &CompletionEvent) -> bool {
        self.send(
            event.user_no,
            &push_message(event.event, event.user_no, &event.data),
        )
    }

    pub fn broadcast(&self, message: &Value) {
        let text = message.to_string();
        self.sessions
            .retain(|_, tx| tx.send(text.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_reaches_connected_user() {
        let push = PushChannel::new();
        let rx = push.connect(1001);
        assert!(push.send(1001, &json!({"type": "building_complete"})));
        let raw = rx.try_recv().unwrap();
        assert!(raw.contains("building_complete"));
    }

    #[test]
    fn send_to_absent_user_is_dropped() {
        let push = PushChannel::new();
        assert!(!push.send(42, &json!({"type": "x"})));
    }

    #[test]
    fn dead_session_is_pruned_on_send() {
        let push = PushChannel::new();
        let rx = push.connect(7);
        drop(rx);
        assert!(!push.send(7, &json!({"type": "x"})));
        assert_eq!(push.session_count(), 0);
    }

    #[test]
    fn reconnect_replaces_session() {
        let push = PushChannel::new();
        let old = push.connect(7);
        let new = push.connect(7);
        assert_eq!(push.session_count(), 1);
        push.send(7, &json!({"type": "x"}));
        assert!(old.try_recv().is_err());
        assert!(new.try_recv().is_ok());
    }

    #[test]
    fn broadcast_hits_everyone() {
        let push = PushChannel::new();
        let a = push.connect(1);
        let b = push.connect(2);
        push.broadcast(&json!({"type": "notice"}));
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
    }
}
