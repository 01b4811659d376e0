//! Per-connection state: the peer id and the one room membership a
//! connection can hold at a time.

use crate::error::RoomError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unjoined,
    Joined { room_id: String },
    Terminated,
}

/// A single signaling connection's state machine. `PeerSession` does not
/// itself hold the socket write-half (the Dispatcher owns that, keyed by
/// the same connection); it tracks only the join state, so transport,
/// produce, and consume requests can be rejected before ever reaching the
/// room actor.
#[derive(Debug, Clone)]
pub struct PeerSession {
    peer_id: String,
    state: SessionState,
}

impl PeerSession {
    pub fn new(peer_id: String) -> Self {
        Self {
            peer_id,
            state: SessionState::Unjoined,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn room_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Joined { room_id } => Some(room_id),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, SessionState::Terminated)
    }

    /// UNJOINED →(joinRoom)→ JOINED. Joining a second room from the same
    /// connection without first disconnecting is a `PreconditionFailed`: one
    /// room membership per peer.
    pub fn join(&mut self, room_id: String) -> Result<(), RoomError> {
        match &self.state {
            SessionState::Unjoined => {
                self.state = SessionState::Joined { room_id };
                Ok(())
            }
            SessionState::Joined { room_id: existing } if existing == &room_id => Ok(()),
            SessionState::Joined { .. } => Err(RoomError::PreconditionFailed(
                "session already joined to a different room".into(),
            )),
            SessionState::Terminated => Err(RoomError::PreconditionFailed(
                "session is terminated".into(),
            )),
        }
    }

    /// Only in JOINED does the dispatcher forward transport, produce, and
    /// consume requests.
    pub fn require_joined(&self) -> Result<&str, RoomError> {
        match &self.state {
            SessionState::Joined { room_id } => Ok(room_id),
            SessionState::Unjoined => Err(RoomError::PreconditionFailed(
                "peer has not joined a room".into(),
            )),
            SessionState::Terminated => Err(RoomError::PreconditionFailed(
                "session is terminated".into(),
            )),
        }
    }

    /// Any state →(disconnect/kick)→ TERMINATED.
    pub fn terminate(&mut self) {
        self.state = SessionState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unjoined_and_rejects_requests() {
        let session = PeerSession::new("A".into());
        assert_eq!(session.state(), &SessionState::Unjoined);
        assert!(session.require_joined().is_err());
    }

    #[test]
    fn join_then_allows_requests() {
        let mut session = PeerSession::new("A".into());
        session.join("r1".into()).unwrap();
        assert_eq!(session.require_joined().unwrap(), "r1");
    }

    #[test]
    fn repeated_join_to_same_room_is_idempotent() {
        let mut session = PeerSession::new("A".into());
        session.join("r1".into()).unwrap();
        session.join("r1".into()).unwrap();
        assert_eq!(session.room_id(), Some("r1"));
    }

    #[test]
    fn join_to_second_room_is_rejected() {
        let mut session = PeerSession::new("A".into());
        session.join("r1".into()).unwrap();
        assert!(session.join("r2".into()).is_err());
    }

    #[test]
    fn terminate_is_terminal() {
        let mut session = PeerSession::new("A".into());
        session.join("r1".into()).unwrap();
        session.terminate();
        assert!(session.is_terminated());
        assert!(session.require_joined().is_err());
        assert!(session.join("r1".into()).is_err());
    }
}
