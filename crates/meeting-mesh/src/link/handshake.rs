//! Token handshake rules. Both ends run the same machine; politeness breaks
//! ties when both request at once.

use crate::protocol::HandshakeSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    New,
    Requesting,
    Acknowledging,
    Synchronized,
}

impl HandshakeState {
    /// The message a heartbeat re-sends while in this state.
    pub fn heartbeat(self) -> Option<HandshakeSignal> {
        match self {
            HandshakeState::New => None,
            HandshakeState::Requesting => Some(HandshakeSignal::Requesting),
            HandshakeState::Acknowledging => Some(HandshakeSignal::Acknowledging),
            HandshakeState::Synchronized => Some(HandshakeSignal::Synchronized),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAction {
    Ignore,
    /// Reset to a fresh session, adopt the peer's token and acknowledge it.
    Accept,
    /// The held token was confirmed; synchronize and open the control channel.
    Synchronize,
}

pub fn is_polite(local_id: &str, peer_id: &str) -> bool {
    local_id < peer_id
}

pub fn on_handshake(
    state: HandshakeState,
    polite: bool,
    held_token: &str,
    signal: HandshakeSignal,
    token: &str,
) -> HandshakeAction {
    let same_token = held_token == token;
    if state == HandshakeState::Synchronized && same_token {
        return HandshakeAction::Ignore;
    }
    match signal {
        HandshakeSignal::Requesting => {
            if polite || state != HandshakeState::Requesting {
                HandshakeAction::Accept
            } else {
                HandshakeAction::Ignore
            }
        }
        HandshakeSignal::Acknowledging => {
            if state == HandshakeState::Requesting && same_token {
                HandshakeAction::Synchronize
            } else {
                HandshakeAction::Ignore
            }
        }
        HandshakeSignal::Synchronized => {
            if state == HandshakeState::Acknowledging && same_token {
                HandshakeAction::Synchronize
            } else {
                HandshakeAction::Ignore
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HandshakeSignal as Sig;
    use HandshakeState as St;

    #[test]
    fn exactly_one_side_is_polite() {
        let ids = ["a", "b", "alice", "bob", "0", "Z", "zz"];
        for left in ids {
            for right in ids {
                if left == right {
                    continue;
                }
                assert!(is_polite(left, right) != is_polite(right, left));
            }
        }
    }

    #[test]
    fn impolite_requester_ignores_competing_request() {
        assert_eq!(
            on_handshake(St::Requesting, false, "mine", Sig::Requesting, "theirs"),
            HandshakeAction::Ignore
        );
        assert_eq!(
            on_handshake(St::Requesting, true, "mine", Sig::Requesting, "theirs"),
            HandshakeAction::Accept
        );
    }

    #[test]
    fn request_is_accepted_from_any_other_state() {
        for state in [St::New, St::Acknowledging, St::Synchronized] {
            assert_eq!(
                on_handshake(state, false, "mine", Sig::Requesting, "theirs"),
                HandshakeAction::Accept,
                "{state:?}"
            );
        }
    }

    #[test]
    fn synchronized_with_same_token_ignores_everything() {
        for signal in [Sig::Requesting, Sig::Acknowledging, Sig::Synchronized] {
            assert_eq!(
                on_handshake(St::Synchronized, true, "tok", signal, "tok"),
                HandshakeAction::Ignore
            );
        }
    }

    #[test]
    fn confirmations_require_held_token() {
        assert_eq!(
            on_handshake(St::Requesting, false, "tok", Sig::Acknowledging, "tok"),
            HandshakeAction::Synchronize
        );
        assert_eq!(
            on_handshake(St::Requesting, false, "tok", Sig::Acknowledging, "old"),
            HandshakeAction::Ignore
        );
        assert_eq!(
            on_handshake(St::Acknowledging, true, "tok", Sig::Synchronized, "tok"),
            HandshakeAction::Synchronize
        );
        assert_eq!(
            on_handshake(St::New, true, "tok", Sig::Synchronized, "tok"),
            HandshakeAction::Ignore
        );
    }

    struct Side {
        state: HandshakeState,
        token: String,
        polite: bool,
    }

    impl Side {
        fn connect(&mut self) -> (Sig, String) {
            self.state = St::Requesting;
            (Sig::Requesting, self.token.clone())
        }

        fn receive(&mut self, signal: Sig, token: &str) -> Option<(Sig, String)> {
            match on_handshake(self.state, self.polite, &self.token, signal, token) {
                HandshakeAction::Ignore => None,
                HandshakeAction::Accept => {
                    self.token = token.to_string();
                    self.state = St::Acknowledging;
                    Some((Sig::Acknowledging, self.token.clone()))
                }
                HandshakeAction::Synchronize => {
                    self.state = St::Synchronized;
                    Some((Sig::Synchronized, self.token.clone()))
                }
            }
        }
    }

    #[test]
    fn simultaneous_requests_settle_on_impolite_token() {
        let mut a = Side {
            state: St::New,
            token: "tokenA".into(),
            polite: is_polite("a", "b"),
        };
        let mut b = Side {
            state: St::New,
            token: "tokenB".into(),
            polite: is_polite("b", "a"),
        };
        let from_a = a.connect();
        let from_b = b.connect();

        assert_eq!(b.receive(from_a.0, &from_a.1), None);
        let ack = a.receive(from_b.0, &from_b.1).unwrap();
        assert_eq!(a.state, St::Acknowledging);
        assert_eq!(a.token, "tokenB");

        let sync = b.receive(ack.0, &ack.1).unwrap();
        assert_eq!(b.state, St::Synchronized);
        assert_eq!(a.receive(sync.0, &sync.1).map(|(s, _)| s), Some(Sig::Synchronized));
        assert_eq!(a.state, St::Synchronized);
        assert_eq!(a.token, b.token);
        assert_eq!(b.token, "tokenB");
    }
}
