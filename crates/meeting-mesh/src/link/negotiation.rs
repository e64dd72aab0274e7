//! Perfect negotiation over the link's ordered job queue.

use std::sync::Arc;

use thiserror::Error;

use super::tracks::{plan, TrackAction};
use super::{LinkInner, Outgoing};
use crate::error::{NegotiationError, SessionError};
use crate::protocol::ContentKind;
use crate::session::{
    local_track_kind, IceCandidate, LocalTrack, NativeSession, SessionDescription, SignalingState,
};

/// Whether an inbound offer should be applied. `Ok(false)` means the local
/// offer wins the collision and the inbound one is ignored.
pub fn decide_offer(state: SignalingState, polite: bool) -> Result<bool, NegotiationError> {
    match state {
        SignalingState::Stable => Ok(true),
        SignalingState::HaveLocalOffer => Ok(polite),
        state => Err(NegotiationError::UnexpectedSignal {
            kind: "offer",
            state,
        }),
    }
}

pub fn decide_answer(state: SignalingState) -> Result<(), NegotiationError> {
    match state {
        SignalingState::HaveLocalOffer => Ok(()),
        state => Err(NegotiationError::UnexpectedSignal {
            kind: "answer",
            state,
        }),
    }
}

/// `Ok(false)` means the candidate belongs to a remote offer this side is
/// ignoring and is dropped.
pub fn decide_candidate(
    state: SignalingState,
    polite: bool,
    has_remote_description: bool,
) -> Result<bool, NegotiationError> {
    if has_remote_description {
        Ok(true)
    } else if !polite && state == SignalingState::HaveLocalOffer {
        Ok(false)
    } else {
        Err(NegotiationError::PrematureCandidate { state })
    }
}

#[derive(Debug, Error)]
enum StepError {
    #[error("malformed content: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("session was replaced")]
    Stale,
}

impl LinkInner {
    fn ensure_current(&self, generation: u64) -> Result<(), StepError> {
        if self.is_current(generation) {
            Ok(())
        } else {
            Err(StepError::Stale)
        }
    }

    pub(super) async fn negotiate(self: &Arc<Self>, generation: u64) {
        let session = {
            let mut st = self.state.lock();
            if st.destroyed || st.generation != generation {
                return;
            }
            st.negotiation_queued = false;
            st.session.clone()
        };
        let Some(session) = session else {
            return;
        };
        let state = session.signaling_state();
        if state != SignalingState::Stable {
            tracing::debug!(
                target = "mesh",
                peer = %self.peer_id,
                state = ?state,
                "skipping offer outside stable state"
            );
            return;
        }

        let offer = match session.set_local_description().await {
            Ok(offer) => offer,
            Err(err) => {
                if self.is_current(generation) {
                    tracing::warn!(
                        target = "mesh",
                        peer = %self.peer_id,
                        error = %err,
                        "failed to produce offer"
                    );
                    self.restart("error during negotiation");
                }
                return;
            }
        };
        if !self.is_current(generation) {
            return;
        }
        match serde_json::to_string(&offer) {
            Ok(content) => {
                tracing::debug!(target = "mesh", peer = %self.peer_id, "sending offer");
                self.send_signal(generation, Outgoing::Content(ContentKind::Offer, content));
            }
            Err(err) => {
                tracing::warn!(target = "mesh", error = %err, "failed to encode offer");
            }
        }
    }

    pub(super) async fn process_content(
        self: &Arc<Self>,
        generation: u64,
        kind: ContentKind,
        content: String,
    ) {
        let Some(session) = self.session_for(generation) else {
            return;
        };
        let result = match kind {
            ContentKind::Offer => self.accept_offer(generation, &session, &content).await,
            ContentKind::Answer => self.accept_answer(&session, &content).await,
            ContentKind::IceCandidate => {
                self.accept_candidate(generation, &session, &content).await
            }
        };

        match result {
            Ok(()) | Err(StepError::Stale) => {}
            Err(StepError::Malformed(err)) => {
                tracing::warn!(
                    target = "mesh",
                    peer = %self.peer_id,
                    kind = kind.as_str(),
                    error = %err,
                    "dropping malformed content"
                );
            }
            Err(StepError::Negotiation(err)) => {
                if self.is_current(generation) {
                    tracing::warn!(
                        target = "mesh",
                        peer = %self.peer_id,
                        error = %err,
                        "negotiation error"
                    );
                    self.restart("negotiation error");
                }
            }
            Err(StepError::Session(err)) => {
                if self.is_current(generation) {
                    tracing::warn!(
                        target = "mesh",
                        peer = %self.peer_id,
                        kind = kind.as_str(),
                        error = %err,
                        "error while processing signal"
                    );
                }
            }
        }
    }

    async fn accept_offer(
        self: &Arc<Self>,
        generation: u64,
        session: &Arc<dyn NativeSession>,
        content: &str,
    ) -> Result<(), StepError> {
        let description: SessionDescription = serde_json::from_str(content)?;
        if !decide_offer(session.signaling_state(), self.polite)? {
            tracing::debug!(target = "mesh", peer = %self.peer_id, "ignoring colliding offer");
            return Ok(());
        }
        session.set_remote_description(description).await?;
        self.ensure_current(generation)?;
        let answer = session.set_local_description().await?;
        self.ensure_current(generation)?;
        let content = serde_json::to_string(&answer)?;
        tracing::debug!(target = "mesh", peer = %self.peer_id, "sending answer");
        self.send_signal(generation, Outgoing::Content(ContentKind::Answer, content));
        Ok(())
    }

    async fn accept_answer(
        &self,
        session: &Arc<dyn NativeSession>,
        content: &str,
    ) -> Result<(), StepError> {
        let description: SessionDescription = serde_json::from_str(content)?;
        decide_answer(session.signaling_state())?;
        session.set_remote_description(description).await?;
        Ok(())
    }

    async fn accept_candidate(
        &self,
        generation: u64,
        session: &Arc<dyn NativeSession>,
        content: &str,
    ) -> Result<(), StepError> {
        let candidate: Option<IceCandidate> = serde_json::from_str(content)?;
        let has_remote = session.has_remote_description().await;
        self.ensure_current(generation)?;
        if decide_candidate(session.signaling_state(), self.polite, has_remote)? {
            session.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!(
                target = "mesh",
                peer = %self.peer_id,
                "ignoring candidate for a colliding offer"
            );
        }
        Ok(())
    }

    pub(super) async fn sync_tracks(&self, generation: u64, tracks: Vec<LocalTrack>) {
        let Some(session) = self.session_for(generation) else {
            return;
        };
        let senders = session.senders().await;
        let desired: Vec<_> = tracks
            .iter()
            .map(|track| (track.id().to_string(), local_track_kind(track)))
            .collect();

        for action in plan(&senders, &desired) {
            if !self.is_current(generation) {
                return;
            }
            let outcome = match action {
                TrackAction::Replace { sender, track } => {
                    let track = Arc::clone(&tracks[track]);
                    match session.replace_track(sender, Arc::clone(&track)).await {
                        Ok(()) => Ok(()),
                        Err(err) => {
                            tracing::debug!(
                                target = "mesh",
                                peer = %self.peer_id,
                                error = %err,
                                "replace failed, adding track instead"
                            );
                            session.add_track(track).await
                        }
                    }
                }
                TrackAction::Add { track } => session.add_track(Arc::clone(&tracks[track])).await,
                TrackAction::Remove { sender } => session.remove_sender(sender).await,
            };
            if let Err(err) = outcome {
                tracing::warn!(
                    target = "mesh",
                    peer = %self.peer_id,
                    error = %err,
                    "failed to update outbound track"
                );
            }
        }
    }
}
