use crate::session::{SenderId, SenderInfo, TrackKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackAction {
    /// Swap the track on a sender whose track is no longer wanted.
    Replace { sender: SenderId, track: usize },
    Add { track: usize },
    Remove { sender: SenderId },
}

/// Plans how to move the session's senders to `desired` (track id, kind).
/// Indices in the returned actions refer to positions in `desired`.
pub fn plan(senders: &[SenderInfo], desired: &[(String, TrackKind)]) -> Vec<TrackAction> {
    let wanted = |id: &str| desired.iter().any(|(want, _)| want == id);
    let mut stale: Vec<&SenderInfo> = senders
        .iter()
        .filter(|sender| matches!(&sender.track_id, Some(id) if !wanted(id.as_str())))
        .collect();

    let mut actions = Vec::new();
    for (index, (id, kind)) in desired.iter().enumerate() {
        let present = senders
            .iter()
            .any(|sender| sender.track_id.as_deref() == Some(id.as_str()));
        if present {
            continue;
        }
        match stale.iter().position(|sender| sender.kind == *kind) {
            Some(position) => {
                let sender = stale.remove(position);
                actions.push(TrackAction::Replace {
                    sender: sender.id,
                    track: index,
                });
            }
            None => actions.push(TrackAction::Add { track: index }),
        }
    }
    actions.extend(
        stale
            .into_iter()
            .map(|sender| TrackAction::Remove { sender: sender.id }),
    );
    actions
}
