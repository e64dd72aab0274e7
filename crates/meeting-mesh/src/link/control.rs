//! In-band control channel that takes signaling over from the relay.

use std::sync::Arc;

use tokio::time::Instant;

use super::LinkInner;
use crate::protocol::SignalMessage;
use crate::session::{ChannelEvent, ControlChannel, ControlChannelHandle, NativeSession};

fn same_channel(a: &Arc<dyn ControlChannel>, b: &Arc<dyn ControlChannel>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl LinkInner {
    pub(super) fn open_control_channel(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if st.destroyed || st.control_requested {
            return;
        }
        let Some(session) = st.session.clone() else {
            return;
        };
        st.control_requested = true;
        st.pristine = false;
        let generation = st.generation;
        let task = tokio::spawn(Arc::clone(self).run_control_channel(generation, session));
        st.session_tasks.push(task);
    }

    async fn run_control_channel(self: Arc<Self>, generation: u64, session: Arc<dyn NativeSession>) {
        let label = self.config.control_label.clone();
        let handle = match session
            .create_control_channel(&label, self.config.control_channel_id)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                if self.is_current(generation) {
                    tracing::warn!(
                        target = "mesh",
                        peer = %self.peer_id,
                        error = %err,
                        "failed to create control channel"
                    );
                    self.restart("control channel setup failed");
                }
                return;
            }
        };
        let ControlChannelHandle {
            channel,
            mut events,
        } = handle;

        let installed = {
            let mut st = self.state.lock();
            if st.destroyed || st.generation != generation || st.control.is_some() {
                false
            } else {
                st.control = Some(Arc::clone(&channel));
                true
            }
        };
        if !installed {
            channel.close().await;
            return;
        }

        let deadline = tokio::time::sleep(self.config.control_open_timeout());
        tokio::pin!(deadline);
        let mut opened = false;

        loop {
            tokio::select! {
                _ = &mut deadline, if !opened => {
                    if channel.is_open() {
                        opened = true;
                        continue;
                    }
                    tracing::warn!(
                        target = "mesh",
                        peer = %self.peer_id,
                        "control channel did not open in time"
                    );
                    self.control_failed(generation, &channel, "open timeout");
                    return;
                }
                event = events.recv() => match event {
                    Some(ChannelEvent::Open) => {
                        opened = true;
                        tracing::debug!(target = "mesh", peer = %self.peer_id, "control channel open");
                    }
                    Some(ChannelEvent::Message(text)) => self.on_control_message(generation, &text),
                    Some(ChannelEvent::Error(reason)) => {
                        tracing::warn!(
                            target = "mesh",
                            peer = %self.peer_id,
                            reason = %reason,
                            "control channel error"
                        );
                        self.control_failed(generation, &channel, "channel error");
                        return;
                    }
                    Some(ChannelEvent::Closing) | Some(ChannelEvent::Closed) | None => {
                        self.control_failed(generation, &channel, "channel closed");
                        return;
                    }
                },
            }
        }
    }

    fn on_control_message(self: &Arc<Self>, generation: u64, text: &str) {
        let first = {
            let mut st = self.state.lock();
            if st.destroyed || st.generation != generation {
                return;
            }
            st.last_inbound = Instant::now();
            let first = !st.control_operational;
            st.control_operational = true;
            first
        };
        if first {
            tracing::info!(target = "mesh", peer = %self.peer_id, "control channel operational");
            self.apply_input_tracks(generation);
        }

        match SignalMessage::parse(text) {
            Ok(message) => {
                if let Err(err) = self.handle_signal(message) {
                    tracing::warn!(
                        target = "mesh",
                        peer = %self.peer_id,
                        error = %err,
                        "rejected control channel signal"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "mesh",
                    peer = %self.peer_id,
                    error = %err,
                    "dropping malformed control message"
                );
            }
        }
    }

    /// Detaches a failed channel and restarts the link if the channel still
    /// belongs to the current session.
    pub(super) fn control_failed(
        self: &Arc<Self>,
        generation: u64,
        channel: &Arc<dyn ControlChannel>,
        reason: &str,
    ) {
        let current = {
            let mut st = self.state.lock();
            if st
                .control
                .as_ref()
                .is_some_and(|installed| same_channel(installed, channel))
            {
                st.control = None;
                st.control_operational = false;
            }
            !st.destroyed && st.generation == generation
        };

        let closing = Arc::clone(channel);
        tokio::spawn(async move {
            closing.close().await;
        });

        if current {
            self.restart(reason);
        }
    }
}
