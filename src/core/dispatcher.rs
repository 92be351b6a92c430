//! Command dispatch: channel -> device socket
//!
//! Change notifications are debounced per session; only when the window
//! closes without further changes is the command content read and sent.
//! Commands for a session without a writable socket stay in the channel.

use super::event::BrokerEvent;
use super::session::Session;
use super::timer::Scheduler;
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a debounce flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending in the channel
    Empty,
    /// Content written to the socket and the channel cleared
    Delivered(Bytes),
    /// Content present but no writable socket; left in place
    Undelivered,
    /// Channel could not be read
    Failed,
}

/// Open (or re-open) the debounce window after a change notification
pub fn on_change(session: &mut Session, scheduler: &mut Scheduler<BrokerEvent>, window: Duration) {
    let device = session.device();
    let task = scheduler.schedule(window, move |task| BrokerEvent::DebounceElapsed { device, task });
    session.restart_debounce(task);
}

/// Queue bytes on the session's socket. False if there is no writable socket.
pub fn deliver(session: &Session, data: Bytes) -> bool {
    match session.link() {
        Some(link) => link.send(data).is_ok(),
        None => false,
    }
}

/// Read the pending command and hand it to the socket
pub async fn flush(session: &mut Session) -> FlushOutcome {
    let device = session.device();

    let content = match session.channel_mut().read_command().await {
        Ok(content) => content,
        Err(e) => {
            warn!("Pico {}: reading command failed: {}", device, e);
            return FlushOutcome::Failed;
        }
    };

    if content.is_empty() {
        return FlushOutcome::Empty;
    }

    if !deliver(session, content.clone()) {
        debug!(
            "Pico {}: no writable socket, {} command bytes left in channel",
            device,
            content.len()
        );
        return FlushOutcome::Undelivered;
    }

    if let Err(e) = session.channel_mut().clear_command().await {
        warn!("Pico {}: clearing command failed: {}", device, e);
    }

    FlushOutcome::Delivered(content)
}
