//! Response relay: device socket -> channel

use super::session::Session;
use tracing::{debug, warn};

/// Write a device chunk to the session's channel. False if the write failed.
pub async fn forward(session: &mut Session, data: &[u8]) -> bool {
    let device = session.device();
    match session.channel_mut().write_response(data).await {
        Ok(()) => {
            debug!("Pico {}: relayed {} bytes", device, data.len());
            true
        }
        Err(e) => {
            warn!("Pico {}: response not recorded: {}", device, e);
            false
        }
    }
}
