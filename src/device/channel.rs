use std::sync::Arc;
use std::time::Duration;
use log::{debug, warn};
use tokio::time::timeout;

use crate::device::constants::BRIGHTNESS_PAYLOAD_LEN;
use crate::device::session::{lock_slot, Session, SessionSlot, SharedSlot};
use crate::device::transport::Link;
use crate::error::IoError;

pub fn encode_value(value: u16) -> [u8; BRIGHTNESS_PAYLOAD_LEN] {
    value.to_le_bytes()
}

pub fn decode_value(payload: &[u8]) -> Result<u16, IoError> {
    let bytes: [u8; BRIGHTNESS_PAYLOAD_LEN] = payload.try_into().map_err(|_| IoError::InvalidResponse {
        reason: format!("expected {} bytes, got {}", BRIGHTNESS_PAYLOAD_LEN, payload.len()),
    })?;
    Ok(u16::from_le_bytes(bytes))
}

/// Exchanges the 2 byte value of the control point of the open session.
///
/// One exchange at a time: a call made while another one is still in flight fails with
/// [`IoError::Busy`] instead of queueing.
pub struct CommandChannel<L: Link> {
    slot: SharedSlot<L>,
    deadline: Duration,
}

impl<L: Link> Clone for CommandChannel<L> {
    fn clone(&self) -> Self {
        CommandChannel {
            slot: self.slot.clone(),
            deadline: self.deadline,
        }
    }
}

impl<L: Link> CommandChannel<L> {
    pub(crate) fn new(slot: SharedSlot<L>, deadline: Duration) -> Self {
        CommandChannel { slot, deadline }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    fn session(&self) -> Result<Arc<Session<L>>, IoError> {
        match &*lock_slot(&self.slot) {
            SessionSlot::Connected(session) => Ok(session.clone()),
            _ => Err(IoError::NotConnected),
        }
    }

    pub async fn write(&self, value: u16) -> Result<(), IoError> {
        let session = self.session()?;
        let _exchange = session.exchange.try_lock().map_err(|_| IoError::Busy)?;
        if session.is_closed() {
            return Err(IoError::NotConnected);
        }

        debug!("Writing {} to the control point...", value);
        let payload = encode_value(value);
        match timeout(self.deadline, session.link().write(session.control_point(), &payload)).await {
            Err(_) => {
                warn!("Sending to the control point took too long");
                Err(IoError::Timeout { deadline: self.deadline })
            },
            Ok(Err(err)) => {
                warn!("Failed to send to the control point: {:?}", err);
                Err(err.into())
            },
            Ok(Ok(())) => Ok(()),
        }
    }

    pub async fn read(&self) -> Result<u16, IoError> {
        let session = self.session()?;
        let _exchange = session.exchange.try_lock().map_err(|_| IoError::Busy)?;
        if session.is_closed() {
            return Err(IoError::NotConnected);
        }

        debug!("Reading the control point...");
        match timeout(self.deadline, session.link().read(session.control_point())).await {
            Err(_) => {
                warn!("Reading the control point took too long");
                Err(IoError::Timeout { deadline: self.deadline })
            },
            Ok(Err(err)) => {
                warn!("Failed to read the control point: {:?}", err);
                Err(IoError::InvalidResponse { reason: err.to_string() })
            },
            Ok(Ok(payload)) => decode_value(&payload),
        }
    }
}
