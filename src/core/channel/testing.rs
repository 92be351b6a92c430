//! In-memory channel used by unit tests

use super::{ChannelError, ChannelKind, ChannelNotifier, ChannelProvider, ExternalChannel};
use crate::core::identity::DeviceNumber;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub command: Vec<u8>,
    /// Latest response only, like the file pair
    pub responses: Vec<u8>,
    pub destroyed: usize,
    pub fail_writes: bool,
}

#[derive(Debug)]
pub(crate) struct FakeChannel {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl ExternalChannel for FakeChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Files
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }

    async fn read_command(&mut self) -> Result<Bytes, ChannelError> {
        Ok(Bytes::copy_from_slice(&self.state.lock().command))
    }

    async fn clear_command(&mut self) -> Result<(), ChannelError> {
        self.state.lock().command.clear();
        Ok(())
    }

    async fn write_response(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(ChannelError::Pty("write refused".to_string()));
        }
        state.responses = data.to_vec();
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), ChannelError> {
        self.state.lock().destroyed += 1;
        Ok(())
    }
}

/// Hands out fake channels and keeps their state reachable per device
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeProvider {
    states: Arc<Mutex<HashMap<DeviceNumber, Arc<Mutex<FakeState>>>>>,
    notifiers: Arc<Mutex<HashMap<DeviceNumber, ChannelNotifier>>>,
    provisions: Arc<Mutex<usize>>,
}

impl FakeProvider {
    pub fn state(&self, device: u32) -> Arc<Mutex<FakeState>> {
        self.states
            .lock()
            .get(&DeviceNumber::new(device))
            .cloned()
            .expect("device was never provisioned")
    }

    pub fn notifier(&self, device: u32) -> ChannelNotifier {
        self.notifiers
            .lock()
            .get(&DeviceNumber::new(device))
            .cloned()
            .expect("device was never provisioned")
    }

    pub fn provisions(&self) -> usize {
        *self.provisions.lock()
    }
}

impl ChannelProvider for FakeProvider {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Files
    }

    fn provision(
        &self,
        device: DeviceNumber,
        notifier: ChannelNotifier,
    ) -> Result<Box<dyn ExternalChannel>, ChannelError> {
        let state = Arc::new(Mutex::new(FakeState::default()));
        self.states.lock().insert(device, state.clone());
        self.notifiers.lock().insert(device, notifier);
        *self.provisions.lock() += 1;
        Ok(Box::new(FakeChannel { state }))
    }
}
