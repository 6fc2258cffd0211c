//! Recording platform for bridge tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use dvbapi_protocol::CONTROL_WORD_LEN;

use super::{BridgeConfig, CaBridge, ProfileKey};
use crate::platform::{
    BankId, BridgeEvent, Descrambler, EventSink, FilterHandle, PlatformError, SectionRequest,
    SectionTag, SubscriptionId, TuningService,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Enable(BankId),
    Disable(BankId),
    InstallCw(BankId, [u8; CONTROL_WORD_LEN]),
    SubscribeSection {
        profile: ProfileKey,
        request: SectionRequest,
        tag: SectionTag,
        handle: FilterHandle,
    },
    UnsubscribeSection(FilterHandle),
    SubscribeTune(ProfileKey),
    UnsubscribeTune(SubscriptionId),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    banks: HashMap<ProfileKey, BankId>,
    current: HashMap<ProfileKey, (i32, u64)>,
    tune_sink: Option<EventSink>,
    next_handle: u64,
}

/// Records every collaborator call.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<State>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_bank(&self, profile: ProfileKey, bank: BankId) {
        self.state.lock().banks.insert(profile, bank);
    }

    pub fn set_current(&self, profile: ProfileKey, program_number: i32, service_id: u64) {
        self.state
            .lock()
            .current
            .insert(profile, (program_number, service_id));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.state.lock().calls)
    }

    /// Deliver a tune event the way the tuning subsystem would.
    pub fn emit(&self, event: BridgeEvent) {
        if let Some(sink) = &self.state.lock().tune_sink {
            let _ = sink.send(event);
        }
    }

    fn next(state: &mut State) -> u64 {
        state.next_handle += 1;
        state.next_handle
    }
}

impl TuningService for MockPlatform {
    fn current_program(&self, profile: ProfileKey) -> Option<(i32, u64)> {
        self.state.lock().current.get(&profile).copied()
    }

    fn bank_for(&self, profile: ProfileKey) -> Option<BankId> {
        self.state.lock().banks.get(&profile).copied()
    }

    fn subscribe_tune_events(
        &self,
        profile: ProfileKey,
        sink: EventSink,
    ) -> Result<SubscriptionId, PlatformError> {
        let mut state = self.state.lock();
        let id = Self::next(&mut state);
        state.calls.push(Call::SubscribeTune(profile));
        state.tune_sink = Some(sink);
        Ok(SubscriptionId(id))
    }

    fn unsubscribe_tune_events(&self, id: SubscriptionId) {
        let mut state = self.state.lock();
        state.calls.push(Call::UnsubscribeTune(id));
        state.tune_sink = None;
    }

    fn subscribe_section(
        &self,
        profile: ProfileKey,
        request: SectionRequest,
        tag: SectionTag,
        _sink: EventSink,
    ) -> Result<FilterHandle, PlatformError> {
        let mut state = self.state.lock();
        let handle = FilterHandle(Self::next(&mut state));
        state.calls.push(Call::SubscribeSection {
            profile,
            request,
            tag,
            handle,
        });
        Ok(handle)
    }

    fn unsubscribe_section(&self, handle: FilterHandle) {
        self.state.lock().calls.push(Call::UnsubscribeSection(handle));
    }
}

impl Descrambler for MockPlatform {
    fn enable(&self, bank: BankId) -> Result<(), PlatformError> {
        self.state.lock().calls.push(Call::Enable(bank));
        Ok(())
    }

    fn disable(&self, bank: BankId) -> Result<(), PlatformError> {
        self.state.lock().calls.push(Call::Disable(bank));
        Ok(())
    }

    fn install_control_word(
        &self,
        bank: BankId,
        control_word: &[u8; CONTROL_WORD_LEN],
    ) -> Result<(), PlatformError> {
        self.state
            .lock()
            .calls
            .push(Call::InstallCw(bank, *control_word));
        Ok(())
    }
}

/// Bridge following `main@0` (bank 0) and `pip@0` (bank 1), attached with
/// its call log cleared.
pub fn attached_bridge(
    demux_count: usize,
) -> (CaBridge, Arc<MockPlatform>, mpsc::UnboundedReceiver<BridgeEvent>) {
    let mock = MockPlatform::new();
    mock.set_bank(ProfileKey::main(0), 0);
    mock.set_bank(ProfileKey::pip(0), 1);
    let config = BridgeConfig {
        demux_count,
        profiles: vec![ProfileKey::main(0), ProfileKey::pip(0)],
        verify_pmt_crc: true,
    };
    let bridge = CaBridge::new(config, mock.clone(), mock.clone()).expect("valid config");
    let (tx, rx) = mpsc::unbounded_channel();
    bridge.attach(tx).expect("attach");
    mock.take_calls();
    (bridge, mock, rx)
}
