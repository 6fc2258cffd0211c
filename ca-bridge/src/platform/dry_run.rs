//! Logging-only platform used when no hardware backend is linked.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};

use dvbapi_protocol::CONTROL_WORD_LEN;

use super::{
    BankId, Descrambler, EventSink, FilterHandle, PlatformError, SectionRequest, SectionTag,
    SubscriptionId, TuningService,
};
use crate::bridge::ProfileKey;

/// Accepts every call and logs it. Never produces events, so no profile is
/// ever tuned; useful for exercising the socket side against a CAM server.
#[derive(Debug, Default)]
pub struct DryRunPlatform {
    next_handle: AtomicU64,
}

impl DryRunPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl TuningService for DryRunPlatform {
    fn current_program(&self, _profile: ProfileKey) -> Option<(i32, u64)> {
        None
    }

    fn bank_for(&self, _profile: ProfileKey) -> Option<BankId> {
        None
    }

    fn subscribe_tune_events(
        &self,
        profile: ProfileKey,
        _sink: EventSink,
    ) -> Result<SubscriptionId, PlatformError> {
        let id = self.next();
        debug!("[dry-run] subscribe tune events for {} -> #{}", profile, id);
        Ok(SubscriptionId(id))
    }

    fn unsubscribe_tune_events(&self, id: SubscriptionId) {
        debug!("[dry-run] unsubscribe tune events #{}", id.0);
    }

    fn subscribe_section(
        &self,
        profile: ProfileKey,
        request: SectionRequest,
        tag: SectionTag,
        _sink: EventSink,
    ) -> Result<FilterHandle, PlatformError> {
        let id = self.next();
        debug!(
            "[dry-run] subscribe section {:?} for {} (slot {}, filter {}) -> #{}",
            request, profile, tag.slot, tag.filter_index, id
        );
        Ok(FilterHandle(id))
    }

    fn unsubscribe_section(&self, handle: FilterHandle) {
        debug!("[dry-run] unsubscribe section #{}", handle.0);
    }
}

impl Descrambler for DryRunPlatform {
    fn enable(&self, bank: BankId) -> Result<(), PlatformError> {
        info!("[dry-run] enable descrambling on bank {}", bank);
        Ok(())
    }

    fn disable(&self, bank: BankId) -> Result<(), PlatformError> {
        info!("[dry-run] disable descrambling on bank {}", bank);
        Ok(())
    }

    fn install_control_word(
        &self,
        bank: BankId,
        _control_word: &[u8; CONTROL_WORD_LEN],
    ) -> Result<(), PlatformError> {
        debug!("[dry-run] install control word on bank {}", bank);
        Ok(())
    }
}
