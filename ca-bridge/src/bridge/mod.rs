//! Demux/profile reconciliation between the CAM server and the receiver.
//!
//! This module provides:
//! - [`CaBridge`]: owns the demux table and the collaborator handles
//! - [`registry`]: the fixed-capacity demux slot table
//! - [`binder`]: tune-success/tune-stop handling
//! - [`aggregator`]: PMT caching and CA_PMT re-announcement
//! - [`dispatcher`]: inbound request handling
//!
//! Every operation takes the registry lock once, does all of its work, and
//! returns the messages to send. Writing them happens after the lock is
//! released.

pub mod aggregator;
pub mod binder;
pub mod dispatcher;
#[cfg(test)]
pub(crate) mod mock;
pub mod profile_key;
pub mod registry;

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;

use dvbapi_protocol::encode_stop_demux;

use crate::error::BridgeError;
use crate::platform::{
    BankId, BridgeEvent, Descrambler, EventSink, SubscriptionId, TuningService,
};

pub use binder::UNSCRAMBLED_FLAG;
pub use profile_key::{ProfileKey, TunePurpose};
pub use registry::{DemuxRegistry, DemuxSlot, Profile, FREE_PROGRAM};

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Number of hardware demultiplexers.
    pub demux_count: usize,
    /// Profiles whose tune events are followed.
    pub profiles: Vec<ProfileKey>,
    /// Drop PMT sections whose CRC does not match.
    pub verify_pmt_crc: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            demux_count: 2,
            profiles: vec![ProfileKey::main(0)],
            verify_pmt_crc: true,
        }
    }
}

/// Per-connection subscription state.
#[derive(Default)]
struct Attachment {
    sink: Option<EventSink>,
    tune_subscriptions: Vec<SubscriptionId>,
}

/// The conditional-access bridge.
pub struct CaBridge {
    config: BridgeConfig,
    registry: Mutex<DemuxRegistry>,
    attachment: Mutex<Attachment>,
    tuning: Arc<dyn TuningService>,
    descrambler: Arc<dyn Descrambler>,
}

impl CaBridge {
    pub fn new(
        config: BridgeConfig,
        tuning: Arc<dyn TuningService>,
        descrambler: Arc<dyn Descrambler>,
    ) -> Result<Self, BridgeError> {
        if config.demux_count == 0 || config.demux_count > u8::MAX as usize {
            return Err(BridgeError::Config(format!(
                "demux_count must be within 1..=255, got {}",
                config.demux_count
            )));
        }
        Ok(Self {
            registry: Mutex::new(DemuxRegistry::new(config.demux_count)),
            attachment: Mutex::new(Attachment::default()),
            config,
            tuning,
            descrambler,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run `f` with the registry locked.
    pub fn with_registry<R>(&self, f: impl FnOnce(&DemuxRegistry) -> R) -> R {
        f(&self.registry.lock())
    }

    /// Start serving a connection: reset the table, follow the configured
    /// profiles and bind the ones that are already tuned.
    pub fn attach(&self, sink: EventSink) -> Result<Vec<Bytes>, BridgeError> {
        self.registry.lock().reset();

        let mut subscriptions = Vec::with_capacity(self.config.profiles.len());
        for profile in &self.config.profiles {
            match self.tuning.subscribe_tune_events(*profile, sink.clone()) {
                Ok(id) => subscriptions.push(id),
                Err(e) => warn!("Failed to follow tune events of {}: {}", profile, e),
            }
        }
        {
            let mut attachment = self.attachment.lock();
            attachment.sink = Some(sink);
            attachment.tune_subscriptions = subscriptions;
        }

        let mut out = Vec::new();
        for profile in &self.config.profiles {
            if let Some((program_number, service_id)) = self.tuning.current_program(*profile) {
                info!(
                    "{} already tuned to program 0x{:04X}",
                    profile, program_number
                );
                out.extend(self.on_tune_success(*profile, program_number, service_id)?);
            }
        }
        Ok(out)
    }

    /// Stop serving the connection: drop subscriptions, release every
    /// profile and disable descrambling.
    pub fn detach(&self) {
        let subscriptions = {
            let mut attachment = self.attachment.lock();
            attachment.sink = None;
            std::mem::take(&mut attachment.tune_subscriptions)
        };
        for id in subscriptions {
            self.tuning.unsubscribe_tune_events(id);
        }

        let drained = self.registry.lock().drain();
        let mut banks = BTreeSet::new();
        for (slot, key, profile) in drained {
            debug!("Releasing {} from slot {}", key, slot);
            for handle in profile.filters.values() {
                self.tuning.unsubscribe_section(*handle);
            }
            if let Some(bank) = profile.bank {
                banks.insert(bank);
            }
        }
        for bank in banks {
            self.disable_bank(bank);
        }
    }

    /// Route an event from the collaborator queue.
    pub fn handle_event(&self, event: BridgeEvent) -> Result<Vec<Bytes>, BridgeError> {
        match event {
            BridgeEvent::TuneSuccess {
                profile,
                program_number,
                service_id,
            } => self.on_tune_success(profile, program_number, service_id),
            BridgeEvent::TuneStop { profile } => self.on_tune_stop(profile),
            BridgeEvent::Section { tag, data } => self.on_section(tag, data),
        }
    }

    fn sink(&self) -> Option<EventSink> {
        self.attachment.lock().sink.clone()
    }

    /// Unbind `key` from `slot` and release what it held. Emits a stop
    /// message if the slot became free.
    fn release_profile(
        &self,
        registry: &mut DemuxRegistry,
        slot: usize,
        key: &ProfileKey,
        out: &mut Vec<Bytes>,
    ) -> Result<(), BridgeError> {
        let unbound = registry.unbind_profile(slot, key)?;
        for handle in unbound.profile.filters.values() {
            self.tuning.unsubscribe_section(*handle);
        }
        if let Some(bank) = unbound.profile.bank {
            if !registry.bank_in_use(bank) {
                self.disable_bank(bank);
            }
        }
        if unbound.slot_freed {
            out.push(encode_stop_demux(slot as u8));
        }
        Ok(())
    }

    fn disable_bank(&self, bank: BankId) {
        if let Err(e) = self.descrambler.disable(bank) {
            warn!("Failed to disable descrambling on bank {}: {}", bank, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{Call, MockPlatform};
    use super::*;

    #[test]
    fn test_rejects_bad_demux_count() {
        let mock = MockPlatform::new();
        let config = BridgeConfig {
            demux_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            CaBridge::new(config, mock.clone(), mock),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_attach_binds_tuned_profiles() {
        let mock = MockPlatform::new();
        mock.set_bank(ProfileKey::main(0), 0);
        mock.set_current(ProfileKey::main(0), 0x1234, 77);
        let config = BridgeConfig {
            profiles: vec![ProfileKey::main(0), ProfileKey::pip(0)],
            ..Default::default()
        };
        let bridge = CaBridge::new(config, mock.clone(), mock.clone()).unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let out = bridge.attach(tx).unwrap();
        assert!(out.is_empty());
        bridge.with_registry(|reg| {
            let slot = reg.slot(0).unwrap();
            assert_eq!(slot.program_number, 0x1234);
            assert_eq!(slot.service_id, 77);
        });
        let calls = mock.calls();
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, Call::SubscribeTune(_)))
                .count(),
            2
        );
        assert!(calls.contains(&Call::Enable(0)));
    }

    #[test]
    fn test_detach_releases_everything() {
        let (bridge, mock, _rx) = mock::attached_bridge(2);
        bridge
            .on_tune_success(ProfileKey::main(0), 0x1234, 1)
            .unwrap();
        bridge.on_tune_success(ProfileKey::pip(0), 0x5678, 2).unwrap();
        mock.take_calls();

        bridge.detach();

        let calls = mock.calls();
        assert!(calls.contains(&Call::Disable(0)));
        assert!(calls.contains(&Call::Disable(1)));
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, Call::UnsubscribeSection(_)))
                .count(),
            2
        );
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, Call::UnsubscribeTune(_)))
                .count(),
            2
        );
        bridge.with_registry(|reg| assert!(reg.occupied().next().is_none()));

        // Events racing the disconnect are ignored.
        let out = bridge.on_tune_success(ProfileKey::main(0), 0x1234, 1).unwrap();
        assert!(out.is_empty());
        bridge.with_registry(|reg| assert!(reg.occupied().next().is_none()));
    }
}
