//! Tune event handling: binds profiles to demux slots as they tune.

use bytes::Bytes;
use log::{debug, info, warn};

use dvbapi_protocol::{encode_stop_demux, PMT_FILTER_INDEX};

use super::{CaBridge, ProfileKey};
use crate::error::BridgeError;
use crate::platform::{SectionRequest, SectionTag};

/// Set on a tune-success program number when the service is not scrambled.
pub const UNSCRAMBLED_FLAG: i32 = 0x0001_0000;

impl CaBridge {
    /// A profile finished tuning to `program_number`.
    ///
    /// A profile that was already bound is released first (channel change).
    /// Scrambled programs get a slot, an enabled bank and a PMT subscription.
    pub fn on_tune_success(
        &self,
        profile: ProfileKey,
        program_number: i32,
        service_id: u64,
    ) -> Result<Vec<Bytes>, BridgeError> {
        let Some(sink) = self.sink() else {
            debug!("Ignoring tune of {} while detached", profile);
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        let mut reg = self.registry.lock();

        if let Some(bound) = reg.find_slot_by_profile(&profile) {
            debug!("{} retuned, leaving slot {}", profile, bound);
            self.release_profile(&mut reg, bound, &profile, &mut out)?;
        }

        if program_number >= 0 && program_number & UNSCRAMBLED_FLAG != 0 {
            info!(
                "{} tuned to unscrambled program 0x{:04X}",
                profile,
                program_number & !UNSCRAMBLED_FLAG
            );
            reg.verify()?;
            return Ok(out);
        }
        let Ok(pmt_program) = u16::try_from(program_number) else {
            warn!(
                "{} reported invalid program number {}",
                profile, program_number
            );
            reg.verify()?;
            return Ok(out);
        };

        let slot = match reg.find_slot_by_program(program_number) {
            Some(existing) => {
                debug!(
                    "Program 0x{:04X} already in slot {}, restarting it",
                    program_number, existing
                );
                out.push(encode_stop_demux(existing as u8));
                existing
            }
            None => reg.allocate_free_slot(program_number, service_id)?,
        };

        let bank = self.tuning.bank_for(profile);
        reg.bind_profile(slot, profile, bank)?;
        match bank {
            Some(bank) => {
                if let Err(e) = self.descrambler.enable(bank) {
                    warn!("Failed to enable descrambling on bank {}: {}", bank, e);
                }
            }
            None => warn!("No hardware bank known for {}", profile),
        }

        let tag = SectionTag {
            slot: slot as u8,
            filter_index: PMT_FILTER_INDEX,
        };
        let request = SectionRequest::Pmt {
            program_number: pmt_program,
        };
        match self.tuning.subscribe_section(profile, request, tag, sink) {
            Ok(handle) => {
                if let Some(bound) = reg
                    .slot_mut(slot)
                    .and_then(|s| s.profiles.get_mut(&profile))
                {
                    bound.filters.insert(PMT_FILTER_INDEX, handle);
                }
            }
            Err(e) => warn!("Failed to subscribe PMT of 0x{:04X}: {}", pmt_program, e),
        }

        info!(
            "{} bound to slot {} (program 0x{:04X}, bank {:?})",
            profile, slot, program_number, bank
        );
        reg.verify()?;
        Ok(out)
    }

    /// A profile stopped; release its slot binding.
    pub fn on_tune_stop(&self, profile: ProfileKey) -> Result<Vec<Bytes>, BridgeError> {
        let mut out = Vec::new();
        let mut reg = self.registry.lock();
        match reg.find_slot_by_profile(&profile) {
            Some(slot) => {
                info!("{} stopped, leaving slot {}", profile, slot);
                self.release_profile(&mut reg, slot, &profile, &mut out)?;
            }
            None => debug!("{} stopped while unbound", profile),
        }
        reg.verify()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::{attached_bridge, Call};
    use super::super::FREE_PROGRAM;
    use super::*;

    #[test]
    fn test_tune_allocates_and_subscribes() {
        let (bridge, mock, _rx) = attached_bridge(2);
        let out = bridge
            .on_tune_success(ProfileKey::main(0), 0x1234, 42)
            .unwrap();
        assert!(out.is_empty());

        let calls = mock.take_calls();
        assert_eq!(calls[0], Call::Enable(0));
        match &calls[1] {
            Call::SubscribeSection { profile, request, tag, .. } => {
                assert_eq!(*profile, ProfileKey::main(0));
                assert_eq!(
                    *request,
                    SectionRequest::Pmt {
                        program_number: 0x1234
                    }
                );
                assert_eq!(tag.slot, 0);
                assert_eq!(tag.filter_index, PMT_FILTER_INDEX);
            }
            other => panic!("unexpected call {:?}", other),
        }
        bridge.with_registry(|reg| {
            let slot = reg.slot(0).unwrap();
            assert_eq!(slot.program_number, 0x1234);
            assert_eq!(slot.service_id, 42);
            let profile = &slot.profiles[&ProfileKey::main(0)];
            assert_eq!(profile.bank, Some(0));
            assert!(profile.filters.contains_key(&PMT_FILTER_INDEX));
        });
    }

    #[test]
    fn test_unscrambled_program_skipped() {
        let (bridge, mock, _rx) = attached_bridge(2);
        let out = bridge
            .on_tune_success(ProfileKey::main(0), 0x1234 | UNSCRAMBLED_FLAG, 1)
            .unwrap();
        assert!(out.is_empty());
        assert!(mock.take_calls().is_empty());
        bridge.with_registry(|reg| assert!(reg.occupied().next().is_none()));
    }

    #[test]
    fn test_retune_to_unscrambled_releases_slot() {
        let (bridge, mock, _rx) = attached_bridge(2);
        bridge
            .on_tune_success(ProfileKey::main(0), 0x1234, 1)
            .unwrap();
        mock.take_calls();

        let out = bridge
            .on_tune_success(ProfileKey::main(0), 0x10 | UNSCRAMBLED_FLAG, 2)
            .unwrap();
        assert_eq!(out, vec![encode_stop_demux(0)]);
        let calls = mock.take_calls();
        assert!(calls.contains(&Call::Disable(0)));
        assert!(calls.iter().any(|c| matches!(c, Call::UnsubscribeSection(_))));
    }

    #[test]
    fn test_same_program_reuses_slot_with_stop() {
        let (bridge, mock, _rx) = attached_bridge(2);
        bridge
            .on_tune_success(ProfileKey::main(0), 0x1234, 1)
            .unwrap();
        let out = bridge
            .on_tune_success(ProfileKey::pip(0), 0x1234, 1)
            .unwrap();
        assert_eq!(out, vec![encode_stop_demux(0)]);
        bridge.with_registry(|reg| {
            assert_eq!(reg.occupied().count(), 1);
            assert_eq!(reg.slot(0).unwrap().profiles.len(), 2);
        });
        assert!(mock.take_calls().contains(&Call::Enable(1)));
    }

    #[test]
    fn test_tune_stop_frees_slot_once() {
        let (bridge, mock, _rx) = attached_bridge(2);
        bridge
            .on_tune_success(ProfileKey::main(0), 0x1234, 9)
            .unwrap();
        mock.take_calls();

        let out = bridge.on_tune_stop(ProfileKey::main(0)).unwrap();
        assert_eq!(out, vec![encode_stop_demux(0)]);
        bridge.with_registry(|reg| {
            let slot = reg.slot(0).unwrap();
            assert_eq!(slot.program_number, FREE_PROGRAM);
            assert_eq!(slot.service_id, 0);
            assert!(slot.profiles.is_empty());
        });
        let calls = mock.take_calls();
        assert!(calls.contains(&Call::Disable(0)));

        // A second stop is a no-op.
        assert!(bridge.on_tune_stop(ProfileKey::main(0)).unwrap().is_empty());
    }

    #[test]
    fn test_shared_bank_disabled_by_last_user() {
        let (bridge, mock, _rx) = attached_bridge(2);
        mock.set_bank(ProfileKey::pip(0), 0);
        bridge
            .on_tune_success(ProfileKey::main(0), 0x1234, 1)
            .unwrap();
        bridge
            .on_tune_success(ProfileKey::pip(0), 0x1234, 1)
            .unwrap();
        mock.take_calls();

        assert!(bridge.on_tune_stop(ProfileKey::pip(0)).unwrap().is_empty());
        assert!(!mock.take_calls().contains(&Call::Disable(0)));

        assert_eq!(
            bridge.on_tune_stop(ProfileKey::main(0)).unwrap(),
            vec![encode_stop_demux(0)]
        );
        assert!(mock.take_calls().contains(&Call::Disable(0)));
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let (bridge, _mock, _rx) = attached_bridge(1);
        bridge.on_tune_success(ProfileKey::main(0), 1, 1).unwrap();
        let err = bridge
            .on_tune_success(ProfileKey::pip(0), 2, 2)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_program_ignored() {
        let (bridge, mock, _rx) = attached_bridge(2);
        let out = bridge.on_tune_success(ProfileKey::main(0), -5, 1).unwrap();
        assert!(out.is_empty());
        assert!(mock.take_calls().is_empty());
    }

    #[test]
    fn test_exclusivity_over_event_sequence() {
        let (bridge, _mock, _rx) = attached_bridge(3);
        let profiles = [ProfileKey::main(0), ProfileKey::pip(0), ProfileKey::capture(0)];
        let programs = [0x10, 0x20, 0x10, 0x30, 0x20, 0x10];
        for (step, program) in programs.iter().enumerate() {
            let profile = profiles[step % profiles.len()];
            bridge.on_tune_success(profile, *program, 0).unwrap();
            if step % 4 == 3 {
                bridge.on_tune_stop(profiles[(step + 1) % profiles.len()]).unwrap();
            }
            bridge.with_registry(|reg| reg.verify().unwrap());
        }
    }
}
