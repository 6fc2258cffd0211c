//! Inbound request handling.

use bytes::Bytes;
use log::{debug, info, trace, warn};

use dvbapi_protocol::{Parity, Request, SectionFilter, PMT_FILTER_INDEX};

use super::CaBridge;
use crate::error::BridgeError;
use crate::platform::{SectionRequest, SectionTag};

impl CaBridge {
    /// Apply one request from the CAM server.
    pub fn dispatch(&self, request: Request) -> Result<Vec<Bytes>, BridgeError> {
        match request {
            Request::SetPid { slot, pid, index } => {
                trace!("pid-set slot {} pid 0x{:04X} index {}", slot, pid, index);
                Ok(Vec::new())
            }
            Request::SetDescrambler {
                slot,
                index,
                parity,
                control_word,
            } => self.set_descrambler(slot, index, parity, &control_word),
            Request::SetFilter {
                slot,
                filter_index,
                filter,
            } => self.set_filter(slot, filter_index, filter),
            Request::StopFilter {
                slot, filter_index, ..
            } => self.stop_filter(slot, filter_index),
            Request::EcmInfo { slot, info } => {
                debug!(
                    "ECM slot {}: sid 0x{:04X} caid 0x{:04X} pid 0x{:04X} prov 0x{:06X} {} ms via {} ({}, {}, {} hops)",
                    slot,
                    info.service_id,
                    info.caid,
                    info.pid,
                    info.provider_id,
                    info.ecm_time_ms,
                    info.reader,
                    info.card_system,
                    info.protocol,
                    info.hops
                );
                Ok(Vec::new())
            }
            Request::ServerInfo(hello) => {
                info!(
                    "Server re-announced itself: {} (protocol {})",
                    hello.server_name, hello.protocol_version
                );
                Ok(Vec::new())
            }
        }
    }

    fn set_descrambler(
        &self,
        slot: u8,
        index: u32,
        parity: u32,
        key: &[u8; 8],
    ) -> Result<Vec<Bytes>, BridgeError> {
        let mut reg = self.registry.lock();
        reg.check_slot(slot as usize)?;
        let parity = match Parity::try_from(parity) {
            Ok(p) => p,
            Err(raw) => {
                warn!("key-set slot {} with invalid parity {}, dropped", slot, raw);
                return Ok(Vec::new());
            }
        };
        trace!("key-set slot {} index {} parity {:?}", slot, index, parity);

        if let Some(demux) = reg.slot_mut(slot as usize) {
            for (key_id, profile) in demux.profiles.iter_mut() {
                profile.set_control_word_half(parity, key);
                let Some(bank) = profile.bank else {
                    debug!("{} has no bank, control word kept", key_id);
                    continue;
                };
                if let Err(e) = self
                    .descrambler
                    .install_control_word(bank, &profile.control_word)
                {
                    warn!("Failed to install control word on bank {}: {}", bank, e);
                }
            }
        }
        reg.verify()?;
        Ok(Vec::new())
    }

    fn set_filter(
        &self,
        slot: u8,
        filter_index: u8,
        filter: SectionFilter,
    ) -> Result<Vec<Bytes>, BridgeError> {
        let mut reg = self.registry.lock();
        reg.check_slot(slot as usize)?;
        if filter_index == PMT_FILTER_INDEX {
            warn!("filter-set slot {} on reserved index {}, dropped", slot, filter_index);
            return Ok(Vec::new());
        }
        let Some(sink) = self.sink() else {
            return Ok(Vec::new());
        };
        debug!(
            "filter-set slot {} index {} pid 0x{:04X}",
            slot, filter_index, filter.pid
        );

        let tag = SectionTag { slot, filter_index };
        let request = SectionRequest::Filter {
            filter,
            crc_check: true,
        };
        if let Some(demux) = reg.slot_mut(slot as usize) {
            for (key, profile) in demux.profiles.iter_mut() {
                if let Some(previous) = profile.filters.remove(&filter_index) {
                    self.tuning.unsubscribe_section(previous);
                }
                match self
                    .tuning
                    .subscribe_section(*key, request, tag, sink.clone())
                {
                    Ok(handle) => {
                        profile.filters.insert(filter_index, handle);
                    }
                    Err(e) => warn!("Failed to start filter {} for {}: {}", filter_index, key, e),
                }
            }
        }
        reg.verify()?;
        Ok(Vec::new())
    }

    fn stop_filter(&self, slot: u8, filter_index: u8) -> Result<Vec<Bytes>, BridgeError> {
        let mut reg = self.registry.lock();
        if filter_index == PMT_FILTER_INDEX {
            warn!("filter-stop slot {} on reserved index {}, dropped", slot, filter_index);
            return Ok(Vec::new());
        }
        let Some(demux) = reg.slot_mut(slot as usize) else {
            warn!("filter-stop for unknown slot {}", slot);
            return Ok(Vec::new());
        };
        debug!("filter-stop slot {} index {}", slot, filter_index);
        for profile in demux.profiles.values_mut() {
            if let Some(handle) = profile.filters.remove(&filter_index) {
                self.tuning.unsubscribe_section(handle);
            }
        }
        reg.verify()?;
        Ok(Vec::new())
    }
}
