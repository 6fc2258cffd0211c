//! PMT caching and CA_PMT re-announcement.

use bytes::Bytes;
use log::{debug, trace, warn};

use dvbapi_protocol::{
    encode_ca_pmt, encode_ca_pmt_placeholder, encode_filter_section, psi, ListManagement,
    PMT_FILTER_INDEX,
};

use super::{CaBridge, DemuxRegistry};
use crate::error::BridgeError;
use crate::platform::SectionTag;

impl CaBridge {
    /// A section matched one of our subscriptions.
    ///
    /// PMT sections update the owning slot's cache and re-announce every
    /// occupied slot. Other sections are forwarded to the server as-is.
    pub fn on_section(&self, tag: SectionTag, data: Bytes) -> Result<Vec<Bytes>, BridgeError> {
        if tag.filter_index != PMT_FILTER_INDEX {
            trace!(
                "Forwarding {} byte section (slot {}, filter {})",
                data.len(),
                tag.slot,
                tag.filter_index
            );
            return Ok(vec![encode_filter_section(
                tag.slot,
                tag.filter_index,
                &data,
            )]);
        }

        let Some(section) = self.accept_pmt(&data) else {
            return Ok(Vec::new());
        };
        let program_number = match psi::pmt_program_number(&section) {
            Ok(p) => i32::from(p),
            Err(e) => {
                warn!("Dropping PMT section: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut reg = self.registry.lock();
        let Some(slot) = reg.find_slot_by_program(program_number) else {
            debug!(
                "PMT for program 0x{:04X} has no slot, ignoring",
                program_number
            );
            return Ok(Vec::new());
        };
        if let Some(s) = reg.slot_mut(slot) {
            s.cached_pmt = Some(section);
        }
        reg.compact();
        let out = flush_ca_pmt(&reg);
        debug!(
            "PMT update for 0x{:04X}: announced {} slot(s)",
            program_number,
            out.len()
        );
        reg.verify()?;
        Ok(out)
    }

    /// Validate a raw PMT section and trim it to its declared length.
    fn accept_pmt(&self, data: &Bytes) -> Option<Bytes> {
        if let Err(e) = psi::validate_pmt(data) {
            warn!("Dropping PMT section: {}", e);
            return None;
        }
        let total = psi::section_total_len(data).ok()?;
        let section = data.slice(..total);
        if self.config.verify_pmt_crc {
            if let Err(e) = psi::verify_section_crc(&section) {
                warn!("Dropping PMT section: {}", e);
                return None;
            }
        }
        Some(section)
    }
}

/// CA_PMT for every occupied slot in index order: "only" for slot 0 and
/// "more" for the rest.
pub(crate) fn flush_ca_pmt(reg: &DemuxRegistry) -> Vec<Bytes> {
    let mut out = Vec::new();
    for (index, slot) in reg.occupied() {
        let list_management = if index == 0 {
            ListManagement::Only
        } else {
            ListManagement::More
        };
        let encoded = slot.cached_pmt.as_ref().and_then(|pmt| {
            encode_ca_pmt(list_management, pmt, index as u8)
                .map_err(|e| warn!("Cached PMT of slot {} unusable: {}", index, e))
                .ok()
        });
        let message = encoded.unwrap_or_else(|| {
            encode_ca_pmt_placeholder(list_management, slot.program_number as u16, index as u8)
        });
        out.push(message);
    }
    out
}
