//! PSI section helpers used when handling PMT sections.

use crc::{Crc, CRC_32_MPEG_2};

use crate::error::ProtocolError;
use crate::types::MAX_PMT_SIZE;

/// Table id of a program map section.
pub const PMT_TABLE_ID: u8 = 0x02;

/// Fixed PMT header (through program_info_length) plus CRC.
pub const PMT_MIN_LEN: usize = 16;

const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Total section length including the 3-byte table header.
pub fn section_total_len(section: &[u8]) -> Result<usize, ProtocolError> {
    if section.len() < 3 {
        return Err(ProtocolError::TruncatedSection {
            expected: 3,
            actual: section.len(),
        });
    }
    Ok(3 + (((section[1] & 0x0F) as usize) << 8) + section[2] as usize)
}

/// Program number (table id extension) of a PMT section.
pub fn pmt_program_number(section: &[u8]) -> Result<u16, ProtocolError> {
    if section.len() < 5 {
        return Err(ProtocolError::TruncatedSection {
            expected: 5,
            actual: section.len(),
        });
    }
    Ok(u16::from_be_bytes([section[3], section[4]]))
}

/// Checks table id and length fields of a PMT section.
pub fn validate_pmt(section: &[u8]) -> Result<(), ProtocolError> {
    let total = section_total_len(section)?;
    if section[0] != PMT_TABLE_ID {
        return Err(ProtocolError::MalformedSection("not a PMT section"));
    }
    if total > MAX_PMT_SIZE {
        return Err(ProtocolError::PmtTooLarge(total, MAX_PMT_SIZE));
    }
    if total < PMT_MIN_LEN {
        return Err(ProtocolError::MalformedSection("section_length too small"));
    }
    if section.len() < total {
        return Err(ProtocolError::TruncatedSection {
            expected: total,
            actual: section.len(),
        });
    }
    let program_info_end = 12 + (((section[10] & 0x0F) as usize) << 8) + section[11] as usize;
    if program_info_end > total - 4 {
        return Err(ProtocolError::MalformedSection("program_info_length overruns section"));
    }
    Ok(())
}

/// CRC-32/MPEG-2 over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC_MPEG.checksum(data)
}

/// Verifies the trailing CRC-32 of a complete section.
pub fn verify_section_crc(section: &[u8]) -> Result<(), ProtocolError> {
    let total = section_total_len(section)?;
    if total < 7 || section.len() < total {
        return Err(ProtocolError::TruncatedSection {
            expected: total.max(7),
            actual: section.len(),
        });
    }
    let computed = crc32(&section[..total - 4]);
    let stored = u32::from_be_bytes([
        section[total - 4],
        section[total - 3],
        section[total - 2],
        section[total - 1],
    ]);
    if computed != stored {
        return Err(ProtocolError::CrcMismatch { computed, stored });
    }
    Ok(())
}

/// Builds a PMT section with a valid CRC. Test fixture shared with the bridge crate.
#[doc(hidden)]
pub fn build_pmt(program_number: u16, program_info: &[u8], streams: &[(u8, u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&program_number.to_be_bytes());
    body.push(0xC1); // version 0, current_next
    body.push(0x00);
    body.push(0x00);
    body.extend_from_slice(&[0xE1, 0x00]); // PCR PID 0x100
    body.push(0xF0 | ((program_info.len() >> 8) as u8 & 0x0F));
    body.push(program_info.len() as u8);
    body.extend_from_slice(program_info);
    for &(stream_type, pid) in streams {
        body.push(stream_type);
        body.push(0xE0 | ((pid >> 8) as u8 & 0x1F));
        body.push(pid as u8);
        body.extend_from_slice(&[0xF0, 0x00]);
    }

    let section_length = body.len() + 4;
    let mut section = vec![
        PMT_TABLE_ID,
        0xB0 | ((section_length >> 8) as u8 & 0x0F),
        section_length as u8,
    ];
    section.extend_from_slice(&body);
    let crc = crc32(&section);
    section.extend_from_slice(&crc.to_be_bytes());
    section
}
