//! Seams to the receiver's tuning subsystem and descrambling hardware.
//!
//! This module provides:
//! - [`TuningService`]: the slice of the tuning/service-navigation API used
//!   by the bridge (program lookup, tune events, section filters)
//! - [`Descrambler`]: descrambling engine control and control-word install
//! - [`BridgeEvent`]: what collaborator callbacks enqueue for the bridge
//! - [`dry_run`]: a logging-only implementation of both traits

pub mod dry_run;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use dvbapi_protocol::{SectionFilter, CONTROL_WORD_LEN};

use crate::bridge::ProfileKey;

pub use dry_run::DryRunPlatform;

/// Hardware identifier of a descrambling engine tied to a demux/adapter.
pub type BankId = u16;

/// Handle of a running section filter subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterHandle(pub u64);

/// Handle of a tune-event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Routing tag attached to a section subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionTag {
    pub slot: u8,
    pub filter_index: u8,
}

/// Event delivered by a collaborator callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A profile finished tuning to a program.
    TuneSuccess {
        profile: ProfileKey,
        program_number: i32,
        service_id: u64,
    },
    /// A profile stopped.
    TuneStop { profile: ProfileKey },
    /// A section matched a running filter.
    Section { tag: SectionTag, data: Bytes },
}

/// Queue collaborator callbacks push into.
pub type EventSink = mpsc::UnboundedSender<BridgeEvent>;

/// What a section subscription captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionRequest {
    /// PMT sections (table id 0x02) of one program.
    Pmt { program_number: u16 },
    /// Sections on a PID matching filter/mask.
    Filter { filter: SectionFilter, crc_check: bool },
}

/// Collaborator failures. Logged only; the affected operation has no effect.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Tuning service error: {0}")]
    Tuning(String),

    #[error("Descrambler error: {0}")]
    Descrambler(String),
}

/// Slice of the tuning subsystem the bridge depends on.
pub trait TuningService: Send + Sync {
    /// Program number and service handle the profile is currently tuned to.
    fn current_program(&self, profile: ProfileKey) -> Option<(i32, u64)>;

    /// Hardware bank backing the profile's current tune.
    fn bank_for(&self, profile: ProfileKey) -> Option<BankId>;

    /// Deliver tune-success/tune-stop of `profile` into `sink`.
    fn subscribe_tune_events(
        &self,
        profile: ProfileKey,
        sink: EventSink,
    ) -> Result<SubscriptionId, PlatformError>;

    fn unsubscribe_tune_events(&self, id: SubscriptionId);

    /// Start a section filter on the profile's stream; matches arrive as
    /// [`BridgeEvent::Section`] carrying `tag`.
    fn subscribe_section(
        &self,
        profile: ProfileKey,
        request: SectionRequest,
        tag: SectionTag,
        sink: EventSink,
    ) -> Result<FilterHandle, PlatformError>;

    fn unsubscribe_section(&self, handle: FilterHandle);
}

/// Descrambling engine and key-management context.
pub trait Descrambler: Send + Sync {
    fn enable(&self, bank: BankId) -> Result<(), PlatformError>;

    fn disable(&self, bank: BankId) -> Result<(), PlatformError>;

    /// Convert and install an even+odd control word on `bank`.
    fn install_control_word(
        &self,
        bank: BankId,
        control_word: &[u8; CONTROL_WORD_LEN],
    ) -> Result<(), PlatformError>;
}
