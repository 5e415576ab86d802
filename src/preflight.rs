//! The preflight collaborator contract (§6): a hook run once a device's
//! session reaches ACTIVE and before it is announced to clients, mirroring
//! the original daemon's lockdownd pairing handshake (`usbmuxd.c`'s
//! `device_add` preflight step). The protocol engine does not need to
//! understand lockdown itself; it only needs to know when preflight is done.

use async_trait::async_trait;

/// Outcome of one preflight run. `Visible` is the only one that flips a
/// device's visibility flag; the others map 1:1 onto the plist-only
/// pairing-stage notifications §4.4 names (`TrustPending`,
/// `PasswordProtected`, `UserDeniedPairing`, `RemovedDuringAdd`) so the
/// dispatcher can relay the external collaborator's pairing-stage
/// signal to LISTEN clients without needing to know what lockdown step
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightOutcome {
    Visible,
    Rejected,
    TrustPending,
    PasswordProtected,
    UserDeniedPairing,
    RemovedDuringAdd,
}

impl PreflightOutcome {
    /// The plist `MessageType` this outcome is relayed under, or `None`
    /// for outcomes that don't produce a client notification of their own
    /// (`Visible` becomes an `Attached` event instead; `Rejected` is
    /// silent since the device is simply never made visible).
    pub fn pairing_event_name(self) -> Option<&'static str> {
        match self {
            PreflightOutcome::TrustPending => Some("TrustPending"),
            PreflightOutcome::PasswordProtected => Some("PasswordProtected"),
            PreflightOutcome::UserDeniedPairing => Some("UserDeniedPairing"),
            PreflightOutcome::RemovedDuringAdd => Some("RemovedDuringAdd"),
            PreflightOutcome::Visible | PreflightOutcome::Rejected => None,
        }
    }
}

#[async_trait]
pub trait Preflight: Send + Sync {
    async fn run(&self, udid: &str, device_id: u32) -> PreflightOutcome;
}

/// Marks every device visible without doing any actual lockdown handshake.
/// Suitable for environments where pairing is handled out of band, and for
/// tests that do not want to model the lockdown protocol.
pub struct AlwaysVisiblePreflight;

#[async_trait]
impl Preflight for AlwaysVisiblePreflight {
    async fn run(&self, _udid: &str, _device_id: u32) -> PreflightOutcome {
        PreflightOutcome::Visible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_visible_accepts_any_device() {
        let pf = AlwaysVisiblePreflight;
        assert_eq!(pf.run("udid", 1).await, PreflightOutcome::Visible);
    }

    #[test]
    fn only_pairing_stage_outcomes_name_an_event() {
        assert_eq!(PreflightOutcome::TrustPending.pairing_event_name(), Some("TrustPending"));
        assert_eq!(PreflightOutcome::Visible.pairing_event_name(), None);
        assert_eq!(PreflightOutcome::Rejected.pairing_event_name(), None);
    }
}
