use serde::{Deserialize, Serialize};

/// Binding state of a license. Records are only ever built from a `Binding`,
/// so `active` and a non-empty `hwid` can never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Unbound,
    Bound(String),
}

impl Binding {
    pub fn device(&self) -> &str {
        match self {
            Self::Unbound => "",
            Self::Bound(device) => device,
        }
    }
}

/// Stored in redb as bincode-encoded bytes, keyed by license id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub license_id: String,
    /// Whether the license is currently bound to a device.
    pub active: bool,
    /// Bound device (hardware id). Empty when unbound.
    pub hwid: String,
    /// Bumped on every committed transition; the precondition for `swap_license`.
    pub revision: u64,
    /// Unix timestamp (seconds) of provisioning.
    pub created_at: i64,
    /// Unix timestamp (seconds) of the last transition.
    pub updated_at: i64,
}

impl LicenseRecord {
    /// A freshly provisioned, unbound record.
    pub fn unbound(license_id: &str, now: i64) -> Self {
        Self {
            license_id: license_id.to_owned(),
            active: false,
            hwid: String::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn binding(&self) -> Binding {
        if self.active {
            Binding::Bound(self.hwid.clone())
        } else {
            Binding::Unbound
        }
    }

    pub fn is_bound_to(&self, device_id: &str) -> bool {
        self.active && self.hwid == device_id
    }

    /// Successor record after committing `next`.
    pub(crate) fn advance(&self, next: &Binding, now: i64) -> Self {
        Self {
            license_id: self.license_id.clone(),
            active: matches!(next, Binding::Bound(_)),
            hwid: next.device().to_owned(),
            revision: self.revision + 1,
            created_at: self.created_at,
            updated_at: now,
        }
    }
}

/// Outcome of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The stored revision matched; the new record is returned.
    Applied(LicenseRecord),
    /// Someone else committed first. Nothing was written.
    Stale,
    /// No record under that id.
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_keeps_active_and_hwid_consistent() {
        let rec = LicenseRecord::unbound("ABC", 10);
        let bound = rec.advance(&Binding::Bound("dev1".into()), 20);
        assert!(bound.active);
        assert_eq!(bound.hwid, "dev1");
        assert_eq!(bound.revision, 1);
        assert_eq!(bound.created_at, 10);
        assert_eq!(bound.updated_at, 20);

        let unbound = bound.advance(&Binding::Unbound, 30);
        assert!(!unbound.active);
        assert!(unbound.hwid.is_empty());
        assert_eq!(unbound.revision, 2);
        assert_eq!(unbound.binding(), Binding::Unbound);
        assert_eq!(unbound.binding().device(), "");
        assert_eq!(bound.binding().device(), "dev1");
    }

    #[test]
    fn is_bound_to_requires_active() {
        let rec = LicenseRecord::unbound("ABC", 0);
        assert!(!rec.is_bound_to(""));
        let bound = rec.advance(&Binding::Bound("dev1".into()), 1);
        assert!(bound.is_bound_to("dev1"));
        assert!(!bound.is_bound_to("dev2"));
    }
}
