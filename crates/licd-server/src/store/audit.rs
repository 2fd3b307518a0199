use serde::{Deserialize, Serialize};

use crate::unix_now;

// ── Action constants ─────────────────────────────────────────────────────────

pub const ACTION_LICENSE_ACTIVATE: &str = "license.activate";
pub const ACTION_LICENSE_DEACTIVATE: &str = "license.deactivate";
pub const ACTION_LICENSE_CREATE: &str = "license.create";

// ── AuditEvent ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub timestamp: i64,
    pub action: String,
    pub license: Option<String>,
    pub hwid: Option<String>,
    pub source_ip: String,
    pub success: bool,
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn new(
        action: &str,
        license: Option<String>,
        hwid: Option<String>,
        source_ip: String,
        success: bool,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: 0, // allocated by store
            timestamp: unix_now(),
            action: action.to_owned(),
            license,
            hwid,
            source_ip,
            success,
            detail,
        }
    }
}

// ── AuditQuery ───────────────────────────────────────────────────────────────

pub struct AuditQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action: Option<String>,
    pub license: Option<String>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            action: None,
            license: None,
            limit: 100,
        }
    }
}
