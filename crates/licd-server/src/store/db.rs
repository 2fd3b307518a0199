use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use super::audit::{AuditEvent, AuditQuery};
use super::model::{Binding, LicenseRecord, SwapOutcome};
use super::LicenseStore;
use crate::unix_now;

const LICENSES: TableDefinition<&str, &[u8]> = TableDefinition::new("licenses");
const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const AUDIT_SEQ_KEY: &str = "audit_seq";

/// Leading byte of every stored license record, ahead of the bincode payload.
const RECORD_FORMAT_V1: u8 = 0x01;

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(LICENSES)?;
        write_txn.open_table(AUDIT_LOG)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Provision an unbound license. Returns `None` if the id is already taken;
    /// existing records are never overwritten.
    pub fn create_license(&self, license_id: &str) -> Result<Option<LicenseRecord>> {
        let record = LicenseRecord::unbound(license_id, unix_now());
        let bytes = encode(&record)?;

        let write_txn = self.db.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(LICENSES)?;
            let exists = table.get(license_id)?.is_some();
            if exists {
                false
            } else {
                table.insert(license_id, bytes.as_slice())?;
                true
            }
        };
        write_txn.commit()?;

        if created {
            info!(license = %license_id, "provisioned license");
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// List every license record in key order.
    pub fn list_licenses(&self) -> Result<Vec<LicenseRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LICENSES)?;

        let mut records = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            records.push(decode(v.value())?);
        }
        Ok(records)
    }

    // ── Audit log ─────────────────────────────────────────────────────────

    /// Record an audit event. Allocates a monotonic ID via the counters table.
    pub fn record_audit(&self, mut event: AuditEvent) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let seq = counters.get(AUDIT_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert(AUDIT_SEQ_KEY, seq)?;
            event.id = seq;

            let bytes = bincode::serde::encode_to_vec(&event, bincode::config::standard())
                .context("bincode encode audit event")?;
            let mut audit = write_txn.open_table(AUDIT_LOG)?;
            audit.insert(event.id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// List audit events matching the query, most recent first.
    pub fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_LOG)?;

        let mut events = Vec::new();
        for item in table.iter()?.rev() {
            let (_k, v) = item?;
            let (event, _): (AuditEvent, _) =
                bincode::serde::decode_from_slice(v.value(), bincode::config::standard())
                    .context("bincode decode audit event")?;

            if let Some(since) = query.since {
                if event.timestamp < since {
                    break; // IDs are monotonic, older events follow.
                }
            }
            if let Some(until) = query.until {
                if event.timestamp > until {
                    continue;
                }
            }
            if let Some(ref action) = query.action {
                if event.action != *action {
                    continue;
                }
            }
            if let Some(ref license) = query.license {
                if event.license.as_deref() != Some(license.as_str()) {
                    continue;
                }
            }
            events.push(event);
            if events.len() >= query.limit {
                break;
            }
        }
        Ok(events)
    }
}

impl LicenseStore for Store {
    fn get_license(&self, license_id: &str) -> Result<Option<LicenseRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LICENSES)?;

        let raw_bytes: Option<Vec<u8>> = table.get(license_id)?.map(|guard| guard.value().to_vec());
        raw_bytes.as_deref().map(decode).transpose()
    }

    /// redb serializes write transactions, so the revision check and the
    /// insert below observe the same committed state.
    fn swap_license(
        &self,
        license_id: &str,
        expected_revision: u64,
        next: &Binding,
    ) -> Result<SwapOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(LICENSES)?;

            // Clone the bytes so the AccessGuard (which borrows `table`) is
            // dropped before the insert.
            let raw_bytes: Option<Vec<u8>> =
                table.get(license_id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => SwapOutcome::Missing,
                Some(bytes) => {
                    let current = decode(&bytes)?;
                    if current.revision != expected_revision {
                        debug!(
                            license = %license_id,
                            expected = expected_revision,
                            found = current.revision,
                            "conditional update lost"
                        );
                        SwapOutcome::Stale
                    } else {
                        let updated = current.advance(next, unix_now());
                        let encoded = encode(&updated)?;
                        table.insert(license_id, encoded.as_slice())?;
                        SwapOutcome::Applied(updated)
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }
}

/// Encode a LicenseRecord as `[RECORD_FORMAT_V1] + bincode(record)`.
fn encode(record: &LicenseRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT_V1);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<LicenseRecord> {
    match bytes.split_first() {
        None => anyhow::bail!("empty record"),
        Some((&RECORD_FORMAT_V1, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode license record")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format 0x{marker:02x}"),
    }
}
