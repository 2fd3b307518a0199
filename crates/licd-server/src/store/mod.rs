pub mod audit;
pub mod db;
pub mod model;

use anyhow::Result;

pub use audit::{AuditEvent, AuditQuery};
pub use db::Store;
pub use model::{Binding, LicenseRecord, SwapOutcome};

/// The document store the activation engine runs against.
///
/// Calls are blocking; the engine moves them onto the blocking pool and
/// bounds them with a timeout. `swap_license` is the only write the engine
/// performs and must be atomic: it commits `next` only when the stored
/// revision still equals `expected_revision`.
pub trait LicenseStore: Clone + Send + Sync + 'static {
    fn get_license(&self, license_id: &str) -> Result<Option<LicenseRecord>>;

    fn swap_license(
        &self,
        license_id: &str,
        expected_revision: u64,
        next: &Binding,
    ) -> Result<SwapOutcome>;
}
