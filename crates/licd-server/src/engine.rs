//! License binding state machine.
//!
//! ```text
//! UNBOUND --activate(d1)--> BOUND(d1) --activate(d1)--> BOUND(d1)
//!    ^                        |   \--activate(d2)--> Conflict
//!    +-----deactivate(d1)-----+
//! ```
//!
//! Every transition is a read followed by a conditional swap against the
//! observed revision. The store is the only synchronization point, so two
//! instances racing on the same license resolve to a single winner.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ActivationError, ActivationResult};
use crate::store::{Binding, LicenseRecord, LicenseStore, SwapOutcome};
use crate::token::Assertion;
use crate::unix_now;

/// Longest accepted license or hardware id, in bytes.
pub const MAX_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Upper bound on a single store call.
    pub store_timeout: Duration,
    /// Read/swap rounds before giving up with `Contended`.
    pub max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

#[derive(Clone)]
pub struct Engine<S> {
    store: S,
    config: EngineConfig,
}

impl<S: LicenseStore> Engine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Bind `license_id` to `device_id`, or confirm an existing binding to
    /// the same device.
    pub async fn activate(&self, license_id: &str, device_id: &str) -> ActivationResult<Assertion> {
        validate_id("license", license_id, false)?;
        validate_id("hwid", device_id, false)?;

        for attempt in 1..=self.config.max_attempts {
            let record = self.fetch(license_id).await?;
            match record.binding() {
                Binding::Bound(ref bound) if bound == device_id => {
                    debug!(license = %license_id, hwid = %device_id, "re-activation of bound device");
                    return Ok(assertion(license_id, device_id));
                }
                Binding::Bound(_) => return Err(ActivationError::Conflict),
                Binding::Unbound => {
                    let next = Binding::Bound(device_id.to_owned());
                    match self.swap(license_id, record.revision, next).await? {
                        SwapOutcome::Applied(_) => {
                            info!(license = %license_id, hwid = %device_id, "license bound");
                            return Ok(assertion(license_id, device_id));
                        }
                        SwapOutcome::Stale => {
                            debug!(license = %license_id, attempt, "bind lost a race, re-reading");
                        }
                        SwapOutcome::Missing => return Err(ActivationError::NotFound),
                    }
                }
            }
        }

        warn!(license = %license_id, attempts = self.config.max_attempts, "activation contended");
        Err(ActivationError::Contended)
    }

    /// Release the binding held by `device_id`.
    ///
    /// The device check is applied to inactive records too: an unbound
    /// license only matches an empty `device_id`, and that call is a no-op.
    pub async fn deactivate(&self, license_id: &str, device_id: &str) -> ActivationResult<()> {
        validate_id("license", license_id, false)?;
        validate_id("hwid", device_id, true)?;

        for attempt in 1..=self.config.max_attempts {
            let record = self.fetch(license_id).await?;
            if record.hwid != device_id {
                return Err(ActivationError::Mismatch);
            }
            if !record.active {
                return Ok(());
            }
            match self.swap(license_id, record.revision, Binding::Unbound).await? {
                SwapOutcome::Applied(_) => {
                    info!(license = %license_id, hwid = %device_id, "license released");
                    return Ok(());
                }
                SwapOutcome::Stale => {
                    debug!(license = %license_id, attempt, "release lost a race, re-reading");
                }
                SwapOutcome::Missing => return Err(ActivationError::NotFound),
            }
        }

        warn!(license = %license_id, attempts = self.config.max_attempts, "deactivation contended");
        Err(ActivationError::Contended)
    }

    async fn fetch(&self, license_id: &str) -> ActivationResult<LicenseRecord> {
        let id = license_id.to_owned();
        self.run_store(move |store| store.get_license(&id))
            .await?
            .ok_or(ActivationError::NotFound)
    }

    async fn swap(
        &self,
        license_id: &str,
        expected_revision: u64,
        next: Binding,
    ) -> ActivationResult<SwapOutcome> {
        let id = license_id.to_owned();
        self.run_store(move |store| store.swap_license(&id, expected_revision, &next))
            .await
    }

    /// Run a blocking store call on the blocking pool, bounded by the timeout.
    /// A call that times out may still commit; callers see a transient error
    /// and a retry observes whatever was committed.
    pub(crate) async fn run_store<T, F>(&self, op: F) -> ActivationResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> anyhow::Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        let task = tokio::task::spawn_blocking(move || op(&store));
        match tokio::time::timeout(self.config.store_timeout, task).await {
            Err(_) => Err(ActivationError::Timeout(self.config.store_timeout)),
            Ok(Err(join_err)) => Err(ActivationError::StoreUnavailable(
                anyhow::Error::new(join_err).context("store task failed"),
            )),
            Ok(Ok(result)) => result.map_err(ActivationError::StoreUnavailable),
        }
    }
}

fn assertion(license_id: &str, device_id: &str) -> Assertion {
    Assertion {
        license_id: license_id.to_owned(),
        device_id: device_id.to_owned(),
        issued_at: unix_now(),
    }
}

fn validate_id(field: &str, value: &str, allow_empty: bool) -> ActivationResult<()> {
    if value.is_empty() && !allow_empty {
        return Err(ActivationError::InvalidRequest(format!("{field} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ActivationError::InvalidRequest(format!(
            "{field} must be at most {MAX_ID_LEN} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use tempfile::tempdir;

    fn make_engine() -> (Engine<Store>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let config = EngineConfig {
            store_timeout: Duration::from_secs(10),
            max_attempts: 3,
        };
        (Engine::new(store, config), dir)
    }

    fn state(engine: &Engine<Store>, id: &str) -> LicenseRecord {
        let rec = engine.store().get_license(id).unwrap().unwrap();
        assert_eq!(rec.active, !rec.hwid.is_empty(), "active/hwid invariant broken: {rec:?}");
        rec
    }

    #[tokio::test]
    async fn activate_unbound_binds_device() {
        let (e, _dir) = make_engine();
        e.store().create_license("ABC").unwrap();

        let a = e.activate("ABC", "dev1").await.unwrap();
        assert_eq!(a.license_id, "ABC");
        assert_eq!(a.device_id, "dev1");
        assert!(state(&e, "ABC").is_bound_to("dev1"));
    }

    #[tokio::test]
    async fn reactivation_is_idempotent() {
        let (e, _dir) = make_engine();
        e.store().create_license("ABC").unwrap();

        e.activate("ABC", "dev1").await.unwrap();
        let before = state(&e, "ABC");
        e.activate("ABC", "dev1").await.unwrap();
        let after = state(&e, "ABC");
        assert_eq!(before, after);
        assert_eq!(after.revision, 1);
    }

    #[tokio::test]
    async fn other_device_conflicts_without_state_change() {
        let (e, _dir) = make_engine();
        e.store().create_license("ABC").unwrap();
        e.activate("ABC", "dev1").await.unwrap();

        let err = e.activate("ABC", "dev2").await.unwrap_err();
        assert!(matches!(err, ActivationError::Conflict));
        assert!(state(&e, "ABC").is_bound_to("dev1"));
    }

    #[tokio::test]
    async fn deactivate_by_owner_unbinds() {
        let (e, _dir) = make_engine();
        e.store().create_license("ABC").unwrap();
        e.activate("ABC", "dev1").await.unwrap();

        e.deactivate("ABC", "dev1").await.unwrap();
        let rec = state(&e, "ABC");
        assert!(!rec.active);
        assert!(rec.hwid.is_empty());
    }

    #[tokio::test]
    async fn deactivate_by_other_device_mismatches() {
        let (e, _dir) = make_engine();
        e.store().create_license("ABC").unwrap();
        e.activate("ABC", "dev1").await.unwrap();

        let err = e.deactivate("ABC", "dev2").await.unwrap_err();
        assert!(matches!(err, ActivationError::Mismatch));
        assert!(state(&e, "ABC").is_bound_to("dev1"));
    }

    #[tokio::test]
    async fn deactivate_inactive_only_matches_empty_device() {
        let (e, _dir) = make_engine();
        e.store().create_license("ABC").unwrap();

        let err = e.deactivate("ABC", "dev1").await.unwrap_err();
        assert!(matches!(err, ActivationError::Mismatch));

        e.deactivate("ABC", "").await.unwrap();
        assert_eq!(state(&e, "ABC").revision, 0);
    }

    #[tokio::test]
    async fn missing_license_is_not_found() {
        let (e, _dir) = make_engine();
        assert!(matches!(
            e.activate("missing-license", "dev1").await.unwrap_err(),
            ActivationError::NotFound
        ));
        assert!(matches!(
            e.deactivate("missing-license", "dev1").await.unwrap_err(),
            ActivationError::NotFound
        ));
    }

    #[tokio::test]
    async fn empty_ids_are_rejected() {
        let (e, _dir) = make_engine();
        e.store().create_license("ABC").unwrap();
        assert!(matches!(
            e.activate("ABC", "").await.unwrap_err(),
            ActivationError::InvalidRequest(_)
        ));
        assert!(matches!(
            e.activate("", "dev1").await.unwrap_err(),
            ActivationError::InvalidRequest(_)
        ));
        assert!(matches!(
            e.activate("ABC", &"x".repeat(MAX_ID_LEN + 1)).await.unwrap_err(),
            ActivationError::InvalidRequest(_)
        ));
        assert!(!state(&e, "ABC").active);
    }

    #[tokio::test]
    async fn full_lifecycle_rebinds_to_new_device() {
        let (e, _dir) = make_engine();
        e.store().create_license("ABC").unwrap();

        e.activate("ABC", "dev1").await.unwrap();
        assert!(e.activate("ABC", "dev2").await.is_err());
        e.deactivate("ABC", "dev1").await.unwrap();
        assert!(!state(&e, "ABC").active);
        e.activate("ABC", "dev2").await.unwrap();
        let rec = state(&e, "ABC");
        assert!(rec.is_bound_to("dev2"));
        assert_eq!(rec.revision, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_activations_have_one_winner() {
        let (e, _dir) = make_engine();
        e.store().create_license("RACE").unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let e = e.clone();
                tokio::spawn(async move { e.activate("RACE", &format!("dev{i}")).await })
            })
            .collect();

        let mut winners = Vec::new();
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(a) => winners.push(a.device_id),
                Err(ActivationError::Conflict) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(winners.len(), 1, "winners: {winners:?}");
        assert_eq!(conflicts, 15);
        let rec = state(&e, "RACE");
        assert!(rec.is_bound_to(&winners[0]));
        assert_eq!(rec.revision, 1);
    }

    // ── Store fault injection ────────────────────────────────────────────

    /// Store that always reports an unbound record and never lets a swap win.
    #[derive(Clone)]
    struct AlwaysStale;

    impl LicenseStore for AlwaysStale {
        fn get_license(&self, license_id: &str) -> anyhow::Result<Option<LicenseRecord>> {
            Ok(Some(LicenseRecord::unbound(license_id, 0)))
        }

        fn swap_license(&self, _: &str, _: u64, _: &Binding) -> anyhow::Result<SwapOutcome> {
            Ok(SwapOutcome::Stale)
        }
    }

    #[derive(Clone)]
    struct Slow(Duration);

    impl LicenseStore for Slow {
        fn get_license(&self, license_id: &str) -> anyhow::Result<Option<LicenseRecord>> {
            std::thread::sleep(self.0);
            Ok(Some(LicenseRecord::unbound(license_id, 0)))
        }

        fn swap_license(&self, _: &str, _: u64, _: &Binding) -> anyhow::Result<SwapOutcome> {
            anyhow::bail!("unreachable in tests")
        }
    }

    #[derive(Clone)]
    struct Broken;

    impl LicenseStore for Broken {
        fn get_license(&self, _: &str) -> anyhow::Result<Option<LicenseRecord>> {
            anyhow::bail!("connection refused")
        }

        fn swap_license(&self, _: &str, _: u64, _: &Binding) -> anyhow::Result<SwapOutcome> {
            anyhow::bail!("connection refused")
        }
    }

    /// Store whose record stays bound to `dev1` while every swap loses.
    #[derive(Clone)]
    struct BoundStale;

    impl LicenseStore for BoundStale {
        fn get_license(&self, license_id: &str) -> anyhow::Result<Option<LicenseRecord>> {
            let rec = LicenseRecord::unbound(license_id, 0);
            Ok(Some(rec.advance(&Binding::Bound("dev1".into()), 0)))
        }

        fn swap_license(&self, _: &str, _: u64, _: &Binding) -> anyhow::Result<SwapOutcome> {
            Ok(SwapOutcome::Stale)
        }
    }

    #[tokio::test]
    async fn endless_release_races_give_up_as_contended() {
        let e = Engine::new(BoundStale, EngineConfig::default());
        let err = e.deactivate("ABC", "dev1").await.unwrap_err();
        assert!(matches!(err, ActivationError::Contended));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn run_store_bounds_arbitrary_calls() {
        let config = EngineConfig {
            store_timeout: Duration::from_millis(20),
            max_attempts: 1,
        };
        let e = Engine::new(Slow(Duration::from_millis(500)), config);
        let err = e
            .run_store(|store| store.get_license("ABC"))
            .await
            .unwrap_err();
        assert!(matches!(err, ActivationError::Timeout(_)));

        let e = Engine::new(Broken, EngineConfig::default());
        let err = e.run_store(|store| store.get_license("ABC")).await.unwrap_err();
        assert!(matches!(err, ActivationError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn endless_races_give_up_as_contended() {
        let e = Engine::new(AlwaysStale, EngineConfig::default());
        let err = e.activate("ABC", "dev1").await.unwrap_err();
        assert!(matches!(err, ActivationError::Contended));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn slow_store_times_out_as_transient() {
        let config = EngineConfig {
            store_timeout: Duration::from_millis(20),
            max_attempts: 3,
        };
        let e = Engine::new(Slow(Duration::from_millis(500)), config);
        let err = e.activate("ABC", "dev1").await.unwrap_err();
        assert!(matches!(err, ActivationError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn store_failure_is_unavailable_not_conflict() {
        let e = Engine::new(Broken, EngineConfig::default());
        let err = e.activate("ABC", "dev1").await.unwrap_err();
        assert!(matches!(err, ActivationError::StoreUnavailable(_)));
        let err = e.deactivate("ABC", "dev1").await.unwrap_err();
        assert!(matches!(err, ActivationError::StoreUnavailable(_)));
    }
}
