use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::observability;

/// Per-tenant engines. Tenant = database name from the pgwire connection;
/// each one gets its own WAL file and compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create (replaying its WAL) the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }
        let safe_name = sanitize(tenant)?;

        // Holding the entry keeps two connections from opening the same WAL twice.
        let engine = self
            .engines
            .entry(tenant.to_string())
            .or_try_insert_with(|| {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                info!("loaded tenant {safe_name}");
                Ok::<_, io::Error>(engine)
            })?
            .value()
            .clone();

        metrics::gauge!(observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

/// Keeps only characters that are safe in a file name.
fn sanitize(tenant: &str) -> io::Result<String> {
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    Ok(safe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    /// 2030-01-07T00:00:00Z, a Monday.
    const MONDAY: Ms = 1_893_974_400_000;
    const HOUR: Ms = 3_600_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn nine_to_five() -> DayRule {
        DayRule {
            start_minute: 9 * 60,
            end_minute: 17 * 60,
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same provider ID in both tenants.
        let pid = Ulid::new();
        eng_a.create_provider(pid, None, ProviderSettings::default()).await.unwrap();
        eng_b.create_provider(pid, None, ProviderSettings::default()).await.unwrap();

        eng_a.set_day_rule(pid, 1, nine_to_five()).await.unwrap();
        eng_a
            .add_blocked_range(
                Ulid::new(),
                pid,
                Span::new(MONDAY + 12 * HOUR, MONDAY + 13 * HOUR).unwrap(),
                None,
            )
            .await
            .unwrap();

        let day = Span::new(MONDAY, MONDAY + 24 * HOUR).unwrap();
        let avail_a = eng_a.compute_availability(pid, day, None).await.unwrap();
        assert_eq!(
            avail_a,
            vec![
                Span::new(MONDAY + 9 * HOUR, MONDAY + 12 * HOUR).unwrap(),
                Span::new(MONDAY + 13 * HOUR, MONDAY + 17 * HOUR).unwrap(),
            ]
        );

        // No hours declared in tenant B.
        let avail_b = eng_b.compute_availability(pid, day, None).await.unwrap();
        assert!(avail_b.is_empty());
        assert!(eng_b.list_blocked_ranges(pid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_state_survives_manager_restart() {
        let dir = test_data_dir("restart");
        let pid = Ulid::new();
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let eng = tm.get_or_create("clinic").unwrap();
            eng.create_provider(pid, Some("Dr. Ada".into()), ProviderSettings::default())
                .await
                .unwrap();
        }

        let tm = TenantManager::new(dir, 1000);
        let eng = tm.get_or_create("clinic").unwrap();
        let providers = eng.list_providers().await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].id, pid);
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
