//! Tenant store: authentication, isolation roots, usage accounting.
//!
//! Tenants are created out-of-band (admin API), never auto-created by
//! ingest. Credentials are stored as salted SHA-256 digests; the plaintext
//! is returned exactly once at creation and exists here only transiently
//! during verification. Every credential resolves to at most one active
//! tenant.
//!
//! Usage records are append-only; the billing pipeline that reads them is an
//! external collaborator.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use zeroize::Zeroizing;

use crate::now_epoch_s;

/// One tenant row.
#[derive(Clone, Debug)]
pub struct TenantRecord {
    pub id: i64,
    pub name: String,
    pub contact_email: Option<String>,
    pub active: bool,
    pub created_at: i64,
}

/// Per-endpoint usage rollup for the usage endpoint.
#[derive(Clone, Debug, serde::Serialize)]
pub struct UsageAggregate {
    pub endpoint: String,
    pub calls: u64,
    pub total_cost: f64,
}

/// SQLite-backed tenant/credential/usage store. The connection is serialized
/// behind a mutex; per-tenant usage appends are therefore totally ordered.
pub struct TenantStore {
    conn: Mutex<Connection>,
}

impl TenantStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = if db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(db_path)?
        };
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS tenants (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              contact_email TEXT,
              active INTEGER NOT NULL DEFAULT 1,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              tenant_id INTEGER NOT NULL REFERENCES tenants(id),
              salt TEXT NOT NULL,
              digest TEXT NOT NULL,
              active INTEGER NOT NULL DEFAULT 1,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS usage_records (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              tenant_id INTEGER NOT NULL REFERENCES tenants(id),
              endpoint TEXT NOT NULL,
              ts INTEGER NOT NULL,
              cost REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_credentials_active ON credentials(active);
            CREATE INDEX IF NOT EXISTS idx_usage_tenant ON usage_records(tenant_id, ts);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("tenant store poisoned")
    }

    // -------------------- Tenants --------------------

    /// Create a tenant and its first credential. The plaintext credential is
    /// returned exactly once; only its salted digest is stored.
    pub fn create_tenant(
        &self,
        name: &str,
        contact_email: Option<&str>,
    ) -> Result<(TenantRecord, String)> {
        if name.trim().is_empty() {
            return Err(anyhow!("tenant name must not be empty"));
        }
        let created_at = now_epoch_s() as i64;
        let tenant_id = {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO tenants (name, contact_email, active, created_at) VALUES (?1, ?2, 1, ?3)",
                params![name.trim(), contact_email, created_at],
            )?;
            conn.last_insert_rowid()
        };
        let plaintext = self.issue_credential(tenant_id)?;
        let record = self
            .get_tenant(tenant_id)?
            .ok_or_else(|| anyhow!("tenant {} vanished during creation", tenant_id))?;
        log::info!("tenant created id={} name={}", tenant_id, record.name);
        Ok((record, plaintext))
    }

    /// Issue a fresh credential for an existing tenant.
    pub fn issue_credential(&self, tenant_id: i64) -> Result<String> {
        let plaintext = Zeroizing::new(hex::encode(rand::random::<[u8; 24]>()));
        let salt = hex::encode(rand::random::<[u8; 16]>());
        let digest = credential_digest(&salt, &plaintext);
        let created_at = now_epoch_s() as i64;
        self.lock().execute(
            "INSERT INTO credentials (tenant_id, salt, digest, active, created_at) VALUES (?1, ?2, ?3, 1, ?4)",
            params![tenant_id, salt, digest, created_at],
        )?;
        Ok(plaintext.to_string())
    }

    pub fn get_tenant(&self, tenant_id: i64) -> Result<Option<TenantRecord>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, contact_email, active, created_at FROM tenants WHERE id = ?1",
                params![tenant_id],
                tenant_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_tenants(&self) -> Result<Vec<TenantRecord>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, contact_email, active, created_at FROM tenants ORDER BY id")?;
        let rows = stmt.query_map([], tenant_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Deactivate a tenant and all its credentials. Returns how many
    /// credentials were revoked.
    pub fn revoke_tenant(&self, tenant_id: i64) -> Result<usize> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE tenants SET active = 0 WHERE id = ?1",
            params![tenant_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("tenant {} not found", tenant_id));
        }
        let count = conn.execute(
            "UPDATE credentials SET active = 0 WHERE tenant_id = ?1 AND active = 1",
            params![tenant_id],
        )?;
        log::info!("tenant revoked id={} credentials_revoked={}", tenant_id, count);
        Ok(count)
    }

    /// Reactivate a tenant and its credentials. Returns how many credentials
    /// were reactivated.
    pub fn reactivate_tenant(&self, tenant_id: i64) -> Result<usize> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE tenants SET active = 1 WHERE id = ?1",
            params![tenant_id],
        )?;
        if changed == 0 {
            return Err(anyhow!("tenant {} not found", tenant_id));
        }
        let count = conn.execute(
            "UPDATE credentials SET active = 1 WHERE tenant_id = ?1 AND active = 0",
            params![tenant_id],
        )?;
        log::info!("tenant reactivated id={} credentials_reactivated={}", tenant_id, count);
        Ok(count)
    }

    // -------------------- Authentication --------------------

    /// Resolve a presented credential to its active tenant. `None` covers
    /// unknown, revoked, and inactive-tenant credentials alike; the caller
    /// maps all of them to 401 without distinguishing.
    pub fn authenticate(&self, presented: &str) -> Result<Option<TenantRecord>> {
        let presented = presented.trim();
        if presented.is_empty() {
            return Ok(None);
        }
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT c.salt, c.digest, t.id, t.name, t.contact_email, t.active, t.created_at
             FROM credentials c JOIN tenants t ON t.id = c.tenant_id
             WHERE c.active = 1 AND t.active = 1",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let salt: String = row.get(0)?;
            let digest: String = row.get(1)?;
            if credential_digest(&salt, presented) == digest {
                return Ok(Some(TenantRecord {
                    id: row.get(2)?,
                    name: row.get(3)?,
                    contact_email: row.get(4)?,
                    active: row.get::<_, i64>(5)? != 0,
                    created_at: row.get(6)?,
                }));
            }
        }
        Ok(None)
    }

    // -------------------- Usage --------------------

    /// Append-only usage record. Cost units are handler-defined.
    pub fn record_usage(&self, tenant_id: i64, endpoint: &str, cost: f64) -> Result<()> {
        let ts = now_epoch_s() as i64;
        self.lock()
            .execute(
                "INSERT INTO usage_records (tenant_id, endpoint, ts, cost) VALUES (?1, ?2, ?3, ?4)",
                params![tenant_id, endpoint, ts, cost],
            )
            .context("append usage record")?;
        Ok(())
    }

    pub fn usage_summary(&self, tenant_id: i64) -> Result<Vec<UsageAggregate>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT endpoint, COUNT(*), SUM(cost) FROM usage_records
             WHERE tenant_id = ?1 GROUP BY endpoint ORDER BY endpoint",
        )?;
        let rows = stmt.query_map(params![tenant_id], |row| {
            Ok(UsageAggregate {
                endpoint: row.get(0)?,
                calls: row.get::<_, i64>(1)? as u64,
                total_cost: row.get::<_, f64>(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn tenant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantRecord> {
    Ok(TenantRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        contact_email: row.get(2)?,
        active: row.get::<_, i64>(3)? != 0,
        created_at: row.get(4)?,
    })
}

/// `hex(SHA256(salt || plaintext))`. The concatenation buffer is zeroized
/// as soon as the digest exists.
fn credential_digest(salt: &str, plaintext: &str) -> String {
    let mut material = Zeroizing::new(Vec::with_capacity(salt.len() + plaintext.len()));
    material.extend_from_slice(salt.as_bytes());
    material.extend_from_slice(plaintext.as_bytes());
    hex::encode(Sha256::digest(material.as_slice()))
}
