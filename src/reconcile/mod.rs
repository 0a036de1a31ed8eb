//! Reconciler (C8) — detects and repairs drift between the catalog and the
//! backend fleets (spec.md §4.8).

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::BackendRegistry;
use crate::store::{KeyRecord, Store};

#[derive(Debug, Clone)]
pub enum Drift {
    /// Present in the catalog, absent on the remote server.
    MissingOnServer { key: KeyRecord },
    /// Present on the remote server, absent in the catalog.
    MissingInLocal { remote_id: String, email: Option<String> },
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub server_id: i64,
    pub drift: Vec<Drift>,
    pub deleted_remote_keys: usize,
    pub deleted_orphan_subscriptions: usize,
}

pub struct Reconciler {
    store: Arc<Store>,
    backends: Arc<dyn BackendRegistry>,
}

impl Reconciler {
    pub fn new(store: Arc<Store>, backends: Arc<dyn BackendRegistry>) -> Self {
        Self { store, backends }
    }

    /// Reconcile a single server. `apply` gates destructive actions —
    /// dry-run only classifies and reports.
    pub async fn reconcile_server(&self, server_id: i64, apply: bool) -> anyhow::Result<ReconcileReport> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("server {server_id} not found"))?;
        let backend = self
            .backends
            .backend_for(server.id, &server.protocol, &server.api_url)?;

        let local = self.store.list_keys_for_server(server.id).await?;
        let remote = backend.get_all_keys().await?;

        let local_ids: HashSet<&str> = local
            .iter()
            .filter_map(|k| k.backend_id.as_deref())
            .collect();
        let local_emails: HashSet<String> = local.iter().map(|k| k.email.to_lowercase()).collect();

        let remote_ids: HashSet<&str> = remote.iter().map(|r| r.remote_id.as_str()).collect();

        let mut drift = Vec::new();

        // Missing on server: local keys whose remote id isn't reported (or
        // that never had one — a legacy row that couldn't be matched by
        // email either).
        for key in &local {
            match &key.backend_id {
                Some(id) if remote_ids.contains(id.as_str()) => {}
                Some(_) => drift.push(Drift::MissingOnServer { key: key.clone() }),
                None => {
                    let matched = remote
                        .iter()
                        .any(|r| r.email.as_deref().map(|e| e.to_lowercase()) == Some(key.email.to_lowercase()));
                    if matched {
                        if let Some(r) = remote.iter().find(|r| {
                            r.email.as_deref().map(|e| e.to_lowercase()) == Some(key.email.to_lowercase())
                        }) {
                            if apply {
                                self.store
                                    .set_key_client_config(&key.backend, key.id, r.access_url.as_deref().unwrap_or(""))
                                    .await
                                    .ok();
                            }
                            info!(key_id = key.id, remote_id = %r.remote_id, "backfilled remote id by email match");
                        }
                    } else {
                        drift.push(Drift::MissingOnServer { key: key.clone() });
                    }
                }
            }
        }

        // Missing in local: remote keys not matched by id or by email.
        let mut deleted = 0usize;
        for r in &remote {
            let matched_by_id = local_ids.contains(r.remote_id.as_str());
            let matched_by_email = r
                .email
                .as_ref()
                .map(|e| local_emails.contains(&e.to_lowercase()))
                .unwrap_or(false);
            if !matched_by_id && !matched_by_email {
                drift.push(Drift::MissingInLocal {
                    remote_id: r.remote_id.clone(),
                    email: r.email.clone(),
                });
                if apply {
                    match backend.delete_user(&r.remote_id).await {
                        Ok(()) => deleted += 1,
                        Err(e) => warn!(remote_id = %r.remote_id, "orphan delete failed: {e:#}"),
                    }
                }
            }
        }

        // Orphan subscription rows: a subscription whose key set (across
        // both key tables) has dropped to zero without the row itself ever
        // being physically removed (spec.md §4.8 step 4, second clause).
        // Not scoped to this server — an empty key set is a property of the
        // subscription, not of any one server's fleet.
        let mut deleted_subscriptions = 0usize;
        if apply {
            for subscription_id in self.store.list_subscriptions_with_no_keys().await? {
                match self
                    .store
                    .with_foreign_keys_off("DELETE FROM subscriptions WHERE id = ?", subscription_id)
                    .await
                {
                    Ok(()) => {
                        deleted_subscriptions += 1;
                        info!(subscription_id, "deleted orphan subscription row with no keys");
                    }
                    Err(e) => warn!(subscription_id, "orphan subscription delete failed: {e:#}"),
                }
            }
        }

        Ok(ReconcileReport {
            server_id: server.id,
            drift,
            deleted_remote_keys: deleted,
            deleted_orphan_subscriptions: deleted_subscriptions,
        })
    }

    /// Reconcile every active server.
    pub async fn reconcile_all(&self, apply: bool) -> anyhow::Result<Vec<ReconcileReport>> {
        let servers = self.store.list_active_servers().await?;
        let mut reports = Vec::with_capacity(servers.len());
        for server in servers {
            match self.reconcile_server(server.id, apply).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(server_id = server.id, "reconcile failed: {e:#}"),
            }
        }
        Ok(reports)
    }
}
