//! Account reconciler - manages user accounts and their SSH keys.

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{Context, Created, Reconciler, Substructures, cluster_id};
use crate::diff::{self, AccountDirective};
use crate::error::{Error, Result};
use crate::id::{ClusterResourceId, ResourceKind};
use crate::model::{AccountDesired, AccountObserved, AppliedPassword};
use crate::remote::NewAccount;

/// Account reconciler.
pub struct AccountReconciler {
    ctx: Context,
}

impl AccountReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Account record plus its SSH keys.
    async fn fetch(&self, id: &str) -> Result<Option<AccountObserved>> {
        let remote = self.ctx.remote();
        let Some(record) = self
            .ctx
            .call("get_account", remote.get_account(id))
            .await?
        else {
            return Ok(None);
        };
        let ssh_keys = self
            .ctx
            .call("list_ssh_keys", remote.list_ssh_keys(id))
            .await?;
        Ok(Some(AccountObserved {
            role: self.ctx.parse_remote("role", &record.role)?,
            email: record.email,
            state: record.state,
            ssh_keys,
            password: None,
        }))
    }

    async fn fetch_required(&self, id: &ClusterResourceId) -> Result<AccountObserved> {
        self.fetch(&id.id).await?.ok_or_else(|| Error::NotFound {
            kind: Self::KIND,
            id: id.to_string(),
        })
    }

    async fn apply(&self, account_id: &str, directive: &AccountDirective) -> Result<()> {
        let remote = self.ctx.remote();
        match directive {
            AccountDirective::ChangeRole { role } => {
                self.ctx
                    .call(
                        "change_account_role",
                        remote.change_account_role(account_id, role.as_str()),
                    )
                    .await?
            }
            AccountDirective::RemoveSshKey { key_id, .. } => {
                self.ctx
                    .call("delete_ssh_key", remote.delete_ssh_key(account_id, *key_id))
                    .await?
            }
            AccountDirective::AddSshKey { key } => {
                self.ctx
                    .call("add_ssh_key", remote.add_ssh_key(account_id, key))
                    .await?
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for AccountReconciler {
    type Desired = AccountDesired;
    type Observed = AccountObserved;

    const KIND: ResourceKind = ResourceKind::Account;

    async fn create(&self, desired: &AccountDesired) -> Result<Created<AccountObserved>> {
        info!("Creating account {}", desired.email);
        let _permit = self.ctx.throttle().acquire().await?;
        let remote = self.ctx.remote();

        if let Some(existing) = self
            .ctx
            .call("find_account", remote.find_account(&desired.email))
            .await?
        {
            let id = ClusterResourceId::new(Self::KIND, existing);
            info!("Account {} already exists as {}", desired.email, id);
            let mut observed = self.fetch_required(&id).await?;
            observed.password = Some(AppliedPassword::new(&desired.password));
            return Ok(Created {
                id: id.to_string(),
                observed,
                adopted: true,
            });
        }

        let request = NewAccount {
            email: desired.email.clone(),
            role: desired.role.to_string(),
            password: desired.password.clone(),
        };
        let raw = self
            .ctx
            .call("create_account", remote.create_account(&request))
            .await?;
        let id = ClusterResourceId::new(Self::KIND, raw);
        info!("Account {} created as {}", desired.email, id);

        let mut progress = Substructures::new(
            desired
                .ssh_keys
                .iter()
                .map(|k| format!("add ssh key {}", k.name))
                .collect(),
        );
        for key in &desired.ssh_keys {
            if let Err(e) = self
                .ctx
                .call("add_ssh_key", remote.add_ssh_key(&id.id, key))
                .await
            {
                error!("Account {} created, but adding ssh keys failed: {}", id, e);
                return Err(progress.failed(&id.to_string(), e));
            }
            progress.applied();
        }

        let mut observed = self.fetch_required(&id).await?;
        observed.password = Some(AppliedPassword::new(&desired.password));
        Ok(Created {
            id: id.to_string(),
            observed,
            adopted: false,
        })
    }

    async fn read(&self, id: &str) -> Result<Option<AccountObserved>> {
        let id = cluster_id(Self::KIND, id)?;
        let _permit = self.ctx.throttle().acquire().await?;
        self.fetch(&id.id).await
    }

    async fn update(
        &self,
        id: &str,
        prior: &AccountObserved,
        desired: &AccountDesired,
    ) -> Result<Option<AccountObserved>> {
        let id = cluster_id(Self::KIND, id)?;
        diff::account(prior, desired)?;

        let _permit = self.ctx.throttle().acquire().await?;
        let Some(mut current) = self.fetch(&id.id).await? else {
            info!("Account {} vanished before update", id);
            return Ok(None);
        };
        current.password.clone_from(&prior.password);
        let directives = diff::account(&current, desired)?;
        info!("Reconciling account {} ({} changes)", id, directives.len());

        for directive in &directives {
            debug!(id = %id, kind = %Self::KIND, directive = %directive, "applying directive");
            self.apply(&id.id, directive).await.inspect_err(|e| {
                error!("Failed to {} on account {}: {}", directive, id, e);
            })?;
        }

        let observed = self.fetch(&id.id).await?;
        Ok(observed.map(|mut o| {
            o.password.clone_from(&prior.password);
            o
        }))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = cluster_id(Self::KIND, id)?;
        info!("Deleting account {}", id);
        let _permit = self.ctx.throttle().acquire().await?;
        self.ctx
            .call("delete_account", self.ctx.remote().delete_account(&id.id))
            .await?;
        Ok(())
    }
}
