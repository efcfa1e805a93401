//! VxLAN reconciler - manages overlay networks owned by an account.

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{Context, Created, Reconciler, cluster_id};
use crate::diff::{self, VxlanDirective};
use crate::error::{Error, Result};
use crate::id::{ClusterResourceId, ResourceKind};
use crate::model::{VxlanDesired, VxlanObserved};
use crate::remote::NewVxlan;

/// VxLAN reconciler.
pub struct VxlanReconciler {
    ctx: Context,
}

impl VxlanReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn fetch(&self, id: &str) -> Result<Option<VxlanObserved>> {
        let record = self
            .ctx
            .call("get_vxlan", self.ctx.remote().get_vxlan(id))
            .await?;
        Ok(record.map(|r| VxlanObserved {
            name: r.name,
            account: r.account,
            clusters: r.clusters,
            comment: r.comment,
            ipnets: r.ipnets,
            ippool: r.ippool,
        }))
    }

    async fn fetch_required(&self, id: &ClusterResourceId) -> Result<VxlanObserved> {
        self.fetch(&id.id).await?.ok_or_else(|| Error::NotFound {
            kind: Self::KIND,
            id: id.to_string(),
        })
    }

    async fn apply(&self, vxlan_id: &str, directive: &VxlanDirective) -> Result<()> {
        let remote = self.ctx.remote();
        match directive {
            VxlanDirective::UpdateComment { comment } => {
                self.ctx
                    .call(
                        "update_vxlan_comment",
                        remote.update_vxlan_comment(vxlan_id, comment),
                    )
                    .await?
            }
            VxlanDirective::RemoveIpnet { ipnet_id, .. } => {
                self.ctx
                    .call(
                        "delete_vxlan_ipnet",
                        remote.delete_vxlan_ipnet(vxlan_id, *ipnet_id),
                    )
                    .await?
            }
            VxlanDirective::AddIpnet { ipnet } => {
                self.ctx
                    .call("add_vxlan_ipnet", remote.add_vxlan_ipnet(vxlan_id, ipnet))
                    .await?
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VxlanReconciler {
    type Desired = VxlanDesired;
    type Observed = VxlanObserved;

    const KIND: ResourceKind = ResourceKind::Vxlan;

    async fn create(&self, desired: &VxlanDesired) -> Result<Created<VxlanObserved>> {
        info!("Creating VxLAN {} for account {}", desired.name, desired.account);
        let _permit = self.ctx.throttle().acquire().await?;
        let remote = self.ctx.remote();

        if let Some(existing) = self
            .ctx
            .call(
                "find_vxlan",
                remote.find_vxlan(desired.account, &desired.name),
            )
            .await?
        {
            let id = ClusterResourceId::new(Self::KIND, existing);
            info!("VxLAN {} already exists as {}", desired.name, id);
            return Ok(Created {
                observed: self.fetch_required(&id).await?,
                id: id.to_string(),
                adopted: true,
            });
        }

        let request = NewVxlan {
            name: desired.name.clone(),
            comment: desired.comment.clone(),
            account: desired.account,
            clusters: desired.clusters.clone(),
            ipnets: desired.ipnets.clone(),
        };
        let raw = self
            .ctx
            .call("create_vxlan", remote.create_vxlan(&request))
            .await?;
        let id = ClusterResourceId::new(Self::KIND, raw);
        info!("VxLAN {} created as {}", desired.name, id);

        Ok(Created {
            observed: self.fetch_required(&id).await?,
            id: id.to_string(),
            adopted: false,
        })
    }

    async fn read(&self, id: &str) -> Result<Option<VxlanObserved>> {
        let id = cluster_id(Self::KIND, id)?;
        let _permit = self.ctx.throttle().acquire().await?;
        self.fetch(&id.id).await
    }

    async fn update(
        &self,
        id: &str,
        prior: &VxlanObserved,
        desired: &VxlanDesired,
    ) -> Result<Option<VxlanObserved>> {
        let id = cluster_id(Self::KIND, id)?;
        diff::vxlan(prior, desired)?;

        let _permit = self.ctx.throttle().acquire().await?;
        let Some(current) = self.fetch(&id.id).await? else {
            info!("VxLAN {} vanished before update", id);
            return Ok(None);
        };
        let directives = diff::vxlan(&current, desired)?;
        info!("Reconciling VxLAN {} ({} changes)", id, directives.len());

        for directive in &directives {
            debug!(id = %id, kind = %Self::KIND, directive = %directive, "applying directive");
            self.apply(&id.id, directive).await.inspect_err(|e| {
                error!("Failed to {} on VxLAN {}: {}", directive, id, e);
            })?;
        }

        self.fetch(&id.id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = cluster_id(Self::KIND, id)?;
        info!("Deleting VxLAN {}", id);
        let _permit = self.ctx.throttle().acquire().await?;
        self.ctx
            .call("delete_vxlan", self.ctx.remote().delete_vxlan(&id.id))
            .await?;
        Ok(())
    }
}
