//! Network reconciler - manages IP networks known to the remote IPAM.

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{Context, Created, Reconciler, cluster_id};
use crate::diff::{self, NetworkDirective};
use crate::error::{Error, Result};
use crate::id::{ClusterResourceId, ResourceKind};
use crate::model::{NetworkDesired, NetworkObserved};
use crate::remote::NewNetwork;

/// Network reconciler.
pub struct NetworkReconciler {
    ctx: Context,
}

impl NetworkReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn fetch(&self, id: &str) -> Result<Option<NetworkObserved>> {
        let record = self
            .ctx
            .call("get_network", self.ctx.remote().get_network(id))
            .await?;
        Ok(record.map(|r| NetworkObserved {
            network: r.name,
            gateway: r.gateway,
            desc: r.note,
        }))
    }

    async fn fetch_required(&self, id: &ClusterResourceId) -> Result<NetworkObserved> {
        self.fetch(&id.id).await?.ok_or_else(|| Error::NotFound {
            kind: Self::KIND,
            id: id.to_string(),
        })
    }
}

#[async_trait]
impl Reconciler for NetworkReconciler {
    type Desired = NetworkDesired;
    type Observed = NetworkObserved;

    const KIND: ResourceKind = ResourceKind::Network;

    async fn create(&self, desired: &NetworkDesired) -> Result<Created<NetworkObserved>> {
        info!("Creating network {}", desired.network);
        let _permit = self.ctx.throttle().acquire().await?;
        let remote = self.ctx.remote();

        if let Some(existing) = self
            .ctx
            .call("find_network", remote.find_network(&desired.network))
            .await?
        {
            let id = ClusterResourceId::new(Self::KIND, existing);
            info!("Network {} already exists as {}", desired.network, id);
            let observed = self.fetch_required(&id).await?;
            return Ok(Created {
                id: id.to_string(),
                observed,
                adopted: true,
            });
        }

        let request = NewNetwork {
            name: desired.network.clone(),
            gateway: desired.gateway.clone(),
            note: desired.desc.clone(),
        };
        let raw = self
            .ctx
            .call("create_network", remote.create_network(&request))
            .await?;
        let id = ClusterResourceId::new(Self::KIND, raw);
        info!("Network {} created as {}", desired.network, id);

        let observed = self.fetch_required(&id).await?;
        Ok(Created {
            id: id.to_string(),
            observed,
            adopted: false,
        })
    }

    async fn read(&self, id: &str) -> Result<Option<NetworkObserved>> {
        let id = cluster_id(Self::KIND, id)?;
        let _permit = self.ctx.throttle().acquire().await?;
        self.fetch(&id.id).await
    }

    async fn update(
        &self,
        id: &str,
        prior: &NetworkObserved,
        desired: &NetworkDesired,
    ) -> Result<Option<NetworkObserved>> {
        let id = cluster_id(Self::KIND, id)?;
        diff::network(prior, desired)?;

        let _permit = self.ctx.throttle().acquire().await?;
        let Some(current) = self.fetch(&id.id).await? else {
            info!("Network {} vanished before update", id);
            return Ok(None);
        };
        let directives = diff::network(&current, desired)?;
        info!("Reconciling network {} ({} changes)", id, directives.len());

        let remote = self.ctx.remote();
        for directive in &directives {
            debug!(id = %id, kind = %Self::KIND, directive = %directive, "applying directive");
            match directive {
                NetworkDirective::UpdateDescription { desc } => {
                    self.ctx
                        .call(
                            "update_network_description",
                            remote.update_network_description(&id.id, desc),
                        )
                        .await
                        .inspect_err(|e| {
                            error!("Failed to {} on network {}: {}", directive, id, e);
                        })?
                }
            }
        }

        self.fetch(&id.id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = cluster_id(Self::KIND, id)?;
        info!("Deleting network {}", id);
        let _permit = self.ctx.throttle().acquire().await?;
        self.ctx
            .call("delete_network", self.ctx.remote().delete_network(&id.id))
            .await?;
        Ok(())
    }
}
