//! Pool reconciler - manages IP address pools and their ranges.

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{Context, Created, Reconciler, cluster_id};
use crate::diff::{self, PoolDirective};
use crate::error::{Error, Result};
use crate::id::{ClusterResourceId, ResourceKind};
use crate::model::{PoolDesired, PoolObserved};
use crate::remote::NewPool;

/// Pool reconciler.
pub struct PoolReconciler {
    ctx: Context,
}

impl PoolReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn fetch(&self, id: &str) -> Result<Option<PoolObserved>> {
        let record = self
            .ctx
            .call("get_pool", self.ctx.remote().get_pool(id))
            .await?;
        Ok(record.map(|r| PoolObserved {
            pool: r.name,
            desc: r.note,
            cluster: r.cluster,
            ranges: r.ranges,
        }))
    }

    async fn fetch_required(&self, id: &ClusterResourceId) -> Result<PoolObserved> {
        self.fetch(&id.id).await?.ok_or_else(|| Error::NotFound {
            kind: Self::KIND,
            id: id.to_string(),
        })
    }

    async fn apply(&self, pool_id: &str, directive: &PoolDirective) -> Result<()> {
        let remote = self.ctx.remote();
        match directive {
            PoolDirective::UpdateSettings { name, desc } => {
                self.ctx
                    .call(
                        "update_pool_settings",
                        remote.update_pool_settings(pool_id, name, desc),
                    )
                    .await?
            }
            PoolDirective::RemoveRange { range_id, .. } => {
                self.ctx
                    .call("delete_pool_range", remote.delete_pool_range(*range_id))
                    .await?
            }
            PoolDirective::AddRange { range } => {
                self.ctx
                    .call("create_pool_range", remote.create_pool_range(pool_id, range))
                    .await?
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for PoolReconciler {
    type Desired = PoolDesired;
    type Observed = PoolObserved;

    const KIND: ResourceKind = ResourceKind::Pool;

    async fn create(&self, desired: &PoolDesired) -> Result<Created<PoolObserved>> {
        info!("Creating pool {}", desired.pool);
        let _permit = self.ctx.throttle().acquire().await?;
        let remote = self.ctx.remote();

        if let Some(existing) = self
            .ctx
            .call("find_pool", remote.find_pool(&desired.pool))
            .await?
        {
            let id = ClusterResourceId::new(Self::KIND, existing);
            info!("Pool {} already exists as {}", desired.pool, id);
            return Ok(Created {
                observed: self.fetch_required(&id).await?,
                id: id.to_string(),
                adopted: true,
            });
        }

        let request = NewPool {
            name: desired.pool.clone(),
            note: desired.desc.clone(),
            ranges: desired.ranges.clone(),
            cluster: desired.cluster,
        };
        let raw = self
            .ctx
            .call("create_pool", remote.create_pool(&request))
            .await?;
        let id = ClusterResourceId::new(Self::KIND, raw);
        info!("Pool {} created as {}", desired.pool, id);

        Ok(Created {
            observed: self.fetch_required(&id).await?,
            id: id.to_string(),
            adopted: false,
        })
    }

    async fn read(&self, id: &str) -> Result<Option<PoolObserved>> {
        let id = cluster_id(Self::KIND, id)?;
        let _permit = self.ctx.throttle().acquire().await?;
        self.fetch(&id.id).await
    }

    async fn update(
        &self,
        id: &str,
        prior: &PoolObserved,
        desired: &PoolDesired,
    ) -> Result<Option<PoolObserved>> {
        let id = cluster_id(Self::KIND, id)?;
        diff::pool(prior, desired)?;

        let _permit = self.ctx.throttle().acquire().await?;
        let Some(current) = self.fetch(&id.id).await? else {
            info!("Pool {} vanished before update", id);
            return Ok(None);
        };
        // Range ids come from this read, so a retry never removes a range twice.
        let directives = diff::pool(&current, desired)?;
        info!("Reconciling pool {} ({} changes)", id, directives.len());

        for directive in &directives {
            debug!(id = %id, kind = %Self::KIND, directive = %directive, "applying directive");
            self.apply(&id.id, directive).await.inspect_err(|e| {
                error!("Failed to {} on pool {}: {}", directive, id, e);
            })?;
        }

        self.fetch(&id.id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = cluster_id(Self::KIND, id)?;
        info!("Deleting pool {}", id);
        let _permit = self.ctx.throttle().acquire().await?;
        self.ctx
            .call("delete_pool", self.ctx.remote().delete_pool(&id.id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::throttle::Throttle;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_range_changes_are_minimal() {
        let remote = Arc::new(MemoryRemote::new());
        let ctx = Context::new(remote.clone(), Throttle::new(1), Duration::from_secs(30));
        let reconciler = PoolReconciler::new(ctx);

        let desired = PoolDesired {
            pool: "public".into(),
            ranges: vec![
                "192.0.2.1".into(),
                "192.0.2.10-192.0.2.20".into(),
                "198.51.100.0/24".into(),
            ],
            desc: String::new(),
            cluster: 1,
        };
        let created = reconciler.create(&desired).await.unwrap();
        assert_eq!(created.observed.ranges.len(), 3);
        remote.take_calls().await;

        let desired = PoolDesired {
            ranges: vec![
                "192.0.2.10-192.0.2.20".into(),
                "198.51.100.0/24".into(),
                "203.0.113.0/24".into(),
            ],
            ..desired
        };
        let observed = reconciler
            .update(&created.id, &created.observed, &desired)
            .await
            .unwrap()
            .unwrap();

        let ranges: Vec<&str> = observed.ranges.iter().map(|r| r.range.as_str()).collect();
        assert_eq!(
            ranges,
            vec!["192.0.2.10-192.0.2.20", "198.51.100.0/24", "203.0.113.0/24"]
        );
        assert_eq!(
            remote.calls().await,
            vec![
                "get_pool",
                "delete_pool_range",
                "create_pool_range",
                "get_pool"
            ]
        );
    }
}
