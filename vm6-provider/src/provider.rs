//! Caller-facing provider: one reconciler per kind behind a shared throttle.
//!
//! The provider works on [`Desired`]/[`Observed`] variants and on [`Tracked`]
//! entries, the state an orchestrator persists between passes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ValidatedConfig;
use crate::error::{Error, Result};
use crate::id::{ResourceId, ResourceKind};
use crate::model::{Desired, Observed};
use crate::reconciler::{
    AccountReconciler, Context, Created, NetworkReconciler, PoolReconciler, Reconciler,
    VmReconciler, VxlanReconciler, with_timeout,
};
use crate::remote::RemoteApi;
use crate::throttle::Throttle;

/// A managed resource as an orchestrator tracks it.
///
/// `id` is `None` once the resource is known to be gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracked {
    pub kind: ResourceKind,
    pub id: Option<String>,
    pub observed: Option<Observed>,
}

impl Tracked {
    pub fn is_gone(&self) -> bool {
        self.id.is_none()
    }

    fn forget(&mut self) {
        self.id = None;
        self.observed = None;
    }
}

pub struct Provider {
    throttle: Throttle,
    vm: VmReconciler,
    network: NetworkReconciler,
    pool: PoolReconciler,
    account: AccountReconciler,
    vxlan: VxlanReconciler,
}

impl Provider {
    pub fn new(remote: Arc<dyn RemoteApi>, max_parallel: usize, call_timeout: Duration) -> Self {
        let throttle = Throttle::new(max_parallel);
        Self::with_context(Context::new(remote, throttle.clone(), call_timeout), throttle)
    }

    fn with_context(ctx: Context, throttle: Throttle) -> Self {
        Self {
            throttle,
            vm: VmReconciler::new(ctx.clone()),
            network: NetworkReconciler::new(ctx.clone()),
            pool: PoolReconciler::new(ctx.clone()),
            account: AccountReconciler::new(ctx.clone()),
            vxlan: VxlanReconciler::new(ctx),
        }
    }

    /// Configure the client, authenticate and build the provider.
    pub async fn connect(remote: Arc<dyn RemoteApi>, config: &ValidatedConfig) -> Result<Self> {
        remote.set_debug(config.debug).await;
        with_timeout(
            "authenticate",
            config.call_timeout,
            remote.authenticate(&config.credentials),
        )
        .await?;
        info!(
            api_url = %config.api_url,
            parallel = config.parallel,
            "Connected to VMmanager"
        );
        if config.ignore_unknown_attributes {
            warn!("Unknown attribute values from the API will be ignored");
        }

        let throttle = Throttle::new(config.parallel);
        let ctx = Context::new(remote, throttle.clone(), config.call_timeout)
            .ignoring_unknown_attributes(config.ignore_unknown_attributes);
        Ok(Self::with_context(ctx, throttle))
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Stop admitting new operations; running ones finish.
    pub fn shutdown(&self) {
        info!("Provider shutting down");
        self.throttle.close();
    }

    pub async fn create(&self, desired: &Desired) -> Result<Tracked> {
        let kind = desired.kind();
        let (id, observed) = match desired {
            Desired::Vm(d) => unpack(self.vm.create(d).await?, Observed::Vm),
            Desired::Network(d) => unpack(self.network.create(d).await?, Observed::Network),
            Desired::Pool(d) => unpack(self.pool.create(d).await?, Observed::Pool),
            Desired::Account(d) => unpack(self.account.create(d).await?, Observed::Account),
            Desired::Vxlan(d) => unpack(self.vxlan.create(d).await?, Observed::Vxlan),
        };
        debug!(id = %id, kind = %kind, record = %render(&observed), "created");
        Ok(Tracked {
            kind,
            id: Some(id),
            observed: Some(observed),
        })
    }

    /// Read any resource by its encoded identifier.
    pub async fn read(&self, id: &str) -> Result<Option<Observed>> {
        let parsed: ResourceId = id.parse()?;
        let observed = match parsed.kind() {
            ResourceKind::Qemu => self.vm.read(id).await?.map(Observed::Vm),
            ResourceKind::Network => self.network.read(id).await?.map(Observed::Network),
            ResourceKind::Pool => self.pool.read(id).await?.map(Observed::Pool),
            ResourceKind::Account => self.account.read(id).await?.map(Observed::Account),
            ResourceKind::Vxlan => self.vxlan.read(id).await?.map(Observed::Vxlan),
        };
        if let Some(observed) = &observed {
            debug!(id, record = %render(observed), "read");
        }
        Ok(observed)
    }

    /// Re-read a tracked resource. A missing resource clears the identifier.
    pub async fn refresh(&self, tracked: &mut Tracked) -> Result<()> {
        let Some(id) = tracked.id.clone() else {
            return Ok(());
        };
        match self.read(&id).await? {
            Some(mut observed) => {
                if let Some(prior) = &tracked.observed {
                    observed.carry_write_only(prior);
                }
                tracked.observed = Some(observed);
            }
            None => {
                warn!("{} {} no longer exists, forgetting it", tracked.kind, id);
                tracked.forget();
            }
        }
        Ok(())
    }

    /// Converge a tracked resource to `desired`.
    pub async fn update(&self, tracked: &mut Tracked, desired: &Desired) -> Result<()> {
        if desired.kind() != tracked.kind {
            return Err(Error::UnsupportedTransition {
                kind: tracked.kind,
                attribute: "kind",
                reason: format!("cannot turn a {} into a {}", tracked.kind, desired.kind()),
            });
        }
        let Some(id) = tracked.id.clone() else {
            return Err(Error::NotFound {
                kind: tracked.kind,
                id: String::new(),
            });
        };
        if tracked.observed.is_none() {
            self.refresh(tracked).await?;
        }
        let Some(prior) = tracked.observed.clone() else {
            return Ok(());
        };

        let updated = match (desired, &prior) {
            (Desired::Vm(d), Observed::Vm(p)) => self.vm.update(&id, p, d).await?.map(Observed::Vm),
            (Desired::Network(d), Observed::Network(p)) => {
                self.network.update(&id, p, d).await?.map(Observed::Network)
            }
            (Desired::Pool(d), Observed::Pool(p)) => {
                self.pool.update(&id, p, d).await?.map(Observed::Pool)
            }
            (Desired::Account(d), Observed::Account(p)) => {
                self.account.update(&id, p, d).await?.map(Observed::Account)
            }
            (Desired::Vxlan(d), Observed::Vxlan(p)) => {
                self.vxlan.update(&id, p, d).await?.map(Observed::Vxlan)
            }
            _ => {
                return Err(Error::UnsupportedTransition {
                    kind: tracked.kind,
                    attribute: "kind",
                    reason: format!("stored state is a {}", prior.kind()),
                });
            }
        };

        match updated {
            Some(observed) => {
                debug!(id = %id, record = %render(&observed), "updated");
                tracked.observed = Some(observed);
            }
            None => {
                warn!("{} {} vanished during update, forgetting it", tracked.kind, id);
                tracked.forget();
            }
        }
        Ok(())
    }

    /// Delete a tracked resource. Remote errors are returned as-is and leave
    /// the entry untouched.
    pub async fn delete(&self, tracked: &mut Tracked) -> Result<()> {
        let Some(id) = tracked.id.as_deref() else {
            return Ok(());
        };
        match tracked.kind {
            ResourceKind::Qemu => self.vm.delete(id).await?,
            ResourceKind::Network => self.network.delete(id).await?,
            ResourceKind::Pool => self.pool.delete(id).await?,
            ResourceKind::Account => self.account.delete(id).await?,
            ResourceKind::Vxlan => self.vxlan.delete(id).await?,
        }
        tracked.forget();
        Ok(())
    }

    /// Start tracking an existing resource.
    pub async fn import(&self, id: &str) -> Result<Tracked> {
        let parsed: ResourceId = id.parse()?;
        let kind = parsed.kind();
        let observed = self.read(id).await?.ok_or_else(|| Error::NotFound {
            kind,
            id: id.to_string(),
        })?;
        info!("Imported {} {}", kind, id);
        Ok(Tracked {
            kind,
            id: Some(id.to_string()),
            observed: Some(observed),
        })
    }
}

fn unpack<O>(created: Created<O>, wrap: fn(O) -> Observed) -> (String, Observed) {
    (created.id, wrap(created.observed))
}

/// JSON rendering for debug logs. Write-only attributes are never serialized.
fn render(observed: &Observed) -> String {
    serde_json::to_string(observed).unwrap_or_else(|e| format!("<unrenderable: {}>", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NetworkDesired, VmDesired};
    use crate::remote::MemoryRemote;

    fn provider() -> (Arc<MemoryRemote>, Provider) {
        let remote = Arc::new(MemoryRemote::new());
        let provider = Provider::new(remote.clone(), 4, Duration::from_secs(30));
        (remote, provider)
    }

    #[tokio::test]
    async fn test_read_dispatches_on_identifier() {
        let (_remote, provider) = provider();
        let net = provider
            .create(&Desired::Network(NetworkDesired {
                network: "10.0.0.0/24".into(),
                gateway: "10.0.0.1".into(),
                desc: String::new(),
            }))
            .await
            .unwrap();
        let id = net.id.clone().unwrap();

        let observed = provider.read(&id).await.unwrap().unwrap();
        assert_eq!(observed.kind(), ResourceKind::Network);
        assert!(provider.read("pool/77").await.unwrap().is_none());
        assert!(matches!(
            provider.read("a/b/c/d").await,
            Err(Error::MalformedIdentifier { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_rejects_kind_change() {
        let (_remote, provider) = provider();
        let mut tracked = provider
            .create(&Desired::Vm(VmDesired {
                name: "a".into(),
                ..VmDesired::default()
            }))
            .await
            .unwrap();
        let err = provider
            .update(
                &mut tracked,
                &Desired::Network(NetworkDesired {
                    network: "10.0.0.0/24".into(),
                    gateway: "10.0.0.1".into(),
                    desc: String::new(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedTransition { attribute: "kind", .. }
        ));
    }

    #[tokio::test]
    async fn test_import_missing_is_not_found() {
        let (_remote, provider) = provider();
        assert!(matches!(
            provider.import("node1/qemu/500").await,
            Err(Error::NotFound {
                kind: ResourceKind::Qemu,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_operations() {
        let (remote, provider) = provider();
        provider.shutdown();
        assert!(matches!(
            provider.read("network/1").await,
            Err(Error::Shutdown)
        ));
        assert!(remote.calls().await.is_empty());
    }

    #[test]
    fn test_tracked_state_round_trips() {
        let tracked = Tracked {
            kind: ResourceKind::Network,
            id: Some("network/1".into()),
            observed: None,
        };
        let json = serde_json::to_string(&tracked).unwrap();
        assert_eq!(
            serde_json::from_str::<Tracked>(&json).unwrap(),
            tracked
        );
    }
}
