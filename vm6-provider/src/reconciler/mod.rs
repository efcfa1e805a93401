//! Reconcilers for the managed resource kinds.
//!
//! Each reconciler maps a desired record onto create/read/update/delete calls
//! against the remote API. Every operation holds one throttle permit for its
//! whole duration, nested remote calls included.

pub mod account;
pub mod network;
pub mod pool;
pub mod vm;
pub mod vxlan;

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Error, Result};
use crate::id::{ClusterResourceId, NodeResourceId, ResourceKind};
use crate::remote::{RemoteApi, RemoteError};
use crate::throttle::Throttle;

pub use account::AccountReconciler;
pub use network::NetworkReconciler;
pub use pool::PoolReconciler;
pub use vm::VmReconciler;
pub use vxlan::VxlanReconciler;

/// Default bound on a single remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared by all reconcilers of one provider.
#[derive(Clone)]
pub struct Context {
    remote: Arc<dyn RemoteApi>,
    throttle: Throttle,
    call_timeout: Duration,
    ignore_unknown_attributes: bool,
}

impl Context {
    pub fn new(remote: Arc<dyn RemoteApi>, throttle: Throttle, call_timeout: Duration) -> Self {
        Self {
            remote,
            throttle,
            call_timeout,
            ignore_unknown_attributes: false,
        }
    }

    /// Read unknown enumerated values from the remote as their default
    /// instead of failing the read.
    pub fn ignoring_unknown_attributes(mut self, ignore: bool) -> Self {
        self.ignore_unknown_attributes = ignore;
        self
    }

    pub fn remote(&self) -> &dyn RemoteApi {
        self.remote.as_ref()
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run one remote call under the per-call timeout.
    pub async fn call<T, F>(&self, call: &'static str, fut: F) -> std::result::Result<T, RemoteError>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        with_timeout(call, self.call_timeout, fut).await
    }

    /// Parse an enumerated attribute read from the remote.
    pub(crate) fn parse_remote<T>(&self, attribute: &'static str, raw: &str) -> Result<T>
    where
        T: FromStr<Err = Error> + Default,
    {
        match raw.parse() {
            Ok(value) => Ok(value),
            Err(e) if self.ignore_unknown_attributes => {
                warn!(attribute, value = raw, "ignoring unknown attribute value: {}", e);
                Ok(T::default())
            }
            Err(e) => Err(e),
        }
    }
}

/// Bound `fut` by `timeout`; expiry becomes [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(
    call: &'static str,
    timeout: Duration,
    fut: F,
) -> std::result::Result<T, RemoteError>
where
    F: Future<Output = std::result::Result<T, RemoteError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(call, ?timeout, "remote call timed out");
            Err(RemoteError::Timeout { call, timeout })
        }
    }
}

/// Outcome of a create.
#[derive(Debug, Clone, PartialEq)]
pub struct Created<O> {
    pub id: String,
    pub observed: O,
    /// The resource already existed under the same natural key.
    pub adopted: bool,
}

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Desired state authored by the caller.
    type Desired: Send + Sync;
    /// State read back from the remote.
    type Observed: Send + Sync;

    const KIND: ResourceKind;

    /// Create the resource, or adopt an existing one with the same natural key.
    async fn create(&self, desired: &Self::Desired) -> Result<Created<Self::Observed>>;

    /// Read the current state; `None` when the remote has no such resource.
    async fn read(&self, id: &str) -> Result<Option<Self::Observed>>;

    /// Converge the resource from `prior` to `desired`. `None` when the
    /// resource vanished before any change was applied.
    async fn update(
        &self,
        id: &str,
        prior: &Self::Observed,
        desired: &Self::Desired,
    ) -> Result<Option<Self::Observed>>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Decode a hierarchical id and check it names `kind`.
pub(crate) fn node_id(kind: ResourceKind, id: &str) -> Result<NodeResourceId> {
    let parsed: NodeResourceId = id.parse()?;
    if parsed.kind != kind {
        return Err(kind_mismatch(kind, id));
    }
    Ok(parsed)
}

/// Decode a flat id and check it names `kind`.
pub(crate) fn cluster_id(kind: ResourceKind, id: &str) -> Result<ClusterResourceId> {
    let parsed: ClusterResourceId = id.parse()?;
    if parsed.kind != kind {
        return Err(kind_mismatch(kind, id));
    }
    Ok(parsed)
}

fn kind_mismatch(kind: ResourceKind, id: &str) -> Error {
    Error::MalformedIdentifier {
        id: id.to_string(),
        reason: format!("not a {} identifier", kind),
    }
}

/// Names of substructure calls, for partial create reports.
pub(crate) struct Substructures {
    steps: Vec<String>,
    applied: usize,
}

impl Substructures {
    pub(crate) fn new(steps: Vec<String>) -> Self {
        Self { steps, applied: 0 }
    }

    pub(crate) fn applied(&mut self) {
        self.applied += 1;
    }

    /// Turn a failed step into [`Error::PartialCreate`].
    pub(crate) fn failed(self, id: &str, source: RemoteError) -> Error {
        let mut steps = self.steps;
        let pending = steps.split_off(self.applied.min(steps.len()));
        Error::PartialCreate {
            id: id.to_string(),
            applied: steps,
            pending,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CpuMode;
    use crate::remote::MemoryRemote;

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let remote = Arc::new(MemoryRemote::new());
        remote.close_gate();
        let ctx = Context::new(remote.clone(), Throttle::new(1), Duration::from_secs(5));

        let err = ctx
            .call("get_vm", ctx.remote().get_vm(101))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RemoteError::Timeout {
                call: "get_vm",
                timeout: Duration::from_secs(5)
            }
        );
        assert_eq!(remote.in_flight(), 0);
    }

    #[test]
    fn test_unknown_attribute_values() {
        let remote = Arc::new(MemoryRemote::new());
        let ctx = Context::new(remote, Throttle::new(1), Duration::from_secs(5));
        assert!(matches!(
            ctx.parse_remote::<CpuMode>("cpu_mode", "turbo"),
            Err(Error::InvalidAttribute { attribute: "cpu_mode", .. })
        ));

        let ctx = ctx.ignoring_unknown_attributes(true);
        assert_eq!(
            ctx.parse_remote::<CpuMode>("cpu_mode", "turbo").unwrap(),
            CpuMode::Default
        );
        assert_eq!(
            ctx.parse_remote::<CpuMode>("cpu_mode", "host-model").unwrap(),
            CpuMode::HostModel
        );
    }

    #[test]
    fn test_id_kind_must_match() {
        assert!(node_id(ResourceKind::Qemu, "node1/qemu/101").is_ok());
        assert!(matches!(
            cluster_id(ResourceKind::Pool, "network/4"),
            Err(Error::MalformedIdentifier { .. })
        ));
        assert!(matches!(
            node_id(ResourceKind::Qemu, "qemu/101"),
            Err(Error::MalformedIdentifier { .. })
        ));
    }

    #[test]
    fn test_substructures_split_on_failure() {
        let mut steps = Substructures::new(vec!["disk 1".into(), "disk 2".into(), "recipe 4".into()]);
        steps.applied();
        let err = steps.failed("node1/qemu/101", RemoteError::Transport("reset".into()));
        match err {
            Error::PartialCreate {
                id,
                applied,
                pending,
                ..
            } => {
                assert_eq!(id, "node1/qemu/101");
                assert_eq!(applied, vec!["disk 1"]);
                assert_eq!(pending, vec!["disk 2", "recipe 4"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
