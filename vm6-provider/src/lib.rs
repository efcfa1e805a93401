//! vm6-provider - reconciliation core for VMmanager 6 resources.
//!
//! Declared VMs, networks, address pools, accounts and VxLANs are converged
//! onto a remote management API through per-kind reconcilers. All outbound
//! operations share one [`Throttle`].

pub mod config;
pub mod diff;
pub mod error;
pub mod id;
pub mod logging;
pub mod model;
pub mod provider;
pub mod reconciler;
pub mod remote;
pub mod throttle;

pub use config::{ConfigError, ProviderConfig, ValidatedConfig};
pub use error::{Error, Result};
pub use id::{ClusterResourceId, NodeResourceId, ResourceId, ResourceKind};
pub use model::{Desired, Observed};
pub use provider::{Provider, Tracked};
pub use reconciler::Reconciler;
pub use remote::{Credentials, MemoryRemote, RemoteApi, RemoteError};
pub use throttle::{Permit, Throttle};
