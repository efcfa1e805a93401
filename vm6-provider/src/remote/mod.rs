//! Remote API facade.
//!
//! The reconcilers talk to VMmanager through [`RemoteApi`]. The HTTP client that
//! implements it against a live installation lives outside this crate;
//! [`MemoryRemote`] is an in-memory implementation used for tests and dry runs.
//!
//! Lookups by id or natural key return `Ok(None)` for missing resources. Mutating
//! calls against a missing resource fail with [`RemoteError::NotFound`].

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    CpuMode, CustomInterface, IpAddress, IpnetSpec, PoolRange, Recipe, SecondaryDisk, SshKey,
    SshKeySpec, VxlanAttachment, VxlanIpnet,
};

pub use memory::MemoryRemote;

/// Failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote resource not found: {0}")]
    NotFound(String),

    #[error("remote API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote call {call} timed out after {timeout:?}")]
    Timeout {
        call: &'static str,
        timeout: Duration,
    },
}

/// How the client authenticates; exactly one method is configured.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { email: String, password: String },
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password { email, .. } => f
                .debug_struct("Password")
                .field("email", email)
                .finish_non_exhaustive(),
            Credentials::Token(_) => f.write_str("Token(..)"),
        }
    }
}

// =============================================================================
// Records returned by the remote
// =============================================================================

/// Where a VM lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub node: String,
    pub vmid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub vmid: u64,
    pub name: String,
    pub desc: String,
    pub cores: u32,
    pub memory: u64,
    pub cpu_mode: String,
    pub disk_id: u64,
    pub disk_size: u64,
    pub cluster: u64,
    pub node_id: u32,
    pub node_name: String,
    pub account: u64,
    pub domain: String,
    pub os: u64,
    pub ip_addresses: Vec<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    pub id: String,
    pub name: String,
    pub gateway: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRecord {
    pub id: String,
    pub name: String,
    pub note: String,
    pub cluster: u64,
    pub ranges: Vec<PoolRange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub id: String,
    pub email: String,
    pub role: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanRecord {
    pub id: String,
    pub name: String,
    pub comment: String,
    pub account: u64,
    pub clusters: Vec<u64>,
    pub ippool: u64,
    pub ipnets: Vec<VxlanIpnet>,
}

// =============================================================================
// Create requests
// =============================================================================

/// Primary VM creation call. Secondary disks, interfaces and recipes are
/// applied afterwards, one call each.
#[derive(Debug, Clone)]
pub struct NewVm {
    pub name: String,
    pub desc: String,
    pub cores: u32,
    pub memory: u64,
    pub disk: u64,
    pub cpu_mode: CpuMode,
    pub cluster: u64,
    pub node: u32,
    pub account: u64,
    pub domain: String,
    pub password: String,
    pub os: u64,
    pub preset: u64,
    pub ipv4_number: u32,
    pub ipv4_pools: Vec<u64>,
    pub anti_spoofing: bool,
}

/// Network interface added to an existing VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmInterface {
    Custom(CustomInterface),
    Vxlan(VxlanAttachment),
}

#[derive(Debug, Clone)]
pub struct NewNetwork {
    pub name: String,
    pub gateway: String,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct NewPool {
    pub name: String,
    pub note: String,
    pub ranges: Vec<String>,
    pub cluster: u64,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub role: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct NewVxlan {
    pub name: String,
    pub comment: String,
    pub account: u64,
    pub clusters: Vec<u64>,
    pub ipnets: Vec<IpnetSpec>,
}

// =============================================================================
// Facade
// =============================================================================

/// Operations the reconcilers need from the management API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Log in with email/password or install an API token.
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), RemoteError>;

    /// Toggle verbose request logging in the client.
    async fn set_debug(&self, enabled: bool);

    // --- VMs ---

    async fn find_vm(&self, name: &str) -> Result<Option<VmHandle>, RemoteError>;
    async fn get_vm(&self, vmid: u64) -> Result<Option<VmRecord>, RemoteError>;
    async fn create_vm(&self, vm: &NewVm) -> Result<VmHandle, RemoteError>;
    async fn attach_disk(&self, vmid: u64, disk: &SecondaryDisk) -> Result<(), RemoteError>;
    async fn attach_interface(&self, vmid: u64, iface: &VmInterface) -> Result<(), RemoteError>;
    async fn run_recipe(&self, vmid: u64, recipe: &Recipe) -> Result<(), RemoteError>;
    async fn update_vm_resources(
        &self,
        vmid: u64,
        cores: u32,
        memory: u64,
        cpu_mode: CpuMode,
    ) -> Result<(), RemoteError>;
    async fn update_vm_config(&self, vmid: u64, name: &str, desc: &str)
    -> Result<(), RemoteError>;
    /// Reinstall from template `os`; resets the root password in the same call.
    async fn reinstall_os(&self, vmid: u64, os: u64, password: &str) -> Result<(), RemoteError>;
    async fn change_vm_password(&self, vmid: u64, password: &str) -> Result<(), RemoteError>;
    async fn change_vm_owner(&self, vmid: u64, account: u64) -> Result<(), RemoteError>;
    async fn resize_disk(&self, disk_id: u64, size: u64) -> Result<(), RemoteError>;
    /// Point the reverse DNS record of an IP address at `domain`.
    async fn update_ptr(&self, ip_id: u64, domain: &str) -> Result<(), RemoteError>;
    async fn delete_vm(&self, vmid: u64) -> Result<(), RemoteError>;

    // --- Networks ---

    async fn find_network(&self, name: &str) -> Result<Option<String>, RemoteError>;
    async fn get_network(&self, id: &str) -> Result<Option<NetworkRecord>, RemoteError>;
    async fn create_network(&self, network: &NewNetwork) -> Result<String, RemoteError>;
    async fn update_network_description(&self, id: &str, note: &str) -> Result<(), RemoteError>;
    async fn delete_network(&self, id: &str) -> Result<(), RemoteError>;

    // --- Pools ---

    async fn find_pool(&self, name: &str) -> Result<Option<String>, RemoteError>;
    async fn get_pool(&self, id: &str) -> Result<Option<PoolRecord>, RemoteError>;
    async fn create_pool(&self, pool: &NewPool) -> Result<String, RemoteError>;
    async fn update_pool_settings(&self, id: &str, name: &str, note: &str)
    -> Result<(), RemoteError>;
    async fn create_pool_range(&self, pool_id: &str, range: &str) -> Result<(), RemoteError>;
    async fn delete_pool_range(&self, range_id: u64) -> Result<(), RemoteError>;
    async fn delete_pool(&self, id: &str) -> Result<(), RemoteError>;

    // --- Accounts ---

    async fn find_account(&self, email: &str) -> Result<Option<String>, RemoteError>;
    async fn get_account(&self, id: &str) -> Result<Option<AccountRecord>, RemoteError>;
    async fn create_account(&self, account: &NewAccount) -> Result<String, RemoteError>;
    async fn change_account_role(&self, id: &str, role: &str) -> Result<(), RemoteError>;
    async fn list_ssh_keys(&self, account_id: &str) -> Result<Vec<SshKey>, RemoteError>;
    async fn add_ssh_key(&self, account_id: &str, key: &SshKeySpec) -> Result<(), RemoteError>;
    async fn delete_ssh_key(&self, account_id: &str, key_id: u64) -> Result<(), RemoteError>;
    async fn delete_account(&self, id: &str) -> Result<(), RemoteError>;

    // --- VxLANs ---

    async fn find_vxlan(&self, account: u64, name: &str) -> Result<Option<String>, RemoteError>;
    async fn get_vxlan(&self, id: &str) -> Result<Option<VxlanRecord>, RemoteError>;
    async fn create_vxlan(&self, vxlan: &NewVxlan) -> Result<String, RemoteError>;
    async fn update_vxlan_comment(&self, id: &str, comment: &str) -> Result<(), RemoteError>;
    async fn add_vxlan_ipnet(&self, id: &str, ipnet: &IpnetSpec) -> Result<(), RemoteError>;
    async fn delete_vxlan_ipnet(&self, id: &str, ipnet_id: u64) -> Result<(), RemoteError>;
    async fn delete_vxlan(&self, id: &str) -> Result<(), RemoteError>;
}
