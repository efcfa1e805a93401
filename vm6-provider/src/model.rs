//! Desired and observed state records, one pair per resource kind.
//!
//! Desired records are authored by the caller; observed records are always
//! built from a remote read. Attributes the remote never returns (passwords,
//! create-time provisioning inputs) are carried on the observed record from
//! the desired record that produced it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;
use crate::id::ResourceKind;

/// Placeholder the remote shows instead of a password; a desired password equal
/// to it means "keep the current one".
pub const PASSWORD_MASK: &str = "**********";

/// A password applied through the provider.
///
/// Persisted as its blake3 digest only, so stored state can tell whether a
/// desired password changed without holding the secret. The plain text is
/// kept in memory for OS reinstalls that reuse it.
#[derive(Clone, Eq)]
pub struct AppliedPassword {
    plain: Option<String>,
    digest: String,
}

impl AppliedPassword {
    pub fn new(password: &str) -> Self {
        Self {
            plain: Some(password.to_string()),
            digest: password_digest(password),
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        password_digest(candidate) == self.digest
    }

    /// `None` once the record went through persisted state.
    pub fn plain(&self) -> Option<&str> {
        self.plain.as_deref()
    }
}

fn password_digest(password: &str) -> String {
    blake3::hash(password.as_bytes()).to_hex().to_string()
}

impl PartialEq for AppliedPassword {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl fmt::Debug for AppliedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AppliedPassword(<redacted>)")
    }
}

impl From<&str> for AppliedPassword {
    fn from(password: &str) -> Self {
        Self::new(password)
    }
}

impl Serialize for AppliedPassword {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.digest)
    }
}

impl<'de> Deserialize<'de> for AppliedPassword {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            plain: None,
            digest: String::deserialize(deserializer)?,
        })
    }
}

// =============================================================================
// Enumerated attributes
// =============================================================================

/// CPU model exposed to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuMode {
    #[default]
    Default,
    HostModel,
    HostPassthrough,
}

impl CpuMode {
    pub const ALLOWED: &'static [&'static str] = &["default", "host-model", "host-passthrough"];

    pub const fn as_str(self) -> &'static str {
        match self {
            CpuMode::Default => "default",
            CpuMode::HostModel => "host-model",
            CpuMode::HostPassthrough => "host-passthrough",
        }
    }
}

impl fmt::Display for CpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CpuMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "default" => Ok(CpuMode::Default),
            "host-model" => Ok(CpuMode::HostModel),
            "host-passthrough" => Ok(CpuMode::HostPassthrough),
            other => Err(Error::InvalidAttribute {
                attribute: "cpu_mode",
                value: other.to_string(),
                allowed: Self::ALLOWED,
            }),
        }
    }
}

/// Account role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountRole {
    #[default]
    #[serde(rename = "@admin")]
    Admin,
    #[serde(rename = "@advanced_user")]
    AdvancedUser,
    #[serde(rename = "@user")]
    User,
}

impl AccountRole {
    pub const ALLOWED: &'static [&'static str] = &["@admin", "@advanced_user", "@user"];

    pub const fn as_str(self) -> &'static str {
        match self {
            AccountRole::Admin => "@admin",
            AccountRole::AdvancedUser => "@advanced_user",
            AccountRole::User => "@user",
        }
    }
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "@admin" => Ok(AccountRole::Admin),
            "@advanced_user" => Ok(AccountRole::AdvancedUser),
            "@user" => Ok(AccountRole::User),
            other => Err(Error::InvalidAttribute {
                attribute: "role",
                value: other.to_string(),
                allowed: Self::ALLOWED,
            }),
        }
    }
}

// =============================================================================
// VM
// =============================================================================

/// Secondary disk attached after the VM is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryDisk {
    #[serde(default = "default_disk_mib")]
    pub size_mib: u64,
    pub boot_order: u32,
    #[serde(default)]
    pub tags: Vec<u64>,
}

/// Interface with a manual address (`ip_name`) or addresses from a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomInterface {
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default)]
    pub ip_name: Option<String>,
    #[serde(default)]
    pub ippool: Option<u64>,
    #[serde(default = "default_one")]
    pub ip_count: u32,
}

/// Interface placed in a network inside a VxLAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanAttachment {
    pub id: u64,
    pub ipnet: u64,
    #[serde(default = "default_one")]
    pub ipv4_number: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeParam {
    pub name: String,
    pub value: String,
}

/// Recipe (provisioning script) run on the VM after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub recipe: u64,
    #[serde(default)]
    pub recipe_params: Vec<RecipeParam>,
}

/// Create-time VM inputs the remote does not report back. Immutable: changing
/// any of them means replacing the VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmProvisioning {
    pub preset: u64,
    pub ipv4_number: u32,
    pub ipv4_pools: Vec<u64>,
    pub custom_interfaces: Vec<CustomInterface>,
    #[serde(rename = "vxlan")]
    pub vxlans: Vec<VxlanAttachment>,
    pub recipes: Vec<Recipe>,
    pub disks: Vec<SecondaryDisk>,
    pub anti_spoofing: bool,
}

impl Default for VmProvisioning {
    fn default() -> Self {
        Self {
            preset: 0,
            ipv4_number: 0,
            ipv4_pools: Vec::new(),
            custom_interfaces: Vec::new(),
            vxlans: Vec::new(),
            recipes: Vec::new(),
            disks: Vec::new(),
            anti_spoofing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDesired {
    pub name: String,
    pub desc: String,
    pub cores: u32,
    /// RAM in MiB.
    pub memory: u64,
    /// Main disk size in MiB; can only grow.
    pub disk: u64,
    pub cpu_mode: CpuMode,
    pub cluster: u64,
    /// Node id; 0 lets the remote place the VM.
    pub node: u32,
    pub account: u64,
    pub domain: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Template (OS image) id.
    pub os: u64,
    #[serde(flatten)]
    pub provisioning: VmProvisioning,
}

impl Default for VmDesired {
    fn default() -> Self {
        Self {
            name: String::new(),
            desc: String::new(),
            cores: 1,
            memory: 512,
            disk: default_disk_mib(),
            cpu_mode: CpuMode::Default,
            cluster: 1,
            node: 0,
            account: 3,
            domain: String::new(),
            password: String::new(),
            os: 0,
            provisioning: VmProvisioning::default(),
        }
    }
}

/// IP address assigned to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: u64,
    pub addr: String,
    pub mask: String,
    pub gateway: String,
    pub family: u8,
    pub netid: u64,
    /// Reverse DNS domain.
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmObserved {
    pub name: String,
    pub desc: String,
    pub cores: u32,
    pub memory: u64,
    pub disk: u64,
    pub disk_id: u64,
    pub cpu_mode: CpuMode,
    pub cluster: u64,
    pub node: u32,
    pub account: u64,
    pub domain: String,
    pub os: u64,
    pub ip_addresses: Vec<IpAddress>,
    /// Last password applied through the provider; `None` when unknown.
    #[serde(default)]
    pub password: Option<AppliedPassword>,
    /// Create-time inputs; `None` for VMs adopted without them.
    #[serde(default)]
    pub provisioning: Option<VmProvisioning>,
}

// =============================================================================
// Network
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDesired {
    /// Network in CIDR notation; also its natural key.
    pub network: String,
    pub gateway: String,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkObserved {
    pub network: String,
    pub gateway: String,
    pub desc: String,
}

// =============================================================================
// Pool
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDesired {
    pub pool: String,
    /// `192.168.0.1`, `192.168.0.1-192.168.0.10` or `192.168.0.0/24`.
    pub ranges: Vec<String>,
    #[serde(default)]
    pub desc: String,
    #[serde(default = "default_one_u64")]
    pub cluster: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRange {
    pub id: u64,
    pub range: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolObserved {
    pub pool: String,
    pub desc: String,
    pub cluster: u64,
    pub ranges: Vec<PoolRange>,
}

// =============================================================================
// Account
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeySpec {
    pub name: String,
    pub ssh_pub_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
    pub ssh_pub_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDesired {
    /// Login email; the natural key.
    pub email: String,
    #[serde(default)]
    pub role: AccountRole,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub ssh_keys: Vec<SshKeySpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountObserved {
    pub email: String,
    pub role: AccountRole,
    pub state: String,
    pub ssh_keys: Vec<SshKey>,
    #[serde(default)]
    pub password: Option<AppliedPassword>,
}

// =============================================================================
// VxLAN
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpnetSpec {
    /// IPv4 range in CIDR notation.
    pub name: String,
    pub gateway: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanIpnet {
    pub id: u64,
    pub name: String,
    pub gateway: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanDesired {
    pub name: String,
    pub account: u64,
    pub clusters: Vec<u64>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub ipnets: Vec<IpnetSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanObserved {
    pub name: String,
    pub account: u64,
    pub clusters: Vec<u64>,
    pub comment: String,
    pub ipnets: Vec<VxlanIpnet>,
    /// IP pool backing the VxLAN, usable for VM creation.
    pub ippool: u64,
}

// =============================================================================
// Tagged variants
// =============================================================================

/// Desired state of any managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Desired {
    #[serde(rename = "qemu")]
    Vm(VmDesired),
    Network(NetworkDesired),
    Pool(PoolDesired),
    Account(AccountDesired),
    Vxlan(VxlanDesired),
}

impl Desired {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Desired::Vm(_) => ResourceKind::Qemu,
            Desired::Network(_) => ResourceKind::Network,
            Desired::Pool(_) => ResourceKind::Pool,
            Desired::Account(_) => ResourceKind::Account,
            Desired::Vxlan(_) => ResourceKind::Vxlan,
        }
    }
}

/// Observed state of any managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Observed {
    #[serde(rename = "qemu")]
    Vm(VmObserved),
    Network(NetworkObserved),
    Pool(PoolObserved),
    Account(AccountObserved),
    Vxlan(VxlanObserved),
}

impl Observed {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Observed::Vm(_) => ResourceKind::Qemu,
            Observed::Network(_) => ResourceKind::Network,
            Observed::Pool(_) => ResourceKind::Pool,
            Observed::Account(_) => ResourceKind::Account,
            Observed::Vxlan(_) => ResourceKind::Vxlan,
        }
    }

    /// Copy write-only attributes from an earlier record of the same resource.
    pub fn carry_write_only(&mut self, prior: &Observed) {
        match (self, prior) {
            (Observed::Vm(current), Observed::Vm(prior)) => {
                current.password.clone_from(&prior.password);
                current.provisioning.clone_from(&prior.provisioning);
            }
            (Observed::Account(current), Observed::Account(prior)) => {
                current.password.clone_from(&prior.password);
            }
            _ => {}
        }
    }
}

fn default_disk_mib() -> u64 {
    6000
}

fn default_bridge() -> String {
    "vmbr0".to_string()
}

fn default_one() -> u32 {
    1
}

fn default_one_u64() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_defaults() {
        let vm: VmDesired = serde_json::from_str(r#"{"name":"db1","domain":"example.com","password":"pw","os":5}"#)
            .unwrap();
        assert_eq!(vm.cores, 1);
        assert_eq!(vm.memory, 512);
        assert_eq!(vm.disk, 6000);
        assert_eq!(vm.cluster, 1);
        assert_eq!(vm.account, 3);
        assert_eq!(vm.cpu_mode, CpuMode::Default);
        assert!(vm.provisioning.anti_spoofing);
    }

    #[test]
    fn test_desired_is_tagged_by_kind() {
        let desired: Desired = serde_json::from_str(
            r#"{"kind":"network","network":"10.0.0.0/24","gateway":"10.0.0.1"}"#,
        )
        .unwrap();
        assert_eq!(desired.kind(), ResourceKind::Network);

        let vm: Desired = serde_json::from_str(r#"{"kind":"qemu","name":"a","os":1}"#).unwrap();
        assert_eq!(vm.kind(), ResourceKind::Qemu);
    }

    #[test]
    fn test_invalid_enumerations_rejected() {
        assert!(serde_json::from_str::<VmDesired>(r#"{"name":"a","cpu_mode":"turbo"}"#).is_err());
        assert!(matches!(
            "@root".parse::<AccountRole>(),
            Err(Error::InvalidAttribute { attribute: "role", .. })
        ));
        assert_eq!("host-model".parse::<CpuMode>().unwrap(), CpuMode::HostModel);
    }

    #[test]
    fn test_password_never_serialized() {
        let vm = VmDesired {
            name: "a".into(),
            password: "secret".into(),
            ..VmDesired::default()
        };
        let json = serde_json::to_string(&vm).unwrap();
        assert!(!json.contains("secret"));
    }
}
