//! Change detection between an observed record and a new desired record.
//!
//! Each function returns the ordered directives that converge the remote
//! resource, or an [`Error::UnsupportedTransition`] before anything is
//! emitted. Nothing here talks to the remote.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use crate::error::{Error, Result};
use crate::id::ResourceKind;
use crate::model::{
    AccountDesired, AccountObserved, AccountRole, AppliedPassword, CpuMode, IpnetSpec, NetworkDesired,
    NetworkObserved, PASSWORD_MASK, PoolDesired, PoolObserved, SshKeySpec, VmDesired, VmObserved,
    VmProvisioning, VxlanDesired, VxlanObserved,
};

// =============================================================================
// Directives
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmDirective {
    UpdateResources {
        cores: u32,
        memory: u64,
        cpu_mode: CpuMode,
    },
    UpdateConfig {
        name: String,
        desc: String,
    },
    /// Reinstall resets the root password as well.
    ReinstallOs {
        os: u64,
        password: String,
    },
    ChangePassword {
        password: String,
    },
    ChangeOwner {
        account: u64,
    },
    ResizeDisk {
        disk_id: u64,
        size: u64,
    },
    UpdatePtr {
        ip_id: u64,
        domain: String,
    },
}

impl fmt::Display for VmDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmDirective::UpdateResources {
                cores,
                memory,
                cpu_mode,
            } => write!(
                f,
                "update resources (cores={}, memory={}, cpu_mode={})",
                cores, memory, cpu_mode
            ),
            VmDirective::UpdateConfig { name, .. } => write!(f, "update config (name={})", name),
            VmDirective::ReinstallOs { os, .. } => write!(f, "reinstall os {}", os),
            VmDirective::ChangePassword { .. } => f.write_str("change password"),
            VmDirective::ChangeOwner { account } => write!(f, "change owner to {}", account),
            VmDirective::ResizeDisk { disk_id, size } => {
                write!(f, "resize disk {} to {}", disk_id, size)
            }
            VmDirective::UpdatePtr { ip_id, domain } => {
                write!(f, "update ptr of ip {} to {}", ip_id, domain)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkDirective {
    UpdateDescription { desc: String },
}

impl fmt::Display for NetworkDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkDirective::UpdateDescription { .. } => f.write_str("update description"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolDirective {
    UpdateSettings { name: String, desc: String },
    RemoveRange { range_id: u64, range: String },
    AddRange { range: String },
}

impl fmt::Display for PoolDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolDirective::UpdateSettings { name, .. } => {
                write!(f, "update settings (name={})", name)
            }
            PoolDirective::RemoveRange { range, .. } => write!(f, "remove range {}", range),
            PoolDirective::AddRange { range } => write!(f, "add range {}", range),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountDirective {
    ChangeRole { role: AccountRole },
    RemoveSshKey { key_id: u64, name: String },
    AddSshKey { key: SshKeySpec },
}

impl fmt::Display for AccountDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountDirective::ChangeRole { role } => write!(f, "change role to {}", role),
            AccountDirective::RemoveSshKey { name, .. } => write!(f, "remove ssh key {}", name),
            AccountDirective::AddSshKey { key } => write!(f, "add ssh key {}", key.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VxlanDirective {
    UpdateComment { comment: String },
    RemoveIpnet { ipnet_id: u64, name: String },
    AddIpnet { ipnet: IpnetSpec },
}

impl fmt::Display for VxlanDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VxlanDirective::UpdateComment { .. } => f.write_str("update comment"),
            VxlanDirective::RemoveIpnet { name, .. } => write!(f, "remove ipnet {}", name),
            VxlanDirective::AddIpnet { ipnet } => write!(f, "add ipnet {}", ipnet.name),
        }
    }
}

// =============================================================================
// Set difference
// =============================================================================

/// Members to remove from and add to a collection.
#[derive(Debug)]
pub struct SetDiff<'a, O, N> {
    /// Old members whose key is absent from the new collection, in old order.
    pub removed: Vec<&'a O>,
    /// New members whose key is absent from the old collection, in new order,
    /// first occurrence only.
    pub added: Vec<&'a N>,
}

/// Compare two collections by key.
pub fn set_difference<'a, O, N, K>(
    old: &'a [O],
    new: &'a [N],
    old_key: impl Fn(&O) -> K,
    new_key: impl Fn(&N) -> K,
) -> SetDiff<'a, O, N>
where
    K: Eq + Hash,
{
    let old_keys: HashSet<K> = old.iter().map(&old_key).collect();
    let new_keys: HashSet<K> = new.iter().map(&new_key).collect();

    let removed = old
        .iter()
        .filter(|o| !new_keys.contains(&old_key(*o)))
        .collect();

    let mut seen = HashSet::new();
    let added = new
        .iter()
        .filter(|n| {
            let key = new_key(*n);
            !old_keys.contains(&key) && seen.insert(key)
        })
        .collect();

    SetDiff { removed, added }
}

fn requires_replacement(kind: ResourceKind, attribute: &'static str) -> Error {
    Error::UnsupportedTransition {
        kind,
        attribute,
        reason: "requires replacement".to_string(),
    }
}

fn same_text(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

// =============================================================================
// Per-kind detectors
// =============================================================================

/// Directives for a VM, in the order the remote must apply them.
pub fn vm(prior: &VmObserved, desired: &VmDesired) -> Result<Vec<VmDirective>> {
    if desired.disk < prior.disk {
        return Err(Error::UnsupportedTransition {
            kind: ResourceKind::Qemu,
            attribute: "disk",
            reason: format!(
                "can't shrink disk from {} to {} MiB",
                prior.disk, desired.disk
            ),
        });
    }
    if desired.cluster != prior.cluster {
        return Err(requires_replacement(ResourceKind::Qemu, "cluster"));
    }
    if desired.node != 0 && desired.node != prior.node {
        return Err(requires_replacement(ResourceKind::Qemu, "node"));
    }
    if let Some(provisioned) = &prior.provisioning {
        if let Some(attribute) = changed_provisioning(provisioned, &desired.provisioning) {
            return Err(requires_replacement(ResourceKind::Qemu, attribute));
        }
    }

    let mut directives = Vec::new();

    if desired.cores != prior.cores
        || desired.memory != prior.memory
        || desired.cpu_mode != prior.cpu_mode
    {
        directives.push(VmDirective::UpdateResources {
            cores: desired.cores,
            memory: desired.memory,
            cpu_mode: desired.cpu_mode,
        });
    }

    if desired.name != prior.name || !same_text(&desired.desc, &prior.desc) {
        directives.push(VmDirective::UpdateConfig {
            name: desired.name.clone(),
            desc: desired.desc.clone(),
        });
    }

    let password_unchanged = desired.password == PASSWORD_MASK
        || desired.password.is_empty()
        || prior
            .password
            .as_ref()
            .is_some_and(|p| p.matches(&desired.password));

    if desired.os != prior.os {
        let password = if desired.password == PASSWORD_MASK {
            prior
                .password
                .as_ref()
                .and_then(AppliedPassword::plain)
                .unwrap_or_default()
                .to_string()
        } else {
            desired.password.clone()
        };
        directives.push(VmDirective::ReinstallOs {
            os: desired.os,
            password,
        });
    } else if !password_unchanged {
        directives.push(VmDirective::ChangePassword {
            password: desired.password.clone(),
        });
    }

    if desired.account != prior.account {
        directives.push(VmDirective::ChangeOwner {
            account: desired.account,
        });
    }

    if desired.disk > prior.disk {
        directives.push(VmDirective::ResizeDisk {
            disk_id: prior.disk_id,
            size: desired.disk,
        });
    }

    if desired.domain != prior.domain {
        directives.extend(prior.ip_addresses.iter().map(|ip| VmDirective::UpdatePtr {
            ip_id: ip.id,
            domain: desired.domain.clone(),
        }));
    }

    Ok(directives)
}

fn changed_provisioning(prior: &VmProvisioning, desired: &VmProvisioning) -> Option<&'static str> {
    if prior.preset != desired.preset {
        Some("preset")
    } else if prior.ipv4_number != desired.ipv4_number {
        Some("ipv4_number")
    } else if prior.ipv4_pools != desired.ipv4_pools {
        Some("ipv4_pools")
    } else if prior.custom_interfaces != desired.custom_interfaces {
        Some("custom_interfaces")
    } else if prior.vxlans != desired.vxlans {
        Some("vxlan")
    } else if prior.recipes != desired.recipes {
        Some("recipes")
    } else if prior.disks != desired.disks {
        Some("disks")
    } else if prior.anti_spoofing != desired.anti_spoofing {
        Some("anti_spoofing")
    } else {
        None
    }
}

pub fn network(prior: &NetworkObserved, desired: &NetworkDesired) -> Result<Vec<NetworkDirective>> {
    if desired.network != prior.network {
        return Err(requires_replacement(ResourceKind::Network, "network"));
    }
    if desired.gateway != prior.gateway {
        return Err(requires_replacement(ResourceKind::Network, "gateway"));
    }

    let mut directives = Vec::new();
    if !same_text(&desired.desc, &prior.desc) {
        directives.push(NetworkDirective::UpdateDescription {
            desc: desired.desc.clone(),
        });
    }
    Ok(directives)
}

pub fn pool(prior: &PoolObserved, desired: &PoolDesired) -> Result<Vec<PoolDirective>> {
    if desired.cluster != prior.cluster {
        return Err(requires_replacement(ResourceKind::Pool, "cluster"));
    }

    let mut directives = Vec::new();
    if desired.pool != prior.pool || !same_text(&desired.desc, &prior.desc) {
        directives.push(PoolDirective::UpdateSettings {
            name: desired.pool.clone(),
            desc: desired.desc.clone(),
        });
    }

    let ranges = set_difference(
        &prior.ranges,
        &desired.ranges,
        |r| r.range.clone(),
        |r| r.clone(),
    );
    directives.extend(ranges.removed.into_iter().map(|r| PoolDirective::RemoveRange {
        range_id: r.id,
        range: r.range.clone(),
    }));
    directives.extend(
        ranges
            .added
            .into_iter()
            .map(|r| PoolDirective::AddRange { range: r.clone() }),
    );
    Ok(directives)
}

pub fn account(prior: &AccountObserved, desired: &AccountDesired) -> Result<Vec<AccountDirective>> {
    if desired.email != prior.email {
        return Err(requires_replacement(ResourceKind::Account, "email"));
    }
    if let Some(password) = &prior.password {
        if !password.matches(&desired.password) {
            return Err(requires_replacement(ResourceKind::Account, "password"));
        }
    }

    let mut directives = Vec::new();
    if desired.role != prior.role {
        directives.push(AccountDirective::ChangeRole { role: desired.role });
    }

    let keys = set_difference(
        &prior.ssh_keys,
        &desired.ssh_keys,
        |k| (k.name.clone(), k.ssh_pub_key.trim().to_string()),
        |k| (k.name.clone(), k.ssh_pub_key.trim().to_string()),
    );
    directives.extend(keys.removed.into_iter().map(|k| AccountDirective::RemoveSshKey {
        key_id: k.id,
        name: k.name.clone(),
    }));
    directives.extend(
        keys.added
            .into_iter()
            .map(|k| AccountDirective::AddSshKey { key: k.clone() }),
    );
    Ok(directives)
}

pub fn vxlan(prior: &VxlanObserved, desired: &VxlanDesired) -> Result<Vec<VxlanDirective>> {
    if desired.name != prior.name {
        return Err(requires_replacement(ResourceKind::Vxlan, "name"));
    }
    if desired.account != prior.account {
        return Err(requires_replacement(ResourceKind::Vxlan, "account"));
    }
    if desired.clusters != prior.clusters {
        return Err(requires_replacement(ResourceKind::Vxlan, "clusters"));
    }

    let mut directives = Vec::new();
    if !same_text(&desired.comment, &prior.comment) {
        directives.push(VxlanDirective::UpdateComment {
            comment: desired.comment.clone(),
        });
    }

    let ipnets = set_difference(
        &prior.ipnets,
        &desired.ipnets,
        |n| (n.name.clone(), n.gateway.clone()),
        |n| (n.name.clone(), n.gateway.clone()),
    );
    directives.extend(ipnets.removed.into_iter().map(|n| VxlanDirective::RemoveIpnet {
        ipnet_id: n.id,
        name: n.name.clone(),
    }));
    directives.extend(
        ipnets
            .added
            .into_iter()
            .map(|n| VxlanDirective::AddIpnet { ipnet: n.clone() }),
    );
    Ok(directives)
}
