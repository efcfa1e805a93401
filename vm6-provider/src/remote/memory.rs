//! In-memory implementation of [`RemoteApi`].
//!
//! Behaves like an empty VMmanager installation: VM ids start at 101 on node
//! `node1`, every other id is drawn from one shared counter starting at 1.
//! Besides storing resources it records every call by name, tracks how many
//! calls are in flight, can hold calls behind a gate and can inject failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use super::{
    AccountRecord, Credentials, NetworkRecord, NewAccount, NewNetwork, NewPool, NewVm, NewVxlan,
    PoolRecord, RemoteApi, RemoteError, VmHandle, VmInterface, VmRecord, VxlanRecord,
};
use crate::model::{
    CpuMode, IpAddress, IpnetSpec, PoolRange, Recipe, SecondaryDisk, SshKey, SshKeySpec,
    VxlanIpnet,
};

const FIRST_VMID: u64 = 101;

#[derive(Debug)]
struct VmEntry {
    record: VmRecord,
    password: String,
    disks: Vec<SecondaryDisk>,
    interfaces: Vec<VmInterface>,
    recipes: Vec<u64>,
}

#[derive(Debug)]
struct AccountEntry {
    record: AccountRecord,
    password: String,
    keys: Vec<SshKey>,
}

#[derive(Debug)]
struct State {
    next_vmid: u64,
    next_id: u64,
    vms: BTreeMap<u64, VmEntry>,
    networks: BTreeMap<String, NetworkRecord>,
    pools: BTreeMap<String, PoolRecord>,
    accounts: BTreeMap<String, AccountEntry>,
    vxlans: BTreeMap<String, VxlanRecord>,
}

impl State {
    fn new() -> Self {
        Self {
            next_vmid: FIRST_VMID,
            next_id: 1,
            vms: BTreeMap::new(),
            networks: BTreeMap::new(),
            pools: BTreeMap::new(),
            accounts: BTreeMap::new(),
            vxlans: BTreeMap::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocate_ips(&mut self, count: u32, domain: &str) -> Vec<IpAddress> {
        (0..count)
            .map(|_| {
                let id = self.next_id();
                IpAddress {
                    id,
                    addr: format!("192.0.2.{}", id % 253 + 1),
                    mask: "255.255.255.0".to_string(),
                    gateway: "192.0.2.254".to_string(),
                    family: 4,
                    netid: 1,
                    domain: domain.to_string(),
                }
            })
            .collect()
    }

    fn vm_mut(&mut self, vmid: u64) -> Result<&mut VmEntry, RemoteError> {
        self.vms
            .get_mut(&vmid)
            .ok_or_else(|| RemoteError::NotFound(format!("vm {}", vmid)))
    }

    fn account_mut(&mut self, id: &str) -> Result<&mut AccountEntry, RemoteError> {
        self.accounts
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(format!("account {}", id)))
    }

    fn vxlan_mut(&mut self, id: &str) -> Result<&mut VxlanRecord, RemoteError> {
        self.vxlans
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(format!("vxlan {}", id)))
    }
}

/// Failure injected for one call name.
#[derive(Debug)]
struct Injected {
    /// Calls that still succeed before the failure kicks in.
    successes_left: usize,
    error: RemoteError,
}

#[derive(Debug, Default)]
struct Journal {
    calls: Vec<&'static str>,
    failures: HashMap<&'static str, Injected>,
}

/// Decrements the in-flight counter when a call returns.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory management API.
pub struct MemoryRemote {
    state: Mutex<State>,
    journal: Mutex<Journal>,
    gate: watch::Sender<bool>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    debug: AtomicBool,
    credentials: Mutex<Option<Credentials>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(State::new()),
            journal: Mutex::new(Journal::default()),
            gate,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            debug: AtomicBool::new(false),
            credentials: Mutex::new(None),
        }
    }

    /// Hold every subsequent call until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Make `call` fail with `error` after it succeeded `after` more times.
    pub async fn fail_call(&self, call: &'static str, after: usize, error: RemoteError) {
        self.journal.lock().await.failures.insert(
            call,
            Injected {
                successes_left: after,
                error,
            },
        );
    }

    pub async fn clear_failures(&self) {
        self.journal.lock().await.failures.clear();
    }

    /// Names of all calls received so far, in arrival order.
    pub async fn calls(&self) -> Vec<&'static str> {
        self.journal.lock().await.calls.clone()
    }

    /// Return and reset the call log.
    pub async fn take_calls(&self) -> Vec<&'static str> {
        std::mem::take(&mut self.journal.lock().await.calls)
    }

    pub async fn call_count(&self, call: &str) -> usize {
        self.journal
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| **c == call)
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        self.credentials.lock().await.clone()
    }

    /// Secondary disks, interfaces and recipe ids applied to a VM.
    pub async fn vm_substructures(
        &self,
        vmid: u64,
    ) -> Option<(Vec<SecondaryDisk>, Vec<VmInterface>, Vec<u64>)> {
        let state = self.state.lock().await;
        state.vms.get(&vmid).map(|vm| {
            (
                vm.disks.clone(),
                vm.interfaces.clone(),
                vm.recipes.clone(),
            )
        })
    }

    /// Current root password of a VM.
    pub async fn vm_password(&self, vmid: u64) -> Option<String> {
        let state = self.state.lock().await;
        state.vms.get(&vmid).map(|vm| vm.password.clone())
    }

    /// Record the call, wait at the gate and apply injected failures.
    async fn enter(&self, call: &'static str) -> Result<InFlight<'_>, RemoteError> {
        let injected = {
            let mut journal = self.journal.lock().await;
            journal.calls.push(call);
            match journal.failures.get_mut(call) {
                Some(f) if f.successes_left > 0 => {
                    f.successes_left -= 1;
                    None
                }
                Some(f) => Some(f.error.clone()),
                None => None,
            }
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        if self.debug_enabled() {
            debug!(call, "memory remote call");
        }
        match injected {
            Some(error) => Err(error),
            None => Ok(guard),
        }
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), RemoteError> {
        let _call = self.enter("authenticate").await?;
        match credentials {
            Credentials::Password { email, password } if email.is_empty() || password.is_empty() => {
                Err(RemoteError::Auth("email and password are required".to_string()))
            }
            Credentials::Token(token) if token.is_empty() => {
                Err(RemoteError::Auth("empty API token".to_string()))
            }
            _ => {
                *self.credentials.lock().await = Some(credentials.clone());
                Ok(())
            }
        }
    }

    async fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::SeqCst);
    }

    // --- VMs ---

    async fn find_vm(&self, name: &str) -> Result<Option<VmHandle>, RemoteError> {
        let _call = self.enter("find_vm").await?;
        let state = self.state.lock().await;
        Ok(state
            .vms
            .values()
            .find(|vm| vm.record.name == name)
            .map(|vm| VmHandle {
                node: vm.record.node_name.clone(),
                vmid: vm.record.vmid,
            }))
    }

    async fn get_vm(&self, vmid: u64) -> Result<Option<VmRecord>, RemoteError> {
        let _call = self.enter("get_vm").await?;
        let state = self.state.lock().await;
        Ok(state.vms.get(&vmid).map(|vm| vm.record.clone()))
    }

    async fn create_vm(&self, vm: &NewVm) -> Result<VmHandle, RemoteError> {
        let _call = self.enter("create_vm").await?;
        let mut state = self.state.lock().await;
        let vmid = state.next_vmid;
        state.next_vmid += 1;
        let node_id = if vm.node == 0 { 1 } else { vm.node };
        let node_name = format!("node{}", node_id);
        let disk_id = state.next_id();
        let ip_addresses = state.allocate_ips(vm.ipv4_number, &vm.domain);
        let record = VmRecord {
            vmid,
            name: vm.name.clone(),
            desc: vm.desc.clone(),
            cores: vm.cores,
            memory: vm.memory,
            cpu_mode: vm.cpu_mode.to_string(),
            disk_id,
            disk_size: vm.disk,
            cluster: vm.cluster,
            node_id,
            node_name: node_name.clone(),
            account: vm.account,
            domain: vm.domain.clone(),
            os: vm.os,
            ip_addresses,
        };
        state.vms.insert(
            vmid,
            VmEntry {
                record,
                password: vm.password.clone(),
                disks: Vec::new(),
                interfaces: Vec::new(),
                recipes: Vec::new(),
            },
        );
        Ok(VmHandle {
            node: node_name,
            vmid,
        })
    }

    async fn attach_disk(&self, vmid: u64, disk: &SecondaryDisk) -> Result<(), RemoteError> {
        let _call = self.enter("attach_disk").await?;
        let mut state = self.state.lock().await;
        state.vm_mut(vmid)?.disks.push(disk.clone());
        Ok(())
    }

    async fn attach_interface(&self, vmid: u64, iface: &VmInterface) -> Result<(), RemoteError> {
        let _call = self.enter("attach_interface").await?;
        let mut state = self.state.lock().await;
        let domain = state.vm_mut(vmid)?.record.domain.clone();
        let count = match iface {
            VmInterface::Custom(custom) if custom.ip_name.is_some() => 1,
            VmInterface::Custom(custom) => custom.ip_count,
            VmInterface::Vxlan(vxlan) => vxlan.ipv4_number,
        };
        let ips = state.allocate_ips(count, &domain);
        let vm = state.vm_mut(vmid)?;
        vm.record.ip_addresses.extend(ips);
        vm.interfaces.push(iface.clone());
        Ok(())
    }

    async fn run_recipe(&self, vmid: u64, recipe: &Recipe) -> Result<(), RemoteError> {
        let _call = self.enter("run_recipe").await?;
        let mut state = self.state.lock().await;
        state.vm_mut(vmid)?.recipes.push(recipe.recipe);
        Ok(())
    }

    async fn update_vm_resources(
        &self,
        vmid: u64,
        cores: u32,
        memory: u64,
        cpu_mode: CpuMode,
    ) -> Result<(), RemoteError> {
        let _call = self.enter("update_vm_resources").await?;
        let mut state = self.state.lock().await;
        let record = &mut state.vm_mut(vmid)?.record;
        record.cores = cores;
        record.memory = memory;
        record.cpu_mode = cpu_mode.to_string();
        Ok(())
    }

    async fn update_vm_config(
        &self,
        vmid: u64,
        name: &str,
        desc: &str,
    ) -> Result<(), RemoteError> {
        let _call = self.enter("update_vm_config").await?;
        let mut state = self.state.lock().await;
        let record = &mut state.vm_mut(vmid)?.record;
        record.name = name.to_string();
        record.desc = desc.to_string();
        Ok(())
    }

    async fn reinstall_os(&self, vmid: u64, os: u64, password: &str) -> Result<(), RemoteError> {
        let _call = self.enter("reinstall_os").await?;
        let mut state = self.state.lock().await;
        let vm = state.vm_mut(vmid)?;
        vm.record.os = os;
        vm.password = password.to_string();
        Ok(())
    }

    async fn change_vm_password(&self, vmid: u64, password: &str) -> Result<(), RemoteError> {
        let _call = self.enter("change_vm_password").await?;
        let mut state = self.state.lock().await;
        state.vm_mut(vmid)?.password = password.to_string();
        Ok(())
    }

    async fn change_vm_owner(&self, vmid: u64, account: u64) -> Result<(), RemoteError> {
        let _call = self.enter("change_vm_owner").await?;
        let mut state = self.state.lock().await;
        state.vm_mut(vmid)?.record.account = account;
        Ok(())
    }

    async fn resize_disk(&self, disk_id: u64, size: u64) -> Result<(), RemoteError> {
        let _call = self.enter("resize_disk").await?;
        let mut state = self.state.lock().await;
        let record = state
            .vms
            .values_mut()
            .map(|vm| &mut vm.record)
            .find(|record| record.disk_id == disk_id)
            .ok_or_else(|| RemoteError::NotFound(format!("disk {}", disk_id)))?;
        if size < record.disk_size {
            return Err(RemoteError::Api {
                status: 400,
                message: "disk can not be shrunk".to_string(),
            });
        }
        record.disk_size = size;
        Ok(())
    }

    async fn update_ptr(&self, ip_id: u64, domain: &str) -> Result<(), RemoteError> {
        let _call = self.enter("update_ptr").await?;
        let mut state = self.state.lock().await;
        // The VM reports the domain of its addresses as its own.
        let record = state
            .vms
            .values_mut()
            .map(|vm| &mut vm.record)
            .find(|record| record.ip_addresses.iter().any(|ip| ip.id == ip_id))
            .ok_or_else(|| RemoteError::NotFound(format!("ip {}", ip_id)))?;
        for ip in record.ip_addresses.iter_mut().filter(|ip| ip.id == ip_id) {
            ip.domain = domain.to_string();
        }
        record.domain = domain.to_string();
        Ok(())
    }

    async fn delete_vm(&self, vmid: u64) -> Result<(), RemoteError> {
        let _call = self.enter("delete_vm").await?;
        let mut state = self.state.lock().await;
        state
            .vms
            .remove(&vmid)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(format!("vm {}", vmid)))
    }

    // --- Networks ---

    async fn find_network(&self, name: &str) -> Result<Option<String>, RemoteError> {
        let _call = self.enter("find_network").await?;
        let state = self.state.lock().await;
        Ok(state
            .networks
            .values()
            .find(|n| n.name == name)
            .map(|n| n.id.clone()))
    }

    async fn get_network(&self, id: &str) -> Result<Option<NetworkRecord>, RemoteError> {
        let _call = self.enter("get_network").await?;
        let state = self.state.lock().await;
        Ok(state.networks.get(id).cloned())
    }

    async fn create_network(&self, network: &NewNetwork) -> Result<String, RemoteError> {
        let _call = self.enter("create_network").await?;
        let mut state = self.state.lock().await;
        let id = state.next_id().to_string();
        state.networks.insert(
            id.clone(),
            NetworkRecord {
                id: id.clone(),
                name: network.name.clone(),
                gateway: network.gateway.clone(),
                note: network.note.clone(),
            },
        );
        Ok(id)
    }

    async fn update_network_description(&self, id: &str, note: &str) -> Result<(), RemoteError> {
        let _call = self.enter("update_network_description").await?;
        let mut state = self.state.lock().await;
        let network = state
            .networks
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(format!("network {}", id)))?;
        network.note = note.to_string();
        Ok(())
    }

    async fn delete_network(&self, id: &str) -> Result<(), RemoteError> {
        let _call = self.enter("delete_network").await?;
        let mut state = self.state.lock().await;
        state
            .networks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(format!("network {}", id)))
    }

    // --- Pools ---

    async fn find_pool(&self, name: &str) -> Result<Option<String>, RemoteError> {
        let _call = self.enter("find_pool").await?;
        let state = self.state.lock().await;
        Ok(state
            .pools
            .values()
            .find(|p| p.name == name)
            .map(|p| p.id.clone()))
    }

    async fn get_pool(&self, id: &str) -> Result<Option<PoolRecord>, RemoteError> {
        let _call = self.enter("get_pool").await?;
        let state = self.state.lock().await;
        Ok(state.pools.get(id).cloned())
    }

    async fn create_pool(&self, pool: &NewPool) -> Result<String, RemoteError> {
        let _call = self.enter("create_pool").await?;
        let mut state = self.state.lock().await;
        let id = state.next_id().to_string();
        let ranges = pool
            .ranges
            .iter()
            .map(|range| PoolRange {
                id: state.next_id(),
                range: range.clone(),
            })
            .collect();
        state.pools.insert(
            id.clone(),
            PoolRecord {
                id: id.clone(),
                name: pool.name.clone(),
                note: pool.note.clone(),
                cluster: pool.cluster,
                ranges,
            },
        );
        Ok(id)
    }

    async fn update_pool_settings(
        &self,
        id: &str,
        name: &str,
        note: &str,
    ) -> Result<(), RemoteError> {
        let _call = self.enter("update_pool_settings").await?;
        let mut state = self.state.lock().await;
        let pool = state
            .pools
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(format!("pool {}", id)))?;
        pool.name = name.to_string();
        pool.note = note.to_string();
        Ok(())
    }

    async fn create_pool_range(&self, pool_id: &str, range: &str) -> Result<(), RemoteError> {
        let _call = self.enter("create_pool_range").await?;
        let mut state = self.state.lock().await;
        let range_id = state.next_id();
        let pool = state
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| RemoteError::NotFound(format!("pool {}", pool_id)))?;
        if pool.ranges.iter().any(|r| r.range == range) {
            return Err(RemoteError::Api {
                status: 409,
                message: format!("range {} already in pool", range),
            });
        }
        pool.ranges.push(PoolRange {
            id: range_id,
            range: range.to_string(),
        });
        Ok(())
    }

    async fn delete_pool_range(&self, range_id: u64) -> Result<(), RemoteError> {
        let _call = self.enter("delete_pool_range").await?;
        let mut state = self.state.lock().await;
        for pool in state.pools.values_mut() {
            if let Some(pos) = pool.ranges.iter().position(|r| r.id == range_id) {
                pool.ranges.remove(pos);
                return Ok(());
            }
        }
        Err(RemoteError::NotFound(format!("pool range {}", range_id)))
    }

    async fn delete_pool(&self, id: &str) -> Result<(), RemoteError> {
        let _call = self.enter("delete_pool").await?;
        let mut state = self.state.lock().await;
        state
            .pools
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(format!("pool {}", id)))
    }

    // --- Accounts ---

    async fn find_account(&self, email: &str) -> Result<Option<String>, RemoteError> {
        let _call = self.enter("find_account").await?;
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|a| a.record.email == email)
            .map(|a| a.record.id.clone()))
    }

    async fn get_account(&self, id: &str) -> Result<Option<AccountRecord>, RemoteError> {
        let _call = self.enter("get_account").await?;
        let state = self.state.lock().await;
        Ok(state.accounts.get(id).map(|a| a.record.clone()))
    }

    async fn create_account(&self, account: &NewAccount) -> Result<String, RemoteError> {
        let _call = self.enter("create_account").await?;
        let mut state = self.state.lock().await;
        let id = state.next_id().to_string();
        state.accounts.insert(
            id.clone(),
            AccountEntry {
                record: AccountRecord {
                    id: id.clone(),
                    email: account.email.clone(),
                    role: account.role.clone(),
                    state: "active".to_string(),
                },
                password: account.password.clone(),
                keys: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn change_account_role(&self, id: &str, role: &str) -> Result<(), RemoteError> {
        let _call = self.enter("change_account_role").await?;
        let mut state = self.state.lock().await;
        state.account_mut(id)?.record.role = role.to_string();
        Ok(())
    }

    async fn list_ssh_keys(&self, account_id: &str) -> Result<Vec<SshKey>, RemoteError> {
        let _call = self.enter("list_ssh_keys").await?;
        let mut state = self.state.lock().await;
        Ok(state.account_mut(account_id)?.keys.clone())
    }

    async fn add_ssh_key(&self, account_id: &str, key: &SshKeySpec) -> Result<(), RemoteError> {
        let _call = self.enter("add_ssh_key").await?;
        let mut state = self.state.lock().await;
        let key_id = state.next_id();
        state.account_mut(account_id)?.keys.push(SshKey {
            id: key_id,
            name: key.name.clone(),
            ssh_pub_key: key.ssh_pub_key.clone(),
        });
        Ok(())
    }

    async fn delete_ssh_key(&self, account_id: &str, key_id: u64) -> Result<(), RemoteError> {
        let _call = self.enter("delete_ssh_key").await?;
        let mut state = self.state.lock().await;
        let account = state.account_mut(account_id)?;
        let pos = account
            .keys
            .iter()
            .position(|k| k.id == key_id)
            .ok_or_else(|| RemoteError::NotFound(format!("ssh key {}", key_id)))?;
        account.keys.remove(pos);
        Ok(())
    }

    async fn delete_account(&self, id: &str) -> Result<(), RemoteError> {
        let _call = self.enter("delete_account").await?;
        let mut state = self.state.lock().await;
        state
            .accounts
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(format!("account {}", id)))
    }

    // --- VxLANs ---

    async fn find_vxlan(&self, account: u64, name: &str) -> Result<Option<String>, RemoteError> {
        let _call = self.enter("find_vxlan").await?;
        let state = self.state.lock().await;
        Ok(state
            .vxlans
            .values()
            .find(|v| v.account == account && v.name == name)
            .map(|v| v.id.clone()))
    }

    async fn get_vxlan(&self, id: &str) -> Result<Option<VxlanRecord>, RemoteError> {
        let _call = self.enter("get_vxlan").await?;
        let state = self.state.lock().await;
        Ok(state.vxlans.get(id).cloned())
    }

    async fn create_vxlan(&self, vxlan: &NewVxlan) -> Result<String, RemoteError> {
        let _call = self.enter("create_vxlan").await?;
        let mut state = self.state.lock().await;
        let id = state.next_id().to_string();
        let ippool = state.next_id();
        let ipnets = vxlan
            .ipnets
            .iter()
            .map(|ipnet| VxlanIpnet {
                id: state.next_id(),
                name: ipnet.name.clone(),
                gateway: ipnet.gateway.clone(),
            })
            .collect();
        state.vxlans.insert(
            id.clone(),
            VxlanRecord {
                id: id.clone(),
                name: vxlan.name.clone(),
                comment: vxlan.comment.clone(),
                account: vxlan.account,
                clusters: vxlan.clusters.clone(),
                ippool,
                ipnets,
            },
        );
        Ok(id)
    }

    async fn update_vxlan_comment(&self, id: &str, comment: &str) -> Result<(), RemoteError> {
        let _call = self.enter("update_vxlan_comment").await?;
        let mut state = self.state.lock().await;
        state.vxlan_mut(id)?.comment = comment.to_string();
        Ok(())
    }

    async fn add_vxlan_ipnet(&self, id: &str, ipnet: &IpnetSpec) -> Result<(), RemoteError> {
        let _call = self.enter("add_vxlan_ipnet").await?;
        let mut state = self.state.lock().await;
        let ipnet_id = state.next_id();
        state.vxlan_mut(id)?.ipnets.push(VxlanIpnet {
            id: ipnet_id,
            name: ipnet.name.clone(),
            gateway: ipnet.gateway.clone(),
        });
        Ok(())
    }

    async fn delete_vxlan_ipnet(&self, id: &str, ipnet_id: u64) -> Result<(), RemoteError> {
        let _call = self.enter("delete_vxlan_ipnet").await?;
        let mut state = self.state.lock().await;
        let vxlan = state.vxlan_mut(id)?;
        let pos = vxlan
            .ipnets
            .iter()
            .position(|n| n.id == ipnet_id)
            .ok_or_else(|| RemoteError::NotFound(format!("ipnet {}", ipnet_id)))?;
        vxlan.ipnets.remove(pos);
        Ok(())
    }

    async fn delete_vxlan(&self, id: &str) -> Result<(), RemoteError> {
        let _call = self.enter("delete_vxlan").await?;
        let mut state = self.state.lock().await;
        state
            .vxlans
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RemoteError::NotFound(format!("vxlan {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_vm(name: &str) -> NewVm {
        NewVm {
            name: name.to_string(),
            desc: String::new(),
            cores: 1,
            memory: 512,
            disk: 6000,
            cpu_mode: CpuMode::Default,
            cluster: 1,
            node: 0,
            account: 3,
            domain: "example.com".to_string(),
            password: "pw".to_string(),
            os: 1,
            preset: 0,
            ipv4_number: 2,
            ipv4_pools: vec![],
            anti_spoofing: true,
        }
    }

    #[tokio::test]
    async fn test_vm_ids_start_at_101_on_node1() {
        let remote = MemoryRemote::new();
        let first = remote.create_vm(&new_vm("a")).await.unwrap();
        let second = remote.create_vm(&new_vm("b")).await.unwrap();
        assert_eq!(first, VmHandle { node: "node1".into(), vmid: 101 });
        assert_eq!(second.vmid, 102);

        let record = remote.get_vm(101).await.unwrap().unwrap();
        assert_eq!(record.ip_addresses.len(), 2);
        assert!(remote.get_vm(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let remote = MemoryRemote::new();
        remote.find_network("10.0.0.0/24").await.unwrap();
        remote
            .create_network(&NewNetwork {
                name: "10.0.0.0/24".into(),
                gateway: "10.0.0.1".into(),
                note: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(remote.calls().await, vec!["find_network", "create_network"]);
        assert_eq!(remote.call_count("create_network").await, 1);
        assert_eq!(remote.take_calls().await.len(), 2);
        assert!(remote.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_after_successes() {
        let remote = MemoryRemote::new();
        remote
            .fail_call("get_pool", 1, RemoteError::Transport("boom".into()))
            .await;
        assert!(remote.get_pool("1").await.is_ok());
        assert_eq!(
            remote.get_pool("1").await.unwrap_err(),
            RemoteError::Transport("boom".into())
        );
        remote.clear_failures().await;
        assert!(remote.get_pool("1").await.is_ok());
        assert_eq!(remote.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_missing_resources_fail_mutations() {
        let remote = MemoryRemote::new();
        assert!(matches!(
            remote.delete_vm(5).await,
            Err(RemoteError::NotFound(_))
        ));
        assert!(matches!(
            remote.update_network_description("9", "x").await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_gate_holds_calls() {
        let remote = std::sync::Arc::new(MemoryRemote::new());
        remote.close_gate();
        let call = {
            let remote = std::sync::Arc::clone(&remote);
            tokio::spawn(async move { remote.get_vm(1).await })
        };
        for _ in 0..10 {
            if remote.in_flight() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(remote.in_flight(), 1);
        assert!(!call.is_finished());

        remote.open_gate();
        call.await.unwrap().unwrap();
        assert_eq!(remote.in_flight(), 0);
        assert_eq!(remote.peak_in_flight(), 1);
    }
}
