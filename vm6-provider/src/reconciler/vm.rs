//! VM reconciler - creates, converges and deletes VMs (`qemu`).

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{Context, Created, Reconciler, Substructures, node_id};
use crate::diff::{self, VmDirective};
use crate::error::{Error, Result};
use crate::id::{NodeResourceId, ResourceKind};
use crate::model::{AppliedPassword, PASSWORD_MASK, VmDesired, VmObserved};
use crate::remote::{NewVm, RemoteError, VmInterface, VmRecord};

/// VM reconciler.
pub struct VmReconciler {
    ctx: Context,
}

impl VmReconciler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Read without taking a permit; callers already hold one.
    async fn fetch(&self, vmid: u64) -> Result<Option<VmObserved>> {
        let record = self
            .ctx
            .call("get_vm", self.ctx.remote().get_vm(vmid))
            .await?;
        record
            .map(|r| observed_from_record(&self.ctx, r))
            .transpose()
    }

    /// Attach secondary disks, interfaces and recipes one call at a time.
    async fn apply_substructures(&self, id: &NodeResourceId, desired: &VmDesired) -> Result<()> {
        let provisioning = &desired.provisioning;
        let interfaces: Vec<VmInterface> = provisioning
            .custom_interfaces
            .iter()
            .cloned()
            .map(VmInterface::Custom)
            .chain(provisioning.vxlans.iter().cloned().map(VmInterface::Vxlan))
            .collect();

        let mut steps = Vec::new();
        steps.extend(
            provisioning
                .disks
                .iter()
                .map(|d| format!("attach disk ({} MiB)", d.size_mib)),
        );
        steps.extend(interfaces.iter().map(|iface| match iface {
            VmInterface::Custom(c) => format!("attach interface on {}", c.bridge),
            VmInterface::Vxlan(v) => format!("attach vxlan {}", v.id),
        }));
        steps.extend(
            provisioning
                .recipes
                .iter()
                .map(|r| format!("run recipe {}", r.recipe)),
        );
        let mut progress = Substructures::new(steps);
        let remote = self.ctx.remote();

        for disk in &provisioning.disks {
            if let Err(e) = self
                .ctx
                .call("attach_disk", remote.attach_disk(id.vmid, disk))
                .await
            {
                return Err(self.partial(id, progress, e));
            }
            progress.applied();
        }
        for iface in &interfaces {
            if let Err(e) = self
                .ctx
                .call("attach_interface", remote.attach_interface(id.vmid, iface))
                .await
            {
                return Err(self.partial(id, progress, e));
            }
            progress.applied();
        }
        for recipe in &provisioning.recipes {
            if let Err(e) = self
                .ctx
                .call("run_recipe", remote.run_recipe(id.vmid, recipe))
                .await
            {
                return Err(self.partial(id, progress, e));
            }
            progress.applied();
        }
        Ok(())
    }

    fn partial(&self, id: &NodeResourceId, progress: Substructures, e: RemoteError) -> Error {
        error!("VM {} created, but applying its substructures failed: {}", id, e);
        progress.failed(&id.to_string(), e)
    }

    async fn apply(&self, vmid: u64, directive: &VmDirective) -> Result<()> {
        let remote = self.ctx.remote();
        match directive {
            VmDirective::UpdateResources {
                cores,
                memory,
                cpu_mode,
            } => {
                self.ctx
                    .call(
                        "update_vm_resources",
                        remote.update_vm_resources(vmid, *cores, *memory, *cpu_mode),
                    )
                    .await?
            }
            VmDirective::UpdateConfig { name, desc } => {
                self.ctx
                    .call("update_vm_config", remote.update_vm_config(vmid, name, desc))
                    .await?
            }
            VmDirective::ReinstallOs { os, password } => {
                self.ctx
                    .call("reinstall_os", remote.reinstall_os(vmid, *os, password))
                    .await?
            }
            VmDirective::ChangePassword { password } => {
                self.ctx
                    .call("change_vm_password", remote.change_vm_password(vmid, password))
                    .await?
            }
            VmDirective::ChangeOwner { account } => {
                self.ctx
                    .call("change_vm_owner", remote.change_vm_owner(vmid, *account))
                    .await?
            }
            VmDirective::ResizeDisk { disk_id, size } => {
                self.ctx
                    .call("resize_disk", remote.resize_disk(*disk_id, *size))
                    .await?
            }
            VmDirective::UpdatePtr { ip_id, domain } => {
                self.ctx
                    .call("update_ptr", remote.update_ptr(*ip_id, domain))
                    .await?
            }
        }
        Ok(())
    }
}

fn observed_from_record(ctx: &Context, record: VmRecord) -> Result<VmObserved> {
    Ok(VmObserved {
        cpu_mode: ctx.parse_remote("cpu_mode", &record.cpu_mode)?,
        name: record.name,
        desc: record.desc,
        cores: record.cores,
        memory: record.memory,
        disk: record.disk_size,
        disk_id: record.disk_id,
        cluster: record.cluster,
        node: record.node_id,
        account: record.account,
        domain: record.domain,
        os: record.os,
        ip_addresses: record.ip_addresses,
        password: None,
        provisioning: None,
    })
}

fn new_vm(desired: &VmDesired) -> NewVm {
    let provisioning = &desired.provisioning;
    NewVm {
        name: desired.name.clone(),
        desc: desired.desc.clone(),
        cores: desired.cores,
        memory: desired.memory,
        disk: desired.disk,
        cpu_mode: desired.cpu_mode,
        cluster: desired.cluster,
        node: desired.node,
        account: desired.account,
        domain: desired.domain.clone(),
        password: desired.password.clone(),
        os: desired.os,
        preset: provisioning.preset,
        ipv4_number: provisioning.ipv4_number,
        ipv4_pools: provisioning.ipv4_pools.clone(),
        anti_spoofing: provisioning.anti_spoofing,
    }
}

/// Carry the write-only inputs of `desired` onto a fresh read.
fn with_inputs(mut observed: VmObserved, desired: &VmDesired) -> VmObserved {
    observed.password = Some(AppliedPassword::new(&desired.password));
    observed.provisioning = Some(desired.provisioning.clone());
    observed
}

#[async_trait]
impl Reconciler for VmReconciler {
    type Desired = VmDesired;
    type Observed = VmObserved;

    const KIND: ResourceKind = ResourceKind::Qemu;

    async fn create(&self, desired: &VmDesired) -> Result<Created<VmObserved>> {
        info!("Creating VM {}", desired.name);
        let _permit = self.ctx.throttle().acquire().await?;
        let remote = self.ctx.remote();

        if let Some(handle) = self
            .ctx
            .call("find_vm", remote.find_vm(&desired.name))
            .await?
        {
            let id = NodeResourceId::new(handle.node, Self::KIND, handle.vmid);
            info!("VM {} already exists as {}, adopting", desired.name, id);
            let observed = self.fetch(id.vmid).await?.ok_or_else(|| Error::NotFound {
                kind: Self::KIND,
                id: id.to_string(),
            })?;
            return Ok(Created {
                id: id.to_string(),
                observed: with_inputs(observed, desired),
                adopted: true,
            });
        }

        let handle = self
            .ctx
            .call("create_vm", remote.create_vm(&new_vm(desired)))
            .await?;
        let id = NodeResourceId::new(handle.node, Self::KIND, handle.vmid);
        info!("VM {} created as {}", desired.name, id);

        self.apply_substructures(&id, desired).await?;

        let observed = self.fetch(id.vmid).await?.ok_or_else(|| Error::NotFound {
            kind: Self::KIND,
            id: id.to_string(),
        })?;
        Ok(Created {
            id: id.to_string(),
            observed: with_inputs(observed, desired),
            adopted: false,
        })
    }

    async fn read(&self, id: &str) -> Result<Option<VmObserved>> {
        let id = node_id(Self::KIND, id)?;
        let _permit = self.ctx.throttle().acquire().await?;
        let observed = self.fetch(id.vmid).await?;
        if observed.is_none() {
            info!("VM {} not found", id);
        }
        Ok(observed)
    }

    async fn update(
        &self,
        id: &str,
        prior: &VmObserved,
        desired: &VmDesired,
    ) -> Result<Option<VmObserved>> {
        let id = node_id(Self::KIND, id)?;
        diff::vm(prior, desired)?;

        let _permit = self.ctx.throttle().acquire().await?;
        let Some(mut current) = self.fetch(id.vmid).await? else {
            info!("VM {} vanished before update", id);
            return Ok(None);
        };
        current.password.clone_from(&prior.password);
        current.provisioning.clone_from(&prior.provisioning);

        // A retry after a failed pass only sends what is still missing.
        let directives = diff::vm(&current, desired)?;
        info!("Reconciling VM {} ({} changes)", id, directives.len());

        for directive in &directives {
            debug!(id = %id, kind = %Self::KIND, directive = %directive, "applying directive");
            self.apply(id.vmid, directive).await.inspect_err(|e| {
                error!("Failed to {} on VM {}: {}", directive, id, e);
            })?;
        }

        let Some(mut observed) = self.fetch(id.vmid).await? else {
            return Ok(None);
        };
        observed.password = if desired.password.is_empty() || desired.password == PASSWORD_MASK {
            prior.password.clone()
        } else {
            Some(AppliedPassword::new(&desired.password))
        };
        observed.provisioning.clone_from(&prior.provisioning);
        Ok(Some(observed))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = node_id(Self::KIND, id)?;
        info!("Deleting VM {}", id);
        let _permit = self.ctx.throttle().acquire().await?;
        self.ctx
            .call("delete_vm", self.ctx.remote().delete_vm(id.vmid))
            .await?;
        info!("VM {} deleted", id);
        Ok(())
    }
}
