use std::collections::BTreeMap;

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::{partition, BlockDevice, CloudProvider, ClusterNodes, LaunchSpec, Node, Role, SpotSpec};
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::config::{ClusterConfig, ZoneChoice};

/// Device the first instance-store volume is mapped at; first boot formats
/// it and mounts it at /hadoop.
pub const EPHEMERAL_DEVICE: &str = "/dev/sdz";
/// Device the optional EBS volume is mapped at; mounted at /vol.
pub const EBS_DEVICE: &str = "/dev/sdv";

/// Outcome of asking the provider for capacity.
#[derive(Debug)]
pub enum Provisioned {
    /// Instances exist already, possibly still `pending`.
    OnDemand(ClusterNodes),
    /// Reservation requests that still have to be granted.
    Spot(SpotBatch),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpotBatch {
    pub requests: BTreeMap<Role, Vec<String>>,
    pub desired_workers: usize,
}

impl SpotBatch {
    pub fn all_ids(&self) -> Vec<String> {
        self.requests.values().flatten().cloned().collect()
    }

    pub fn role_of(&self, request_id: &str) -> Option<Role> {
        self.requests
            .iter()
            .find(|(_, ids)| ids.iter().any(|id| id == request_id))
            .map(|(role, _)| *role)
    }

    /// Granted instances needed per role before the batch is satisfied.
    pub fn desired(&self, role: Role) -> usize {
        match role {
            Role::Worker => self.desired_workers,
            Role::ControlPlane | Role::Auxiliary => 1,
        }
    }
}

/// Zones to launch into for this run.
pub async fn resolve_zones(provider: &dyn CloudProvider, choice: &ZoneChoice) -> Result<Vec<String>> {
    match choice {
        ZoneChoice::Named(zone) => Ok(vec![zone.clone()]),
        ZoneChoice::All => {
            let zones = provider.availability_zones().await?;
            if zones.is_empty() {
                return Err(FlotillaError::provider("describe-availability-zones", "no zones available"));
            }
            Ok(zones)
        }
        ZoneChoice::Random => {
            let zones = provider.availability_zones().await?;
            zones
                .choose(&mut rand::thread_rng())
                .map(|zone| vec![zone.clone()])
                .ok_or_else(|| FlotillaError::provider("describe-availability-zones", "no zones available"))
        }
    }
}

pub struct CapacityRequester<'a> {
    provider: &'a dyn CloudProvider,
    config: &'a ClusterConfig,
}

impl<'a> CapacityRequester<'a> {
    pub fn new(provider: &'a dyn CloudProvider, config: &'a ClusterConfig) -> Self {
        CapacityRequester { provider, config }
    }

    /// Request a full cluster: one control-plane node, one auxiliary node
    /// and `config.slaves` workers spread evenly over `zones`.
    pub async fn request(&self, zones: &[String]) -> Result<Provisioned> {
        if zones.is_empty() {
            return Err(FlotillaError::InvalidArguments("no availability zone to launch into".into()));
        }
        self.check_image().await?;

        let control_zone = zones
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| zones[0].clone());

        match self.config.spot_price {
            Some(price) => self.request_spot(zones, &control_zone, price).await.map(Provisioned::Spot),
            None => self.request_on_demand(zones, &control_zone).await.map(Provisioned::OnDemand),
        }
    }

    async fn check_image(&self) -> Result<()> {
        if self.provider.image_exists(&self.config.ami).await? {
            Ok(())
        } else {
            Err(FlotillaError::ImageNotFound(self.config.ami.clone()))
        }
    }

    pub fn block_devices(&self) -> Vec<BlockDevice> {
        let mut devices = vec![BlockDevice::Ephemeral {
            device: EPHEMERAL_DEVICE.to_string(),
            virtual_name: "ephemeral0".to_string(),
        }];
        if self.config.ebs_vol_size > 0 {
            devices.push(BlockDevice::Ebs {
                device: EBS_DEVICE.to_string(),
                size_gb: self.config.ebs_vol_size,
                delete_on_termination: true,
            });
        }
        devices
    }

    fn launch_spec(&self, role: Role, zone: &str, count: usize) -> LaunchSpec {
        let instance_type = match role {
            Role::Worker => &self.config.instance_type,
            Role::ControlPlane | Role::Auxiliary => &self.config.master_instance_type,
        };
        LaunchSpec {
            image_id: self.config.ami.clone(),
            instance_type: instance_type.clone(),
            key_pair: self.config.key_pair.clone(),
            security_group: role.group_name(&self.config.cluster_name),
            zone: zone.to_string(),
            count,
            block_devices: self.block_devices(),
            client_token: None,
        }
    }

    async fn request_on_demand(&self, zones: &[String], control_zone: &str) -> Result<ClusterNodes> {
        let mut nodes = ClusterNodes::new();

        for (index, zone) in zones.iter().enumerate() {
            let count = partition(self.config.slaves, zones.len(), index);
            if count == 0 {
                continue;
            }
            let launched = self.run(Role::Worker, zone, count).await?;
            info!(count, zone = %zone, "launched slaves");
            nodes.extend(Role::Worker, launched);
        }

        for role in [Role::ControlPlane, Role::Auxiliary] {
            let launched = self.run(role, control_zone, 1).await?;
            info!(role = %role, zone = %control_zone, "launched {}", role);
            nodes.extend(role, launched);
        }
        Ok(nodes)
    }

    async fn run(&self, role: Role, zone: &str, count: usize) -> Result<Vec<Node>> {
        let mut spec = self.launch_spec(role, zone, count);
        spec.client_token = Some(uuid::Uuid::new_v4().to_string());
        self.provider.run_instances(&spec).await
    }

    async fn request_spot(&self, zones: &[String], control_zone: &str, price: f64) -> Result<SpotBatch> {
        info!(
            slaves = self.config.slaves,
            price,
            "requesting spot instances"
        );
        let mut batch = SpotBatch {
            requests: BTreeMap::new(),
            desired_workers: self.config.slaves,
        };

        let mut plan: Vec<(Role, &str, usize)> = vec![
            (Role::ControlPlane, control_zone, 1),
            (Role::Auxiliary, control_zone, 1),
        ];
        for (index, zone) in zones.iter().enumerate() {
            let count = partition(self.config.slaves, zones.len(), index);
            if count > 0 {
                plan.push((Role::Worker, zone.as_str(), count));
            }
        }

        for (role, zone, count) in plan {
            let spec = SpotSpec {
                launch: self.launch_spec(role, zone, count),
                max_price: price,
                launch_group: self.config.launch_group(),
            };
            match self.provider.request_spot_instances(&spec).await {
                Ok(requests) => {
                    batch
                        .requests
                        .entry(role)
                        .or_default()
                        .extend(requests.into_iter().map(|r| r.id));
                }
                Err(e) => {
                    let issued = batch.all_ids();
                    warn!(error = %e, issued = issued.len(), "spot request failed, cancelling issued requests");
                    if let Err(cancel) = self.provider.cancel_spot_requests(&issued).await {
                        warn!(error = %cancel, "could not cancel spot requests");
                    }
                    return Err(FlotillaError::ProvisioningAborted {
                        reason: e.to_string(),
                        leaked: 0,
                    });
                }
            }
        }
        Ok(batch)
    }
}
