//! In-memory provider for exercising the controller without a cloud account.
//!
//! Every call is recorded so tests can assert on exactly what would have
//! been sent to the provider.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{FlotillaError, Result};
use crate::node::{InstanceState, Node, SecurityGroup, SpotRequest, SpotRequestState};
use crate::{CloudProvider, IngressRule, LaunchSpec, SpotSpec};

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    FindSecurityGroup(String),
    CreateSecurityGroup(String),
    AuthorizeGroup { group: String, source: String },
    AuthorizeCidr { group: String, cidr: String },
    AvailabilityZones,
    ImageExists(String),
    RunInstances { group: String, zone: String, count: usize },
    RequestSpot { group: String, zone: String, count: usize, launch_group: String },
    DescribeSpot(Vec<String>),
    CancelSpot(Vec<String>),
    DescribeInstances(Option<Vec<String>>),
    StopInstances(Vec<String>),
    TerminateInstances(Vec<String>),
}

/// What the next `describe_spot_requests` call does.
#[derive(Debug, Clone)]
pub enum SpotStep {
    /// Fulfil these request ids (launching their instances), leave others open.
    Activate(Vec<String>),
    /// Fail the describe call.
    Fail(String),
    /// Mark these request ids as failed by the provider.
    Reject(Vec<String>),
    /// Report none of the asked-for requests, as the provider does for ids
    /// it has only just issued.
    Invisible,
}

#[derive(Debug, Clone)]
struct PendingSpot {
    request: SpotRequest,
    spec: SpotSpec,
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<ProviderCall>,
    groups: Vec<SecurityGroup>,
    instances: Vec<Node>,
    pending_polls: HashMap<String, usize>,
    spot: Vec<PendingSpot>,
    spot_script: VecDeque<SpotStep>,
    next_id: usize,
}

impl Inner {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn launch(&mut self, spec: &LaunchSpec, spot_request_id: Option<String>, polls: usize) -> Node {
        let id = self.next("i");
        let node = Node {
            public_dns: format!("{}.compute.example.com", id),
            private_dns: format!("{}.internal", id),
            id: id.clone(),
            state: InstanceState::Pending,
            zone: spec.zone.clone(),
            security_groups: vec![spec.security_group.clone()],
            spot_request_id,
            launch_time: None,
        };
        self.pending_polls.insert(id, polls);
        self.instances.push(node.clone());
        node
    }
}

pub struct MockProvider {
    zones: Vec<String>,
    images: Vec<String>,
    image_error: Option<String>,
    pending_polls: usize,
    inner: Mutex<Inner>,
}

impl MockProvider {
    pub fn new(zones: &[&str]) -> Self {
        MockProvider {
            zones: zones.iter().map(|z| z.to_string()).collect(),
            images: vec!["ami-test".to_string()],
            image_error: None,
            pending_polls: 1,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_images(mut self, images: &[&str]) -> Self {
        self.images = images.iter().map(|i| i.to_string()).collect();
        self
    }

    /// Fail every image lookup with `reason`.
    pub fn with_image_lookup_error(mut self, reason: &str) -> Self {
        self.image_error = Some(reason.to_string());
        self
    }

    /// Number of instance describes a new instance stays `pending` for.
    pub fn with_pending_polls(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn script_spot(&self, steps: impl IntoIterator<Item = SpotStep>) {
        self.lock().spot_script.extend(steps);
    }

    pub fn seed_group(&self, name: &str, rule_count: usize) -> SecurityGroup {
        let mut inner = self.lock();
        let group = SecurityGroup {
            id: inner.next("sg"),
            name: name.to_string(),
            rule_count,
        };
        inner.groups.push(group.clone());
        group
    }

    pub fn seed_instance(&self, node: Node) {
        self.lock().instances.push(node);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn instances(&self) -> Vec<Node> {
        self.lock().instances.clone()
    }

    pub fn groups(&self) -> Vec<SecurityGroup> {
        self.lock().groups.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, call: ProviderCall) {
        self.lock().calls.push(call);
    }
}

/// Convenience constructor for a node already running in `group`.
pub fn running_node(id: &str, group: &str, spot_request_id: Option<&str>) -> Node {
    Node {
        id: id.to_string(),
        public_dns: format!("{}.compute.example.com", id),
        private_dns: format!("{}.internal", id),
        state: InstanceState::Running,
        zone: "zone-a".to_string(),
        security_groups: vec![group.to_string()],
        spot_request_id: spot_request_id.map(str::to_string),
        launch_time: None,
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn find_security_group(&self, name: &str) -> Result<Option<SecurityGroup>> {
        self.record(ProviderCall::FindSecurityGroup(name.to_string()));
        Ok(self.lock().groups.iter().find(|g| g.name == name).cloned())
    }

    async fn create_security_group(&self, name: &str, _description: &str) -> Result<SecurityGroup> {
        self.record(ProviderCall::CreateSecurityGroup(name.to_string()));
        let mut inner = self.lock();
        if inner.groups.iter().any(|g| g.name == name) {
            return Err(FlotillaError::provider("create-security-group", format!("group {} already exists", name)));
        }
        let group = SecurityGroup {
            id: inner.next("sg"),
            name: name.to_string(),
            rule_count: 0,
        };
        inner.groups.push(group.clone());
        Ok(group)
    }

    async fn authorize_group_ingress(&self, group: &SecurityGroup, source: &SecurityGroup) -> Result<()> {
        self.record(ProviderCall::AuthorizeGroup {
            group: group.name.clone(),
            source: source.name.clone(),
        });
        if let Some(g) = self.lock().groups.iter_mut().find(|g| g.id == group.id) {
            g.rule_count += 1;
        }
        Ok(())
    }

    async fn authorize_cidr_ingress(&self, group: &SecurityGroup, rule: &IngressRule) -> Result<()> {
        self.record(ProviderCall::AuthorizeCidr {
            group: group.name.clone(),
            cidr: rule.cidr.clone(),
        });
        if let Some(g) = self.lock().groups.iter_mut().find(|g| g.id == group.id) {
            g.rule_count += 1;
        }
        Ok(())
    }

    async fn availability_zones(&self) -> Result<Vec<String>> {
        self.record(ProviderCall::AvailabilityZones);
        Ok(self.zones.clone())
    }

    async fn image_exists(&self, image_id: &str) -> Result<bool> {
        self.record(ProviderCall::ImageExists(image_id.to_string()));
        if let Some(reason) = &self.image_error {
            return Err(FlotillaError::provider("describe-images", reason));
        }
        Ok(self.images.iter().any(|i| i == image_id))
    }

    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<Node>> {
        self.record(ProviderCall::RunInstances {
            group: spec.security_group.clone(),
            zone: spec.zone.clone(),
            count: spec.count,
        });
        let polls = self.pending_polls;
        let mut inner = self.lock();
        Ok((0..spec.count).map(|_| inner.launch(spec, None, polls)).collect())
    }

    async fn request_spot_instances(&self, spec: &SpotSpec) -> Result<Vec<SpotRequest>> {
        self.record(ProviderCall::RequestSpot {
            group: spec.launch.security_group.clone(),
            zone: spec.launch.zone.clone(),
            count: spec.launch.count,
            launch_group: spec.launch_group.clone(),
        });
        let mut inner = self.lock();
        let mut requests = Vec::with_capacity(spec.launch.count);
        for _ in 0..spec.launch.count {
            let request = SpotRequest {
                id: inner.next("sir"),
                state: SpotRequestState::Open,
                instance_id: None,
            };
            inner.spot.push(PendingSpot {
                request: request.clone(),
                spec: spec.clone(),
            });
            requests.push(request);
        }
        Ok(requests)
    }

    async fn describe_spot_requests(&self, ids: &[String]) -> Result<Vec<SpotRequest>> {
        self.record(ProviderCall::DescribeSpot(ids.to_vec()));
        let polls = self.pending_polls;
        let mut inner = self.lock();
        let step = inner.spot_script.pop_front();
        let to_activate: Vec<String> = match step {
            Some(SpotStep::Fail(reason)) => {
                return Err(FlotillaError::provider("describe-spot-instance-requests", reason));
            }
            Some(SpotStep::Activate(ids)) => ids,
            Some(SpotStep::Invisible) => return Ok(Vec::new()),
            Some(SpotStep::Reject(ids)) => {
                for pending in inner.spot.iter_mut().filter(|p| ids.contains(&p.request.id)) {
                    pending.request.state = SpotRequestState::Failed;
                }
                Vec::new()
            }
            None => inner
                .spot
                .iter()
                .filter(|p| p.request.state == SpotRequestState::Open)
                .map(|p| p.request.id.clone())
                .collect(),
        };
        for id in to_activate {
            let Some(index) = inner
                .spot
                .iter()
                .position(|p| p.request.id == id && p.request.state == SpotRequestState::Open)
            else {
                continue;
            };
            let spec = inner.spot[index].spec.launch.clone();
            let node = inner.launch(&spec, Some(id.clone()), polls);
            let pending = &mut inner.spot[index];
            pending.request.state = SpotRequestState::Active;
            pending.request.instance_id = Some(node.id);
        }
        Ok(inner
            .spot
            .iter()
            .filter(|p| ids.contains(&p.request.id))
            .map(|p| p.request.clone())
            .collect())
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<()> {
        self.record(ProviderCall::CancelSpot(ids.to_vec()));
        for pending in self.lock().spot.iter_mut().filter(|p| ids.contains(&p.request.id)) {
            if pending.request.state == SpotRequestState::Open {
                pending.request.state = SpotRequestState::Cancelled;
            }
        }
        Ok(())
    }

    async fn describe_instances(&self, ids: Option<&[String]>) -> Result<Vec<Node>> {
        self.record(ProviderCall::DescribeInstances(ids.map(<[String]>::to_vec)));
        let mut inner = self.lock();
        let Inner {
            instances,
            pending_polls,
            ..
        } = &mut *inner;
        let mut out = Vec::new();
        for node in instances.iter_mut() {
            if ids.is_some_and(|ids| !ids.contains(&node.id)) {
                continue;
            }
            if node.state == InstanceState::Pending {
                let remaining = pending_polls.entry(node.id.clone()).or_insert(0);
                if *remaining == 0 {
                    node.state = InstanceState::Running;
                } else {
                    *remaining -= 1;
                }
            }
            out.push(node.clone());
        }
        Ok(out)
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        self.record(ProviderCall::StopInstances(ids.to_vec()));
        for node in self.lock().instances.iter_mut().filter(|n| ids.contains(&n.id)) {
            node.state = InstanceState::Stopped;
        }
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        self.record(ProviderCall::TerminateInstances(ids.to_vec()));
        for node in self.lock().instances.iter_mut().filter(|n| ids.contains(&n.id)) {
            node.state = InstanceState::Terminated;
        }
        Ok(())
    }
}
