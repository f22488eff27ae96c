use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::{
    BlockDevice, CloudProvider, IngressRule, InstanceState, LaunchSpec, Node, SecurityGroup,
    SpotRequest, SpotRequestState, SpotSpec,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

const AWS_PROGRAM: &str = "aws";

/// EC2 driven through the `aws ec2` command line, one process per call.
pub struct Ec2 {
    pub region: String,
    pub credentials_file: Option<PathBuf>,
    program: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
    #[serde(default)]
    groups: Vec<GroupIdentifier>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesResponse {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: InstanceStateName,
    #[serde(default)]
    public_dns_name: Option<String>,
    #[serde(default)]
    private_dns_name: Option<String>,
    #[serde(default)]
    placement: Option<Placement>,
    #[serde(default)]
    security_groups: Vec<GroupIdentifier>,
    #[serde(default)]
    spot_instance_request_id: Option<String>,
    #[serde(default)]
    launch_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceStateName {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Placement {
    #[serde(default)]
    availability_zone: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GroupIdentifier {
    #[serde(default)]
    group_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequestsResponse {
    #[serde(default)]
    spot_instance_requests: Vec<SpotInstanceRequest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotInstanceRequest {
    spot_instance_request_id: String,
    state: String,
    #[serde(default)]
    instance_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupsResponse {
    #[serde(default)]
    security_groups: Vec<SecurityGroupEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecurityGroupEntry {
    group_id: String,
    group_name: String,
    #[serde(default)]
    ip_permissions: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateGroupResponse {
    group_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ZonesResponse {
    #[serde(default)]
    availability_zones: Vec<Zone>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Zone {
    zone_name: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImagesResponse {
    #[serde(default)]
    images: Vec<Value>,
}

impl Ec2 {
    pub fn new(region: String, credentials_file: Option<PathBuf>) -> Ec2 {
        Ec2 {
            region,
            credentials_file,
            program: AWS_PROGRAM.to_string(),
        }
    }

    async fn call(&self, operation: &str, args: Vec<String>) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("ec2")
            .arg(operation)
            .args(&args)
            .arg("--region")
            .arg(&self.region)
            .arg("--output")
            .arg("json");
        if let Some(path) = &self.credentials_file {
            cmd.env("AWS_SHARED_CREDENTIALS_FILE", path);
        }
        debug!(operation, region = %self.region, "calling aws ec2");

        let output = cmd
            .output()
            .await
            .map_err(|e| FlotillaError::provider(operation, format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlotillaError::provider(
                operation,
                format!("{} ({})", stderr.trim(), output.status),
            ));
        }
        Ok(output.stdout)
    }

    async fn call_json<T: DeserializeOwned>(&self, operation: &str, args: Vec<String>) -> Result<T> {
        let body = self.call(operation, args).await?;
        decode(operation, &body)
    }

    /// Like `call`, but `None` when the provider reports `code` for the
    /// ids asked about. Freshly issued ids take a while to become visible.
    async fn call_visible(&self, operation: &str, args: Vec<String>, code: &str) -> Result<Option<Vec<u8>>> {
        match self.call(operation, args).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if reports(&e, code) => {
                debug!(operation, code, "ids not visible yet");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

const SPOT_REQUEST_NOT_FOUND: &str = "InvalidSpotInstanceRequestID.NotFound";
const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";
const IMAGE_NOT_FOUND: &str = "InvalidAMIID.NotFound";

/// Whether a failed call carries the provider error `code`.
fn reports(err: &FlotillaError, code: &str) -> bool {
    matches!(err, FlotillaError::Provider { reason, .. } if reason.contains(code))
}

fn decode<T: DeserializeOwned>(operation: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| {
        FlotillaError::provider(
            operation,
            format!(
                "failed to parse response: {} - response body: {}",
                e,
                String::from_utf8_lossy(body)
            ),
        )
    })
}

fn to_node(instance: Instance, reservation_groups: &[GroupIdentifier]) -> Result<Node> {
    let state = instance
        .state
        .name
        .parse::<InstanceState>()
        .map_err(|e| FlotillaError::provider("describe-instances", e))?;
    // Older accounts report group membership on the reservation only.
    let groups = if instance.security_groups.is_empty() {
        reservation_groups
    } else {
        instance.security_groups.as_slice()
    };
    Ok(Node {
        id: instance.instance_id,
        public_dns: instance.public_dns_name.unwrap_or_default(),
        private_dns: instance.private_dns_name.unwrap_or_default(),
        state,
        zone: instance.placement.map(|p| p.availability_zone).unwrap_or_default(),
        security_groups: groups.iter().map(|g| g.group_name.clone()).collect(),
        spot_request_id: instance.spot_instance_request_id,
        launch_time: instance.launch_time,
    })
}

fn parse_instances(body: &[u8]) -> Result<Vec<Node>> {
    let response: DescribeInstancesResponse = decode("describe-instances", body)?;
    let mut nodes = Vec::new();
    for reservation in response.reservations {
        for instance in reservation.instances {
            nodes.push(to_node(instance, &reservation.groups)?);
        }
    }
    Ok(nodes)
}

fn parse_spot_requests(operation: &str, body: &[u8]) -> Result<Vec<SpotRequest>> {
    let response: SpotRequestsResponse = decode(operation, body)?;
    response
        .spot_instance_requests
        .into_iter()
        .map(|r| {
            let state = r
                .state
                .parse::<SpotRequestState>()
                .map_err(|e| FlotillaError::provider(operation, e))?;
            Ok(SpotRequest {
                id: r.spot_instance_request_id,
                state,
                instance_id: r.instance_id,
            })
        })
        .collect()
}

fn block_device_mappings(devices: &[BlockDevice]) -> Value {
    Value::Array(
        devices
            .iter()
            .map(|device| match device {
                BlockDevice::Ephemeral { device, virtual_name } => json!({
                    "DeviceName": device,
                    "VirtualName": virtual_name,
                }),
                BlockDevice::Ebs {
                    device,
                    size_gb,
                    delete_on_termination,
                } => json!({
                    "DeviceName": device,
                    "Ebs": {
                        "VolumeSize": size_gb,
                        "DeleteOnTermination": delete_on_termination,
                    },
                }),
            })
            .collect(),
    )
}

fn run_instances_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "--image-id".to_string(),
        spec.image_id.clone(),
        "--instance-type".to_string(),
        spec.instance_type.clone(),
        "--count".to_string(),
        format!("{}:{}", spec.count, spec.count),
        "--security-groups".to_string(),
        spec.security_group.clone(),
        "--placement".to_string(),
        format!("AvailabilityZone={}", spec.zone),
    ];
    if let Some(key) = &spec.key_pair {
        args.push("--key-name".to_string());
        args.push(key.clone());
    }
    if !spec.block_devices.is_empty() {
        args.push("--block-device-mappings".to_string());
        args.push(block_device_mappings(&spec.block_devices).to_string());
    }
    if let Some(token) = &spec.client_token {
        args.push("--client-token".to_string());
        args.push(token.clone());
    }
    args
}

fn spot_request_args(spec: &SpotSpec) -> Vec<String> {
    let launch = &spec.launch;
    let mut specification = json!({
        "ImageId": launch.image_id,
        "InstanceType": launch.instance_type,
        "SecurityGroups": [launch.security_group],
        "Placement": { "AvailabilityZone": launch.zone },
    });
    if let Some(key) = &launch.key_pair {
        specification["KeyName"] = json!(key);
    }
    if !launch.block_devices.is_empty() {
        specification["BlockDeviceMappings"] = block_device_mappings(&launch.block_devices);
    }
    vec![
        "--spot-price".to_string(),
        spec.max_price.to_string(),
        "--instance-count".to_string(),
        launch.count.to_string(),
        "--type".to_string(),
        "one-time".to_string(),
        "--launch-group".to_string(),
        spec.launch_group.clone(),
        "--launch-specification".to_string(),
        specification.to_string(),
    ]
}

fn id_args(flag: &str, ids: &[String]) -> Vec<String> {
    std::iter::once(flag.to_string()).chain(ids.iter().cloned()).collect()
}

#[async_trait]
impl CloudProvider for Ec2 {
    async fn find_security_group(&self, name: &str) -> Result<Option<SecurityGroup>> {
        let response: SecurityGroupsResponse = self
            .call_json(
                "describe-security-groups",
                vec!["--filters".to_string(), format!("Name=group-name,Values={}", name)],
            )
            .await?;
        Ok(response
            .security_groups
            .into_iter()
            .find(|g| g.group_name == name)
            .map(|g| SecurityGroup {
                id: g.group_id,
                name: g.group_name,
                rule_count: g.ip_permissions.len(),
            }))
    }

    async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup> {
        let response: CreateGroupResponse = self
            .call_json(
                "create-security-group",
                vec![
                    "--group-name".to_string(),
                    name.to_string(),
                    "--description".to_string(),
                    description.to_string(),
                ],
            )
            .await?;
        Ok(SecurityGroup {
            id: response.group_id,
            name: name.to_string(),
            rule_count: 0,
        })
    }

    async fn authorize_group_ingress(&self, group: &SecurityGroup, source: &SecurityGroup) -> Result<()> {
        let permissions = json!([{
            "IpProtocol": "-1",
            "UserIdGroupPairs": [{ "GroupId": source.id }],
        }]);
        self.call(
            "authorize-security-group-ingress",
            vec![
                "--group-id".to_string(),
                group.id.clone(),
                "--ip-permissions".to_string(),
                permissions.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn authorize_cidr_ingress(&self, group: &SecurityGroup, rule: &IngressRule) -> Result<()> {
        let permissions = json!([{
            "IpProtocol": rule.protocol,
            "FromPort": rule.from_port,
            "ToPort": rule.to_port,
            "IpRanges": [{ "CidrIp": rule.cidr }],
        }]);
        self.call(
            "authorize-security-group-ingress",
            vec![
                "--group-id".to_string(),
                group.id.clone(),
                "--ip-permissions".to_string(),
                permissions.to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn availability_zones(&self) -> Result<Vec<String>> {
        let response: ZonesResponse = self.call_json("describe-availability-zones", Vec::new()).await?;
        Ok(response
            .availability_zones
            .into_iter()
            .filter(|z| z.state.as_deref().map_or(true, |s| s == "available"))
            .map(|z| z.zone_name)
            .collect())
    }

    async fn image_exists(&self, image_id: &str) -> Result<bool> {
        let args = vec!["--image-ids".to_string(), image_id.to_string()];
        let Some(body) = self.call_visible("describe-images", args, IMAGE_NOT_FOUND).await? else {
            return Ok(false);
        };
        let response: ImagesResponse = decode("describe-images", &body)?;
        Ok(!response.images.is_empty())
    }

    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<Node>> {
        let body = self.call("run-instances", run_instances_args(spec)).await?;
        let response: RunInstancesResponse = decode("run-instances", &body)?;
        response
            .instances
            .into_iter()
            .map(|instance| to_node(instance, &[]))
            .collect()
    }

    async fn request_spot_instances(&self, spec: &SpotSpec) -> Result<Vec<SpotRequest>> {
        let body = self.call("request-spot-instances", spot_request_args(spec)).await?;
        parse_spot_requests("request-spot-instances", &body)
    }

    async fn describe_spot_requests(&self, ids: &[String]) -> Result<Vec<SpotRequest>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = self
            .call_visible(
                "describe-spot-instance-requests",
                id_args("--spot-instance-request-ids", ids),
                SPOT_REQUEST_NOT_FOUND,
            )
            .await?;
        match body {
            Some(body) => parse_spot_requests("describe-spot-instance-requests", &body),
            None => Ok(Vec::new()),
        }
    }

    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.call(
            "cancel-spot-instance-requests",
            id_args("--spot-instance-request-ids", ids),
        )
        .await?;
        Ok(())
    }

    async fn describe_instances(&self, ids: Option<&[String]>) -> Result<Vec<Node>> {
        let body = match ids {
            Some([]) => return Ok(Vec::new()),
            Some(ids) => {
                self.call_visible("describe-instances", id_args("--instance-ids", ids), INSTANCE_NOT_FOUND)
                    .await?
            }
            None => Some(self.call("describe-instances", Vec::new()).await?),
        };
        match body {
            Some(body) => parse_instances(&body),
            None => Ok(Vec::new()),
        }
    }

    async fn stop_instances(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.call("stop-instances", id_args("--instance-ids", ids)).await?;
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.call("terminate-instances", id_args("--instance-ids", ids)).await?;
        Ok(())
    }
}
