pub mod error;
pub mod node;
pub mod retry;

#[cfg(feature = "testkit")]
pub mod testkit;

use async_trait::async_trait;

pub use error::{FlotillaError, Result};
pub use node::{ClusterNodes, InstanceState, Node, Role, SecurityGroup, SpotRequest, SpotRequestState};
pub use retry::RetryPolicy;

/// Cloud-side operations the cluster controller consumes.
///
/// Implementations must not cache: every call reflects the provider's
/// current view, since cluster identity is recovered by querying each time.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn find_security_group(&self, name: &str) -> Result<Option<SecurityGroup>>;
    async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup>;
    /// Allow all traffic from members of `source` into `group`.
    async fn authorize_group_ingress(&self, group: &SecurityGroup, source: &SecurityGroup) -> Result<()>;
    async fn authorize_cidr_ingress(&self, group: &SecurityGroup, rule: &IngressRule) -> Result<()>;

    async fn availability_zones(&self) -> Result<Vec<String>>;
    async fn image_exists(&self, image_id: &str) -> Result<bool>;

    /// Place one on-demand request for exactly `spec.count` instances.
    async fn run_instances(&self, spec: &LaunchSpec) -> Result<Vec<Node>>;
    async fn request_spot_instances(&self, spec: &SpotSpec) -> Result<Vec<SpotRequest>>;
    async fn describe_spot_requests(&self, ids: &[String]) -> Result<Vec<SpotRequest>>;
    async fn cancel_spot_requests(&self, ids: &[String]) -> Result<()>;

    /// All instances visible to the caller, or only `ids` when given.
    async fn describe_instances(&self, ids: Option<&[String]>) -> Result<Vec<Node>>;
    async fn stop_instances(&self, ids: &[String]) -> Result<()>;
    async fn terminate_instances(&self, ids: &[String]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    pub cidr: String,
}

impl IngressRule {
    pub fn open_tcp() -> Self {
        IngressRule {
            protocol: "tcp".to_string(),
            from_port: 0,
            to_port: 65535,
            cidr: "0.0.0.0/0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDevice {
    Ephemeral { device: String, virtual_name: String },
    Ebs { device: String, size_gb: u32, delete_on_termination: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub key_pair: Option<String>,
    pub security_group: String,
    pub zone: String,
    pub count: usize,
    pub block_devices: Vec<BlockDevice>,
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpotSpec {
    pub launch: LaunchSpec,
    pub max_price: f64,
    pub launch_group: String,
}

/// Share of `total` items assigned to partition `index` out of `partitions`.
///
/// The first `total % partitions` partitions get one extra item, so the
/// shares sum to `total` and differ by at most one.
pub fn partition(total: usize, partitions: usize, index: usize) -> usize {
    if partitions == 0 {
        return 0;
    }
    let base = total / partitions;
    if index < total % partitions {
        base + 1
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_spreads_remainder_over_first_zones() {
        let shares: Vec<_> = (0..2).map(|i| partition(3, 2, i)).collect();
        assert_eq!(shares, vec![2, 1]);
        let shares: Vec<_> = (0..4).map(|i| partition(2, 4, i)).collect();
        assert_eq!(shares, vec![1, 1, 0, 0]);
    }

    #[test]
    fn partition_sums_to_total_and_stays_balanced() {
        for total in 0..64 {
            for zones in 1..9 {
                let shares: Vec<_> = (0..zones).map(|i| partition(total, zones, i)).collect();
                assert_eq!(shares.iter().sum::<usize>(), total);
                let max = *shares.iter().max().unwrap();
                let min = *shares.iter().min().unwrap();
                assert!(max - min <= 1, "total={} zones={}", total, zones);
                assert!(max <= total.div_ceil(zones));
            }
        }
    }
}
