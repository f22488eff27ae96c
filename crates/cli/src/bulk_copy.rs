use async_trait::async_trait;
use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::RetryPolicy;
use tracing::{debug, info};

use crate::remote::{RemoteExecutor, Target, Transport};

/// Scratch space for job bookkeeping on the node.
const SCRATCH_DIR: &str = "/tmp/flotilla";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySpec {
    /// Object-store or HDFS URI to read from.
    pub source: String,
    /// Destination path on the cluster filesystem.
    pub dest: String,
    /// Upper bound on simultaneous copy tasks; the tool's default when unset.
    pub max_maps: Option<u32>,
}

/// A submitted copy, identified well enough to poll it from a later call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub host: String,
    pub work_dir: String,
}

impl JobHandle {
    pub fn exit_file(&self) -> String {
        format!("{}/exit", self.work_dir)
    }

    pub fn log_file(&self) -> String {
        format!("{}/log", self.work_dir)
    }
}

/// A bulk data copy run by the cluster itself.
#[async_trait]
pub trait BulkCopy: Send + Sync {
    async fn submit(&self, spec: &CopySpec) -> Result<JobHandle>;
    async fn await_completion(&self, handle: &JobHandle) -> Result<()>;
}

/// `hadoop distcp` started detached on the control-plane node.
///
/// The job writes its exit status to a file in its work directory; completion
/// is detected by polling for that file.
pub struct DistCpJob<'a, T> {
    executor: &'a RemoteExecutor<T>,
    master: Target,
    poll: RetryPolicy,
}

impl<'a, T: Transport> DistCpJob<'a, T> {
    pub fn new(executor: &'a RemoteExecutor<T>, master: Target, poll: RetryPolicy) -> Self {
        DistCpJob { executor, master, poll }
    }

    pub fn command(spec: &CopySpec, handle: &JobHandle) -> Result<String> {
        for value in [&spec.source, &spec.dest] {
            if value.is_empty() || value.contains(['\'', '"', '\\', '$', '`']) {
                return Err(FlotillaError::InvalidArguments(format!("unsupported copy location '{}'", value)));
            }
        }
        let maps = spec.max_maps.map(|m| format!("-m {} ", m)).unwrap_or_default();
        Ok(format!(
            "mkdir -p {dir} && nohup sh -c \"hadoop distcp {maps}'{src}' '{dst}' > {log} 2>&1; echo \\$? > {exit}\" >/dev/null 2>&1 &",
            dir = handle.work_dir,
            maps = maps,
            src = spec.source,
            dst = spec.dest,
            log = handle.log_file(),
            exit = handle.exit_file(),
        ))
    }
}

#[async_trait]
impl<'a, T: Transport> BulkCopy for DistCpJob<'a, T> {
    async fn submit(&self, spec: &CopySpec) -> Result<JobHandle> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let handle = JobHandle {
            work_dir: format!("{}/copy-{}", SCRATCH_DIR, id),
            host: self.master.host.clone(),
            id,
        };
        let command = Self::command(spec, &handle)?;
        info!(job = %handle.id, source = %spec.source, dest = %spec.dest, "submitting bulk copy");
        self.executor.run(&self.master, &command).await?;
        Ok(handle)
    }

    async fn await_completion(&self, handle: &JobHandle) -> Result<()> {
        let finished = format!("test -f {}", handle.exit_file());
        let done = self
            .poll
            .poll_until(|attempt| {
                let finished = &finished;
                async move {
                    debug!(job = %handle.id, attempt, "polling bulk copy");
                    Ok::<_, FlotillaError>(self.executor.check(&self.master, finished).await?.then_some(()))
                }
            })
            .await?;
        if done.is_none() {
            return Err(FlotillaError::CopyFailed {
                host: handle.host.clone(),
                reason: format!("job {} did not finish in time", handle.id),
            });
        }

        let succeeded = format!("test \"$(cat {})\" = 0", handle.exit_file());
        if !self.executor.check(&self.master, &succeeded).await? {
            return Err(FlotillaError::CopyFailed {
                host: handle.host.clone(),
                reason: format!("distcp failed; see {} on the master", handle.log_file()),
            });
        }

        self.executor
            .run(&self.master, &format!("rm -rf {}", handle.work_dir))
            .await?;
        info!(job = %handle.id, "bulk copy finished");
        Ok(())
    }
}
