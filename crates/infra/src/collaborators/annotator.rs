//! The annotation tool, run as one supervised child process per job.
//!
//! Launching never waits for the tool. Finished children are collected by
//! [`AnnotationRunner::reap`], which the completion sweep calls before it
//! looks for output files.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use annoflow_core::JobId;

use super::ProviderError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Launched,
    /// A child for this job is still running.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Succeeded,
    Failed(String),
}

pub trait AnnotationRunner: Send + Sync {
    /// Start the tool on a local input file. Must not block on the tool.
    fn launch(&self, job_id: &JobId, input: &Path) -> Result<LaunchOutcome, ProviderError>;

    /// Collect children that have exited since the last call.
    fn reap(&self) -> Vec<(JobId, ExitOutcome)>;

    fn is_running(&self, job_id: &JobId) -> bool;
}

impl<R> AnnotationRunner for Arc<R>
where
    R: AnnotationRunner + ?Sized,
{
    fn launch(&self, job_id: &JobId, input: &Path) -> Result<LaunchOutcome, ProviderError> {
        (**self).launch(job_id, input)
    }

    fn reap(&self) -> Vec<(JobId, ExitOutcome)> {
        (**self).reap()
    }

    fn is_running(&self, job_id: &JobId) -> bool {
        (**self).is_running(job_id)
    }
}

/// Spawns the configured command, replacing `{input}` with the input path.
/// The child runs in the input file's directory so outputs land next to it.
#[derive(Debug)]
pub struct ProcessRunner {
    command: Vec<String>,
    children: Mutex<HashMap<JobId, Child>>,
}

impl ProcessRunner {
    pub fn new(command: Vec<String>) -> Result<Self, ProviderError> {
        if command.is_empty() {
            return Err(ProviderError::MissingResource("annotator command is empty".into()));
        }
        Ok(Self {
            command,
            children: Mutex::new(HashMap::new()),
        })
    }

    fn build(&self, input: &Path) -> Command {
        let input = input.to_string_lossy();
        let mut args = self.command.iter().map(|a| a.replace("{input}", &input));
        // `new` guarantees at least one element.
        let program = args.next().unwrap_or_default();
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        cmd
    }
}

impl AnnotationRunner for ProcessRunner {
    fn launch(&self, job_id: &JobId, input: &Path) -> Result<LaunchOutcome, ProviderError> {
        let mut children = self
            .children
            .lock()
            .map_err(|_| ProviderError::Transient("runner lock poisoned".into()))?;
        if children.contains_key(job_id) {
            return Ok(LaunchOutcome::AlreadyRunning);
        }

        let mut cmd = self.build(input);
        if let Some(dir) = input.parent() {
            cmd.current_dir(dir);
        }
        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ProviderError::MissingResource(format!("annotator not found: {e}"))
            }
            _ => ProviderError::Transient(format!("failed to start annotator: {e}")),
        })?;

        info!(job_id = %job_id, pid = child.id(), "annotator launched");
        children.insert(job_id.clone(), child);
        Ok(LaunchOutcome::Launched)
    }

    fn reap(&self) -> Vec<(JobId, ExitOutcome)> {
        let Ok(mut children) = self.children.lock() else {
            return Vec::new();
        };

        let mut finished = Vec::new();
        children.retain(|job_id, child| match child.try_wait() {
            Ok(Some(status)) if status.success() => {
                finished.push((job_id.clone(), ExitOutcome::Succeeded));
                false
            }
            Ok(Some(status)) => {
                finished.push((job_id.clone(), ExitOutcome::Failed(status.to_string())));
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to poll annotator");
                true
            }
        });
        finished
    }

    fn is_running(&self, job_id: &JobId) -> bool {
        self.children
            .lock()
            .map(|c| c.contains_key(job_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A runner that "annotates" synchronously by writing the output files
    //! the real tool would produce.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    pub struct InstantRunner {
        result_suffix: String,
        log_suffix: String,
        launched: Mutex<Vec<JobId>>,
        exits: Mutex<Vec<(JobId, ExitOutcome)>>,
    }

    impl InstantRunner {
        pub fn new(result_suffix: &str, log_suffix: &str) -> Self {
            Self {
                result_suffix: result_suffix.to_string(),
                log_suffix: log_suffix.to_string(),
                launched: Mutex::new(Vec::new()),
                exits: Mutex::new(Vec::new()),
            }
        }

        pub fn launched(&self) -> Vec<JobId> {
            self.launched.lock().unwrap().clone()
        }

        /// Report `outcome` for `job_id` on the next reap.
        pub fn exit(&self, job_id: &JobId, outcome: ExitOutcome) {
            self.exits.lock().unwrap().push((job_id.clone(), outcome));
        }
    }

    impl AnnotationRunner for InstantRunner {
        fn launch(&self, job_id: &JobId, input: &Path) -> Result<LaunchOutcome, ProviderError> {
            let name = input.file_name().unwrap().to_string_lossy().to_string();
            let stem = input.file_stem().unwrap().to_string_lossy().to_string();
            let dir = input.parent().unwrap();
            std::fs::write(dir.join(format!("{stem}{}", self.result_suffix)), b"annotated").unwrap();
            std::fs::write(dir.join(format!("{name}{}", self.log_suffix)), b"42 lines").unwrap();
            self.launched.lock().unwrap().push(job_id.clone());
            Ok(LaunchOutcome::Launched)
        }

        fn reap(&self) -> Vec<(JobId, ExitOutcome)> {
            std::mem::take(&mut *self.exits.lock().unwrap())
        }

        fn is_running(&self, _job_id: &JobId) -> bool {
            false
        }
    }
}
