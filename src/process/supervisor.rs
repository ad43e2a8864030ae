//! Supervision backends: who actually starts and stops an instance.

use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::command::{failure_detail, run_tool, stdout_text};
use super::control::{graceful_shutdown, is_process_alive};
use crate::blueprint::{BlueprintKind, BlueprintStore};
use crate::error::{AppError, Result};
use crate::instance::{Instance, LifecycleManager};

/// Timeout for graceful shutdown before force killing.
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a freshly spawned process must survive to count as started.
const STARTUP_GRACE: Duration = Duration::from_millis(300);

/// File name the container downloader deploys into the install directory.
pub const COMPOSE_FILE: &str = "docker-compose.yml";

#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn start(&self, instance: &Instance) -> Result<()>;
    async fn stop(&self, instance: &Instance) -> Result<()>;
    async fn is_active(&self, instance: &Instance) -> Result<bool>;
}

/// Units managed through `systemctl`; the unit is `<instance>.service`.
pub struct SystemdBackend;

impl SystemdBackend {
    pub fn unit_name(instance: &Instance) -> String {
        format!("{}.service", instance.name)
    }

    async fn systemctl(&self, action: &str, instance: &Instance) -> Result<()> {
        let unit = Self::unit_name(instance);
        let mut cmd = Command::new("systemctl");
        cmd.arg(action).arg(&unit);
        let output = run_tool(&mut cmd, "systemctl").await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AppError::supervision(format!(
                "systemctl {} {} failed: {}",
                action,
                unit,
                failure_detail(&output)
            )))
        }
    }
}

#[async_trait]
impl Supervisor for SystemdBackend {
    async fn start(&self, instance: &Instance) -> Result<()> {
        self.systemctl("start", instance).await
    }

    async fn stop(&self, instance: &Instance) -> Result<()> {
        self.systemctl("stop", instance).await
    }

    async fn is_active(&self, instance: &Instance) -> Result<bool> {
        let mut cmd = Command::new("systemctl");
        cmd.args(["is-active", "--quiet"]).arg(Self::unit_name(instance));
        Ok(run_tool(&mut cmd, "systemctl").await?.status.success())
    }
}

/// Processes spawned directly and tracked through a PID file.
pub struct StandaloneBackend {
    blueprints: Arc<BlueprintStore>,
    stop_timeout: Duration,
}

impl StandaloneBackend {
    pub fn new(blueprints: Arc<BlueprintStore>, stop_timeout: Duration) -> Self {
        Self {
            blueprints,
            stop_timeout,
        }
    }

    fn read_pid(instance: &Instance) -> Option<u32> {
        fs::read_to_string(instance.pid_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// PID of the live process, clearing a stale PID file on the way.
    pub fn running_pid(instance: &Instance) -> Option<u32> {
        let pid = Self::read_pid(instance)?;
        if is_process_alive(pid) {
            return Some(pid);
        }
        log::debug!("Removing stale PID file for {}", instance.name);
        Self::remove_pid_file(instance);
        None
    }

    fn remove_pid_file(instance: &Instance) {
        let path = instance.pid_file();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove PID file {:?}: {}", path, e),
        }
    }

    fn launch_command(&self, instance: &Instance) -> Result<Command> {
        let blueprint = self.blueprints.load(&instance.blueprint)?;
        let BlueprintKind::Native(spec) = &blueprint.kind else {
            return Err(AppError::invalid_argument(format!(
                "Blueprint {} is container based",
                blueprint.name
            )));
        };
        let executable = spec.executable_file.as_deref().ok_or_else(|| {
            AppError::invalid_config(format!(
                "Blueprint {} has no executable_file",
                blueprint.name
            ))
        })?;

        let exe_dir = match spec.executable_subdirectory.as_deref() {
            Some(sub) => instance.install_dir().join(sub),
            None => instance.install_dir(),
        };
        let exe_path = exe_dir.join(executable);
        if !exe_path.is_file() {
            return Err(AppError::supervision(format!(
                "Executable {} not found, is the instance installed?",
                exe_path.display()
            )));
        }

        let mut cmd = Command::new(&exe_path);
        if let Some(args) = spec.executable_arguments.as_deref() {
            cmd.args(args.split_whitespace());
        }
        cmd.current_dir(&exe_dir)
            .env("GSM_INSTANCE", &instance.name)
            .stdin(Stdio::null());
        Ok(cmd)
    }

    fn log_file(instance: &Instance) -> Result<(fs::File, PathBuf)> {
        let logs_dir = instance.logs_dir();
        fs::create_dir_all(&logs_dir)
            .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", logs_dir, e)))?;
        let path = logs_dir.join(format!("{}.log", instance.name));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::io(format!("Failed to open {:?}: {}", path, e)))?;
        Ok((file, path))
    }
}

#[async_trait]
impl Supervisor for StandaloneBackend {
    async fn start(&self, instance: &Instance) -> Result<()> {
        let mut cmd = self.launch_command(instance)?;
        let (log, log_path) = Self::log_file(instance)?;
        let log_err = log.try_clone()?;
        cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::supervision(format!("Failed to start {}: {}", instance.name, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::supervision("Failed to get process ID"))?;

        tokio::time::sleep(STARTUP_GRACE).await;
        if let Some(status) = child.try_wait()? {
            return Err(AppError::supervision(format!(
                "{} exited immediately ({}), see {}",
                instance.name,
                status,
                log_path.display()
            )));
        }

        fs::write(instance.pid_file(), format!("{}\n", pid))
            .map_err(|e| AppError::io(format!("Failed to write PID file: {}", e)))?;
        log::info!("Instance {} started (pid: {})", instance.name, pid);
        Ok(())
    }

    async fn stop(&self, instance: &Instance) -> Result<()> {
        let Some(pid) = Self::running_pid(instance) else {
            return Ok(());
        };
        let graceful = graceful_shutdown(pid, self.stop_timeout).await?;
        if !graceful {
            log::warn!("Instance {} was force killed", instance.name);
        }
        Self::remove_pid_file(instance);
        Ok(())
    }

    async fn is_active(&self, instance: &Instance) -> Result<bool> {
        Ok(Self::running_pid(instance).is_some())
    }
}

/// `docker compose` projects named after the instance.
pub struct ContainerBackend;

impl ContainerBackend {
    fn compose(instance: &Instance) -> Option<Command> {
        let file = instance.install_dir().join(COMPOSE_FILE);
        if !file.is_file() {
            return None;
        }
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-p")
            .arg(&instance.name)
            .arg("-f")
            .arg(file)
            .current_dir(instance.install_dir());
        Some(cmd)
    }

    fn require_compose(instance: &Instance) -> Result<Command> {
        Self::compose(instance).ok_or_else(|| {
            AppError::supervision(format!(
                "No {} in {}, is the instance installed?",
                COMPOSE_FILE,
                instance.install_dir().display()
            ))
        })
    }

    async fn run(mut cmd: Command, what: &str, instance: &Instance) -> Result<String> {
        let output = run_tool(&mut cmd, "docker").await?;
        if output.status.success() {
            Ok(stdout_text(&output))
        } else {
            Err(AppError::supervision(format!(
                "docker compose {} for {} failed: {}",
                what,
                instance.name,
                failure_detail(&output)
            )))
        }
    }
}

#[async_trait]
impl Supervisor for ContainerBackend {
    async fn start(&self, instance: &Instance) -> Result<()> {
        let mut cmd = Self::require_compose(instance)?;
        cmd.args(["up", "-d"]);
        Self::run(cmd, "up", instance).await.map(|_| ())
    }

    async fn stop(&self, instance: &Instance) -> Result<()> {
        let mut cmd = Self::require_compose(instance)?;
        cmd.arg("down");
        Self::run(cmd, "down", instance).await.map(|_| ())
    }

    async fn is_active(&self, instance: &Instance) -> Result<bool> {
        let Some(mut cmd) = Self::compose(instance) else {
            return Ok(false);
        };
        cmd.args(["ps", "-q"]);
        Ok(!Self::run(cmd, "ps", instance).await?.is_empty())
    }
}

/// Routes each call to the backend recorded on the instance.
pub struct Supervision {
    systemd: SystemdBackend,
    standalone: StandaloneBackend,
    container: ContainerBackend,
}

impl Supervision {
    pub fn new(blueprints: Arc<BlueprintStore>) -> Self {
        Self {
            systemd: SystemdBackend,
            standalone: StandaloneBackend::new(blueprints, GRACEFUL_SHUTDOWN_TIMEOUT),
            container: ContainerBackend,
        }
    }

    fn backend(&self, manager: LifecycleManager) -> &dyn Supervisor {
        match manager {
            LifecycleManager::Systemd => &self.systemd,
            LifecycleManager::Standalone => &self.standalone,
            LifecycleManager::Container => &self.container,
        }
    }
}

#[async_trait]
impl Supervisor for Supervision {
    async fn start(&self, instance: &Instance) -> Result<()> {
        self.backend(instance.lifecycle_manager).start(instance).await
    }

    async fn stop(&self, instance: &Instance) -> Result<()> {
        self.backend(instance.lifecycle_manager).stop(instance).await
    }

    async fn is_active(&self, instance: &Instance) -> Result<bool> {
        self.backend(instance.lifecycle_manager)
            .is_active(instance)
            .await
    }
}
