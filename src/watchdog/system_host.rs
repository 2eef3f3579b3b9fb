use async_trait::async_trait;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::{process::Command, sync::Mutex, task::JoinHandle};

use super::{Host, HostError, OsJobs, ProcessTarget, ScheduledJob};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

const REGISTRY_FILE: &str = "jobs.json";
const REPAIR_TIMEOUT: Duration = Duration::from_secs(10);

/// Desktop host adapter.
///
/// Processes are identified by pid files under `<data_dir>/pids`, checked
/// with sysinfo, and started as detached children of the current binary.
///
/// Scheduled jobs run as in-process timers and are also written to a JSON
/// registry that the companion process services. When `OsJobs` is present,
/// periodic and persisted jobs are additionally handed to the OS (a systemd
/// user timer and a crontab `@reboot` entry) and fire with no curfew process
/// alive. Wake alarms have no OS counterpart here; after the agent dies they
/// depend on the companion alone.
#[derive(Clone)]
pub struct SystemHost {
    inner: Arc<Inner>,
}

struct Inner {
    data_dir: PathBuf,
    exe: PathBuf,
    repair_command: Option<Vec<String>>,
    os_jobs: Option<OsJobs>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    registry: Mutex<()>,
    last_fired: Mutex<HashMap<String, Instant>>,
}

impl SystemHost {
    pub fn new(
        data_dir: PathBuf,
        exe: PathBuf,
        repair_command: Option<Vec<String>>,
    ) -> Self {
        Self::with_os_jobs(data_dir, exe, repair_command, None)
    }

    pub fn with_os_jobs(
        data_dir: PathBuf,
        exe: PathBuf,
        repair_command: Option<Vec<String>>,
        os_jobs: Option<OsJobs>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                data_dir,
                exe,
                repair_command,
                os_jobs,
                timers: Mutex::new(HashMap::new()),
                registry: Mutex::new(()),
                last_fired: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn for_current_exe(
        data_dir: PathBuf,
        repair_command: Option<Vec<String>>,
    ) -> Result<Self, HostError> {
        let exe = std::env::current_exe()?;
        let os_jobs = OsJobs::for_user();
        if os_jobs.is_none() {
            log_warn!("no OS job facility on this platform; jobs rely on the companion");
        }
        Ok(Self::with_os_jobs(data_dir, exe, repair_command, os_jobs))
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    pub fn pid_file(&self, target: &ProcessTarget) -> PathBuf {
        self.inner
            .data_dir
            .join("pids")
            .join(format!("{}.pid", target.name))
    }

    fn read_pid(&self, target: &ProcessTarget) -> Option<u32> {
        fs::read_to_string(self.pid_file(target))
            .ok()
            .and_then(|contents| contents.trim().parse().ok())
    }

    fn write_pid(&self, target: &ProcessTarget, pid: u32) -> Result<(), HostError> {
        let path = self.pid_file(target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, pid.to_string())?;
        Ok(())
    }

    /// Records the current process as `target`. Returns false if another live
    /// instance already holds it.
    pub fn claim(&self, target: &ProcessTarget) -> Result<bool, HostError> {
        let own = std::process::id();
        if let Some(pid) = self.read_pid(target) {
            if pid != own && self.is_pid_alive(pid) {
                return Ok(false);
            }
        }
        self.write_pid(target, own)?;
        Ok(true)
    }

    /// Drops the pid file if it still names the current process.
    pub fn release(&self, target: &ProcessTarget) {
        if self.read_pid(target) == Some(std::process::id()) {
            let _ = fs::remove_file(self.pid_file(target));
        }
    }

    /// Kills the recorded instance of `target`, if any is alive.
    pub fn terminate(&self, target: &ProcessTarget) -> Result<bool, HostError> {
        let Some(pid) = self.read_pid(target) else {
            return Ok(false);
        };
        let _ = fs::remove_file(self.pid_file(target));
        if pid == std::process::id() {
            return Ok(false);
        }

        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            ProcessRefreshKind::everything(),
        );
        match system.process(sys_pid) {
            Some(process) if self.is_own_binary(process) => Ok(process.kill()),
            _ => Ok(false),
        }
    }

    fn is_pid_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            ProcessRefreshKind::everything(),
        );
        system.process(sys_pid).map_or(false, |process| {
            process.status() != ProcessStatus::Zombie && self.is_own_binary(process)
        })
    }

    // Guards against pid reuse by an unrelated program.
    fn is_own_binary(&self, process: &sysinfo::Process) -> bool {
        if let Some(exe) = process.exe() {
            if exe == self.inner.exe {
                return true;
            }
        }
        let name = process.name().to_string_lossy();
        let own_name = self
            .inner
            .exe
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        !name.is_empty() && own_name.starts_with(name.as_ref())
    }

    async fn spawn_detached(&self, args: &[String]) -> Result<u32, HostError> {
        let mut command = Command::new(&self.inner.exe);
        command
            .arg("--data-dir")
            .arg(&self.inner.data_dir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                HostError::PermissionDenied(format!("spawn {}: {err}", self.inner.exe.display()))
            }
            _ => HostError::Io(err),
        })?;
        let pid = child
            .id()
            .ok_or_else(|| HostError::Io(std::io::Error::other("child exited before pid was read")))?;
        log_debug!("spawned {:?} as pid {pid}", args);
        Ok(pid)
    }

    fn registry_path(&self) -> PathBuf {
        self.inner.data_dir.join(REGISTRY_FILE)
    }

    fn read_registry(&self) -> Result<Vec<ScheduledJob>, HostError> {
        let path = self.registry_path();
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|err| HostError::Registry(format!("{}: {err}", path.display()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_registry(&self, jobs: &[ScheduledJob]) -> Result<(), HostError> {
        fs::create_dir_all(&self.inner.data_dir)?;
        let serialized = serde_json::to_string_pretty(jobs)
            .map_err(|err| HostError::Registry(err.to_string()))?;
        fs::write(self.registry_path(), serialized)?;
        Ok(())
    }

    pub async fn registered_jobs(&self) -> Result<Vec<ScheduledJob>, HostError> {
        let _guard = self.inner.registry.lock().await;
        self.read_registry()
    }

    async fn start_timer(&self, job: ScheduledJob) {
        let host = self.clone();
        let id = job.id.clone();
        let handle = tokio::spawn(async move {
            let interval = job.schedule.interval();
            loop {
                tokio::time::sleep(interval).await;
                match host.ensure_running(&job.target).await {
                    Ok(true) => log_info!("job {} restarted {}", job.id, job.target),
                    Ok(false) => {}
                    Err(err) => log_warn!("job {} could not ensure {}: {err}", job.id, job.target),
                }
            }
        });

        if let Some(previous) = self.inner.timers.lock().await.insert(id, handle) {
            previous.abort();
        }
    }

    /// Called once at agent startup. Jobs that do not survive process death
    /// are dropped from the registry; persisted ones get their timers back.
    pub async fn restore_persisted(&self) -> Result<usize, HostError> {
        let persisted: Vec<ScheduledJob> = {
            let _guard = self.inner.registry.lock().await;
            let jobs = self.read_registry()?;
            let persisted: Vec<_> = jobs.into_iter().filter(|job| job.persisted).collect();
            self.write_registry(&persisted)?;
            persisted
        };

        let restored = persisted.len();
        for job in persisted {
            self.start_timer(job).await;
        }
        Ok(restored)
    }

    /// Fires every registered job whose interval has elapsed. Used by the
    /// companion process so jobs outlive the agent.
    pub async fn run_due_jobs(&self, now: Instant) -> Result<usize, HostError> {
        let jobs = self.registered_jobs().await?;
        let mut fired = 0;

        for job in jobs {
            let due = {
                let mut last_fired = self.inner.last_fired.lock().await;
                let due = last_fired
                    .get(&job.id)
                    .map_or(true, |at| now.saturating_duration_since(*at) >= job.schedule.interval());
                if due {
                    last_fired.insert(job.id.clone(), now);
                }
                due
            };
            if !due {
                continue;
            }

            fired += 1;
            if let Err(err) = self.ensure_running(&job.target).await {
                log_warn!("job {} could not ensure {}: {err}", job.id, job.target);
            }
        }
        Ok(fired)
    }

    pub async fn shutdown_timers(&self) {
        for (_, handle) in self.inner.timers.lock().await.drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Host for SystemHost {
    async fn ensure_running(&self, target: &ProcessTarget) -> Result<bool, HostError> {
        if self.is_running(target).await? {
            return Ok(false);
        }

        let args = match target.name.as_str() {
            ProcessTarget::AGENT => vec!["run".to_string()],
            ProcessTarget::COMPANION => vec!["companion".to_string()],
            other => return Err(HostError::Unsupported(format!("unknown target {other}"))),
        };
        let pid = self.spawn_detached(&args).await?;
        self.write_pid(target, pid)?;
        log_info!("started {target} (pid {pid})");
        Ok(true)
    }

    async fn is_running(&self, target: &ProcessTarget) -> Result<bool, HostError> {
        Ok(self
            .read_pid(target)
            .map_or(false, |pid| self.is_pid_alive(pid)))
    }

    async fn schedule(&self, job: ScheduledJob) -> Result<(), HostError> {
        if let Some(os_jobs) = &self.inner.os_jobs {
            os_jobs
                .install(&job, &self.inner.exe, &self.inner.data_dir)
                .await?;
        }
        {
            let _guard = self.inner.registry.lock().await;
            let mut jobs = self.read_registry()?;
            jobs.retain(|existing| existing.id != job.id);
            jobs.push(job.clone());
            self.write_registry(&jobs)?;
        }
        self.start_timer(job).await;
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> Result<(), HostError> {
        if let Some(handle) = self.inner.timers.lock().await.remove(job_id) {
            handle.abort();
        }
        if let Some(os_jobs) = &self.inner.os_jobs {
            os_jobs.remove(job_id).await?;
        }
        let _guard = self.inner.registry.lock().await;
        let mut jobs = self.read_registry()?;
        let before = jobs.len();
        jobs.retain(|existing| existing.id != job_id);
        if jobs.len() != before {
            self.write_registry(&jobs)?;
        }
        Ok(())
    }

    async fn spawn_companion(
        &self,
        _target: &ProcessTarget,
        interval: Duration,
    ) -> Result<(), HostError> {
        let companion = ProcessTarget::companion();
        if self.is_running(&companion).await? {
            return Ok(());
        }
        let args = vec![
            "companion".to_string(),
            "--interval".to_string(),
            interval.as_secs().max(1).to_string(),
        ];
        let pid = self.spawn_detached(&args).await?;
        self.write_pid(&companion, pid)?;
        log_info!("companion started (pid {pid})");
        Ok(())
    }

    async fn stop_companion(&self) -> Result<(), HostError> {
        if self.terminate(&ProcessTarget::companion())? {
            log_info!("companion stopped");
        }
        Ok(())
    }

    async fn schedule_restart(
        &self,
        target: &ProcessTarget,
        delay: Duration,
    ) -> Result<(), HostError> {
        if target.name != ProcessTarget::AGENT {
            return Err(HostError::Unsupported(format!("restart of {target}")));
        }
        let args = vec![
            "relaunch".to_string(),
            "--delay-ms".to_string(),
            delay.as_millis().to_string(),
        ];
        self.spawn_detached(&args).await?;
        Ok(())
    }

    async fn bump_foreground_priority(&self) -> Result<(), HostError> {
        let Some((program, args)) = self
            .inner
            .repair_command
            .as_ref()
            .and_then(|command| command.split_first())
        else {
            return Err(HostError::Unsupported(
                "no repair command configured".to_string(),
            ));
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true);

        let status = tokio::time::timeout(REPAIR_TIMEOUT, command.status())
            .await
            .map_err(|_| {
                HostError::Io(std::io::Error::other(format!(
                    "{program} did not finish within {REPAIR_TIMEOUT:?}"
                )))
            })??;

        if status.success() {
            Ok(())
        } else {
            Err(HostError::Io(std::io::Error::other(format!(
                "{program} exited with {status}"
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::JobSchedule;

    fn host_in(dir: &Path) -> SystemHost {
        SystemHost::new(dir.to_path_buf(), PathBuf::from("/nonexistent/curfew"), None)
    }

    fn job(id: &str, persisted: bool) -> ScheduledJob {
        ScheduledJob {
            id: id.to_string(),
            schedule: JobSchedule::Periodic { interval_secs: 900 },
            persisted,
            target: ProcessTarget::agent(),
        }
    }

    #[tokio::test]
    async fn schedule_and_cancel_maintain_registry() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path());

        host.schedule(job("a", false)).await.unwrap();
        host.schedule(job("b", true)).await.unwrap();
        host.schedule(job("a", false)).await.unwrap();
        assert_eq!(host.registered_jobs().await.unwrap().len(), 2);

        host.cancel("a").await.unwrap();
        host.cancel("missing").await.unwrap();
        let ids: Vec<_> = host
            .registered_jobs()
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(ids, vec!["b".to_string()]);
        host.shutdown_timers().await;
    }

    #[tokio::test]
    async fn restore_keeps_only_persisted_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path());
        host.schedule(job("volatile", false)).await.unwrap();
        host.schedule(job("durable", true)).await.unwrap();
        host.shutdown_timers().await;

        let restarted = host_in(dir.path());
        assert_eq!(restarted.restore_persisted().await.unwrap(), 1);
        let jobs = restarted.registered_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "durable");
        restarted.shutdown_timers().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn persisted_job_is_registered_with_the_os() {
        use crate::watchdog::os_jobs::testing::scripted_os_jobs;

        let dir = tempfile::tempdir().unwrap();
        let os_jobs = scripted_os_jobs(dir.path());
        let host = SystemHost::with_os_jobs(
            dir.path().join("data"),
            PathBuf::from("/nonexistent/curfew"),
            None,
            Some(os_jobs.clone()),
        );

        host.schedule(job("curfew.persisted", true)).await.unwrap();
        host.schedule(job("curfew.periodic", false)).await.unwrap();
        host.shutdown_timers().await;

        // Nothing of curfew runs at boot; only these entries remain.
        let table = fs::read_to_string(dir.path().join("crontab.txt")).unwrap();
        assert!(table.starts_with("@reboot '/nonexistent/curfew' --data-dir"));
        assert!(table.contains("ensure"));
        assert!(os_jobs.timer_path("curfew.periodic").exists());
        assert_eq!(host.registered_jobs().await.unwrap().len(), 2);

        host.cancel("curfew.persisted").await.unwrap();
        host.cancel("curfew.periodic").await.unwrap();
        let table = fs::read_to_string(dir.path().join("crontab.txt")).unwrap();
        assert!(!table.contains("curfew.persisted"));
        assert!(!os_jobs.timer_path("curfew.periodic").exists());
        assert!(host.registered_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_os_registration_leaves_no_registry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let os_jobs = OsJobs::new(
            dir.path().join("units"),
            vec!["/nonexistent/systemctl".into()],
            vec!["/nonexistent/crontab".into()],
        );
        let host = SystemHost::with_os_jobs(
            dir.path().to_path_buf(),
            PathBuf::from("/nonexistent/curfew"),
            None,
            Some(os_jobs),
        );

        let result = host.schedule(job("curfew.persisted", true)).await;
        assert!(matches!(result, Err(HostError::Unsupported(_))));
        assert!(host.registered_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_and_release_own_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path());
        let target = ProcessTarget::agent();

        assert!(host.claim(&target).unwrap());
        assert_eq!(host.read_pid(&target), Some(std::process::id()));
        // Re-claiming from the same process is fine.
        assert!(host.claim(&target).unwrap());

        host.release(&target);
        assert!(!host.pid_file(&target).exists());
    }

    #[tokio::test]
    async fn stale_pid_file_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path());
        let target = ProcessTarget::companion();
        host.write_pid(&target, u32::MAX - 1).unwrap();

        assert!(!host.is_running(&target).await.unwrap());
    }

    #[tokio::test]
    async fn bump_without_repair_command_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path());
        assert!(matches!(
            host.bump_foreground_priority().await,
            Err(HostError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn unknown_restart_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let host = host_in(dir.path());
        let result = host
            .schedule_restart(&ProcessTarget::new("other"), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(HostError::Unsupported(_))));
    }
}
