use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};
use tokio::{io::AsyncWriteExt, process::Command};

use super::{HostError, JobSchedule, ScheduledJob};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

const CRON_MARKER: &str = "# curfew:";

/// Registers recovery jobs with facilities the OS runs on its own, so they
/// keep firing when no curfew process is alive.
///
/// Periodic jobs become systemd user timers. Persisted jobs become crontab
/// `@reboot` entries. The two never share a code path, so losing one leaves
/// the other in place. Both run `curfew ensure`, which starts the agent only
/// if it is down.
#[derive(Debug, Clone)]
pub struct OsJobs {
    unit_dir: PathBuf,
    systemctl: Vec<String>,
    crontab: Vec<String>,
}

impl OsJobs {
    pub fn new(unit_dir: PathBuf, systemctl: Vec<String>, crontab: Vec<String>) -> Self {
        Self {
            unit_dir,
            systemctl,
            crontab,
        }
    }

    /// The current user's systemd and cron setup. Only available on Linux.
    pub fn for_user() -> Option<Self> {
        if !cfg!(target_os = "linux") {
            return None;
        }
        let unit_dir = dirs::config_dir()?.join("systemd").join("user");
        Some(Self::new(
            unit_dir,
            vec!["systemctl".to_string(), "--user".to_string()],
            vec!["crontab".to_string()],
        ))
    }

    /// Returns false when the job has no OS counterpart (wake alarms).
    pub async fn install(
        &self,
        job: &ScheduledJob,
        exe: &Path,
        data_dir: &Path,
    ) -> Result<bool, HostError> {
        match (&job.schedule, job.persisted) {
            (_, true) => {
                self.install_cron(&job.id, exe, data_dir).await?;
                log_info!("job {} registered as @reboot crontab entry", job.id);
                Ok(true)
            }
            (JobSchedule::Periodic { .. }, false) => {
                self.install_timer(&job.id, job.schedule.interval(), exe, data_dir)
                    .await?;
                log_info!("job {} registered as systemd user timer", job.id);
                Ok(true)
            }
            (JobSchedule::Alarm { .. }, false) => Ok(false),
        }
    }

    /// Removes whatever OS entries exist for `job_id`. Missing entries are fine.
    pub async fn remove(&self, job_id: &str) -> Result<(), HostError> {
        self.remove_timer(job_id).await?;
        self.remove_cron(job_id).await
    }

    pub fn timer_path(&self, job_id: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.timer", unit_name(job_id)))
    }

    pub fn service_path(&self, job_id: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service", unit_name(job_id)))
    }

    async fn install_timer(
        &self,
        job_id: &str,
        interval: Duration,
        exe: &Path,
        data_dir: &Path,
    ) -> Result<(), HostError> {
        std::fs::create_dir_all(&self.unit_dir)?;
        std::fs::write(self.service_path(job_id), render_service(job_id, exe, data_dir))?;
        std::fs::write(self.timer_path(job_id), render_timer(job_id, interval))?;

        let timer = format!("{}.timer", unit_name(job_id));
        run(&self.systemctl, &["daemon-reload"], None).await?;
        run(&self.systemctl, &["enable", "--now", &timer], None).await?;
        Ok(())
    }

    async fn remove_timer(&self, job_id: &str) -> Result<(), HostError> {
        let timer_path = self.timer_path(job_id);
        if !timer_path.exists() {
            return Ok(());
        }

        let timer = format!("{}.timer", unit_name(job_id));
        if let Err(err) = run(&self.systemctl, &["disable", "--now", &timer], None).await {
            log_debug!("disabling {timer} failed, removing unit files anyway: {err}");
        }
        std::fs::remove_file(&timer_path)?;
        let service_path = self.service_path(job_id);
        if service_path.exists() {
            std::fs::remove_file(service_path)?;
        }
        if let Err(err) = run(&self.systemctl, &["daemon-reload"], None).await {
            log_debug!("daemon-reload after removing {timer} failed: {err}");
        }
        Ok(())
    }

    async fn install_cron(&self, job_id: &str, exe: &Path, data_dir: &Path) -> Result<(), HostError> {
        let table = self.read_crontab().await?;
        let updated = upsert_cron_line(&table, job_id, &render_cron_line(job_id, exe, data_dir));
        if updated != table {
            run(&self.crontab, &["-"], Some(&updated)).await?;
        }
        Ok(())
    }

    async fn remove_cron(&self, job_id: &str) -> Result<(), HostError> {
        let table = match self.read_crontab().await {
            Ok(table) => table,
            // No crontab binary means nothing was ever installed there.
            Err(HostError::Unsupported(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        let updated = remove_cron_line(&table, job_id);
        if updated != table {
            run(&self.crontab, &["-"], Some(&updated)).await?;
        }
        Ok(())
    }

    async fn read_crontab(&self) -> Result<String, HostError> {
        match run(&self.crontab, &["-l"], None).await {
            Ok(table) => Ok(table),
            // `crontab -l` exits non-zero when the user has no table yet.
            Err(HostError::Io(err)) if err.kind() == ErrorKind::Other => Ok(String::new()),
            Err(err) => Err(err),
        }
    }
}

fn unit_name(job_id: &str) -> String {
    job_id.replace('.', "-")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn launch_words(exe: &Path, data_dir: &Path) -> [String; 4] {
    [
        exe.display().to_string(),
        "--data-dir".to_string(),
        data_dir.display().to_string(),
        "ensure".to_string(),
    ]
}

pub fn render_service(job_id: &str, exe: &Path, data_dir: &Path) -> String {
    let exec = launch_words(exe, data_dir)
        .iter()
        .map(|word| format!("\"{}\"", word.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "[Unit]\nDescription=curfew recovery job {job_id}\n\n[Service]\nType=oneshot\nExecStart={exec}\n"
    )
}

pub fn render_timer(job_id: &str, interval: Duration) -> String {
    let secs = interval.as_secs().max(60);
    format!(
        "[Unit]\nDescription=curfew recovery job {job_id}\n\n[Timer]\nOnBootSec={secs}s\nOnUnitActiveSec={secs}s\n\n[Install]\nWantedBy=timers.target\n"
    )
}

pub fn render_cron_line(job_id: &str, exe: &Path, data_dir: &Path) -> String {
    let command = launch_words(exe, data_dir)
        .iter()
        .map(|word| shell_quote(word))
        .collect::<Vec<_>>()
        .join(" ");
    format!("@reboot {command} >/dev/null 2>&1 {CRON_MARKER}{job_id}")
}

fn is_job_line(line: &str, job_id: &str) -> bool {
    line.trim_end().ends_with(&format!("{CRON_MARKER}{job_id}"))
}

pub fn upsert_cron_line(table: &str, job_id: &str, line: &str) -> String {
    let mut lines: Vec<&str> = table
        .lines()
        .filter(|existing| !is_job_line(existing, job_id))
        .collect();
    lines.push(line);
    let mut updated = lines.join("\n");
    updated.push('\n');
    updated
}

pub fn remove_cron_line(table: &str, job_id: &str) -> String {
    if !table.lines().any(|line| is_job_line(line, job_id)) {
        return table.to_string();
    }
    let lines: Vec<&str> = table
        .lines()
        .filter(|existing| !is_job_line(existing, job_id))
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    let mut updated = lines.join("\n");
    updated.push('\n');
    updated
}

/// Runs `program args..`, feeding `stdin` if given, and returns stdout.
/// A non-zero exit maps to `ErrorKind::Other`.
async fn run(program: &[String], args: &[&str], stdin: Option<&str>) -> Result<String, HostError> {
    let Some((binary, prefix)) = program.split_first() else {
        return Err(HostError::Unsupported("empty command".to_string()));
    };

    let mut command = Command::new(binary);
    command
        .args(prefix)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| match err.kind() {
        ErrorKind::NotFound => HostError::Unsupported(format!("{binary} not available")),
        ErrorKind::PermissionDenied => HostError::PermissionDenied(format!("{binary}: {err}")),
        _ => HostError::Io(err),
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(HostError::Io(std::io::Error::other(format!(
            "{binary} {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(all(test, unix))]
pub(crate) mod testing {
    use super::OsJobs;
    use std::path::Path;

    const FAKE_SYSTEMCTL: &str = r#"echo "$@" >> "$(dirname "$0")/systemctl.log""#;
    const FAKE_CRONTAB: &str = r#"table="$(dirname "$0")/crontab.txt"
if [ "$1" = "-l" ]; then
  [ -f "$table" ] || { echo "no crontab for tester" >&2; exit 1; }
  cat "$table"
else
  cat > "$table"
fi"#;

    /// Shell-script stand-ins for systemctl and crontab. The crontab lives
    /// at `<dir>/crontab.txt`, systemctl calls are appended to
    /// `<dir>/systemctl.log`.
    pub fn scripted_os_jobs(dir: &Path) -> OsJobs {
        let systemctl = dir.join("systemctl.sh");
        let crontab = dir.join("crontab.sh");
        std::fs::write(&systemctl, FAKE_SYSTEMCTL).unwrap();
        std::fs::write(&crontab, FAKE_CRONTAB).unwrap();
        OsJobs::new(
            dir.join("units"),
            vec!["sh".into(), systemctl.display().to_string()],
            vec!["sh".into(), crontab.display().to_string()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::ProcessTarget;

    fn job(id: &str, schedule: JobSchedule, persisted: bool) -> ScheduledJob {
        ScheduledJob {
            id: id.to_string(),
            schedule,
            persisted,
            target: ProcessTarget::agent(),
        }
    }

    #[test]
    fn cron_upsert_replaces_only_own_line() {
        let exe = Path::new("/opt/curfew/bin/curfew");
        let data = Path::new("/home/kid/.local/share/curfew");
        let line = render_cron_line("curfew.persisted", exe, data);
        assert!(line.starts_with("@reboot '/opt/curfew/bin/curfew' --data-dir"));
        assert!(line.ends_with("# curfew:curfew.persisted"));

        let table = "0 3 * * * backup\n";
        let once = upsert_cron_line(table, "curfew.persisted", &line);
        let twice = upsert_cron_line(&once, "curfew.persisted", &line);
        assert_eq!(once, twice);
        assert_eq!(once.lines().count(), 2);
        assert!(once.starts_with("0 3 * * * backup\n"));

        assert_eq!(remove_cron_line(&once, "curfew.persisted"), table);
        assert_eq!(remove_cron_line(table, "curfew.persisted"), table);
    }

    #[test]
    fn quoting_survives_awkward_paths() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");

        let unit = render_service("curfew.periodic", Path::new("/a b/curfew"), Path::new("/d"));
        assert!(unit.contains("ExecStart=\"/a b/curfew\" \"--data-dir\" \"/d\" \"ensure\""));

        let timer = render_timer("curfew.periodic", Duration::from_secs(900));
        assert!(timer.contains("OnUnitActiveSec=900s"));
        assert!(timer.contains("WantedBy=timers.target"));
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use crate::watchdog::os_jobs::testing::scripted_os_jobs as os_jobs;

        #[tokio::test]
        async fn periodic_job_becomes_enabled_timer() {
            let dir = tempfile::tempdir().unwrap();
            let jobs = os_jobs(dir.path());
            let periodic = job(
                "curfew.periodic",
                JobSchedule::Periodic { interval_secs: 900 },
                false,
            );

            let exe = Path::new("/usr/bin/curfew");
            assert!(jobs.install(&periodic, exe, dir.path()).await.unwrap());
            assert!(jobs.timer_path("curfew.periodic").exists());
            assert!(jobs.service_path("curfew.periodic").exists());
            let log = std::fs::read_to_string(dir.path().join("systemctl.log")).unwrap();
            assert!(log.contains("enable --now curfew-periodic.timer"));

            jobs.remove("curfew.periodic").await.unwrap();
            assert!(!jobs.timer_path("curfew.periodic").exists());
            let log = std::fs::read_to_string(dir.path().join("systemctl.log")).unwrap();
            assert!(log.contains("disable --now curfew-periodic.timer"));
        }

        #[tokio::test]
        async fn persisted_job_lands_in_crontab_once() {
            let dir = tempfile::tempdir().unwrap();
            let jobs = os_jobs(dir.path());
            let persisted = job(
                "curfew.persisted",
                JobSchedule::Periodic { interval_secs: 900 },
                true,
            );
            let exe = Path::new("/usr/bin/curfew");

            jobs.install(&persisted, exe, dir.path()).await.unwrap();
            jobs.install(&persisted, exe, dir.path()).await.unwrap();
            let table = std::fs::read_to_string(dir.path().join("crontab.txt")).unwrap();
            assert_eq!(table.matches("@reboot").count(), 1);
            assert!(!jobs.timer_path("curfew.persisted").exists());

            jobs.remove("curfew.persisted").await.unwrap();
            let table = std::fs::read_to_string(dir.path().join("crontab.txt")).unwrap();
            assert!(!table.contains("curfew.persisted"));
        }

        #[tokio::test]
        async fn alarms_have_no_os_entry() {
            let dir = tempfile::tempdir().unwrap();
            let jobs = os_jobs(dir.path());
            let alarm = job("curfew.wake_timer", JobSchedule::Alarm { interval_secs: 120 }, false);

            assert!(!jobs
                .install(&alarm, Path::new("/usr/bin/curfew"), dir.path())
                .await
                .unwrap());
            assert!(!dir.path().join("units").exists());
            assert!(!dir.path().join("crontab.txt").exists());
        }

        #[tokio::test]
        async fn missing_tools_report_unsupported() {
            let dir = tempfile::tempdir().unwrap();
            let jobs = OsJobs::new(
                dir.path().join("units"),
                vec!["/nonexistent/systemctl".into()],
                vec!["/nonexistent/crontab".into()],
            );
            let persisted = job(
                "curfew.persisted",
                JobSchedule::Periodic { interval_secs: 900 },
                true,
            );

            let result = jobs
                .install(&persisted, Path::new("/usr/bin/curfew"), dir.path())
                .await;
            assert!(matches!(result, Err(HostError::Unsupported(_))));
            jobs.remove("curfew.persisted").await.unwrap();
        }
    }
}
