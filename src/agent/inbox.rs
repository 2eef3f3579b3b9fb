use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::RemoteCommand;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// File-drop command channel: the sync collaborator writes one
/// `<anything>.json` file per command into the inbox directory. Files are
/// applied in name order and removed; unparsable ones are renamed to
/// `.rejected`.
pub struct CommandInbox {
    dir: PathBuf,
    interval: Duration,
}

impl CommandInbox {
    pub fn new(dir: PathBuf, interval: Duration) -> Self {
        Self { dir, interval }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn drain(&self) -> Result<Vec<RemoteCommand>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read inbox {}", self.dir.display()))
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut commands = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            match serde_json::from_str::<RemoteCommand>(&contents) {
                Ok(command) => {
                    tokio::fs::remove_file(&path).await?;
                    commands.push(command);
                }
                Err(err) => {
                    log_warn!("rejecting inbox file {}: {err}", path.display());
                    tokio::fs::rename(&path, path.with_extension("rejected")).await?;
                }
            }
        }
        Ok(commands)
    }

    pub async fn run(self, tx: mpsc::Sender<RemoteCommand>, cancel_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let commands = match self.drain().await {
                        Ok(commands) => commands,
                        Err(err) => {
                            log_warn!("command inbox unavailable: {err:?}");
                            continue;
                        }
                    };
                    for command in commands {
                        log_info!("inbox delivered {command}");
                        if tx.send(command).await.is_err() {
                            return;
                        }
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_in_name_order_and_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = CommandInbox::new(dir.path().to_path_buf(), Duration::from_secs(1));

        std::fs::write(dir.path().join("002.json"), r#"{"command":"unlock"}"#).unwrap();
        std::fs::write(dir.path().join("001.json"), r#"{"command":"lock"}"#).unwrap();
        std::fs::write(dir.path().join("003.json"), "not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let commands = inbox.drain().await.unwrap();
        assert_eq!(commands, vec![RemoteCommand::Lock, RemoteCommand::Unlock]);
        assert!(!dir.path().join("001.json").exists());
        assert!(dir.path().join("003.rejected").exists());
        assert!(dir.path().join("notes.txt").exists());

        assert!(inbox.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = CommandInbox::new(dir.path().join("absent"), Duration::from_secs(1));
        assert!(inbox.drain().await.unwrap().is_empty());
    }
}
