use std::{
    collections::HashMap,
    process::{Child, Command, Stdio},
};
use thiserror::Error;

use crate::models::BlockReason;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("overlay permission denied: {0}")]
    PermissionDenied(String),
    #[error("overlay surface is not configured")]
    NotConfigured,
    #[error("unknown overlay handle {0:?}")]
    UnknownHandle(SurfaceHandle),
    #[error("overlay surface I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// What the blocking surface shows and how it behaves while shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayContent {
    pub app_identifier: String,
    pub reason: BlockReason,
    pub message: String,
    /// Swallow all touch/pointer input behind the surface.
    pub capture_input: bool,
    pub keep_screen_on: bool,
    /// Must stay false so the soft keyboard never opens.
    pub focusable: bool,
}

impl OverlayContent {
    pub fn for_block(app_identifier: impl Into<String>, reason: BlockReason) -> Self {
        Self {
            app_identifier: app_identifier.into(),
            reason,
            message: reason.message().to_string(),
            capture_input: true,
            keep_screen_on: true,
            focusable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

/// Platform adapter that actually draws the overlay. Each `present` builds a
/// brand-new surface; the caller dismisses the old one first.
pub trait OverlaySurface: Send {
    fn present(&mut self, content: &OverlayContent) -> Result<SurfaceHandle, OverlayError>;
    fn dismiss(&mut self, handle: SurfaceHandle) -> Result<(), OverlayError>;
}

impl<S: OverlaySurface + ?Sized> OverlaySurface for Box<S> {
    fn present(&mut self, content: &OverlayContent) -> Result<SurfaceHandle, OverlayError> {
        (**self).present(content)
    }

    fn dismiss(&mut self, handle: SurfaceHandle) -> Result<(), OverlayError> {
        (**self).dismiss(handle)
    }
}

/// Logs instead of drawing. Used when no overlay command is configured.
#[derive(Debug, Default)]
pub struct HeadlessSurface {
    next_handle: u64,
}

impl HeadlessSurface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OverlaySurface for HeadlessSurface {
    fn present(&mut self, content: &OverlayContent) -> Result<SurfaceHandle, OverlayError> {
        self.next_handle += 1;
        log_info!(
            "[headless overlay] blocking {} ({}): {}",
            content.app_identifier,
            content.reason,
            content.message
        );
        Ok(SurfaceHandle(self.next_handle))
    }

    fn dismiss(&mut self, handle: SurfaceHandle) -> Result<(), OverlayError> {
        log_info!("[headless overlay] dismissed surface {}", handle.0);
        Ok(())
    }
}

/// Runs an external program per shown surface and kills it on dismiss.
///
/// The configured command receives the app identifier, reason and message as
/// trailing arguments.
pub struct ProcessSurface {
    command: Vec<String>,
    next_handle: u64,
    children: HashMap<SurfaceHandle, Child>,
}

impl ProcessSurface {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            next_handle: 0,
            children: HashMap::new(),
        }
    }
}

impl OverlaySurface for ProcessSurface {
    fn present(&mut self, content: &OverlayContent) -> Result<SurfaceHandle, OverlayError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(OverlayError::NotConfigured)?;

        let child = Command::new(program)
            .args(args)
            .arg(&content.app_identifier)
            .arg(content.reason.as_str())
            .arg(&content.message)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    OverlayError::PermissionDenied(format!("{program}: {err}"))
                }
                _ => OverlayError::Io(err),
            })?;

        self.next_handle += 1;
        let handle = SurfaceHandle(self.next_handle);
        self.children.insert(handle, child);
        Ok(handle)
    }

    fn dismiss(&mut self, handle: SurfaceHandle) -> Result<(), OverlayError> {
        let mut child = self
            .children
            .remove(&handle)
            .ok_or(OverlayError::UnknownHandle(handle))?;

        if let Err(err) = child.kill() {
            // Already exited on its own.
            if err.kind() != std::io::ErrorKind::InvalidInput {
                log_warn!("failed to kill overlay process {}: {err}", child.id());
            }
        }
        child.wait()?;
        Ok(())
    }
}

impl Drop for ProcessSurface {
    fn drop(&mut self) {
        for (_, mut child) in self.children.drain() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SurfaceEvent {
        Presented(SurfaceHandle, String, BlockReason),
        Dismissed(SurfaceHandle),
    }

    /// Records every construction and teardown; can be told to refuse.
    #[derive(Clone, Default)]
    pub struct RecordingSurface {
        pub events: Arc<Mutex<Vec<SurfaceEvent>>>,
        pub deny: Arc<Mutex<bool>>,
        next: u64,
    }

    impl RecordingSurface {
        pub fn events(&self) -> Vec<SurfaceEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn presented(&self) -> usize {
            self.events()
                .iter()
                .filter(|event| matches!(event, SurfaceEvent::Presented(..)))
                .count()
        }

        pub fn set_deny(&self, deny: bool) {
            *self.deny.lock().unwrap() = deny;
        }
    }

    impl OverlaySurface for RecordingSurface {
        fn present(&mut self, content: &OverlayContent) -> Result<SurfaceHandle, OverlayError> {
            if *self.deny.lock().unwrap() {
                return Err(OverlayError::PermissionDenied("draw over other apps".into()));
            }
            assert!(content.capture_input && content.keep_screen_on && !content.focusable);
            self.next += 1;
            let handle = SurfaceHandle(self.next);
            self.events.lock().unwrap().push(SurfaceEvent::Presented(
                handle,
                content.app_identifier.clone(),
                content.reason,
            ));
            Ok(handle)
        }

        fn dismiss(&mut self, handle: SurfaceHandle) -> Result<(), OverlayError> {
            self.events
                .lock()
                .unwrap()
                .push(SurfaceEvent::Dismissed(handle));
            Ok(())
        }
    }
}
