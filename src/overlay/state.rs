use serde::{Deserialize, Serialize};

use crate::models::{BlockReason, EnforcementVerdict};

use super::{OverlayContent, OverlaySurface, SurfaceHandle};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Published view of the overlay for UI binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayState {
    pub visible: bool,
    pub blocked_app: Option<String>,
    pub block_reason: Option<BlockReason>,
}

impl OverlayState {
    pub fn hidden() -> Self {
        Self::default()
    }

    pub fn shown(app: impl Into<String>, reason: BlockReason) -> Self {
        Self {
            visible: true,
            blocked_app: Some(app.into()),
            block_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HideCause {
    /// Explicit remote unlock / clear-overlay command.
    Command,
    /// Enforcement liveness lost while shown.
    Liveness,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Shown,
    Replaced,
    Unchanged,
    Hidden,
    /// Identical block was cleared by command and has not changed since.
    Suppressed,
    /// Surface construction failed; the overlay stays hidden.
    Failed,
}

struct ActiveSurface {
    app: String,
    reason: BlockReason,
    handle: SurfaceHandle,
}

impl ActiveSurface {
    fn matches(&self, app: &str, reason: BlockReason) -> bool {
        self.reason == reason && self.app == app
    }
}

/// `Hidden` / `Shown(app, reason)` state machine over an [`OverlaySurface`].
///
/// Identical blocks are debounced. A changed block always dismisses the old
/// surface before presenting the new one. Not thread-safe on purpose: the
/// overlay actor is its only owner.
pub struct OverlayMachine<S: OverlaySurface> {
    surface: S,
    active: Option<ActiveSurface>,
    suppressed: Option<(String, BlockReason)>,
    constructions: u64,
}

impl<S: OverlaySurface> OverlayMachine<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            active: None,
            suppressed: None,
            constructions: 0,
        }
    }

    pub fn state(&self) -> OverlayState {
        match &self.active {
            Some(active) => OverlayState::shown(active.app.clone(), active.reason),
            None => OverlayState::hidden(),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.active.is_some()
    }

    /// Total successful surface constructions since creation.
    pub fn constructions(&self) -> u64 {
        self.constructions
    }

    pub fn apply_verdict(&mut self, verdict: &EnforcementVerdict) -> Transition {
        let Some(reason) = verdict.blocking_reason() else {
            if verdict.blocked {
                log_warn!(
                    "blocking verdict for {} carried no reason; treating as allow",
                    verdict.app_identifier
                );
            }
            self.suppressed = None;
            return if self.teardown() {
                Transition::Hidden
            } else {
                Transition::Unchanged
            };
        };

        let app = verdict.app_identifier.as_str();

        if let Some((suppressed_app, suppressed_reason)) = &self.suppressed {
            if suppressed_app == app && *suppressed_reason == reason {
                return Transition::Suppressed;
            }
            self.suppressed = None;
        }

        if let Some(active) = &self.active {
            if active.matches(app, reason) {
                return Transition::Unchanged;
            }
        }

        let replaced = self.teardown();
        let content = OverlayContent::for_block(app, reason);
        match self.surface.present(&content) {
            Ok(handle) => {
                self.constructions += 1;
                self.active = Some(ActiveSurface {
                    app: app.to_string(),
                    reason,
                    handle,
                });
                log_info!("overlay shown for {app} ({reason})");
                if replaced {
                    Transition::Replaced
                } else {
                    Transition::Shown
                }
            }
            Err(err) => {
                log_error!("overlay construction for {app} ({reason}) failed: {err}");
                Transition::Failed
            }
        }
    }

    /// Hides the overlay regardless of the current verdict. A command-driven
    /// hide keeps the cleared block from re-showing until the verdict changes.
    pub fn hide(&mut self, cause: HideCause) -> Transition {
        if cause == HideCause::Command {
            if let Some(active) = &self.active {
                self.suppressed = Some((active.app.clone(), active.reason));
            }
        }

        if self.teardown() {
            log_info!("overlay hidden ({cause:?})");
            Transition::Hidden
        } else {
            log_debug!("overlay already hidden ({cause:?})");
            Transition::Unchanged
        }
    }

    /// Returns whether a surface was torn down. The state is hidden afterwards
    /// even if the platform failed to dismiss it.
    fn teardown(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        if let Err(err) = self.surface.dismiss(active.handle) {
            log_error!(
                "failed to dismiss overlay for {} ({}): {err}",
                active.app,
                active.reason
            );
        }
        true
    }
}
