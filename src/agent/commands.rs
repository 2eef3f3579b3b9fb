use serde::{Deserialize, Serialize};
use std::fmt;

/// Commands pushed by the backend or a parent's device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RemoteCommand {
    /// Lock the whole device until unlocked.
    Lock,
    /// Lift the remote lock and clear whatever overlay is up right now.
    Unlock,
    RefreshPolicy,
    /// App-agnostic "clear overlay now".
    ClearOverlay,
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteCommand::Lock => "lock",
            RemoteCommand::Unlock => "unlock",
            RemoteCommand::RefreshPolicy => "refresh_policy",
            RemoteCommand::ClearOverlay => "clear_overlay",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_json() {
        let command: RemoteCommand = serde_json::from_str(r#"{"command":"clear_overlay"}"#).unwrap();
        assert_eq!(command, RemoteCommand::ClearOverlay);
        assert_eq!(
            serde_json::to_string(&RemoteCommand::RefreshPolicy).unwrap(),
            r#"{"command":"refresh_policy"}"#
        );
        assert!(serde_json::from_str::<RemoteCommand>(r#"{"command":"wipe"}"#).is_err());
    }
}
