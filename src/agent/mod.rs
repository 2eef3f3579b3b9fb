//! Wires the enforcement loops together and routes remote commands into them.

pub mod commands;
pub mod controller;
pub mod inbox;
pub mod transport;

pub use commands::RemoteCommand;
pub use controller::{AgentController, AgentParts};
pub use inbox::CommandInbox;
pub use transport::ObservedFetcher;
