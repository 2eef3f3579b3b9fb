//! Blocking overlay: a platform-independent show/hide state machine owned by
//! a single actor task, plus the thin surface adapters that draw it.

pub mod controller;
pub mod state;
pub mod surface;

pub use controller::OverlayController;
pub use state::{HideCause, OverlayMachine, OverlayState, Transition};
pub use surface::{
    HeadlessSurface, OverlayContent, OverlayError, OverlaySurface, ProcessSurface, SurfaceHandle,
};
