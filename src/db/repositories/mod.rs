pub mod policy;
pub mod usage;
