//! HonseFarmCluster reconciliation

pub mod appsettings;
pub mod build;
pub mod controller;
pub mod converge;
pub mod material;
pub mod naming;
pub mod render;
pub mod resources;
pub mod status;
pub mod store;
pub mod tunnel;

pub use controller::{error_policy, reconcile_cluster, run_pass};
pub use render::{render, render_plan};
