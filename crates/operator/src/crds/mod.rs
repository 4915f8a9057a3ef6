pub mod honsefarmcluster;

pub use honsefarmcluster::*;
