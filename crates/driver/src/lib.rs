//! Controller side of a block storage CSI driver: attaching, detaching and
//! modifying volumes through a [Cloud](cloud::Cloud) while keeping
//! concurrent requests from racing each other.

pub mod cloud;
pub mod controller;
pub mod fake;
pub mod options;

mod utils;

pub use cloud::{Cloud, CloudError, Instance, ModificationState, VolumeModification};
pub use controller::Controller;
pub use options::DriverOptions;
