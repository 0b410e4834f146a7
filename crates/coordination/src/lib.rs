//! Primitives that keep concurrent CSI requests from stepping on each other:
//! request batching, device slot allocation and in-flight operation tracking.

pub mod batcher;
pub mod devicemanager;
pub mod inflight;

use static_assertions::assert_impl_all;

pub use batcher::{BatchError, BatchResult, Batcher};
pub use devicemanager::{BlockDeviceMapping, Device, DeviceError, DeviceManager, Reservation};
pub use inflight::{InFlight, InFlightGuard};

assert_impl_all!(DeviceManager: Send, Sync);
assert_impl_all!(InFlight: Send, Sync);
