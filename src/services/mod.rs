//! Services layered on the RPC channel
//!
//! The subscription builder feeds the state engine; the remaining modules
//! are thin boundary services for collaborators outside the sync core.

pub mod alerts;
pub mod power;
pub mod subscription;
pub mod system_info;

pub use alerts::{Alert, SystemStatus};
pub use power::{PowerDevice, PowerRegistry, PowerService, PowerState};
pub use subscription::{snapshot_status, subscribe, SubscriptionPlan, CORE_OBJECTS};
pub use system_info::{FirmwareInfo, HostInfo, McuInfo};
