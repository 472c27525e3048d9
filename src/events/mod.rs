//! Push events: model, in-process bus and the `/ws` endpoint.

pub mod bus;
pub mod model;
pub mod ws;

pub use bus::{EventBus, Subscription};
pub use model::{AlertData, ClientMessage, DeviceStatusData, PushEvent, ScanStatusData, Severity, Topic};
pub use ws::push_routes;
