//! Device notification subscriptions

mod handle;
mod interface;
mod registry;

pub use handle::{DeviceHandle, DeviceToken, RawHandle};
pub use interface::{DeviceInterfaceSubscription, Guid, InterfaceFilter};
pub use registry::{DeviceRegistration, DeviceRegistrationTable, DeviceSubscription};

/// Where a notification delivered to a unit came from
#[derive(Debug, Clone)]
pub enum DeviceSource {
    /// A handle registered through the registration table, with its caller token
    Handle {
        handle: std::sync::Arc<dyn DeviceHandle>,
        token: DeviceToken,
    },
    /// An interface-class subscription
    Interface { class: Guid, name: Option<String> },
}
