//! Device interface class subscriptions

use crate::error::{HostError, Result};
use crate::manager::{DeviceNotifier, NotificationFilter, NotificationHandle};
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Device interface class identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid(u128);

impl Guid {
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn to_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:04X}-{:012X}}}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            v & 0xFFFF_FFFF_FFFF
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Guid {
    type Err = HostError;

    /// Accepts `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}` with or without braces
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || HostError::InvalidOperation(format!("'{}' is not a GUID", s));
        let trimmed = s.trim_start_matches('{').trim_end_matches('}');
        let groups: Vec<&str> = trimmed.split('-').collect();
        if groups.len() != 5
            || groups
                .iter()
                .zip([8, 4, 4, 4, 12])
                .any(|(g, len)| g.len() != len)
        {
            return Err(invalid());
        }
        let hex: String = groups.concat();
        u128::from_str_radix(&hex, 16)
            .map(Guid)
            .map_err(|_| invalid())
    }
}

/// Which interface classes a subscription covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceFilter {
    Class(Guid),
    AllClasses,
}

impl fmt::Display for InterfaceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceFilter::Class(guid) => write!(f, "{}", guid),
            InterfaceFilter::AllClasses => f.write_str("all interface classes"),
        }
    }
}

/// Class-scoped subscription; events are routed by class id, no table needed
pub struct DeviceInterfaceSubscription {
    filter: InterfaceFilter,
    native: Mutex<Option<NotificationHandle>>,
    notifier: Arc<dyn DeviceNotifier>,
    disposed: AtomicBool,
}

impl DeviceInterfaceSubscription {
    pub fn subscribe(
        filter: InterfaceFilter,
        notifier: Arc<dyn DeviceNotifier>,
    ) -> Result<Self> {
        let native = notifier
            .register(NotificationFilter::Interface(filter))
            .map_err(|e| HostError::native("RegisterDeviceNotification", e))?;
        debug!("Registered device interface notifications for {}", filter);
        Ok(Self {
            filter,
            native: Mutex::new(Some(native)),
            notifier,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn filter(&self) -> InterfaceFilter {
        self.filter
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(native) = self.native.lock().take() {
            if let Err(e) = self.notifier.unregister(native) {
                warn!(
                    "Failed to unregister device notifications for {}: {}",
                    self.filter, e
                );
            }
        }
    }
}

impl Drop for DeviceInterfaceSubscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for DeviceInterfaceSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInterfaceSubscription")
            .field("filter", &self.filter)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
