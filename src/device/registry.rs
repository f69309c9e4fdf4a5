//! Registration table routing handle-scoped device events to subscribers

use crate::device::handle::{DeviceHandle, DeviceToken, RawHandle};
use crate::error::{HostError, Result};
use crate::manager::{DeviceNotifier, NotificationFilter, NotificationHandle};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// A live subscriber entry: the pinned handle and the caller token
pub struct DeviceRegistration {
    id: u64,
    handle: Arc<dyn DeviceHandle>,
    token: DeviceToken,
}

impl DeviceRegistration {
    pub fn handle(&self) -> &Arc<dyn DeviceHandle> {
        &self.handle
    }

    pub fn token(&self) -> &DeviceToken {
        &self.token
    }
}

impl fmt::Debug for DeviceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistration")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish()
    }
}

type Entries = Arc<RwLock<HashMap<RawHandle, Arc<DeviceRegistration>>>>;

/// Thread-safe map from raw handle value to subscriber
#[derive(Clone, Default)]
pub struct DeviceRegistrationTable {
    entries: Entries,
}

impl DeviceRegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to notifications for `handle`.
    ///
    /// The entry is visible to `lookup` before the native registration is
    /// requested, so events racing the registration still find the token.
    pub fn subscribe(
        &self,
        handle: Arc<dyn DeviceHandle>,
        token: DeviceToken,
        notifier: Arc<dyn DeviceNotifier>,
    ) -> Result<DeviceSubscription> {
        let raw = handle.raw_value();
        let registration = Arc::new(DeviceRegistration {
            id: NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed),
            handle,
            token,
        });

        {
            let mut entries = self.entries.write();
            if entries.contains_key(&raw) {
                return Err(HostError::DuplicateDevice(raw));
            }
            entries.insert(raw, registration.clone());
        }

        let subscription = DeviceSubscription {
            raw,
            id: registration.id,
            entries: self.entries.clone(),
            registration: Mutex::new(Some(registration)),
            native: Mutex::new(None),
            notifier: notifier.clone(),
            disposed: AtomicBool::new(false),
        };

        match notifier.register(NotificationFilter::Handle(raw)) {
            Ok(native) => {
                *subscription.native.lock() = Some(native);
                debug!("Registered device notifications for handle {:#x}", raw);
                Ok(subscription)
            }
            Err(e) => {
                subscription.dispose();
                Err(HostError::native("RegisterDeviceNotification", e))
            }
        }
    }

    /// Find the subscriber for a raw handle value
    pub fn lookup(&self, raw: RawHandle) -> Option<Arc<DeviceRegistration>> {
        self.entries.read().get(&raw).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Handle-scoped subscription; disposing it unregisters exactly once
pub struct DeviceSubscription {
    raw: RawHandle,
    id: u64,
    entries: Entries,
    registration: Mutex<Option<Arc<DeviceRegistration>>>,
    native: Mutex<Option<NotificationHandle>>,
    notifier: Arc<dyn DeviceNotifier>,
    disposed: AtomicBool,
}

impl DeviceSubscription {
    pub fn raw_handle(&self) -> RawHandle {
        self.raw
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Remove the table entry, release the native registration and unpin the handle
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut entries = self.entries.write();
            if entries.get(&self.raw).is_some_and(|r| r.id == self.id) {
                entries.remove(&self.raw);
            }
        }

        if let Some(native) = self.native.lock().take() {
            if let Err(e) = self.notifier.unregister(native) {
                warn!(
                    "Failed to unregister device notifications for handle {:#x}: {}",
                    self.raw, e
                );
            }
        }

        self.registration.lock().take();
    }
}

impl Drop for DeviceSubscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for DeviceSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSubscription")
            .field("raw", &format_args!("{:#x}", self.raw))
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
