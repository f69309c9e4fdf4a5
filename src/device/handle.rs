//! Borrowed device handles and caller tokens

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Raw numeric value of a native handle, used as the routing key
pub type RawHandle = u64;

/// A native handle that can be pinned for the lifetime of a subscription.
///
/// Subscriptions hold an `Arc` to the handle, so the underlying resource
/// cannot be released while notifications for it are outstanding.
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    fn raw_value(&self) -> RawHandle;
}

#[cfg(windows)]
impl DeviceHandle for std::fs::File {
    fn raw_value(&self) -> RawHandle {
        use std::os::windows::io::AsRawHandle;
        self.as_raw_handle() as usize as RawHandle
    }
}

#[cfg(unix)]
impl DeviceHandle for std::fs::File {
    fn raw_value(&self) -> RawHandle {
        use std::os::unix::io::AsRawFd;
        self.as_raw_fd() as RawHandle
    }
}

/// Opaque caller value returned with every event for a handle
#[derive(Clone)]
pub struct DeviceToken(Arc<dyn Any + Send + Sync>);

impl DeviceToken {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceToken(..)")
    }
}
