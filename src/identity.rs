//! Service identity: validated name plus the properties frozen at initialization

use crate::error::{HostError, Result};
use crate::status::AcceptedCommands;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Longest name the service manager accepts
pub const MAX_NAME_LENGTH: usize = 80;

/// A validated service name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ServiceName(String);

impl ServiceName {
    /// Validate a service name.
    ///
    /// The empty name is allowed here; the host rejects it when the unit starts.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.chars().count() > MAX_NAME_LENGTH {
            return Err(HostError::InvalidName {
                name,
                reason: "longer than 80 characters",
            });
        }
        if name.contains(['/', '\\']) {
            return Err(HostError::InvalidName {
                name,
                reason: "contains a path separator",
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name and accepted commands of a unit
pub(crate) struct ServiceIdentity {
    name: RwLock<ServiceName>,
    accepted: AtomicU32,
    name_frozen: AtomicBool,
    commands_frozen: AtomicBool,
}

impl ServiceIdentity {
    pub fn new(name: ServiceName) -> Self {
        Self {
            name: RwLock::new(name),
            accepted: AtomicU32::new(AcceptedCommands::STOP.bits()),
            name_frozen: AtomicBool::new(false),
            commands_frozen: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> ServiceName {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        if self.name_frozen.load(Ordering::Acquire) {
            return Err(HostError::Frozen("the service name"));
        }
        *self.name.write() = ServiceName::new(name)?;
        Ok(())
    }

    pub fn accepted(&self) -> AcceptedCommands {
        AcceptedCommands::from_bits_truncate(self.accepted.load(Ordering::Acquire))
    }

    pub fn set_accepted(&self, command: AcceptedCommands, enabled: bool) -> Result<()> {
        if self.commands_frozen.load(Ordering::Acquire) {
            return Err(HostError::Frozen("the accepted commands"));
        }
        let mut accepted = self.accepted();
        accepted.set(command, enabled);
        self.accepted.store(accepted.bits(), Ordering::Release);
        Ok(())
    }

    pub fn freeze(&self) {
        self.name_frozen.store(true, Ordering::Release);
        self.commands_frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.name_frozen.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_length_limits() {
        assert!(ServiceName::new("").is_ok());
        assert!(ServiceName::new("a".repeat(80)).is_ok());
        assert!(matches!(
            ServiceName::new("a".repeat(81)),
            Err(HostError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_name_rejects_separators() {
        assert!(ServiceName::new("svc/one").is_err());
        assert!(ServiceName::new("svc\\one").is_err());
        assert!(ServiceName::new("svc-one").is_ok());
    }

    #[test]
    fn test_frozen_identity_rejects_changes() {
        let identity = ServiceIdentity::new(ServiceName::new("svc").unwrap());
        identity
            .set_accepted(AcceptedCommands::PAUSE_CONTINUE, true)
            .unwrap();
        identity.set_name("renamed").unwrap();

        identity.freeze();
        assert!(matches!(
            identity.set_name("other"),
            Err(HostError::Frozen(_))
        ));
        assert!(matches!(
            identity.set_accepted(AcceptedCommands::SHUTDOWN, true),
            Err(HostError::Frozen(_))
        ));
        assert_eq!(identity.name().as_str(), "renamed");
        assert_eq!(
            identity.accepted(),
            AcceptedCommands::STOP | AcceptedCommands::PAUSE_CONTINUE
        );
    }
}
