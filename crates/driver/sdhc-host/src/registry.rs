//! Registry of card drivers.
//!
//! Card protocol drivers register a [`DeviceDriver`] entry naming the device
//! kinds they handle and the hooks they supply. When a device is attached to
//! a slot, the first entry matching its kind provides the slot's hooks.
//!
//! The registry is owned by the [`Host`](crate::Host); there is no global
//! table.

use alloc::vec::Vec;

use sdhc_core::sd_info;
use sdhc_driver_api::SdError;
use sdhc_driver_api::capability::SlotHooks;
use sdhc_driver_api::device::DeviceKind;

/// Default number of entries a registry accepts.
pub const DEFAULT_CAPACITY: usize = 8;

/// A registered card driver.
#[derive(Debug, Clone)]
pub struct DeviceDriver {
    /// Unique driver name.
    pub name: &'static str,
    /// Device kinds this driver binds to.
    pub kinds: &'static [DeviceKind],
    /// Hooks installed on a slot when a matching device attaches.
    pub hooks: SlotHooks,
}

impl DeviceDriver {
    /// Returns `true` if the driver handles `kind`.
    #[must_use]
    pub fn handles(&self, kind: DeviceKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Fixed-capacity table of [`DeviceDriver`] entries, matched in
/// registration order.
#[derive(Debug)]
pub struct DeviceRegistry {
    drivers: Vec<DeviceDriver>,
    capacity: usize,
}

impl DeviceRegistry {
    /// Creates an empty registry holding at most `capacity` drivers.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            drivers: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds `driver`.
    ///
    /// # Errors
    ///
    /// [`SdError::RegistryFull`] when the table is full,
    /// [`SdError::InvalidParameter`] when the name is already registered.
    pub fn register(&mut self, driver: DeviceDriver) -> Result<(), SdError> {
        if self.drivers.len() >= self.capacity {
            return Err(SdError::RegistryFull);
        }
        if self.drivers.iter().any(|d| d.name == driver.name) {
            return Err(SdError::InvalidParameter);
        }
        sd_info!("sdhc: registered driver '{}'", driver.name);
        self.drivers.push(driver);
        Ok(())
    }

    /// First driver handling `kind`.
    #[must_use]
    pub fn find(&self, kind: DeviceKind) -> Option<&DeviceDriver> {
        self.drivers.iter().find(|d| d.handles(kind))
    }

    /// Registered drivers in match order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceDriver> {
        self.drivers.iter()
    }

    /// Number of registered drivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// No driver is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Maximum number of drivers.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
