//! Driver binding: matching discovered bundles to protocol drivers.
//!
//! A bundle carries the static identity (vendor, product, class) of one
//! function block on a discovered interface. Drivers declare match rules
//! where each field participates only if its flag bit is set; an unset
//! flag is a wildcard. The first rule, in driver registration order,
//! that matches wins; a bundle with no matching driver is simply left
//! unbound.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Flag bits selecting which [`MatchRule`] fields participate.
pub mod match_flags {
    pub const VENDOR: u16 = 1 << 0;
    pub const PRODUCT: u16 = 1 << 1;
    pub const CLASS: u16 = 1 << 2;
}

/// One driver match rule over a bundle's identity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchRule {
    pub match_flags: u16,
    pub vendor: u32,
    pub product: u32,
    pub class: u8,
}

impl MatchRule {
    /// Rule matching a (vendor, product) pair, any class.
    pub fn vendor_product(vendor: u32, product: u32) -> Self {
        Self {
            match_flags: match_flags::VENDOR | match_flags::PRODUCT,
            vendor,
            product,
            class: 0,
        }
    }

    /// Rule matching a device class, any vendor/product.
    pub fn class(class: u8) -> Self {
        Self {
            match_flags: match_flags::CLASS,
            vendor: 0,
            product: 0,
            class,
        }
    }

    /// Evaluate this rule against a bundle. An unset flag field is a
    /// wildcard.
    pub fn matches(&self, bundle: &Bundle) -> bool {
        if self.match_flags & match_flags::VENDOR != 0 && self.vendor != bundle.vendor {
            return false;
        }
        if self.match_flags & match_flags::PRODUCT != 0 && self.product != bundle.product {
            return false;
        }
        if self.match_flags & match_flags::CLASS != 0 && self.class != bundle.class {
            return false;
        }
        true
    }
}

/// A discovered bundle: one function block's static identity, plus the
/// driver currently bound to it.
pub struct Bundle {
    pub vendor: u32,
    pub product: u32,
    pub class: u8,
    driver: Mutex<Option<Arc<dyn BundleDriver>>>,
}

impl Bundle {
    pub fn new(vendor: u32, product: u32, class: u8) -> Arc<Self> {
        Arc::new(Self {
            vendor,
            product,
            class,
            driver: Mutex::new(None),
        })
    }

    /// The driver bound to this bundle, if any.
    pub fn driver(&self) -> Option<Arc<dyn BundleDriver>> {
        self.driver.lock().unwrap().clone()
    }

    fn bind(&self, driver: Arc<dyn BundleDriver>) {
        *self.driver.lock().unwrap() = Some(driver);
    }

    fn unbind(&self) -> Option<Arc<dyn BundleDriver>> {
        self.driver.lock().unwrap().take()
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("vendor", &self.vendor)
            .field("product", &self.product)
            .field("class", &self.class)
            .field("bound", &self.driver.lock().unwrap().is_some())
            .finish()
    }
}

/// A protocol driver that can claim bundles.
pub trait BundleDriver: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Match rules in declaration order; the first hit wins.
    fn rules(&self) -> &[MatchRule];

    /// Claim the bundle. Failure leaves the bundle unbound.
    fn probe(&self, bundle: &Arc<Bundle>, rule: &MatchRule) -> Result<()>;

    /// Release everything created against the bundle, connections
    /// included.
    fn disconnect(&self, bundle: &Arc<Bundle>);
}

/// Registered drivers, evaluated in registration order.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Mutex<Vec<Arc<dyn BundleDriver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver. Later registrations are considered after
    /// earlier ones.
    pub fn register(&self, driver: Arc<dyn BundleDriver>) {
        tracing::info!(driver = driver.name(), "registered bundle driver");
        self.drivers.lock().unwrap().push(driver);
    }

    /// Remove a driver by name. Bundles it already claimed stay bound
    /// until removed.
    pub fn deregister(&self, name: &str) {
        self.drivers.lock().unwrap().retain(|d| d.name() != name);
    }

    /// Try to bind a bundle to a registered driver.
    ///
    /// Returns the driver that claimed the bundle, or `None` when no
    /// rule matched or the matching driver's probe failed. Neither is
    /// an error: many bundles simply have no driver loaded.
    pub fn bind(&self, bundle: &Arc<Bundle>) -> Option<Arc<dyn BundleDriver>> {
        if let Some(existing) = bundle.driver() {
            return Some(existing);
        }

        let candidates: Vec<Arc<dyn BundleDriver>> =
            self.drivers.lock().unwrap().iter().cloned().collect();

        for driver in candidates {
            let rule = driver.rules().iter().find(|rule| rule.matches(bundle));
            let Some(rule) = rule else { continue };

            match driver.probe(bundle, rule) {
                Ok(()) => {
                    tracing::debug!(driver = driver.name(), "bound bundle {bundle:?}");
                    bundle.bind(driver.clone());
                    return Some(driver);
                }
                Err(err) => {
                    tracing::warn!(
                        driver = driver.name(),
                        "probe failed, bundle left unbound: {err}"
                    );
                    return None;
                }
            }
        }

        None
    }

    /// Run the bound driver's disconnect routine on bundle removal.
    pub fn unbind(&self, bundle: &Arc<Bundle>) {
        if let Some(driver) = bundle.unbind() {
            driver.disconnect(bundle);
        }
    }
}
