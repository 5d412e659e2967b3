//! Radio medium abstraction.

use crate::error::EnvError;
use crate::types::MoteId;

/// Cross-mote message delivery.
///
/// The kernel depends on this contract only for registration: motes are
/// registered when added and unregistered when removed, synchronously and
/// on the simulation thread. Propagation and delivery are the medium's own
/// business.
pub trait RadioMedium: Send {
    /// Medium name (used in logs and the registry).
    fn name(&self) -> &str;

    /// Starts observing a mote.
    fn register_mote(&mut self, mote: MoteId) -> Result<(), EnvError>;

    /// Stops observing a mote.
    fn unregister_mote(&mut self, mote: MoteId) -> Result<(), EnvError>;

    /// Motes currently registered, in registration order.
    fn registered_motes(&self) -> Vec<MoteId>;
}
