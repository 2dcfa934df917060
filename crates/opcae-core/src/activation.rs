// ── Server activation seam ──
//
// Creating the server object (CoCreateInstanceEx, a moniker, a test fixture)
// and initializing the COM apartment both belong to the embedding
// application. The core only asks an `Activator` for an object and then
// queries it for the interfaces it needs.

use opcae_api::{ComPtr, IOPCEventServer, IUnknown};
use tracing::debug;

use crate::config::ServerTarget;
use crate::error::CoreError;

/// Supplies the server object for a target.
///
/// Implementations may assume COM is already initialized on the calling
/// thread.
pub trait Activator: Send + Sync {
    fn activate(&self, target: &ServerTarget) -> Result<ComPtr<IUnknown>, CoreError>;
}

impl<F> Activator for F
where
    F: Fn(&ServerTarget) -> Result<ComPtr<IUnknown>, CoreError> + Send + Sync,
{
    fn activate(&self, target: &ServerTarget) -> Result<ComPtr<IUnknown>, CoreError> {
        self(target)
    }
}

/// Activate `target` and obtain its event server interface.
pub(crate) fn activate_event_server(
    activator: &dyn Activator,
    target: &ServerTarget,
) -> Result<ComPtr<IOPCEventServer>, CoreError> {
    let object = activator.activate(target)?;
    let server = object.query_interface::<IOPCEventServer>().map_err(|err| match err {
        opcae_api::Error::NoInterface { .. } => CoreError::Activation {
            target: target.to_string(),
            reason: "object is not an OPC event server".into(),
        },
        other => other.into(),
    })?;
    debug!(%target, local = target.is_local(), "event server activated");
    Ok(server)
}
