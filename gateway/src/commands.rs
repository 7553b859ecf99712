//! Actuator command dispatch: a short-lived TCP client per command.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::TcpStream;

use discovery::ServiceKind;
use protocol::{frame, ActuatorAction, ErrorBody, ErrorCode, Request, Response};

use crate::registry::{DeviceRegistry, DeviceStatus};

/// Budget for connecting to a device and for reading its response.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Looks up the device, verifies it can take commands, then performs one
/// framed request/response exchange. Device-side errors are surfaced
/// unchanged; transport failures map to `DeviceOffline` with the attempted
/// address in the metadata.
pub async fn send_actuator_command(
    registry: &DeviceRegistry,
    device_id: &str,
    action: ActuatorAction,
) -> Result<String, ErrorBody> {
    let entry = registry.get(device_id).await.ok_or_else(|| {
        ErrorBody::new(
            ErrorCode::DeviceNotFound,
            format!("no device registered as {}", device_id),
        )
    })?;

    if entry.kind != ServiceKind::Actuator {
        return Err(ErrorBody::new(
            ErrorCode::InvalidCommand,
            format!("{} is a sensor and does not accept commands", entry.device_name),
        ));
    }
    if entry.status == DeviceStatus::Offline {
        return Err(ErrorBody::new(
            ErrorCode::DeviceOffline,
            format!("{} failed its last liveness probe", entry.device_name),
        ));
    }

    let address = entry.addresses.first().ok_or_else(|| {
        ErrorBody::new(
            ErrorCode::DeviceOffline,
            format!("{} advertised no addresses", entry.device_name),
        )
    })?;
    let target = SocketAddr::new(IpAddr::V4(*address), entry.port);

    debug!("Dispatching {:?} command to {}", action.category(), target);

    let mut stream = tokio::time::timeout(COMMAND_TIMEOUT, TcpStream::connect(target))
        .await
        .map_err(|_| offline(target, "connect timed out"))?
        .map_err(|e| offline(target, e))?;

    let request = Request::SendActuatorCommand {
        device_id: device_id.to_string(),
        action,
    };
    frame::write_message(&mut stream, &request)
        .await
        .map_err(|e| offline(target, e))?;

    let response: Response = tokio::time::timeout(COMMAND_TIMEOUT, frame::read_message(&mut stream))
        .await
        .map_err(|_| offline(target, "response timed out"))?
        .map_err(|e| offline(target, e))?;

    match response {
        Response::SendActuatorCommand { message } => Ok(message),
        Response::Error(body) => {
            warn!("Device {} rejected the command: {}", device_id, body);
            Err(body)
        }
        Response::Empty => Ok(String::new()),
    }
}

fn offline(target: SocketAddr, detail: impl std::fmt::Display) -> ErrorBody {
    ErrorBody::new(
        ErrorCode::DeviceOffline,
        format!("could not reach the device: {}", detail),
    )
    .with_metadata("address", target.to_string())
}
