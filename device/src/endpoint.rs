//! The device endpoint: a TCP listener speaking the framed request/response
//! protocol, kept in sync with the discovery announcements.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Mutex,
    time::MissedTickBehavior,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use discovery::{DiscoveryService, ServiceInfo};
use protocol::{frame, ErrorBody, ErrorCode, Request, Response};

use crate::state::DeviceState;

/// How long in-flight connections get to drain on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// The seam between the endpoint and the discovery engine: whoever owns the
/// announcements re-broadcasts them when the advertised properties change.
#[async_trait]
pub trait PropertyAnnouncer: Send + Sync {
    async fn publish_update(&self, info: ServiceInfo) -> Result<()>;
}

#[async_trait]
impl PropertyAnnouncer for DiscoveryService {
    async fn publish_update(&self, info: ServiceInfo) -> Result<()> {
        self.update(info).await
    }
}

struct DeviceShared {
    state: DeviceState,
    info: ServiceInfo,
}

/// One device process: a listener, the state machine behind a mutex and the
/// announcer that keeps the network view in sync.
pub struct DeviceEndpoint {
    listener: TcpListener,
    announcer: Arc<dyn PropertyAnnouncer>,
    shared: Arc<Mutex<DeviceShared>>,
}

impl DeviceEndpoint {
    /// `info` must be the committed registration (post-tiebreak name).
    pub fn new(
        listener: TcpListener,
        announcer: Arc<dyn PropertyAnnouncer>,
        info: ServiceInfo,
        state: DeviceState,
    ) -> Self {
        Self {
            listener,
            announcer,
            shared: Arc::new(Mutex::new(DeviceShared { state, info })),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until cancelled, then drains in-flight connections
    /// for up to two seconds before returning.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let shared = self.shared.clone();
                            let announcer = self.announcer.clone();
                            tracker.spawn(async move {
                                handle_connection(stream, peer, shared, announcer).await;
                            });
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
            }
        }

        tracker.close();
        if tokio::time::timeout(DRAIN_DEADLINE, tracker.wait())
            .await
            .is_err()
        {
            warn!("Forcing shutdown with connections still in flight");
        }
        Ok(())
    }

    /// Periodically refreshes sensor readings and re-announces the derived
    /// properties. Actuator states never drift, so the loop is a no-op for
    /// them.
    pub async fn run_sensor_loop(&self, period: Duration, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = interval.tick() => {
                    let mut guard = self.shared.lock().await;
                    let changed = {
                        let mut rng = rand::thread_rng();
                        guard.state.refresh_reading(&mut rng)
                    };
                    if changed {
                        guard.info.properties = guard.state.properties();
                        let info = guard.info.clone();
                        if let Err(e) = self.announcer.publish_update(info).await {
                            warn!("Sensor reading announcement failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// The currently advertised service info.
    pub async fn advertised_info(&self) -> ServiceInfo {
        self.shared.lock().await.info.clone()
    }
}

/// Serves one connection until the peer hangs up or sends garbage. Errors
/// here never affect other connections.
async fn handle_connection(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    shared: Arc<Mutex<DeviceShared>>,
    announcer: Arc<dyn PropertyAnnouncer>,
) {
    loop {
        let request: Request = match frame::read_message(&mut stream).await {
            Ok(request) => request,
            Err(e) if e.is_clean_eof() => {
                debug!("Connection from {} closed", peer);
                return;
            }
            Err(e) => {
                warn!("Dropping connection from {}: {}", peer, e);
                return;
            }
        };

        let response = dispatch(request, &shared, &announcer).await;

        if let Err(e) = frame::write_message(&mut stream, &response).await {
            warn!("Failed to respond to {}: {}", peer, e);
            return;
        }
    }
}

/// Applies one request. State mutation and the property re-announcement
/// happen under the shared lock so concurrent connections commit in a total
/// order, and observers hear about a change before the caller sees the
/// response.
async fn dispatch(
    request: Request,
    shared: &Mutex<DeviceShared>,
    announcer: &Arc<dyn PropertyAnnouncer>,
) -> Response {
    match request {
        Request::Empty => Response::Empty,
        Request::ListDevices { .. } => Response::Error(ErrorBody::new(
            ErrorCode::InvalidCommand,
            "device endpoints do not serve listings",
        )),
        Request::SendActuatorCommand { device_id, action } => {
            let mut guard = shared.lock().await;
            if device_id != guard.info.fqdn() {
                return Response::Error(ErrorBody::new(
                    ErrorCode::DeviceNotFound,
                    format!("this endpoint serves {}", guard.info.fqdn()),
                ));
            }
            match guard.state.apply(&action) {
                Ok(message) => {
                    guard.info.properties = guard.state.properties();
                    let info = guard.info.clone();
                    info!("Applied {} command: {}", info.category.as_str(), message);
                    if let Err(e) = announcer.publish_update(info).await {
                        warn!("Property re-announcement failed: {}", e);
                    }
                    Response::SendActuatorCommand { message }
                }
                Err(body) => Response::Error(body),
            }
        }
    }
}
