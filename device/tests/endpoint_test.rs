use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use device::{DeviceEndpoint, DeviceState, PropertyAnnouncer};
use discovery::{DeviceCategory, ServiceInfo, Transport};
use protocol::{frame, ActuatorAction, ErrorCode, Request, Response};

#[derive(Default)]
struct RecordingAnnouncer {
    updates: Mutex<Vec<ServiceInfo>>,
}

impl RecordingAnnouncer {
    async fn snapshot(&self) -> Vec<ServiceInfo> {
        self.updates.lock().await.clone()
    }
}

#[async_trait]
impl PropertyAnnouncer for RecordingAnnouncer {
    async fn publish_update(&self, info: ServiceInfo) -> anyhow::Result<()> {
        self.updates.lock().await.push(info);
        Ok(())
    }
}

async fn start_endpoint(
    category: DeviceCategory,
    instance_name: &str,
) -> (
    Arc<DeviceEndpoint>,
    Arc<RecordingAnnouncer>,
    std::net::SocketAddr,
    CancellationToken,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let state = {
        let mut rng = rand::thread_rng();
        DeviceState::seeded(category, &mut rng)
    };
    let info = ServiceInfo {
        instance_name: instance_name.to_string(),
        service_type: category.service_type().to_string(),
        port: addr.port(),
        addresses: vec![Ipv4Addr::LOCALHOST],
        kind: category.kind(),
        category,
        transport: Transport::Tcp,
        properties: state.properties(),
        ttl_seconds: 60,
    };

    let announcer = Arc::new(RecordingAnnouncer::default());
    let endpoint = Arc::new(DeviceEndpoint::new(
        listener,
        announcer.clone() as Arc<dyn PropertyAnnouncer>,
        info,
        state,
    ));

    let cancel = CancellationToken::new();
    {
        let endpoint = endpoint.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            endpoint.run(token).await.unwrap();
        });
    }

    (endpoint, announcer, addr, cancel)
}

async fn send_request(stream: &mut TcpStream, request: &Request) -> Response {
    frame::write_message(stream, request).await.unwrap();
    frame::read_message(stream).await.unwrap()
}

#[tokio::test]
async fn command_reannounces_properties_before_responding() {
    let (endpoint, announcer, addr, cancel) =
        start_endpoint(DeviceCategory::LightLamp, "Light Lamp").await;
    let device_id = endpoint.advertised_info().await.fqdn();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let response = send_request(
        &mut stream,
        &Request::SendActuatorCommand {
            device_id,
            action: ActuatorAction::LightLamp {
                turn_on: Some(true),
                brightness: Some(75),
                color: None,
            },
        },
    )
    .await;

    let Response::SendActuatorCommand { message } = response else {
        panic!("expected a command response, got {response:?}");
    };
    assert!(!message.is_empty());

    // The re-announcement happened before the response was written.
    let updates = announcer.snapshot().await;
    assert_eq!(updates.len(), 1);
    let properties = &updates[0].properties;
    assert_eq!(properties.get("is_on").map(String::as_str), Some("true"));
    assert_eq!(properties.get("brightness").map(String::as_str), Some("75"));

    cancel.cancel();
}

#[tokio::test]
async fn pipelined_commands_commit_in_order() {
    let (endpoint, announcer, addr, cancel) =
        start_endpoint(DeviceCategory::LightLamp, "Light Lamp").await;
    let device_id = endpoint.advertised_info().await.fqdn();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    for brightness in [10u8, 90u8] {
        let response = send_request(
            &mut stream,
            &Request::SendActuatorCommand {
                device_id: device_id.clone(),
                action: ActuatorAction::LightLamp {
                    turn_on: Some(true),
                    brightness: Some(brightness),
                    color: None,
                },
            },
        )
        .await;
        assert!(matches!(response, Response::SendActuatorCommand { .. }));
    }

    let updates = announcer.snapshot().await;
    assert_eq!(updates.len(), 2);
    assert_eq!(
        updates[1].properties.get("brightness").map(String::as_str),
        Some("90")
    );
    assert_eq!(
        endpoint
            .advertised_info()
            .await
            .properties
            .get("brightness")
            .map(String::as_str),
        Some("90")
    );

    cancel.cancel();
}

#[tokio::test]
async fn rejects_commands_for_another_device() {
    let (_endpoint, announcer, addr, cancel) =
        start_endpoint(DeviceCategory::LightLamp, "Light Lamp").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let response = send_request(
        &mut stream,
        &Request::SendActuatorCommand {
            device_id: "Other._lightlamp._tcp.local.".to_string(),
            action: ActuatorAction::LightLamp {
                turn_on: Some(true),
                brightness: None,
                color: None,
            },
        },
    )
    .await;

    let Response::Error(body) = response else {
        panic!("expected an error, got {response:?}");
    };
    assert_eq!(body.code, ErrorCode::DeviceNotFound);
    assert!(announcer.snapshot().await.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn rejects_actions_for_another_category() {
    let (endpoint, announcer, addr, cancel) =
        start_endpoint(DeviceCategory::LightLamp, "Light Lamp").await;
    let device_id = endpoint.advertised_info().await.fqdn();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let response = send_request(
        &mut stream,
        &Request::SendActuatorCommand {
            device_id,
            action: ActuatorAction::Sink { turn_on: Some(true) },
        },
    )
    .await;

    let Response::Error(body) = response else {
        panic!("expected an error, got {response:?}");
    };
    assert_eq!(body.code, ErrorCode::InvalidCommand);
    assert!(announcer.snapshot().await.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn empty_requests_get_empty_responses() {
    let (_endpoint, _announcer, addr, cancel) =
        start_endpoint(DeviceCategory::Sink, "Sink").await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let response = send_request(&mut stream, &Request::Empty).await;
    assert_eq!(response, Response::Empty);

    cancel.cancel();
}

#[tokio::test]
async fn oversized_frames_kill_only_their_connection() {
    let (endpoint, _announcer, addr, cancel) =
        start_endpoint(DeviceCategory::LightLamp, "Light Lamp").await;
    let device_id = endpoint.advertised_info().await.fqdn();

    let mut bad = TcpStream::connect(addr).await.unwrap();
    bad.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();
    let _ = bad.write_all(&[0u8; 64]).await;
    let err = frame::read_message::<_, Response>(&mut bad).await.unwrap_err();
    assert!(err.is_clean_eof());

    // A fresh connection still works.
    let mut good = TcpStream::connect(addr).await.unwrap();
    let response = send_request(
        &mut good,
        &Request::SendActuatorCommand {
            device_id,
            action: ActuatorAction::LightLamp {
                turn_on: Some(false),
                brightness: None,
                color: None,
            },
        },
    )
    .await;
    assert!(matches!(response, Response::SendActuatorCommand { .. }));

    cancel.cancel();
}

#[tokio::test]
async fn sensor_loop_reannounces_fresh_readings() {
    let (endpoint, announcer, _addr, cancel) =
        start_endpoint(DeviceCategory::WaterLeak, "Water Leak").await;

    {
        let endpoint = endpoint.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            endpoint
                .run_sensor_loop(Duration::from_millis(50), token)
                .await;
        });
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let updates = announcer.snapshot().await;
    assert!(updates.len() >= 2, "expected repeated sensor updates");
    assert!(updates
        .iter()
        .all(|info| info.properties.contains_key("moisture")));
}
