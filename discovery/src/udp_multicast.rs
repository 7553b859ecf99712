//! Multicast transport and lifecycle for the discovery protocol.
//!
//! One UDP socket, joined to the discovery group, carries announcements,
//! goodbyes, queries and responses for every service a participant registers.
//! The service handles socket configuration, retry logic, name tiebreaking,
//! TTL renovation and inbound packet fan-out.

use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::UdpSocket,
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    net,
    packet::{self, MdnsPacket, PacketBody, Question, RecordData, RecordType},
    service_info::{ServiceInfo, SERVICE_META_NAME},
};

/// Multicast group shared by every participant on the LAN.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
/// UDP port of the discovery protocol.
pub const MULTICAST_PORT: u16 = 5369;

/// How many raw sent datagrams are remembered for self-echo suppression.
const SENT_RING_CAPACITY: usize = 50;
/// Cadence of the renovation sweep. Each tick re-announces services past 75%
/// of their advertised TTL.
const RENOVATION_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Probe rounds that must pass silently before a name is committed.
const PROBE_ROUNDS: usize = 3;
/// Gap between tiebreak probe queries.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
/// How often a candidate may be renamed before registration fails.
const RENAME_BUDGET: usize = 8;

type SentRing = Arc<StdMutex<VecDeque<Vec<u8>>>>;

/// A parsed inbound packet together with its sender address.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub packet: MdnsPacket,
    pub source: SocketAddr,
}

/// Configuration for network operation retry behavior.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts.
    max_retries: usize,
    /// Initial delay between retries (exponential backoff).
    initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

struct RegisteredService {
    info: ServiceInfo,
    last_announced: Instant,
}

/// The discovery engine: owns the multicast socket, the locally registered
/// services and the self-echo ring, and fans parsed inbound packets out to
/// subscribers.
pub struct DiscoveryService {
    /// Lazily initialized multicast socket with retry status.
    socket_init: Mutex<Option<Result<Arc<UdpSocket>>>>,
    /// Locally registered services, keyed by FQDN.
    registered: Arc<DashMap<String, RegisteredService>>,
    /// Raw bytes of recent sends, matched against inbound datagrams.
    sent_ring: SentRing,
    /// Fan-out channel for parsed, non-self inbound packets.
    inbound_tx: broadcast::Sender<InboundPacket>,
    /// Policy for socket initialization retries.
    retry_policy: RetryPolicy,
    /// Background listener and renovation tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for DiscoveryService {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryService {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(64);
        Self {
            socket_init: Mutex::new(None),
            registered: Arc::new(DashMap::new()),
            sent_ring: Arc::new(StdMutex::new(VecDeque::with_capacity(SENT_RING_CAPACITY))),
            inbound_tx,
            retry_policy: RetryPolicy::default(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Configures the retry policy for socket initialization.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Initializes the multicast socket with retry logic.
    async fn socket_with_retry(&self) -> Result<Arc<UdpSocket>> {
        let mut lock = self.socket_init.lock().await;

        if let Some(result) = &*lock {
            return result
                .as_ref()
                .map(Arc::clone)
                .map_err(|e| anyhow!(e.to_string()));
        }

        let mut retries = self.retry_policy.max_retries;
        let mut backoff = self.retry_policy.initial_backoff;
        let mut last_error = None;

        while retries > 0 {
            match Self::try_init_socket().await {
                Ok(socket) => {
                    *lock = Some(Ok(socket.clone()));
                    return Ok(socket);
                }
                Err(e) => {
                    last_error = Some(e);
                    retries -= 1;
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        let error = last_error.unwrap_or_else(|| anyhow!("socket initialization failed"));
        *lock = Some(Err(anyhow!("{}", error)));

        Err(error)
    }

    /// Creates the shared send/receive socket: reuse-address and reuse-port so
    /// multiple participants coexist on one host, multicast loop enabled so
    /// tiebreaking between them works at all.
    async fn try_init_socket() -> Result<Arc<UdpSocket>> {
        let socket = tokio::task::spawn_blocking(move || {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MULTICAST_PORT);

            socket.set_reuse_address(true)?;
            #[cfg(not(target_os = "windows"))]
            socket.set_reuse_port(true)?;
            socket.set_nonblocking(true)?;
            socket.bind(&bind_addr.into())?;

            socket.set_multicast_ttl_v4(255)?;
            socket.set_multicast_loop_v4(true)?;

            let interface_addrs: Vec<Ipv4Addr> = net::multicast_interfaces()
                .into_iter()
                .flat_map(|iface| iface.ipv4.into_iter().map(|net| net.addr()))
                .collect();
            if interface_addrs.is_empty() {
                socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
            } else {
                for addr in interface_addrs {
                    if let Err(e) = socket.join_multicast_v4(&MULTICAST_GROUP, &addr) {
                        warn!("Could not join multicast group on {}: {}", addr, e);
                    }
                }
            }

            Ok::<_, anyhow::Error>(socket)
        })
        .await??;

        let tokio_socket = UdpSocket::from_std(socket.into())
            .context("Failed to convert multicast socket to tokio socket")?;

        Ok(Arc::new(tokio_socket))
    }

    /// Starts the receive loop. Parsed, non-self packets are fanned out to
    /// [`subscribe_inbound`](Self::subscribe_inbound) subscribers; inbound
    /// queries are answered with matching local registrations.
    pub async fn listen(&self, cancel_token: CancellationToken) -> Result<()> {
        let socket = self.socket_with_retry().await?;
        info!("Listening on multicast {}:{}", MULTICAST_GROUP, MULTICAST_PORT);

        let sent_ring = self.sent_ring.clone();
        let registered = self.registered.clone();
        let inbound_tx = self.inbound_tx.clone();

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Multicast listener exiting");
                        break;
                    }
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, source)) => {
                                let datagram = &buf[..len];
                                if is_self_echo(&sent_ring, datagram) {
                                    continue;
                                }
                                match packet::decode_packet(datagram) {
                                    Ok(parsed) => {
                                        if let PacketBody::Query { questions } = &parsed.body {
                                            answer_questions(&socket, &sent_ring, &registered, questions)
                                                .await;
                                        }
                                        // Receiver count of zero just means nobody
                                        // subscribed yet.
                                        let _ = inbound_tx.send(InboundPacket {
                                            packet: parsed,
                                            source,
                                        });
                                    }
                                    Err(e) => {
                                        warn!("Discarding malformed datagram from {}: {}", source, e);
                                    }
                                }
                            }
                            Err(e) => {
                                error!("Multicast receive failed, stopping listener: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Starts the renovation sweep: every second, any registered service past
    /// 75% of its TTL is re-announced. A failed send is retried on the next
    /// sweep; a missed tick does not produce duplicates.
    pub async fn start_renovation(&self, cancel_token: CancellationToken) -> Result<()> {
        let socket = self.socket_with_retry().await?;
        let registered = self.registered.clone();
        let sent_ring = self.sent_ring.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(RENOVATION_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = interval.tick() => {
                        let due: Vec<(String, MdnsPacket)> = registered
                            .iter()
                            .filter(|entry| {
                                entry.value().last_announced.elapsed()
                                    >= renovation_due(entry.value().info.ttl_seconds)
                            })
                            .map(|entry| {
                                (
                                    entry.key().clone(),
                                    entry.value().info.announcement(rand::random(), false),
                                )
                            })
                            .collect();

                        for (fqdn, announcement) in due {
                            match transmit(&socket, &sent_ring, &announcement).await {
                                Ok(()) => {
                                    if let Some(mut entry) = registered.get_mut(&fqdn) {
                                        entry.last_announced = Instant::now();
                                    }
                                }
                                Err(e) => warn!("Re-announcement of {} failed: {}", fqdn, e),
                            }
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Registers a service: desynchronizing jitter, probe-based tiebreaking,
    /// then the first announcement. Returns the committed info, whose
    /// `instance_name` may have been renamed.
    ///
    /// Fails if the port is zero, the FQDN is already registered locally, or
    /// no unique name is found within the rename budget.
    pub async fn register(&self, info: ServiceInfo) -> Result<ServiceInfo> {
        if info.port == 0 {
            bail!("cannot register {}: port 0 is not routable", info.fqdn());
        }
        if self.registered.contains_key(&info.fqdn()) {
            bail!("service {} is already registered", info.fqdn());
        }

        let jitter_ms = {
            let mut rng = rand::thread_rng();
            rng.gen_range(150..=250)
        };
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        let mut candidate = info;
        let mut renames = 0;
        loop {
            match self.probe_for_conflict(&candidate.fqdn()).await? {
                None => break,
                Some(claimant) => {
                    renames += 1;
                    if renames > RENAME_BUDGET {
                        bail!(
                            "could not find a unique name for {} after {} attempts",
                            candidate.fqdn(),
                            renames
                        );
                    }
                    let renamed = rename_with_suffix(&candidate.instance_name);
                    info!(
                        "Name {} already claimed by {}; retrying as {}",
                        candidate.fqdn(),
                        claimant,
                        renamed
                    );
                    candidate.instance_name = renamed;
                }
            }
        }

        info!("Committed service name {}", candidate.fqdn());
        self.registered.insert(
            candidate.fqdn(),
            RegisteredService {
                info: candidate.clone(),
                last_announced: Instant::now(),
            },
        );
        self.send_packet(&candidate.announcement(rand::random(), false))
            .await?;
        Ok(candidate)
    }

    /// Re-announces a registered service with fresh properties. The records
    /// carry the cache-flush flag so listeners replace their cached state.
    pub async fn update(&self, info: ServiceInfo) -> Result<()> {
        let fqdn = info.fqdn();
        {
            let mut entry = self
                .registered
                .get_mut(&fqdn)
                .ok_or_else(|| anyhow!("service {} is not registered", fqdn))?;
            entry.info = info.clone();
            entry.last_announced = Instant::now();
        }
        self.send_packet(&info.announcement(rand::random(), true))
            .await
    }

    /// Broadcasts a goodbye for the service and stops renewing it.
    pub async fn unregister(&self, fqdn: &str) -> Result<()> {
        let (_, entry) = self
            .registered
            .remove(fqdn)
            .ok_or_else(|| anyhow!("service {} is not registered", fqdn))?;
        info!("Unregistering {}", fqdn);
        self.send_packet(&entry.info.goodbye(rand::random())).await
    }

    /// Every parsed, non-self inbound packet is delivered to each subscriber.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<InboundPacket> {
        self.inbound_tx.subscribe()
    }

    /// Sends a one-off query to the multicast group.
    pub async fn query(&self, name: &str, record_type: RecordType) -> Result<()> {
        let packet = MdnsPacket::new(
            rand::random(),
            PacketBody::Query {
                questions: vec![Question {
                    name: name.to_string(),
                    record_type,
                }],
            },
        );
        self.send_packet(&packet).await
    }

    /// Snapshot of the currently registered services.
    pub fn registered_services(&self) -> Vec<ServiceInfo> {
        self.registered
            .iter()
            .map(|entry| entry.value().info.clone())
            .collect()
    }

    /// Emits goodbyes for every registered service, then stops all background
    /// tasks.
    pub async fn shutdown(&self) {
        let fqdns: Vec<String> = self.registered.iter().map(|e| e.key().clone()).collect();
        for fqdn in fqdns {
            if let Err(e) = self.unregister(&fqdn).await {
                warn!("Goodbye for {} failed: {}", fqdn, e);
            }
        }

        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    async fn send_packet(&self, packet: &MdnsPacket) -> Result<()> {
        let socket = self.socket_with_retry().await?;
        transmit(&socket, &self.sent_ring, packet).await
    }

    /// Emits probe queries and watches the inbound feed for anyone else
    /// holding or wanting `fqdn`. Our own packets never reach the feed
    /// (self-echo suppression), so any claimant is a distinct participant,
    /// including a sibling process on this host.
    ///
    /// Two kinds of conflict force a rename: a response claiming the name
    /// (an established owner), and a probe query naming the same candidate
    /// (a simultaneous starter). The latter is resolved by comparing the
    /// probe tokens both sides drew: the lower token yields, so exactly one
    /// participant keeps the name whenever the tokens differ.
    async fn probe_for_conflict(&self, fqdn: &str) -> Result<Option<SocketAddr>> {
        let mut inbound = self.inbound_tx.subscribe();
        let probe_token: u32 = rand::random();

        for _ in 0..PROBE_ROUNDS {
            self.send_packet(&probe_packet(fqdn, probe_token)).await?;

            let window = tokio::time::sleep(PROBE_INTERVAL);
            tokio::pin!(window);
            loop {
                tokio::select! {
                    _ = &mut window => break,
                    received = inbound.recv() => match received {
                        Ok(InboundPacket { packet, source }) => {
                            if claims_name(&packet, fqdn) {
                                return Ok(Some(source));
                            }
                            if probes_name(&packet, fqdn)
                                && yields_to_peer(packet.transaction_id, probe_token)
                            {
                                return Ok(Some(source));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Probe window dropped {} inbound packets", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(None)
    }
}

/// The probe query: the meta question surfaces everything already committed,
/// and the candidate question makes this probe visible to anyone starting up
/// with the same name at the same time. The transaction id doubles as the
/// tiebreaker token.
fn probe_packet(fqdn: &str, probe_token: u32) -> MdnsPacket {
    MdnsPacket::new(
        probe_token,
        PacketBody::Query {
            questions: vec![
                Question {
                    name: SERVICE_META_NAME.to_string(),
                    record_type: RecordType::Ptr,
                },
                Question {
                    name: fqdn.to_string(),
                    record_type: RecordType::Ptr,
                },
            ],
        },
    )
}

/// Whether a query packet is another participant probing for this name.
fn probes_name(packet: &MdnsPacket, fqdn: &str) -> bool {
    let PacketBody::Query { questions } = &packet.body else {
        return false;
    };
    questions.iter().any(|question| question.name == fqdn)
}

/// Simultaneous-probe tiebreak: yield when the peer's token outranks ours.
/// Equal tokens make both sides yield, and both re-probe under fresh names.
fn yields_to_peer(peer_token: u32, own_token: u32) -> bool {
    peer_token >= own_token
}

/// Re-announce once a service's age crosses 75% of its TTL.
fn renovation_due(ttl_seconds: u32) -> Duration {
    Duration::from_secs_f64(f64::from(ttl_seconds) * 0.75)
}

fn rename_with_suffix(instance_name: &str) -> String {
    let suffix: u16 = rand::random();
    format!("{}-{:04x}", instance_name, suffix)
}

/// Whether a response packet claims ownership of the given FQDN.
fn claims_name(packet: &MdnsPacket, fqdn: &str) -> bool {
    let PacketBody::Response { answers, additional } = &packet.body else {
        return false;
    };
    answers.iter().chain(additional.iter()).any(|record| {
        record.name == fqdn
            || matches!(&record.data, RecordData::Ptr { domain_name } if domain_name == fqdn)
    })
}

fn remember_sent(ring: &SentRing, bytes: &[u8]) {
    let mut ring = ring.lock().unwrap_or_else(PoisonError::into_inner);
    if ring.len() == SENT_RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(bytes.to_vec());
}

/// An inbound datagram byte-identical to a remembered send is our own
/// transmission looped back by the kernel.
fn is_self_echo(ring: &SentRing, datagram: &[u8]) -> bool {
    let ring = ring.lock().unwrap_or_else(PoisonError::into_inner);
    ring.iter().any(|sent| sent == datagram)
}

/// Encodes, remembers and sends one packet to the multicast group.
async fn transmit(socket: &UdpSocket, ring: &SentRing, packet: &MdnsPacket) -> Result<()> {
    let bytes = packet::encode_packet(packet)?;
    remember_sent(ring, &bytes);
    let target = SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), MULTICAST_PORT);
    let sent = socket.send_to(&bytes, target).await?;
    debug!("Sent {} bytes to {}", sent, target);
    Ok(())
}

/// Answers inbound questions with the records of matching local services.
/// The meta name matches everything; otherwise the question name must equal
/// the service type. No match, no response.
async fn answer_questions(
    socket: &UdpSocket,
    ring: &SentRing,
    registered: &DashMap<String, RegisteredService>,
    questions: &[Question],
) {
    for question in questions {
        let responses: Vec<MdnsPacket> = registered
            .iter()
            .filter(|entry| entry.value().info.matches_question(&question.name))
            .map(|entry| entry.value().info.announcement(rand::random(), false))
            .collect();

        for response in responses {
            if let Err(e) = transmit(socket, ring, &response).await {
                warn!("Failed to answer query for {}: {}", question.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_info::{DeviceCategory, ServiceKind, Transport};
    use std::collections::HashMap;

    fn ring() -> SentRing {
        Arc::new(StdMutex::new(VecDeque::with_capacity(SENT_RING_CAPACITY)))
    }

    fn lamp_info(name: &str) -> ServiceInfo {
        ServiceInfo {
            instance_name: name.to_string(),
            service_type: DeviceCategory::LightLamp.service_type().to_string(),
            port: 4040,
            addresses: vec![Ipv4Addr::new(192, 168, 1, 20)],
            kind: ServiceKind::Actuator,
            category: DeviceCategory::LightLamp,
            transport: Transport::Tcp,
            properties: HashMap::new(),
            ttl_seconds: 60,
        }
    }

    #[test]
    fn self_echo_matches_remembered_sends() {
        let ring = ring();
        remember_sent(&ring, b"announcement-1");
        remember_sent(&ring, b"announcement-2");

        assert!(is_self_echo(&ring, b"announcement-1"));
        assert!(is_self_echo(&ring, b"announcement-2"));
        assert!(!is_self_echo(&ring, b"someone-else"));
    }

    #[test]
    fn sent_ring_is_bounded() {
        let ring = ring();
        for i in 0..(SENT_RING_CAPACITY + 5) {
            remember_sent(&ring, format!("packet-{}", i).as_bytes());
        }

        assert!(!is_self_echo(&ring, b"packet-0"));
        assert!(!is_self_echo(&ring, b"packet-4"));
        assert!(is_self_echo(&ring, b"packet-5"));
        assert!(is_self_echo(
            &ring,
            format!("packet-{}", SENT_RING_CAPACITY + 4).as_bytes()
        ));
    }

    #[test]
    fn renamed_instances_keep_their_base_name() {
        let renamed = rename_with_suffix("Light Lamp");
        assert!(renamed.starts_with("Light Lamp-"));
        assert_eq!(renamed.len(), "Light Lamp-".len() + 4);
    }

    #[test]
    fn announcements_claim_their_fqdn() {
        let info = lamp_info("Light Lamp");
        let packet = info.announcement(1, false);
        assert!(claims_name(&packet, &info.fqdn()));
        assert!(!claims_name(&packet, "Sink._sink._tcp.local."));
    }

    #[test]
    fn queries_claim_nothing() {
        let packet = MdnsPacket::new(
            1,
            PacketBody::Query {
                questions: vec![Question {
                    name: SERVICE_META_NAME.to_string(),
                    record_type: RecordType::Ptr,
                }],
            },
        );
        assert!(!claims_name(&packet, "Light Lamp._lightlamp._tcp.local."));
    }

    #[test]
    fn probes_carry_the_meta_and_candidate_questions() {
        let fqdn = "Light Lamp._lightlamp._tcp.local.";
        let packet = probe_packet(fqdn, 17);
        assert_eq!(packet.transaction_id, 17);
        let PacketBody::Query { questions } = &packet.body else {
            panic!("probe must be a query");
        };
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].name, SERVICE_META_NAME);
        assert_eq!(questions[1].name, fqdn);

        assert!(probes_name(&packet, fqdn));
        assert!(!probes_name(&packet, "Sink._sink._tcp.local."));
    }

    #[test]
    fn responses_are_not_probes() {
        let info = lamp_info("Light Lamp");
        let packet = info.announcement(1, false);
        assert!(!probes_name(&packet, &info.fqdn()));
    }

    #[test]
    fn exactly_one_simultaneous_prober_keeps_the_name() {
        // Distinct tokens: the lower one yields, the higher one does not.
        assert!(yields_to_peer(9, 3));
        assert!(!yields_to_peer(3, 9));
        // Equal tokens: both sides yield and re-probe under fresh names.
        assert!(yields_to_peer(7, 7));
    }

    #[test]
    fn renovation_fires_at_three_quarters_of_ttl() {
        assert_eq!(renovation_due(60), Duration::from_secs(45));
        assert_eq!(renovation_due(4500), Duration::from_secs(3375));
    }

    #[tokio::test]
    async fn register_rejects_port_zero() {
        let service = DiscoveryService::new();
        let mut info = lamp_info("Light Lamp");
        info.port = 0;
        let err = service.register(info).await.unwrap_err();
        assert!(err.to_string().contains("port 0"));
    }
}
