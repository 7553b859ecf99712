//! Turns inbound discovery responses into registry entries.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use discovery::{
    DeviceCategory, InboundPacket, MdnsPacket, MdnsRecord, PacketBody, RecordData, ServiceKind,
    TXT_CATEGORY_KEY, TXT_KIND_KEY,
};

use crate::registry::{DeviceEntry, DeviceRegistry, DeviceStatus};

/// What one inbound packet means for the registry: entries to merge in, and
/// FQDNs saying goodbye.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub upserts: Vec<DeviceEntry>,
    pub goodbyes: Vec<String>,
}

/// Groups a response packet by its PTR answers and synthesizes one entry per
/// advertised service. Groups missing their SRV or TXT record are skipped;
/// any record with TTL zero turns the group into a goodbye.
pub fn digest_packet(packet: &MdnsPacket, now: DateTime<Utc>) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();
    let PacketBody::Response { answers, additional } = &packet.body else {
        return outcome;
    };

    for answer in answers {
        let RecordData::Ptr { domain_name } = &answer.data else {
            continue;
        };
        let group: Vec<&MdnsRecord> = additional
            .iter()
            .filter(|record| &record.name == domain_name)
            .collect();

        let min_ttl = group
            .iter()
            .map(|record| record.ttl)
            .chain(std::iter::once(answer.ttl))
            .min()
            .unwrap_or(0);
        if min_ttl == 0 {
            outcome.goodbyes.push(domain_name.clone());
            continue;
        }

        match synthesize_entry(domain_name, &group, min_ttl, now) {
            Some(entry) => outcome.upserts.push(entry),
            None => warn!("Skipping incomplete announcement for {}", domain_name),
        }
    }

    outcome
}

fn synthesize_entry(
    domain_name: &str,
    group: &[&MdnsRecord],
    min_ttl: u32,
    now: DateTime<Utc>,
) -> Option<DeviceEntry> {
    let mut device_name = None;
    let mut port = None;
    let mut transport = None;
    let mut txt_entries: Option<&HashMap<String, String>> = None;
    let mut addresses: Vec<Ipv4Addr> = Vec::new();

    for record in group {
        match &record.data {
            RecordData::Srv {
                port: srv_port,
                protocol,
                instance,
                ..
            } => {
                device_name = Some(instance.clone());
                port = Some(*srv_port);
                transport = Some(*protocol);
            }
            RecordData::Txt { entries } => txt_entries = Some(entries),
            RecordData::A { address } => {
                if !addresses.contains(address) {
                    addresses.push(*address);
                }
            }
            RecordData::Ptr { .. } => {}
        }
    }

    let txt_entries = txt_entries?;
    let kind = txt_entries
        .get(TXT_KIND_KEY)
        .and_then(|label| ServiceKind::from_label(label))?;
    let category = txt_entries
        .get(TXT_CATEGORY_KEY)
        .and_then(|label| DeviceCategory::from_label(label))?;
    let properties: HashMap<String, String> = txt_entries
        .iter()
        .filter(|(key, _)| key.as_str() != TXT_KIND_KEY && key.as_str() != TXT_CATEGORY_KEY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Some(DeviceEntry {
        id: domain_name.to_string(),
        device_name: device_name?,
        category,
        kind,
        transport: transport?,
        port: port?,
        addresses,
        properties,
        status: DeviceStatus::Unknown,
        // A TTL below one second still keeps the entry for one.
        expires_at: now + Duration::seconds(i64::from(min_ttl.max(1))),
        last_health_ok_at: None,
    })
}

/// Consumes the discovery engine's inbound feed and keeps the registry
/// current. FIFO from one channel, so ingest ordering is preserved.
pub fn spawn_ingest(
    registry: Arc<DeviceRegistry>,
    mut inbound: broadcast::Receiver<InboundPacket>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                received = inbound.recv() => match received {
                    Ok(InboundPacket { packet, source }) => {
                        let outcome = digest_packet(&packet, Utc::now());
                        if !outcome.upserts.is_empty() || !outcome.goodbyes.is_empty() {
                            debug!(
                                "Ingesting {} entries and {} goodbyes from {}",
                                outcome.upserts.len(),
                                outcome.goodbyes.len(),
                                source
                            );
                        }
                        for id in outcome.goodbyes {
                            registry.remove(&id).await;
                        }
                        for entry in outcome.upserts {
                            registry.upsert(entry).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Ingest fell behind by {} packets", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}
