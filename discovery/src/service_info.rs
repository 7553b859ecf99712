//! The service model advertised over the discovery protocol.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::packet::{MdnsPacket, MdnsRecord, PacketBody, RecordData};

/// Meta service name answered with every locally registered service.
pub const SERVICE_META_NAME: &str = "_services._dns-sd._udp.local";

/// Reserved TXT key carrying the service kind. User properties cannot shadow it.
pub const TXT_KIND_KEY: &str = "kind";
/// Reserved TXT key carrying the device category. User properties cannot shadow it.
pub const TXT_CATEGORY_KEY: &str = "category";

/// Whether a device produces readings or accepts commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServiceKind {
    Sensor,
    Actuator,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Sensor => "sensor",
            ServiceKind::Actuator => "actuator",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "sensor" => Some(ServiceKind::Sensor),
            "actuator" => Some(ServiceKind::Actuator),
            _ => None,
        }
    }
}

/// Closed set of device categories known to the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceCategory {
    LightLamp,
    FartDetector,
    Toilet,
    Sink,
    WaterLeak,
}

impl DeviceCategory {
    pub const ALL: [DeviceCategory; 5] = [
        DeviceCategory::LightLamp,
        DeviceCategory::FartDetector,
        DeviceCategory::Toilet,
        DeviceCategory::Sink,
        DeviceCategory::WaterLeak,
    ];

    /// The hierarchical service-type label announced for this category.
    pub fn service_type(&self) -> &'static str {
        match self {
            DeviceCategory::LightLamp => "_lightlamp._tcp.local.",
            DeviceCategory::FartDetector => "_fartdetector._tcp.local.",
            DeviceCategory::Toilet => "_toilet._tcp.local.",
            DeviceCategory::Sink => "_sink._tcp.local.",
            DeviceCategory::WaterLeak => "_waterleak._tcp.local.",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCategory::LightLamp => "lightlamp",
            DeviceCategory::FartDetector => "fartdetector",
            DeviceCategory::Toilet => "toilet",
            DeviceCategory::Sink => "sink",
            DeviceCategory::WaterLeak => "waterleak",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        DeviceCategory::ALL
            .iter()
            .copied()
            .find(|category| category.as_str() == label)
    }

    /// Toilets, sinks and lamps take commands; the rest only report.
    pub fn kind(&self) -> ServiceKind {
        match self {
            DeviceCategory::LightLamp | DeviceCategory::Toilet | DeviceCategory::Sink => {
                ServiceKind::Actuator
            }
            DeviceCategory::FartDetector | DeviceCategory::WaterLeak => ServiceKind::Sensor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// Everything a participant advertises about one of its services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Human-readable name; tiebreaking may append a suffix before commit.
    pub instance_name: String,
    /// Hierarchical label, e.g. `_lightlamp._tcp.local.`.
    pub service_type: String,
    /// TCP port of the device endpoint.
    pub port: u16,
    /// Advertised IPv4 addresses, loopback and bridge ranges excluded.
    pub addresses: Vec<Ipv4Addr>,
    pub kind: ServiceKind,
    pub category: DeviceCategory,
    pub transport: Transport,
    /// Device-specific key/value pairs, merged into the TXT record.
    pub properties: HashMap<String, String>,
    /// Advertised lifetime in seconds. Zero signals a goodbye.
    pub ttl_seconds: u32,
}

impl ServiceInfo {
    /// Stable network identity: `"{instance_name}.{service_type}"`.
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.instance_name, self.service_type)
    }

    /// Whether a question with this name should be answered with our records.
    pub fn matches_question(&self, name: &str) -> bool {
        name == SERVICE_META_NAME || name == self.service_type
    }

    /// The merged TXT map. The reserved `kind`/`category` entries are derived
    /// from the typed fields and always win over user-supplied properties.
    pub fn txt_entries(&self) -> HashMap<String, String> {
        let mut entries = self.properties.clone();
        entries.insert(TXT_KIND_KEY.to_string(), self.kind.as_str().to_string());
        entries.insert(
            TXT_CATEGORY_KEY.to_string(),
            self.category.as_str().to_string(),
        );
        entries
    }

    /// Builds the announcement packet for this service: one PTR answer,
    /// followed by A records, one SRV and one TXT as additional records.
    /// `cache_flush` is set on the additional records only.
    pub fn announcement(&self, transaction_id: u32, cache_flush: bool) -> MdnsPacket {
        self.announcement_with_ttl(transaction_id, cache_flush, self.ttl_seconds)
    }

    /// A goodbye is an announcement whose records all carry TTL zero.
    pub fn goodbye(&self, transaction_id: u32) -> MdnsPacket {
        self.announcement_with_ttl(transaction_id, true, 0)
    }

    fn announcement_with_ttl(&self, transaction_id: u32, cache_flush: bool, ttl: u32) -> MdnsPacket {
        let fqdn = self.fqdn();
        let answers = vec![MdnsRecord {
            name: self.service_type.clone(),
            ttl,
            cache_flush: false,
            data: RecordData::Ptr {
                domain_name: fqdn.clone(),
            },
        }];

        let mut additional = Vec::with_capacity(self.addresses.len() + 2);
        for address in &self.addresses {
            additional.push(MdnsRecord {
                name: fqdn.clone(),
                ttl,
                cache_flush,
                data: RecordData::A { address: *address },
            });
        }
        additional.push(MdnsRecord {
            name: fqdn.clone(),
            ttl,
            cache_flush,
            data: RecordData::Srv {
                port: self.port,
                target: format!("{}.local.", self.instance_name),
                protocol: self.transport,
                service: self.service_type.clone(),
                instance: self.instance_name.clone(),
            },
        });
        additional.push(MdnsRecord {
            name: fqdn,
            ttl,
            cache_flush,
            data: RecordData::Txt {
                entries: self.txt_entries(),
            },
        });

        MdnsPacket::new(transaction_id, PacketBody::Response { answers, additional })
    }
}
