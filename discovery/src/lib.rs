pub mod net;
pub mod packet;
pub mod service_info;
pub mod udp_multicast;

pub use packet::{
    decode_packet, encode_packet, MdnsPacket, MdnsRecord, PacketBody, PacketError, Question,
    RecordData, RecordType,
};
pub use service_info::{
    DeviceCategory, ServiceInfo, ServiceKind, Transport, SERVICE_META_NAME, TXT_CATEGORY_KEY,
    TXT_KIND_KEY,
};
pub use udp_multicast::{DiscoveryService, InboundPacket, RetryPolicy};
