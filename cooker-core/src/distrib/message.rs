use serde::{Deserialize, Serialize};

use crate::{
    cook::{
        item::{DiscoveredDependency, Instigator, PlatformResult, Urgency},
        leaf::ArtifactMetadata,
    },
    types::{ContentHash, ItemId, Platform, WorkerId},
};

/// Bumped whenever a message body changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Everything exchanged between a director and its workers.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Connect(Connect),
    AssignPackages(AssignPackages),
    AbortPackages(AbortPackages),
    PackageResults(PackageResults),
    Heartbeat(Heartbeat),
    AbortWorker(AbortWorker),
}

impl Message {
    /// Wire name carried in the envelope's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connect(_) => "connect",
            Message::AssignPackages(_) => "assign_packages",
            Message::AbortPackages(_) => "abort_packages",
            Message::PackageResults(_) => "package_results",
            Message::Heartbeat(_) => "heartbeat",
            Message::AbortWorker(_) => "abort_worker",
        }
    }
}

/// First message a worker sends after the socket opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub worker_id: WorkerId,
    pub protocol_version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedItem {
    pub id: ItemId,
    pub platforms: Vec<Platform>,
    pub urgency: Urgency,
    pub instigator: Instigator,
}

/// Results the director already holds for an item the assignment refers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceInfo {
    pub id: ItemId,
    pub results: Vec<(Platform, PlatformResult)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignPackages {
    pub items: Vec<AssignedItem>,
    #[serde(default)]
    pub existence: Vec<ExistenceInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortPackages {
    pub ids: Vec<ItemId>,
}

/// Serialized artifact shipped back to the director for persistence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    pub metadata: ArtifactMetadata,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformOutcome {
    pub platform: Platform,
    pub result: PlatformResult,
    #[serde(default)]
    pub artifact: Option<ArtifactPayload>,
}

/// Report for one item whose assigned platforms all reached a terminal result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResult {
    pub id: ItemId,
    pub platforms: Vec<PlatformOutcome>,
    #[serde(default)]
    pub discovered: Vec<(Platform, Vec<DiscoveredDependency>)>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub input_hash: Option<ContentHash>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageResults {
    pub results: Vec<PackageResult>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub number: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortKind {
    /// The session finished; flush and exit.
    CookComplete,
    /// The session was aborted; drop local work and exit.
    Abort,
    /// Worker reply to either of the above, sent after its last result.
    AbortAcknowledge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortWorker {
    pub kind: AbortKind,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(de::Error::custom)
    }
}
