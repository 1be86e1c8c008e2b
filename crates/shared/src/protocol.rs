//! Wire schema exchanged with the feed server.
//!
//! Messages are protobuf-encoded with `prost`; field tags are part of the
//! contract and must not be renumbered.

#[derive(Clone, PartialEq, Eq, Hash, prost::Message)]
pub struct WireContentId {
    #[prost(string, tag = "1")]
    pub table: String,
    #[prost(string, tag = "2")]
    pub content_domain: String,
    #[prost(int64, tag = "3")]
    pub id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WireOperationKind {
    Unspecified = 0,
    ClearAll = 1,
    UpdateOrAppend = 2,
    Remove = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireFeature {
    #[prost(bytes = "vec", tag = "1")]
    pub content: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireToken {
    #[prost(bytes = "vec", tag = "1")]
    pub next_page_token: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireSharedState {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

pub mod wire_operation {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "4")]
        Feature(super::WireFeature),
        #[prost(message, tag = "5")]
        Token(super::WireToken),
        #[prost(message, tag = "6")]
        SharedState(super::WireSharedState),
    }
}

/// One raw update record as delivered by the server.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireOperation {
    #[prost(enumeration = "WireOperationKind", tag = "1")]
    pub operation: i32,
    #[prost(message, optional, tag = "2")]
    pub content_id: Option<WireContentId>,
    #[prost(message, optional, tag = "3")]
    pub parent_id: Option<WireContentId>,
    #[prost(oneof = "wire_operation::Payload", tags = "4, 5, 6")]
    pub payload: Option<wire_operation::Payload>,
    /// Opaque semantic bytes attached to the content id.
    #[prost(bytes = "vec", optional, tag = "7")]
    pub semantic_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseMetadata {
    #[prost(int64, tag = "1")]
    pub creation_time_ms: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FeedResponse {
    #[prost(message, repeated, tag = "1")]
    pub operations: Vec<WireOperation>,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<ResponseMetadata>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WireRequestReason {
    Unspecified = 0,
    ZeroState = 1,
    HostRequested = 2,
    ManualRefresh = 3,
    ScheduledRefresh = 4,
    LoadMore = 5,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireClientInfo {
    #[prost(string, tag = "1")]
    pub locale: String,
    #[prost(string, tag = "2")]
    pub platform: String,
    #[prost(string, tag = "3")]
    pub app_version: String,
}

/// One dismiss action, expressed as indices into the parallel tables of
/// [`WireDismissTables`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireActionReference {
    #[prost(string, tag = "1")]
    pub action_type: String,
    #[prost(uint32, tag = "2")]
    pub id_index: u32,
    #[prost(uint32, tag = "3")]
    pub table_index: u32,
    #[prost(uint32, tag = "4")]
    pub content_domain_index: u32,
    #[prost(uint32, optional, tag = "5")]
    pub semantic_properties_index: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireDismissTables {
    #[prost(int64, repeated, tag = "1")]
    pub ids: Vec<i64>,
    #[prost(string, repeated, tag = "2")]
    pub tables: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub content_domains: Vec<String>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub semantic_properties: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "5")]
    pub actions: Vec<WireActionReference>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FeedRequest {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub page_token: Option<Vec<u8>>,
    #[prost(enumeration = "WireRequestReason", tag = "2")]
    pub reason: i32,
    #[prost(message, optional, tag = "3")]
    pub client_info: Option<WireClientInfo>,
    #[prost(message, optional, tag = "4")]
    pub dismissed: Option<WireDismissTables>,
}
