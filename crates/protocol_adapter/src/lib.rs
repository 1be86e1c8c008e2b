//! Translates server update records into canonical stream operations.
//!
//! The adapter is pure and reentrant: it performs no I/O and only keeps
//! relaxed counters for introspection.

use std::sync::atomic::{AtomicU64, Ordering};

use shared::{
    domain::ContentId,
    error::ContentIdError,
    protocol::{
        wire_operation::Payload, FeedResponse, ResponseMetadata, WireContentId, WireOperation,
        WireOperationKind,
    },
    stream::{StreamDataOperation, StreamFeature, StreamPayload, StreamSharedState, StreamToken},
};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("unknown wire operation kind {0}")]
    UnknownOperation(i32),
}

/// Rewrites or augments a feature payload before it is wrapped as an
/// operation. Transformers run in registration order.
pub trait PayloadTransformer: Send + Sync {
    fn transform(
        &self,
        record: &WireOperation,
        feature: StreamFeature,
        metadata: &ResponseMetadata,
    ) -> StreamFeature;
}

/// Stamps every feature with the creation time of the response it came in.
pub struct ResponseMetadataTransformer;

impl PayloadTransformer for ResponseMetadataTransformer {
    fn transform(
        &self,
        _record: &WireOperation,
        mut feature: StreamFeature,
        metadata: &ResponseMetadata,
    ) -> StreamFeature {
        if metadata.creation_time_ms > 0 {
            feature.response_created_ms = Some(metadata.creation_time_ms);
        }
        feature
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub responses: u64,
    pub operations: u64,
    pub features: u64,
    pub tokens: u64,
    pub shared_states: u64,
    pub semantic_data: u64,
    pub removes: u64,
    pub clear_alls: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct AdapterCounters {
    responses: AtomicU64,
    operations: AtomicU64,
    features: AtomicU64,
    tokens: AtomicU64,
    shared_states: AtomicU64,
    semantic_data: AtomicU64,
    removes: AtomicU64,
    clear_alls: AtomicU64,
    dropped: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct FeedProtocolAdapter {
    transformers: Vec<Box<dyn PayloadTransformer>>,
    counters: AdapterCounters,
}

impl Default for FeedProtocolAdapter {
    fn default() -> Self {
        Self::new(vec![Box::new(ResponseMetadataTransformer)])
    }
}

impl FeedProtocolAdapter {
    pub fn new(transformers: Vec<Box<dyn PayloadTransformer>>) -> Self {
        Self {
            transformers,
            counters: AdapterCounters::default(),
        }
    }

    pub fn create_model(
        &self,
        response: &FeedResponse,
    ) -> Result<Vec<StreamDataOperation>, AdapterError> {
        bump(&self.counters.responses);
        let metadata = response.metadata.clone().unwrap_or_default();
        self.create_operations(&response.operations, &metadata)
    }

    pub fn create_operations(
        &self,
        records: &[WireOperation],
        metadata: &ResponseMetadata,
    ) -> Result<Vec<StreamDataOperation>, AdapterError> {
        let mut operations = Vec::with_capacity(records.len());
        for record in records {
            self.convert_record(record, metadata, &mut operations)?;
        }
        self.counters
            .operations
            .fetch_add(operations.len() as u64, Ordering::Relaxed);
        debug!(
            "adapter: converted records={} operations={}",
            records.len(),
            operations.len()
        );
        Ok(operations)
    }

    fn convert_record(
        &self,
        record: &WireOperation,
        metadata: &ResponseMetadata,
        out: &mut Vec<StreamDataOperation>,
    ) -> Result<(), AdapterError> {
        let kind = WireOperationKind::try_from(record.operation)
            .map_err(|_| AdapterError::UnknownOperation(record.operation))?;
        match kind {
            WireOperationKind::Unspecified => {
                return Err(AdapterError::UnknownOperation(record.operation));
            }
            WireOperationKind::ClearAll => {
                bump(&self.counters.clear_alls);
                out.push(StreamDataOperation::clear_all());
                return Ok(());
            }
            WireOperationKind::Remove | WireOperationKind::UpdateOrAppend => {}
        }

        let (content_id, parent_id) = match record_ids(record) {
            Ok(ids) => ids,
            Err(err) => {
                error!("adapter: integrity error, record with unusable id dropped: {err}");
                bump(&self.counters.dropped);
                return Ok(());
            }
        };
        let Some(content_id) = content_id else {
            error!("adapter: integrity error, record without content id dropped kind={kind:?}");
            bump(&self.counters.dropped);
            return Ok(());
        };

        if kind == WireOperationKind::Remove {
            bump(&self.counters.removes);
            out.push(StreamDataOperation::remove(content_id, parent_id));
        } else {
            self.convert_update(record, content_id, parent_id, metadata, out);
        }
        Ok(())
    }

    fn convert_update(
        &self,
        record: &WireOperation,
        content_id: String,
        parent_id: Option<String>,
        metadata: &ResponseMetadata,
        out: &mut Vec<StreamDataOperation>,
    ) {
        match &record.payload {
            Some(Payload::Token(token)) => {
                if token.next_page_token.is_empty() {
                    error!("adapter: empty continuation token dropped content_id={content_id}");
                    bump(&self.counters.dropped);
                } else {
                    bump(&self.counters.tokens);
                    let payload = StreamPayload::Token(StreamToken {
                        parent_id: parent_id.clone(),
                        next_page_token: token.next_page_token.clone(),
                    });
                    out.push(StreamDataOperation::update_or_append(
                        content_id.clone(),
                        parent_id,
                        payload,
                    ));
                }
            }
            Some(Payload::SharedState(shared_state)) => {
                bump(&self.counters.shared_states);
                let payload = StreamPayload::SharedState(StreamSharedState {
                    content_id: content_id.clone(),
                    payload: shared_state.payload.clone(),
                });
                out.push(StreamDataOperation::update_or_append(
                    content_id.clone(),
                    parent_id,
                    payload,
                ));
            }
            Some(Payload::Feature(feature)) => {
                bump(&self.counters.features);
                let feature = self.transformers.iter().fold(
                    StreamFeature {
                        content: feature.content.clone(),
                        response_created_ms: None,
                    },
                    |feature, transformer| transformer.transform(record, feature, metadata),
                );
                out.push(StreamDataOperation::update_or_append(
                    content_id.clone(),
                    parent_id,
                    StreamPayload::Feature(feature),
                ));
            }
            None if record.semantic_data.is_none() => {
                warn!("adapter: update record without payload dropped content_id={content_id}");
                bump(&self.counters.dropped);
            }
            None => {}
        }

        if let Some(semantic_data) = &record.semantic_data {
            bump(&self.counters.semantic_data);
            out.push(StreamDataOperation::update_or_append(
                content_id,
                None,
                StreamPayload::SemanticData(semantic_data.clone()),
            ));
        }
    }

    pub fn stream_content_id(&self, wire_id: &WireContentId) -> Result<String, ContentIdError> {
        stream_content_id(wire_id)
    }

    pub fn wire_content_id(&self, content_id: &str) -> Result<WireContentId, ContentIdError> {
        wire_content_id(content_id)
    }

    pub fn stats(&self) -> AdapterStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        AdapterStats {
            responses: load(&self.counters.responses),
            operations: load(&self.counters.operations),
            features: load(&self.counters.features),
            tokens: load(&self.counters.tokens),
            shared_states: load(&self.counters.shared_states),
            semantic_data: load(&self.counters.semantic_data),
            removes: load(&self.counters.removes),
            clear_alls: load(&self.counters.clear_alls),
            dropped: load(&self.counters.dropped),
        }
    }
}

pub fn stream_content_id(wire_id: &WireContentId) -> Result<String, ContentIdError> {
    let content_id = ContentId::new(
        wire_id.table.clone(),
        wire_id.content_domain.clone(),
        wire_id.id,
    )?;
    Ok(content_id.to_string())
}

fn optional_content_id(wire_id: Option<&WireContentId>) -> Result<Option<String>, ContentIdError> {
    wire_id.map(stream_content_id).transpose()
}

fn record_ids(record: &WireOperation) -> Result<(Option<String>, Option<String>), ContentIdError> {
    Ok((
        optional_content_id(record.content_id.as_ref())?,
        optional_content_id(record.parent_id.as_ref())?,
    ))
}

pub fn wire_content_id(content_id: &str) -> Result<WireContentId, ContentIdError> {
    let parsed: ContentId = content_id.parse()?;
    Ok(WireContentId {
        table: parsed.table,
        content_domain: parsed.content_domain,
        id: parsed.id,
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
