use crate::{
    domain::ContentId,
    error::ContentIdError,
    stream::{StreamDataOperation, StreamFeature, StreamPayload, StreamStructure},
};

#[test]
fn formats_content_id_with_double_colon_delimiter() {
    let id = ContentId::new("feature", "stories", 42).expect("valid id");
    assert_eq!(id.to_string(), "feature::stories::42");
}

#[test]
fn content_id_round_trips_including_empty_segments() {
    for (table, domain, id) in [
        ("t", "d", 1),
        ("", "d", 7),
        ("t", "", -3),
        ("", "", 0),
        ("table", "domain", i64::MAX),
        ("a:b", "c", 2),
    ] {
        let id = ContentId::new(table, domain, id).expect("valid id");
        let parsed: ContentId = id.to_string().parse().expect("parse formatted id");
        assert_eq!(parsed, id);
    }
}

#[test]
fn rejects_wrong_segment_count() {
    for raw in ["", "t::d", "t::d::1::2", "plain"] {
        let err = raw.parse::<ContentId>().expect_err("malformed id");
        assert!(matches!(err, ContentIdError::WrongSegmentCount { .. }), "{raw}");
    }
}

#[test]
fn segments_that_would_not_round_trip_are_rejected() {
    for (table, domain) in [
        ("a::b", "d"),
        ("t", "x::y"),
        ("t:", "d"),
        ("t", ":d"),
        ("::", ""),
    ] {
        let err = ContentId::new(table, domain, 1).expect_err("ambiguous segment");
        assert!(
            matches!(err, ContentIdError::DelimiterInSegment { .. }),
            "{table} {domain}"
        );
    }
    let err = "t:::d::1".parse::<ContentId>().expect_err("colon run");
    assert_eq!(
        err,
        ContentIdError::DelimiterInSegment {
            segment: ":d".into(),
        }
    );
}

#[test]
fn rejects_non_numeric_id() {
    let err = "t::d::abc".parse::<ContentId>().expect_err("non numeric");
    assert_eq!(
        err,
        ContentIdError::InvalidNumericId {
            raw: "t::d::abc".into(),
            segment: "abc".into(),
        }
    );
}

#[test]
fn data_operation_survives_json_storage_encoding() {
    let op = StreamDataOperation::update_or_append(
        "t::d::1",
        Some("t::d::0".into()),
        StreamPayload::Feature(StreamFeature {
            content: vec![0, 1, 2, 255],
            response_created_ms: Some(12),
        }),
    );
    let encoded = serde_json::to_vec(&op).expect("encode");
    let decoded: StreamDataOperation = serde_json::from_slice(&encoded).expect("decode");
    assert_eq!(decoded, op);
}

#[test]
fn structure_accessors_report_ids() {
    let remove = StreamStructure::remove("t::d::2", Some("t::d::1".into()));
    assert_eq!(remove.content_id(), Some("t::d::2"));
    assert_eq!(remove.parent_id(), Some("t::d::1"));
    assert_eq!(StreamStructure::ClearAll.content_id(), None);
}
