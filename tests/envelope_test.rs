//! Wire-format tests for envelopes as the server decodes them.

use mdml_client::clock::FixedClock;
use mdml_client::envelope::{
    AnalysisEnvelope, DataEnvelope, DataFormat, DlhubEnvelope, FuncxCallback, ImageEnvelope,
    VectorEnvelope,
};
use mdml_client::{
    AnalysisMessage, DataMessage, DataValue, DlhubMessage, EnvelopeBuilder, ImageMessage,
    ImagePayload, Timestamp, VectorMessage,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;

const NOW: i64 = 1_700_000_000_123_456_789;

fn builder() -> EnvelopeBuilder {
    EnvelopeBuilder::new("MDML", "fsp", Arc::new(FixedClock::new(NOW)))
}

#[test]
fn test_data_envelope_decodes() {
    let message = builder()
        .data(DataMessage::new("dht11", DataValue::delimited("21.5,40", ",")).timestamp(Timestamp::Many))
        .unwrap();
    let envelope: DataEnvelope = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(envelope.device_id, "DHT11");
    assert_eq!(envelope.data, json!("21.5,40"));
    assert_eq!(envelope.data_format, DataFormat::String);
    assert_eq!(envelope.data_delimiter.as_deref(), Some(","));
    assert_eq!(envelope.timestamp, Timestamp::Many);
    assert_eq!(envelope.sys_timestamp, NOW);
}

#[test]
fn test_undelimited_text_has_no_delimiter_field() {
    let message = builder()
        .data(DataMessage::new("dht11", DataValue::text("opaque")))
        .unwrap();
    let body: Value = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(body["data_format"], "string");
    assert!(body.get("data_delimiter").is_none());
}

#[test]
fn test_vector_envelope_decodes() {
    let message = builder()
        .vector(VectorMessage::new("spectrometer", json!({"wl": [400, 500], "counts": [3.5, 4.0]})).timestamp(NOW))
        .unwrap();
    assert_eq!(message.topic, "MDML/FSP/DATA/SPECTROMETER");
    let envelope: VectorEnvelope = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(envelope.data_type, "vector");
    assert_eq!(envelope.data["counts"], json!([3.5, 4.0]));
    assert_eq!(envelope.timestamp, Timestamp::Nanos(NOW));
}

#[test]
fn test_image_envelope_decodes() {
    let mut builder = builder();
    let meta = json!({"exposure_ms": 20}).as_object().cloned().unwrap();
    let message = builder
        .image(
            ImageMessage::new("webcam", ImagePayload::from_bytes(b"jpeg bytes"))
                .timestamp(5)
                .metadata(meta),
        )
        .unwrap();
    let envelope: ImageEnvelope = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(envelope.data_type, "image");
    assert_eq!(envelope.filename, "FSP_1.jpg");
    assert_eq!(envelope.timestamp, 5);
    assert_eq!(envelope.metadata["exposure_ms"], 20);
    assert_eq!(envelope.data, ImagePayload::from_bytes(b"jpeg bytes").as_str());
}

#[test]
fn test_analysis_envelope_decodes() {
    let message = builder()
        .analysis(
            AnalysisMessage::new("fsp_analysis", "func-uuid", "endpoint-uuid")
                .parameters(json!({"window": 5}))
                .queries(json!([{"device": "DHT11", "variables": ["temperature"], "last": 10}])),
            Some("token"),
        )
        .unwrap();
    let envelope: AnalysisEnvelope = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(envelope.function_id, "func-uuid");
    assert_eq!(envelope.endpoint_id, "endpoint-uuid");
    assert_eq!(envelope.parameters["window"], 5);
    assert!(envelope.queries.is_some());
    assert!(envelope.trigger.is_empty());
    assert_eq!(envelope.timestamp, NOW);
}

#[test]
fn test_dlhub_envelope_decodes() {
    let callback = FuncxCallback {
        endpoint_uuid: "ep".into(),
        function_uuid: "fn".into(),
        save_intermediate: true,
    };
    let message = builder()
        .dlhub(
            DlhubMessage::new("mnist", "aristana_uchicago/noop", json!([1, 2])).callback(callback.clone()),
            Some("token"),
        )
        .unwrap();
    assert_eq!(message.topic, "MDML/FSP/DLHUB/MNIST");
    let envelope: DlhubEnvelope = serde_json::from_str(&message.payload).unwrap();
    assert_eq!(envelope.model_id, "aristana_uchicago/noop");
    assert_eq!(envelope.callback, Some(callback));
    assert_eq!(envelope.globus_token, "token");
}

fn data_value() -> impl Strategy<Value = (DataValue, DataFormat)> {
    prop_oneof![
        ("[a-z0-9,]{0,16}", prop::option::of(",|\t")).prop_map(|(text, delimiter)| {
            let value = match delimiter {
                Some(d) => DataValue::delimited(text, d),
                None => DataValue::text(text),
            };
            (value, DataFormat::String)
        }),
        prop::collection::vec(any::<i32>(), 0..8).prop_map(|xs| {
            let items = xs.into_iter().map(Value::from).collect::<Vec<_>>();
            (DataValue::from(items), DataFormat::List)
        }),
        prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..6).prop_map(|m| {
            let map = m.into_iter().map(|(k, v)| (k, Value::from(v))).collect::<serde_json::Map<_, _>>();
            (DataValue::from(map), DataFormat::Dict)
        }),
    ]
}

proptest! {
    #[test]
    fn prop_data_format_follows_representation((value, expected) in data_value()) {
        let message = builder().data(DataMessage::new("dev", value)).unwrap();
        let envelope: DataEnvelope = serde_json::from_str(&message.payload).unwrap();
        prop_assert_eq!(envelope.data_format, expected);
        if expected != DataFormat::String {
            prop_assert!(envelope.data_delimiter.is_none());
        }
        match expected {
            DataFormat::Dict => prop_assert!(envelope.data.is_object()),
            DataFormat::List => prop_assert!(envelope.data.is_array()),
            DataFormat::String => prop_assert!(envelope.data.is_string()),
        }
    }
}
