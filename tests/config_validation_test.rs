//! Tests for experiment configuration validation.

use mdml_client::config::{validate, ConfigSource, DeviceDataType, ValidationMode, DEVICE_FIELDS};
use mdml_client::{auto_config, ErrorKind, MdmlError};
use proptest::prelude::*;
use serde_json::{json, Value};

fn fsp_config() -> Value {
    json!({
        "experiment": {
            "experiment_id": "fsp",
            "experiment_notes": "flame spray pyrolysis",
            "experiment_devices": ["DHT11", "CAMERA"]
        },
        "devices": [
            {
                "device_id": "DHT11",
                "device_name": "DHT11 temperature and humidity sensor",
                "device_output": "temperature and humidity",
                "device_output_rate": 1,
                "device_data_type": "text/numeric",
                "device_notes": "on the bench",
                "headers": ["time", "temperature", "humidity"],
                "data_types": ["time", "numeric", "numeric"],
                "data_units": ["nanoseconds", "celsius", "percent"],
                "influx_tags": ["time"]
            },
            {
                "device_id": "CAMERA",
                "device_name": "Webcam",
                "device_output": "frames",
                "device_output_rate": 0.5,
                "device_data_type": "image",
                "device_notes": "",
                "headers": [],
                "data_types": [],
                "data_units": []
            }
        ]
    })
}

fn section(err: MdmlError) -> String {
    match err {
        MdmlError::Schema { section, .. } => section,
        other => panic!("expected a schema error, got {other:?}"),
    }
}

#[test]
fn test_valid_config_is_normalized() {
    let config = validate(fsp_config(), "run_1").unwrap();
    assert_eq!(config.mode(), ValidationMode::Strict);
    assert_eq!(config.experiment_id(), "FSP");
    assert_eq!(config.run_id(), "run_1");
    assert_eq!(config.document()["experiment"]["experiment_run_id"], "run_1");
    assert_eq!(config.document()["experiment"]["experiment_id"], "FSP");

    let typed = config.experiment().unwrap();
    assert_eq!(typed.devices.len(), 2);
    assert_eq!(typed.device("dht11").unwrap().headers.len(), 3);
    assert_eq!(typed.device("camera").unwrap().device_data_type, DeviceDataType::Image);

    let reparsed: Value = serde_json::from_str(config.as_text()).unwrap();
    assert_eq!(&reparsed, config.document());
}

#[test]
fn test_text_input_is_parsed() {
    let text = fsp_config().to_string();
    assert!(validate(ConfigSource::Text(text), "").is_ok());
}

#[test]
fn test_empty_run_id_leaves_document_alone() {
    let config = validate(fsp_config(), "").unwrap();
    assert!(config.document()["experiment"].get("experiment_run_id").is_none());
}

#[test]
fn test_malformed_text_is_parse_error() {
    assert_eq!(validate("{not json", "").unwrap_err().kind(), ErrorKind::Parse);
    assert_eq!(validate("[1, 2, 3]", "").unwrap_err().kind(), ErrorKind::Parse);
}

#[test]
fn test_missing_top_level_keys_name_the_key() {
    for key in ["experiment", "devices"] {
        let mut config = fsp_config();
        config.as_object_mut().unwrap().remove(key);
        assert_eq!(section(validate(config, "").unwrap_err()), key);
    }
}

#[test]
fn test_missing_experiment_fields() {
    for field in ["experiment_id", "experiment_notes", "experiment_devices"] {
        let mut config = fsp_config();
        config["experiment"].as_object_mut().unwrap().remove(field);
        let err = validate(config, "").unwrap_err();
        assert!(err.to_string().contains(field));
        assert_eq!(section(err), "experiment");
    }
}

#[test]
fn test_every_missing_device_field_is_schema_error() {
    for device in 0..2 {
        for field in DEVICE_FIELDS {
            let mut config = fsp_config();
            config["devices"][device].as_object_mut().unwrap().remove(field);
            let err = validate(config, "").unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
            assert_eq!(section(err), "devices", "device {device} field {field}");
        }
    }
}

#[test]
fn test_column_lengths_must_match() {
    let mut config = fsp_config();
    config["devices"][0]["data_units"] = json!(["celsius"]);
    assert_eq!(section(validate(config, "").unwrap_err()), "devices");
}

#[test]
fn test_zero_columns_only_for_images() {
    let mut config = fsp_config();
    config["devices"][1]["device_data_type"] = json!("text/numeric");
    assert_eq!(section(validate(config, "").unwrap_err()), "devices");
}

#[test]
fn test_duplicate_and_unknown_devices() {
    let mut config = fsp_config();
    config["devices"][1]["device_id"] = json!("DHT11");
    assert_eq!(section(validate(config, "").unwrap_err()), "devices");

    let mut config = fsp_config();
    config["experiment"]["experiment_devices"] = json!(["DHT11", "NOPE"]);
    assert_eq!(section(validate(config, "").unwrap_err()), "experiment");
}

#[test]
fn test_device_ids_differing_only_in_case_collide() {
    let mut config = fsp_config();
    config["devices"][1]["device_id"] = json!("dht11");
    config["experiment"]["experiment_devices"] = json!(["DHT11", "dht11"]);
    let err = validate(config, "").unwrap_err();
    assert_eq!(section(err), "devices");
}

#[test]
fn test_experiment_devices_match_case_insensitively() {
    let mut config = fsp_config();
    config["experiment"]["experiment_devices"] = json!(["dht11", "Camera"]);
    assert!(validate(config, "").is_ok());
}

#[test]
fn test_negative_rate_rejected() {
    let mut config = fsp_config();
    config["devices"][0]["device_output_rate"] = json!(-1);
    assert_eq!(section(validate(config, "").unwrap_err()), "devices");
}

#[test]
fn test_tags_must_be_headers() {
    let mut config = fsp_config();
    config["devices"][0]["influx_tags"] = json!(["pressure"]);
    assert_eq!(section(validate(config, "").unwrap_err()), "devices");
}

#[test]
fn test_auto_config_skeleton() {
    let config = auto_config("fsp", "run_2").unwrap();
    assert_eq!(config.mode(), ValidationMode::Auto);
    assert!(config.allows_device_inference());
    assert!(config.experiment().is_none());
    assert_eq!(config.document()["auto"], json!(true));
    assert_eq!(config.document()["devices"], json!([]));
    assert_eq!(config.document()["experiment"]["experiment_id"], "FSP");
    assert_eq!(auto_config("fsp", "bad id").unwrap_err().kind(), ErrorKind::Format);
}

#[test]
fn test_token_is_merged() {
    let config = validate(fsp_config(), "").unwrap().with_token("tok").unwrap();
    assert_eq!(config.document()["globus_token"], "tok");
    assert!(config.as_text().contains("\"globus_token\":\"tok\""));
}

proptest! {
    #[test]
    fn prop_run_ids_in_alphabet_are_accepted(run_id in "[A-Za-z0-9_]{0,24}") {
        let config = validate(fsp_config(), &run_id).unwrap();
        prop_assert_eq!(config.run_id(), run_id.as_str());
    }

    #[test]
    fn prop_run_ids_outside_alphabet_are_format_errors(
        prefix in "[A-Za-z0-9_]{0,8}",
        bad in "[^A-Za-z0-9_]",
        suffix in "[A-Za-z0-9_]{0,8}",
    ) {
        let run_id = format!("{prefix}{bad}{suffix}");
        let err = validate(fsp_config(), &run_id).unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::Format);
    }
}
