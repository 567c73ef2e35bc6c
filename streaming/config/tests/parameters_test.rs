// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use streaming_config::Parameters;

#[test]
fn default_parameters_are_sane() {
    let parameters = Parameters::default();
    assert!(parameters.worker_threads >= 1);
    assert!(parameters.partitions >= 1);
    // A single buffer must be able to carry at least one 40-byte join record.
    assert!(parameters.buffer_size_bytes >= 64);
    assert!(parameters.pooled_buffers >= parameters.worker_threads);
    assert!(parameters.watermark_log_capacity >= 2);
}

#[test]
fn missing_fields_fall_back_to_defaults() {
    let parameters: Parameters = serde_json::from_str("{}").expect("empty config should parse");
    let defaults = Parameters::default();
    assert_eq!(parameters.worker_threads, defaults.worker_threads);
    assert_eq!(parameters.partitions, defaults.partitions);
    assert_eq!(parameters.buffer_size_bytes, defaults.buffer_size_bytes);
    assert_eq!(parameters.status_wait, defaults.status_wait);
}

#[test]
fn explicit_fields_override_defaults() {
    let parameters: Parameters =
        serde_json::from_str(r#"{"worker_threads": 8, "partitions": 2}"#)
            .expect("partial config should parse");
    assert_eq!(parameters.worker_threads, 8);
    assert_eq!(parameters.partitions, 2);
    assert_eq!(
        parameters.buffer_size_bytes,
        Parameters::default_buffer_size_bytes()
    );
}
