//! Wire format compliance tests.
//!
//! Checks that request and response envelopes match the JSON documents the
//! host application exchanges with the worker.

use sd_bridge::protocol::encode;
use sd_bridge::{BridgeError, InboundMessage, RequestEnvelope, RequestKind, ResponseEnvelope};
use serde_json::{json, Map, Value};

// ============================================================================
// Request Envelope
// ============================================================================

#[test]
fn test_request_txt2img_wire_shape() {
    let options = json!({"prompt": "a cat", "seed": 42});
    let request = RequestEnvelope::new(
        RequestKind::Txt2img,
        options.as_object().cloned().unwrap(),
    );
    let parsed: Value = serde_json::from_slice(&encode(&request.to_value()).unwrap()).unwrap();

    assert_eq!(parsed["type"], "txt2img");
    assert_eq!(parsed["options"]["prompt"], "a cat");
    assert_eq!(parsed["options"]["seed"], 42);
    assert_eq!(parsed.as_object().unwrap().len(), 2);
}

#[test]
fn test_request_serde_matches_to_value() {
    let request = RequestEnvelope::new(RequestKind::Img2img, Map::new());
    assert_eq!(serde_json::to_value(&request).unwrap(), request.to_value());
}

#[test]
fn test_request_img2img_deserialization() {
    let wire = br#"{"type":"img2img","options":{"init_img":"/tmp/in.png","strength":0.75}}"#;
    let request = RequestEnvelope::from_wire(wire).unwrap();
    assert_eq!(request.kind, RequestKind::Img2img);
    assert_eq!(request.options["init_img"], "/tmp/in.png");
    assert_eq!(request.options["strength"], 0.75);
}

#[test]
fn test_request_options_pass_through_untouched() {
    let options = json!({
        "prompt": "a cat",
        "nested": {"steps": [1, 2, 3], "sampler": null},
        "unicode": "猫 🐱"
    });
    let wire = serde_json::to_vec(&json!({"type": "txt2img", "options": options})).unwrap();
    let request = RequestEnvelope::from_wire(&wire).unwrap();
    assert_eq!(Value::Object(request.options), options);
}

#[test]
fn test_request_null_options_is_empty() {
    let request = RequestEnvelope::from_wire(br#"{"type":"txt2img","options":null}"#).unwrap();
    assert!(request.options.is_empty());
}

#[test]
fn test_request_extra_fields_ignored() {
    let request =
        RequestEnvelope::from_wire(br#"{"type":"txt2img","options":{},"id":7}"#).unwrap();
    assert_eq!(request.kind, RequestKind::Txt2img);
}

#[test]
fn test_request_rejections_are_protocol_errors() {
    let cases: &[&[u8]] = &[
        b"",
        b"not json",
        b"[1,2,3]",
        br#"{"options":{}}"#,
        br#"{"type":"upscale"}"#,
        br#"{"type":7}"#,
        br#"{"type":"txt2img","options":[1]}"#,
        br#"{"type":"txt2img""#,
    ];
    for case in cases {
        let err = RequestEnvelope::from_wire(case).unwrap_err();
        assert!(
            matches!(err, BridgeError::Protocol(_)),
            "{:?} gave {:?}",
            String::from_utf8_lossy(case),
            err
        );
    }
}

#[test]
fn test_request_kind_names() {
    assert_eq!(RequestKind::Txt2img.to_string(), "txt2img");
    assert_eq!(RequestKind::parse("img2img"), Some(RequestKind::Img2img));
    assert_eq!(RequestKind::parse("TXT2IMG"), None);
}

// ============================================================================
// Response Envelope
// ============================================================================

#[test]
fn test_response_wire_shape() {
    let wire = ResponseEnvelope::from_result_bytes(br#"["/tmp/out1.png"]"#)
        .to_wire()
        .unwrap();
    assert_eq!(wire, br#"{"response":["/tmp/out1.png"]}"#.to_vec());
}

#[test]
fn test_response_object_result() {
    let env = ResponseEnvelope::from_result_bytes(br#"{"images":["/tmp/a.png"],"seed":42}"#);
    assert_eq!(env.response, json!({"images": ["/tmp/a.png"], "seed": 42}));
}

#[test]
fn test_response_non_utf8_result_is_lossy_string() {
    let env = ResponseEnvelope::from_result_bytes(&[0xff, b'o', b'k']);
    assert_eq!(env.response, json!("\u{fffd}ok"));
}

#[test]
fn test_inbound_classification() {
    assert_eq!(
        InboundMessage::classify(br#"{"response":null}"#).unwrap(),
        InboundMessage::Response(ResponseEnvelope { response: Value::Null })
    );
    assert!(matches!(
        InboundMessage::classify(br#""just a string""#).unwrap(),
        InboundMessage::Other(Value::String(_))
    ));
    assert!(matches!(
        InboundMessage::classify(b"{").unwrap_err(),
        BridgeError::Protocol(_)
    ));
}
