use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tether_core::{EndpointId, SerializedNode};
use tether_ipc::MemoryTransport;
use tether_rpc::{
    Function, Hub, Object, StandardHost, TetherError, Value, WriteChannel,
};

struct Window;

fn hub() -> Hub {
    Hub::with_transport(MemoryTransport::default())
}

fn roundtrip(hub: &Hub, value: &Value) -> Value {
    let node = hub.serialize(value).expect("serialize");
    hub.deserialize(node).expect("deserialize")
}

fn wire(hub: &Hub, value: &Value) -> serde_json::Value {
    let text = serde_json::to_string(&hub.serialize(value).expect("serialize")).expect("text");
    serde_json::from_str(&text).expect("json")
}

fn decode_text(hub: &Hub, text: &str) -> Result<Value, TetherError> {
    let node: SerializedNode = serde_json::from_str(text).expect("node json");
    hub.deserialize(node)
}

#[test]
fn primitives_roundtrip_including_number_sentinels() {
    let hub = hub();

    assert_eq!(wire(&hub, &Value::Number(-0.0)), json!({"type": "number", "value": "-0"}));
    assert_eq!(wire(&hub, &Value::Number(f64::NAN)), json!({"type": "number", "value": "NaN"}));
    assert_eq!(
        wire(&hub, &Value::Number(f64::INFINITY)),
        json!({"type": "number", "value": "+Infinity"})
    );
    assert_eq!(wire(&hub, &Value::Undefined), json!({"type": "undefined"}));

    assert!(roundtrip(&hub, &Value::Number(f64::NAN)).as_number().expect("number").is_nan());
    let zero = roundtrip(&hub, &Value::Number(-0.0)).as_number().expect("number");
    assert!(zero == 0.0 && zero.is_sign_negative());
    assert_eq!(
        roundtrip(&hub, &Value::Number(f64::NEG_INFINITY)).as_number(),
        Some(f64::NEG_INFINITY)
    );
    assert_eq!(roundtrip(&hub, &Value::Number(1.5)).as_number(), Some(1.5));
    assert_eq!(roundtrip(&hub, &Value::from("text")).as_str(), Some("text"));
    assert_eq!(roundtrip(&hub, &Value::Bool(true)).as_bool(), Some(true));
    assert!(roundtrip(&hub, &Value::Null).is_null());
    assert!(roundtrip(&hub, &Value::Undefined).is_undefined());
}

#[test]
fn shared_reference_is_emitted_once() {
    let hub = hub();
    let shared = Value::object([("k", Value::from(1))]);
    let root = Value::array(vec![shared.clone(), shared]);

    assert_eq!(
        wire(&hub, &root),
        json!({
            "type": "array",
            "value": [
                {"type": "object", "value": {"k": {"type": "number", "value": 1.0}}, "objectId": 0},
                {"type": "object", "objectId": 0}
            ]
        })
    );

    let rebuilt = roundtrip(&hub, &root);
    let items = rebuilt.as_array().expect("array").items();
    let first = items[0].as_object().expect("object");
    let second = items[1].as_object().expect("object");
    assert!(first.ptr_eq(second));
    assert_eq!(first.get("k").and_then(|v| v.as_number()), Some(1.0));
}

#[test]
fn self_reference_keeps_identity() {
    let hub = hub();
    let object = Object::new();
    object.insert("name", Value::from("loop"));
    object.insert("self", Value::Object(object.clone()));
    let root = Value::Object(object);

    assert_eq!(
        wire(&hub, &root),
        json!({
            "type": "object",
            "value": {
                "name": {"type": "string", "value": "loop"},
                "self": {"type": "object", "objectId": 0}
            },
            "objectId": 0
        })
    );

    let rebuilt = roundtrip(&hub, &root);
    let rebuilt = rebuilt.as_object().expect("object");
    let inner = rebuilt.get("self").expect("self member");
    assert!(inner.as_object().expect("object").ptr_eq(rebuilt));
    assert_eq!(rebuilt.keys(), ["name", "self"]);
}

#[test]
fn deep_nesting_does_not_exhaust_the_stack() {
    const DEPTH: usize = 100_000;
    let hub = hub();
    let mut value = Value::array(Vec::new());
    for _ in 1..DEPTH {
        value = Value::array(vec![value]);
    }

    let node = hub.serialize(&value).expect("serialize");
    drop(value);
    let rebuilt = hub.deserialize(node).expect("deserialize");

    let mut depth = 1;
    let mut current = rebuilt.clone();
    while let Some(next) = current.as_array().and_then(|array| array.get(0)) {
        depth += 1;
        current = next;
    }
    assert_eq!(depth, DEPTH);
}

#[test]
fn maps_keep_non_string_keys_and_order() {
    let hub = hub();
    let key = Value::object([("id", Value::from(7))]);
    let map = Value::map([
        (Value::Number(1.0), Value::from("one")),
        (key.clone(), Value::from("object")),
        (Value::Bool(false), key),
    ]);

    let rebuilt = roundtrip(&hub, &map);
    let entries = rebuilt.as_map().expect("map").entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].0.as_number(), Some(1.0));
    assert_eq!(entries[0].1.as_str(), Some("one"));

    let key_object = entries[1].0.as_object().expect("object key");
    let value_object = entries[2].1.as_object().expect("object value");
    assert!(key_object.ptr_eq(value_object));
    assert_eq!(
        rebuilt
            .as_map()
            .expect("map")
            .get(&Value::Number(1.0))
            .and_then(|v| v.as_str().map(str::to_owned)),
        Some("one".to_owned())
    );
}

#[test]
fn sets_roundtrip() {
    let hub = hub();
    let set = Value::set(vec![Value::from(1), Value::from("a")]);

    assert_eq!(wire(&hub, &set)["type"], json!("set"));
    let rebuilt = roundtrip(&hub, &set);
    let rebuilt = rebuilt.as_set().expect("set");
    assert_eq!(rebuilt.len(), 2);
    assert!(rebuilt.contains(&Value::from("a")));
}

#[test]
fn unknown_error_kinds_fall_back_to_error() {
    let hub = hub();

    let custom = roundtrip(&hub, &Value::error("BoomError", "kaboom"));
    let custom = custom.as_error().expect("error");
    assert_eq!(custom.kind(), "Error");
    assert_eq!(custom.message(), "kaboom");

    let standard = roundtrip(&hub, &Value::error("RangeError", "too big"));
    assert_eq!(standard.as_error().expect("error").kind(), "RangeError");
}

#[test]
fn host_objects_are_unsupported() {
    let host = StandardHost::new().with_category::<Window>("window");
    let hub = Hub::new(Arc::new(MemoryTransport::default()), Arc::new(host));

    let err = hub
        .serialize(&Value::array(vec![Value::host(Window)]))
        .expect_err("host object");
    match &err {
        TetherError::UnsupportedType { type_name } => assert_eq!(type_name, "window"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("RemoteHandle"));
}

#[test]
fn handles_resolve_locally_and_stay_opaque_elsewhere() {
    let local = hub();
    let remote = hub();
    let pinned = Value::array(vec![Value::from("pinned")]);
    let handle = local.register_handle(pinned.clone());
    let value = Value::Handle(handle.clone());

    assert_eq!(
        wire(&local, &value),
        json!({
            "type": "remoteobject",
            "value": {"type": "array", "objectId": handle.handle_id.to_string()}
        })
    );

    let resolved = roundtrip(&local, &value);
    assert!(
        resolved
            .as_array()
            .expect("local value")
            .ptr_eq(pinned.as_array().expect("array"))
    );

    let node = local.serialize(&value).expect("serialize");
    let foreign = remote.deserialize(node).expect("deserialize");
    assert_eq!(foreign.as_handle(), Some(&handle));

    assert!(local.handles().release(&handle));
    assert!(roundtrip(&local, &value).as_handle().is_some());
}

#[test]
fn write_channels_travel_as_endpoint_ids() {
    let hub = hub();
    let endpoint = EndpointId::from("inbox-7");
    let value = Value::Channel(WriteChannel::new(&hub, endpoint.clone()));

    assert_eq!(wire(&hub, &value), json!({"type": "sendchannel", "value": "inbox-7"}));
    let rebuilt = roundtrip(&hub, &value);
    assert_eq!(rebuilt.as_channel().expect("channel").endpoint(), &endpoint);
}

#[test]
fn dates_regexps_and_bigints_roundtrip() {
    let hub = hub();
    let date: DateTime<Utc> = DateTime::parse_from_rfc3339("2024-01-02T03:04:05.678Z")
        .expect("date")
        .with_timezone(&Utc);

    assert_eq!(
        wire(&hub, &Value::Date(date)),
        json!({"type": "date", "value": "2024-01-02T03:04:05.678Z"})
    );
    assert_eq!(roundtrip(&hub, &Value::Date(date)).as_date(), Some(&date));

    let regexp = roundtrip(&hub, &Value::regexp("a+b", "gi"));
    let regexp = regexp.as_regexp().expect("regexp");
    assert_eq!((regexp.pattern.as_str(), regexp.flags.as_str()), ("a+b", "gi"));

    let big = 1_i128 << 100;
    assert_eq!(
        wire(&hub, &Value::BigInt(big)),
        json!({"type": "bigint", "value": "1267650600228229401496703205376"})
    );
    assert_eq!(roundtrip(&hub, &Value::BigInt(big)).as_bigint(), Some(big));
}

#[test]
fn functions_need_a_host_definition() {
    let increment = Function::sync("(x) => x + 1", |_| Ok(Value::Undefined));
    let caller = hub();
    let node = caller
        .serialize(&Value::Function(increment.clone()))
        .expect("serialize");
    assert_eq!(
        serde_json::to_value(&node).expect("json"),
        json!({"type": "function", "value": "(x) => x + 1"})
    );

    let err = caller.deserialize(node).expect_err("unknown function");
    assert!(matches!(err, TetherError::UnknownFunction { .. }));

    let host = StandardHost::new().with_function(increment.clone());
    let callee = Hub::new(Arc::new(MemoryTransport::default()), Arc::new(host));
    let node = caller
        .serialize(&Value::Function(increment.clone()))
        .expect("serialize");
    let compiled = callee.deserialize(node).expect("compiled");
    assert!(compiled.as_function().expect("function").ptr_eq(&increment));
}

#[test]
fn malformed_nodes_are_rejected() {
    let hub = hub();
    let decode = |text: &str| decode_text(&hub, text);

    for text in [
        r#"{"type":"array","value":[{"type":"object","objectId":3}]}"#,
        r#"{"type":"number","value":"Infinity"}"#,
        r#"{"type":"array"}"#,
        r#"{"type":"date","value":"yesterday"}"#,
        r#"{"type":"bigint","value":"12x"}"#,
        r#"{"type":"string","objectId":0}"#,
        r#"{"type":"array","value":[{"type":"string","objectId":0},{"type":"string","value":"a","objectId":0}]}"#,
    ] {
        assert!(
            matches!(decode(text), Err(TetherError::MalformedMessage(_))),
            "{text} should be malformed"
        );
    }

    assert!(serde_json::from_str::<SerializedNode>(r#"{"type":"symbol"}"#).is_err());
}

#[test]
fn any_node_kind_can_be_referenced_by_object_id() {
    let hub = hub();

    let strings = decode_text(
        &hub,
        r#"{"type":"array","value":[{"type":"string","value":"a","objectId":0},{"type":"string","objectId":0}]}"#,
    )
    .expect("string references");
    let items = strings.as_array().expect("array").items();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_str(), Some("a"));
    assert_eq!(items[1].as_str(), Some("a"));

    let mixed = decode_text(
        &hub,
        r#"{"type":"object","value":{
            "n":{"type":"number","value":"NaN","objectId":1},
            "when":{"type":"date","value":"2024-05-06T07:08:09.010Z","objectId":2},
            "again":{"type":"array","value":[{"type":"date","objectId":2},{"type":"number","objectId":1}]}
        }}"#,
    )
    .expect("mixed references");
    let object = mixed.as_object().expect("object");
    let again = object.get("again").expect("again");
    let again = again.as_array().expect("array");
    assert_eq!(
        again.get(0).and_then(|date| date.as_date().copied()),
        object.get("when").and_then(|date| date.as_date().copied())
    );
    assert!(
        again
            .get(1)
            .and_then(|number| number.as_number())
            .is_some_and(f64::is_nan)
    );
}
