use serde::Serialize;
use serde_json::json;
use tether_core::{
    CallId, CallOutcome, Command, ControlFrame, EndpointId, ErrorRecord, ExceptionDetails,
    ExecuteScriptParams, Fields, PostMessageParams, RequestHeader, RpcRequest, RpcResponse,
    SerializedNode, WireNumber,
};

fn encode<T: Serialize>(value: &T) -> (String, serde_json::Value) {
    let text = serde_json::to_string(value).expect("encode should succeed");
    let json = serde_json::from_str(&text).expect("encoded text should be json");
    (text, json)
}

fn string(value: &str) -> SerializedNode {
    SerializedNode::String {
        value: Some(value.to_string()),
        object_id: None,
    }
}

fn number(value: f64) -> SerializedNode {
    SerializedNode::Number {
        value: Some(WireNumber::Finite(value)),
        object_id: None,
    }
}

#[test]
fn request_roundtrip_json() {
    let input = RpcRequest {
        id: CallId(3),
        command: Command::ExecuteScript(ExecuteScriptParams {
            function: SerializedNode::Function {
                value: Some("(x)=>x+1".to_string()),
                object_id: None,
            },
            args: vec![number(41.0)],
        }),
        resp_channel: Some(SerializedNode::SendChannel {
            value: Some(EndpointId::from("inbox-1")),
            object_id: None,
        }),
    };

    let (text, encoded) = encode(&input);
    assert_eq!(
        encoded,
        json!({
            "id": 3,
            "command": "executeScript",
            "params": {
                "fn": {"type": "function", "value": "(x)=>x+1"},
                "args": [{"type": "number", "value": 41.0}]
            },
            "respChannel": {"type": "sendchannel", "value": "inbox-1"}
        })
    );

    let decoded: RpcRequest = serde_json::from_str(&text).expect("request decode should succeed");
    assert_eq!(decoded, input);
}

#[test]
fn request_members_may_come_in_any_order() {
    let text = r#"{
        "respChannel": {"type": "sendchannel", "value": "inbox-3"},
        "params": {"msg": {"type": "string", "value": "hi"}},
        "extra": [1, {"ignored": true}],
        "command": "postMessage",
        "id": 4
    }"#;
    let decoded: RpcRequest = serde_json::from_str(text).expect("request decode should succeed");
    assert_eq!(decoded.id, CallId(4));
    assert_eq!(
        decoded.command,
        Command::PostMessage(PostMessageParams { msg: string("hi") })
    );
    assert!(decoded.resp_channel.is_some());
}

#[test]
fn post_message_request_omits_response_channel() {
    let input = RpcRequest {
        id: CallId(0),
        command: Command::PostMessage(PostMessageParams {
            msg: string("hi"),
        }),
        resp_channel: None,
    };

    let text = serde_json::to_string(&input).expect("request encode should succeed");
    assert!(!text.contains("respChannel"));

    let decoded: RpcRequest = serde_json::from_str(&text).expect("request decode should succeed");
    assert_eq!(decoded, input);
}

#[test]
fn header_survives_unknown_command() {
    let raw = r#"{
        "id": 9,
        "command": "navigate",
        "params": {},
        "respChannel": {"type": "sendchannel", "value": "inbox-2"}
    }"#;

    assert!(serde_json::from_str::<RpcRequest>(raw).is_err());

    let header: RequestHeader = serde_json::from_str(raw).expect("header should decode");
    assert_eq!(header.id, CallId(9));
    assert!(matches!(
        header.resp_channel,
        Some(SerializedNode::SendChannel { .. })
    ));
}

#[test]
fn response_roundtrip_json() {
    let ok = RpcResponse {
        id: CallId(1),
        result: CallOutcome {
            result: Some(number(42.0)),
            exception_details: None,
        },
    };
    let (_, encoded) = encode(&ok);
    assert_eq!(
        encoded,
        json!({"id": 1, "result": {"result": {"type": "number", "value": 42.0}}})
    );

    let failed = RpcResponse {
        id: CallId(2),
        result: CallOutcome {
            result: None,
            exception_details: Some(ExceptionDetails {
                text: "Error: boom".to_string(),
                line_number: 0,
                column_number: 0,
                exception: SerializedNode::Error {
                    value: Some(ErrorRecord {
                        kind: "Error".to_string(),
                        message: "boom".to_string(),
                        line_number: None,
                        column_number: None,
                        file_name: None,
                        stack: None,
                    }),
                    object_id: None,
                },
            }),
        },
    };
    let (text, encoded) = encode(&failed);
    assert_eq!(
        encoded["result"]["exceptionDetails"]["exception"],
        json!({"type": "error", "value": {"type": "Error", "message": "boom"}})
    );
    assert_eq!(encoded["result"]["exceptionDetails"]["lineNumber"], json!(0));

    let decoded: RpcResponse =
        serde_json::from_str(&text).expect("response decode should succeed");
    assert_eq!(decoded, failed);
}

#[test]
fn control_frames_are_pairs() {
    assert_eq!(encode(&ControlFrame::Pause).0, r#"["pause",null]"#);
    let message = ControlFrame::message(&json!({"a": 1})).expect("message frame");
    assert_eq!(encode(&message).0, r#"["message",{"a":1}]"#);

    let decoded: ControlFrame =
        serde_json::from_str(r#"["message", null]"#).expect("decode null message");
    assert_eq!(decoded, ControlFrame::message(&()).expect("null message"));

    let decoded: ControlFrame =
        serde_json::from_str(r#"["delete", null]"#).expect("decode delete");
    assert_eq!(decoded, ControlFrame::Delete);

    assert!(serde_json::from_str::<ControlFrame>(r#"["reboot", null]"#).is_err());
}

#[test]
fn reference_nodes_carry_only_object_id() {
    let node = SerializedNode::Array {
        value: Some(vec![
            SerializedNode::Object {
                value: Some(Fields(vec![(
                    "k".to_string(),
                    SerializedNode::Boolean {
                        value: Some(true),
                        object_id: None,
                    },
                )])),
                object_id: Some(0),
            },
            SerializedNode::Object {
                value: None,
                object_id: Some(0),
            },
        ]),
        object_id: None,
    };

    let (text, encoded) = encode(&node);
    assert_eq!(
        encoded,
        json!({
            "type": "array",
            "value": [
                {"type": "object", "value": {"k": {"type": "boolean", "value": true}}, "objectId": 0},
                {"type": "object", "objectId": 0}
            ]
        })
    );

    let decoded: SerializedNode =
        serde_json::from_str(&text).expect("node decode should succeed");
    assert_eq!(decoded, node);
    match &decoded {
        SerializedNode::Array {
            value: Some(children),
            ..
        } => {
            assert!(!children[0].is_reference());
            assert!(children[1].is_reference());
        }
        other => panic!("unexpected node: {other:?}"),
    }
}

#[test]
fn object_fields_keep_insertion_order() {
    let text = r#"{"type":"object","value":{"z":{"type":"null"},"a":{"type":"undefined"}}}"#;
    let node: SerializedNode = serde_json::from_str(text).expect("node decode should succeed");
    match &node {
        SerializedNode::Object {
            value: Some(Fields(fields)),
            ..
        } => {
            let keys: Vec<&str> = fields.iter().map(|(key, _)| key.as_str()).collect();
            assert_eq!(keys, ["z", "a"]);
        }
        other => panic!("unexpected node: {other:?}"),
    }
    assert_eq!(serde_json::to_string(&node).expect("node encode"), text);
}

#[test]
fn number_sentinels_decode_as_strings() {
    let node: SerializedNode =
        serde_json::from_str(r#"{"type":"number","value":"-Infinity"}"#).expect("decode");
    assert_eq!(
        node,
        SerializedNode::Number {
            value: Some(WireNumber::Sentinel("-Infinity".to_string())),
            object_id: None,
        }
    );
}

#[test]
fn unknown_node_type_is_rejected() {
    let result = serde_json::from_str::<SerializedNode>(r#"{"type":"symbol","value":"x"}"#);
    assert!(result.is_err());
}

#[test]
fn primitive_nodes_may_carry_object_ids() {
    let text = r#"{"type":"array","value":[{"type":"string","value":"a","objectId":0},{"type":"string","objectId":0}]}"#;
    let node: SerializedNode = serde_json::from_str(text).expect("node decode should succeed");
    let SerializedNode::Array {
        value: Some(children),
        ..
    } = &node
    else {
        panic!("unexpected node: {node:?}");
    };
    assert_eq!(
        children[0],
        SerializedNode::String {
            value: Some("a".to_string()),
            object_id: Some(0),
        }
    );
    assert!(!children[0].is_reference());
    assert!(children[1].is_reference());
    assert_eq!(serde_json::to_string(&node).expect("node encode"), text);
}

#[test]
fn deep_nodes_cross_serde_json() {
    const DEPTH: usize = 100_000;
    let text = format!(
        "{}{}",
        r#"{"type":"array","value":["#.repeat(DEPTH),
        "]}".repeat(DEPTH)
    );
    let request = format!(r#"{{"id":1,"command":"postMessage","params":{{"msg":{text}}}}}"#);

    let decoded: RpcRequest = serde_json::from_str(&request).expect("deep request should decode");
    let reencoded = serde_json::to_string(&decoded).expect("deep request should encode");
    assert_eq!(reencoded, request);
}
