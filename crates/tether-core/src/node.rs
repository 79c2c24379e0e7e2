//! Tagged wire form of one value graph.
//!
//! Node trees are written to and read from JSON text with explicit work
//! lists, so any nesting depth crosses the wire. The serde impls of
//! [`SerializedNode`] go through that text form and carry it as a
//! [`RawValue`]; they only work with `serde_json`.

use serde::{
    Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned, de::Error as _,
    ser::Error as _,
};
use serde_json::value::RawValue;

use crate::{
    CoreError, EndpointId, HandleId,
    scan::{Body, Item, scan},
};

/// Tagged wire representation of one value.
///
/// Any node may carry an `objectId`. A node with an `objectId` and no
/// `value` refers back to the node that was emitted earlier in the same
/// message with that id. `undefined` and `null` never carry a value.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedNode {
    Undefined {
        object_id: Option<u64>,
    },
    Null {
        object_id: Option<u64>,
    },
    String {
        value: Option<String>,
        object_id: Option<u64>,
    },
    Boolean {
        value: Option<bool>,
        object_id: Option<u64>,
    },
    Number {
        value: Option<WireNumber>,
        object_id: Option<u64>,
    },
    /// Decimal digits of an arbitrary-width integer.
    Bigint {
        value: Option<String>,
        object_id: Option<u64>,
    },
    /// Source text, compiled by the receiving host.
    Function {
        value: Option<String>,
        object_id: Option<u64>,
    },
    RemoteObject {
        value: Option<HandleDescriptor>,
        object_id: Option<u64>,
    },
    /// Endpoint id of a write channel.
    SendChannel {
        value: Option<EndpointId>,
        object_id: Option<u64>,
    },
    Regexp {
        value: Option<RegExpSource>,
        object_id: Option<u64>,
    },
    /// ISO-8601 UTC timestamp.
    Date {
        value: Option<String>,
        object_id: Option<u64>,
    },
    Error {
        value: Option<ErrorRecord>,
        object_id: Option<u64>,
    },
    Array {
        value: Option<Vec<SerializedNode>>,
        object_id: Option<u64>,
    },
    Set {
        value: Option<Vec<SerializedNode>>,
        object_id: Option<u64>,
    },
    Object {
        value: Option<Fields>,
        object_id: Option<u64>,
    },
    Map {
        value: Option<Vec<(SerializedNode, SerializedNode)>>,
        object_id: Option<u64>,
    },
}

impl SerializedNode {
    pub const UNDEFINED: SerializedNode = SerializedNode::Undefined { object_id: None };
    pub const NULL: SerializedNode = SerializedNode::Null { object_id: None };

    /// Wire `type` tag of this node.
    pub fn kind(&self) -> &'static str {
        match self {
            SerializedNode::Undefined { .. } => "undefined",
            SerializedNode::Null { .. } => "null",
            SerializedNode::String { .. } => "string",
            SerializedNode::Boolean { .. } => "boolean",
            SerializedNode::Number { .. } => "number",
            SerializedNode::Bigint { .. } => "bigint",
            SerializedNode::Function { .. } => "function",
            SerializedNode::RemoteObject { .. } => "remoteobject",
            SerializedNode::SendChannel { .. } => "sendchannel",
            SerializedNode::Regexp { .. } => "regexp",
            SerializedNode::Date { .. } => "date",
            SerializedNode::Error { .. } => "error",
            SerializedNode::Array { .. } => "array",
            SerializedNode::Set { .. } => "set",
            SerializedNode::Object { .. } => "object",
            SerializedNode::Map { .. } => "map",
        }
    }

    pub fn object_id(&self) -> Option<u64> {
        match self {
            SerializedNode::Undefined { object_id }
            | SerializedNode::Null { object_id }
            | SerializedNode::String { object_id, .. }
            | SerializedNode::Boolean { object_id, .. }
            | SerializedNode::Number { object_id, .. }
            | SerializedNode::Bigint { object_id, .. }
            | SerializedNode::Function { object_id, .. }
            | SerializedNode::RemoteObject { object_id, .. }
            | SerializedNode::SendChannel { object_id, .. }
            | SerializedNode::Regexp { object_id, .. }
            | SerializedNode::Date { object_id, .. }
            | SerializedNode::Error { object_id, .. }
            | SerializedNode::Array { object_id, .. }
            | SerializedNode::Set { object_id, .. }
            | SerializedNode::Object { object_id, .. }
            | SerializedNode::Map { object_id, .. } => *object_id,
        }
    }

    /// True if the node carries a `value` member.
    pub fn has_value(&self) -> bool {
        match self {
            SerializedNode::Undefined { .. } | SerializedNode::Null { .. } => false,
            SerializedNode::String { value, .. }
            | SerializedNode::Bigint { value, .. }
            | SerializedNode::Function { value, .. }
            | SerializedNode::Date { value, .. } => value.is_some(),
            SerializedNode::Boolean { value, .. } => value.is_some(),
            SerializedNode::Number { value, .. } => value.is_some(),
            SerializedNode::RemoteObject { value, .. } => value.is_some(),
            SerializedNode::SendChannel { value, .. } => value.is_some(),
            SerializedNode::Regexp { value, .. } => value.is_some(),
            SerializedNode::Error { value, .. } => value.is_some(),
            SerializedNode::Array { value, .. } | SerializedNode::Set { value, .. } => {
                value.is_some()
            }
            SerializedNode::Object { value, .. } => value.is_some(),
            SerializedNode::Map { value, .. } => value.is_some(),
        }
    }

    /// True for a back-reference node: an `objectId` without a `value`.
    pub fn is_reference(&self) -> bool {
        self.object_id().is_some() && !self.has_value()
    }

    /// Writes the node as JSON text.
    pub fn to_json_text(&self) -> Result<String, CoreError> {
        let mut out = String::new();
        let mut pending = vec![Emit::Node(self)];
        while let Some(emit) = pending.pop() {
            match emit {
                Emit::Node(node) => open_node(node, &mut out, &mut pending)?,
                Emit::Key(key) => {
                    out.push_str(&to_json(key)?);
                    out.push(':');
                }
                Emit::Text(text) => out.push_str(text),
                Emit::Close(bracket, object_id) => {
                    out.push(bracket);
                    close_node(&mut out, object_id);
                }
            }
        }
        Ok(out)
    }

    /// Reads a node from JSON text.
    pub fn from_json_text(text: &str) -> Result<Self, CoreError> {
        let items = scan(text)?;
        let mut drafts: Vec<Option<Draft>> = vec![None];
        let mut work = vec![(0_usize, 0_usize)];
        while let Some((item, slot)) = work.pop() {
            let draft = read_node(text, &items, item, &mut drafts, &mut work)?;
            drafts[slot] = Some(draft);
        }
        assemble(drafts)
    }

    /// Moves nested child nodes out of this node into `out`.
    fn detach_children(&mut self, out: &mut Vec<SerializedNode>) {
        match self {
            SerializedNode::Array { value, .. } | SerializedNode::Set { value, .. } => {
                if let Some(children) = value.take() {
                    out.extend(children);
                }
            }
            SerializedNode::Object { value, .. } => {
                if let Some(fields) = value.take() {
                    out.extend(fields.0.into_iter().map(|(_, child)| child));
                }
            }
            SerializedNode::Map { value, .. } => {
                if let Some(entries) = value.take() {
                    for (key, child) in entries {
                        out.push(key);
                        out.push(child);
                    }
                }
            }
            _ => {}
        }
    }
}

// Deeply nested trees are torn down with an explicit stack.
impl Drop for SerializedNode {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        self.detach_children(&mut pending);
        while let Some(mut node) = pending.pop() {
            node.detach_children(&mut pending);
        }
    }
}

impl Serialize for SerializedNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = self.to_json_text().map_err(S::Error::custom)?;
        RawValue::from_string(text)
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SerializedNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        SerializedNode::from_json_text(raw.get()).map_err(D::Error::custom)
    }
}

/// Number payload: a finite JSON number or one of the sentinel strings
/// `NaN`, `-0`, `+Infinity`, `-Infinity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireNumber {
    Finite(f64),
    Sentinel(String),
}

/// Reference to an entry in a remote handle registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleDescriptor {
    /// Classifier category of the pinned value.
    #[serde(rename = "type")]
    pub category: String,
    /// Registry key.
    #[serde(rename = "objectId")]
    pub handle_id: HandleId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegExpSource {
    pub pattern: String,
    pub flags: String,
}

/// Fields of a serialized error value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Error kind name such as `TypeError`.
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Object members in insertion order, encoded as a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(pub Vec<(String, SerializedNode)>);

/// Pending output of the node writer.
enum Emit<'a> {
    Node(&'a SerializedNode),
    Key(&'a str),
    Text(&'static str),
    /// Ends a container value, then its node.
    Close(char, Option<u64>),
}

/// Writes the start of `node`. Leaves are written whole; container children
/// are queued on `pending` in reverse.
fn open_node<'a>(
    node: &'a SerializedNode,
    out: &mut String,
    pending: &mut Vec<Emit<'a>>,
) -> Result<(), CoreError> {
    out.push_str(r#"{"type":""#);
    out.push_str(node.kind());
    out.push('"');
    let object_id = node.object_id();

    let leaf = match node {
        SerializedNode::Array {
            value: Some(items), ..
        }
        | SerializedNode::Set {
            value: Some(items), ..
        } => {
            out.push_str(r#","value":["#);
            pending.push(Emit::Close(']', object_id));
            for (index, item) in items.iter().enumerate().rev() {
                pending.push(Emit::Node(item));
                if index > 0 {
                    pending.push(Emit::Text(","));
                }
            }
            return Ok(());
        }
        SerializedNode::Object {
            value: Some(Fields(fields)),
            ..
        } => {
            out.push_str(r#","value":{"#);
            pending.push(Emit::Close('}', object_id));
            for (index, (key, item)) in fields.iter().enumerate().rev() {
                pending.push(Emit::Node(item));
                pending.push(Emit::Key(key));
                if index > 0 {
                    pending.push(Emit::Text(","));
                }
            }
            return Ok(());
        }
        SerializedNode::Map {
            value: Some(entries),
            ..
        } => {
            out.push_str(r#","value":["#);
            pending.push(Emit::Close(']', object_id));
            for (index, (key, item)) in entries.iter().enumerate().rev() {
                pending.push(Emit::Text("]"));
                pending.push(Emit::Node(item));
                pending.push(Emit::Text(","));
                pending.push(Emit::Node(key));
                pending.push(Emit::Text("["));
                if index > 0 {
                    pending.push(Emit::Text(","));
                }
            }
            return Ok(());
        }
        SerializedNode::String {
            value: Some(text), ..
        }
        | SerializedNode::Bigint {
            value: Some(text), ..
        }
        | SerializedNode::Function {
            value: Some(text), ..
        }
        | SerializedNode::Date {
            value: Some(text), ..
        } => Some(to_json(text)?),
        SerializedNode::Boolean {
            value: Some(flag), ..
        } => Some(to_json(flag)?),
        SerializedNode::Number {
            value: Some(number),
            ..
        } => Some(to_json(number)?),
        SerializedNode::RemoteObject {
            value: Some(handle),
            ..
        } => Some(to_json(handle)?),
        SerializedNode::SendChannel {
            value: Some(endpoint),
            ..
        } => Some(to_json(endpoint)?),
        SerializedNode::Regexp {
            value: Some(source),
            ..
        } => Some(to_json(source)?),
        SerializedNode::Error {
            value: Some(record),
            ..
        } => Some(to_json(record)?),
        _ => None,
    };

    if let Some(leaf) = leaf {
        out.push_str(r#","value":"#);
        out.push_str(&leaf);
    }
    close_node(out, object_id);
    Ok(())
}

fn close_node(out: &mut String, object_id: Option<u64>) {
    if let Some(object_id) = object_id {
        out.push_str(r#","objectId":"#);
        out.push_str(&object_id.to_string());
    }
    out.push('}');
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CoreError> {
    serde_json::to_string(value).map_err(|err| CoreError::InvalidJson(err.to_string()))
}

/// A read node whose children are still arena slots.
enum Draft {
    Leaf(SerializedNode),
    Array(Option<u64>, Vec<usize>),
    Set(Option<u64>, Vec<usize>),
    Object(Option<u64>, Vec<(String, usize)>),
    Map(Option<u64>, Vec<(usize, usize)>),
}

/// Reads the node at `items[index]`, reserving a slot for every child and
/// queueing it on `work`.
fn read_node(
    text: &str,
    items: &[Item],
    index: usize,
    drafts: &mut Vec<Option<Draft>>,
    work: &mut Vec<(usize, usize)>,
) -> Result<Draft, CoreError> {
    let Body::Object(members) = &items[index].body else {
        return Err(malformed("node is not an object"));
    };
    // The last duplicate member wins.
    let member = |name: &str| {
        members
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, item)| &items[*item])
    };

    let kind: String = match member("type") {
        Some(item) => decode(text, item)?,
        None => return Err(malformed("node has no type")),
    };
    let object_id: Option<u64> = match member("objectId") {
        Some(item) => decode(text, item)?,
        None => None,
    };
    let value = member("value");
    let mut reserve = |child: usize| {
        let slot = drafts.len();
        drafts.push(None);
        work.push((child, slot));
        slot
    };

    let leaf = match kind.as_str() {
        "undefined" => SerializedNode::Undefined { object_id },
        "null" => SerializedNode::Null { object_id },
        "string" => SerializedNode::String {
            value: decode_value(text, value)?,
            object_id,
        },
        "boolean" => SerializedNode::Boolean {
            value: decode_value(text, value)?,
            object_id,
        },
        "number" => SerializedNode::Number {
            value: decode_value(text, value)?,
            object_id,
        },
        "bigint" => SerializedNode::Bigint {
            value: decode_value(text, value)?,
            object_id,
        },
        "function" => SerializedNode::Function {
            value: decode_value(text, value)?,
            object_id,
        },
        "remoteobject" => SerializedNode::RemoteObject {
            value: decode_value(text, value)?,
            object_id,
        },
        "sendchannel" => SerializedNode::SendChannel {
            value: decode_value(text, value)?,
            object_id,
        },
        "regexp" => SerializedNode::Regexp {
            value: decode_value(text, value)?,
            object_id,
        },
        "date" => SerializedNode::Date {
            value: decode_value(text, value)?,
            object_id,
        },
        "error" => SerializedNode::Error {
            value: decode_value(text, value)?,
            object_id,
        },
        "array" | "set" => {
            let Some(value) = value else {
                return Ok(Draft::Leaf(if kind == "array" {
                    SerializedNode::Array {
                        value: None,
                        object_id,
                    }
                } else {
                    SerializedNode::Set {
                        value: None,
                        object_id,
                    }
                }));
            };
            let Body::Array(children) = &value.body else {
                return Err(malformed(&format!("{kind} value is not an array")));
            };
            let slots = children.iter().map(|child| reserve(*child)).collect();
            return Ok(if kind == "array" {
                Draft::Array(object_id, slots)
            } else {
                Draft::Set(object_id, slots)
            });
        }
        "object" => {
            let Some(value) = value else {
                return Ok(Draft::Leaf(SerializedNode::Object {
                    value: None,
                    object_id,
                }));
            };
            let Body::Object(fields) = &value.body else {
                return Err(malformed("object value is not an object"));
            };
            let slots = fields
                .iter()
                .map(|(key, child)| (key.clone(), reserve(*child)))
                .collect();
            return Ok(Draft::Object(object_id, slots));
        }
        "map" => {
            let Some(value) = value else {
                return Ok(Draft::Leaf(SerializedNode::Map {
                    value: None,
                    object_id,
                }));
            };
            let Body::Array(pairs) = &value.body else {
                return Err(malformed("map value is not an array"));
            };
            let mut slots = Vec::with_capacity(pairs.len());
            for pair in pairs {
                match &items[*pair].body {
                    Body::Array(entry) if entry.len() == 2 => {
                        slots.push((reserve(entry[0]), reserve(entry[1])));
                    }
                    _ => return Err(malformed("map entry is not a [key, value] pair")),
                }
            }
            return Ok(Draft::Map(object_id, slots));
        }
        other => return Err(CoreError::UnknownNodeType(other.to_string())),
    };
    Ok(Draft::Leaf(leaf))
}

fn decode<T: DeserializeOwned>(text: &str, item: &Item) -> Result<T, CoreError> {
    serde_json::from_str(&text[item.span.clone()]).map_err(|err| malformed(&err.to_string()))
}

fn decode_value<T: DeserializeOwned>(
    text: &str,
    item: Option<&Item>,
) -> Result<Option<T>, CoreError> {
    item.map(|item| decode(text, item)).transpose()
}

/// Builds the tree bottom-up. Children always sit in later slots than
/// their parent, so walking backwards finds every child finished.
fn assemble(drafts: Vec<Option<Draft>>) -> Result<SerializedNode, CoreError> {
    let mut built: Vec<Option<SerializedNode>> = Vec::with_capacity(drafts.len());
    built.resize_with(drafts.len(), || None);

    for (index, draft) in drafts.into_iter().enumerate().rev() {
        let mut take = |slot: usize| {
            built
                .get_mut(slot)
                .and_then(Option::take)
                .ok_or_else(|| malformed("dangling child"))
        };
        let node = match draft.ok_or_else(|| malformed("unread node"))? {
            Draft::Leaf(node) => node,
            Draft::Array(object_id, slots) => SerializedNode::Array {
                value: Some(slots.into_iter().map(&mut take).collect::<Result<_, _>>()?),
                object_id,
            },
            Draft::Set(object_id, slots) => SerializedNode::Set {
                value: Some(slots.into_iter().map(&mut take).collect::<Result<_, _>>()?),
                object_id,
            },
            Draft::Object(object_id, slots) => {
                let mut fields = Vec::with_capacity(slots.len());
                for (key, slot) in slots {
                    fields.push((key, take(slot)?));
                }
                SerializedNode::Object {
                    value: Some(Fields(fields)),
                    object_id,
                }
            }
            Draft::Map(object_id, slots) => {
                let mut entries = Vec::with_capacity(slots.len());
                for (key, value) in slots {
                    entries.push((take(key)?, take(value)?));
                }
                SerializedNode::Map {
                    value: Some(entries),
                    object_id,
                }
            }
        };
        built[index] = Some(node);
    }

    built
        .first_mut()
        .and_then(Option::take)
        .ok_or_else(|| malformed("empty node"))
}

fn malformed(message: &str) -> CoreError {
    CoreError::MalformedNode(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::{Fields, SerializedNode, WireNumber};

    fn nested_arrays(depth: usize) -> SerializedNode {
        let mut node = SerializedNode::Array {
            value: Some(Vec::new()),
            object_id: None,
        };
        for _ in 1..depth {
            node = SerializedNode::Array {
                value: Some(vec![node]),
                object_id: None,
            };
        }
        node
    }

    #[test]
    fn deep_trees_cross_text_both_ways() {
        const DEPTH: usize = 100_000;
        let text = nested_arrays(DEPTH).to_json_text().expect("write");
        assert!(text.starts_with(r#"{"type":"array","value":[{"type":"array","value":["#));

        let mut node = SerializedNode::from_json_text(&text).expect("read");
        let mut depth = 1;
        loop {
            let SerializedNode::Array {
                value: Some(children),
                ..
            } = &mut node
            else {
                panic!("not an array node");
            };
            match children.pop() {
                Some(child) => {
                    node = child;
                    depth += 1;
                }
                None => break,
            }
        }
        assert_eq!(depth, DEPTH);
    }

    #[test]
    fn writer_output_matches_the_wire_shape() {
        let node = SerializedNode::Map {
            value: Some(vec![(
                SerializedNode::Number {
                    value: Some(WireNumber::Finite(1.0)),
                    object_id: None,
                },
                SerializedNode::Object {
                    value: Some(Fields(vec![
                        ("b".to_string(), SerializedNode::NULL),
                        (
                            "a\"".to_string(),
                            SerializedNode::String {
                                value: Some("x".to_string()),
                                object_id: Some(1),
                            },
                        ),
                    ])),
                    object_id: Some(0),
                },
            )]),
            object_id: None,
        };

        let text = node.to_json_text().expect("write");
        assert_eq!(
            text,
            r#"{"type":"map","value":[[{"type":"number","value":1.0},{"type":"object","value":{"b":{"type":"null"},"a\"":{"type":"string","value":"x","objectId":1}},"objectId":0}]]}"#
        );
        assert_eq!(SerializedNode::from_json_text(&text).expect("read"), node);
    }

    #[test]
    fn any_node_kind_may_be_a_reference() {
        let node = SerializedNode::from_json_text(r#"{"type":"date","objectId":4}"#).expect("read");
        assert_eq!(
            node,
            SerializedNode::Date {
                value: None,
                object_id: Some(4)
            }
        );
        assert!(node.is_reference());

        let null = SerializedNode::from_json_text(r#"{"type":"null"}"#).expect("read");
        assert!(!null.is_reference());
        let undefined_ref =
            SerializedNode::from_json_text(r#"{"objectId":2,"type":"undefined"}"#).expect("read");
        assert!(undefined_ref.is_reference());
    }

    #[test]
    fn malformed_text_is_rejected() {
        for text in [
            r#"{"type":"symbol"}"#,
            r#"{"value":1}"#,
            r#"{"type":"array","value":{}}"#,
            r#"{"type":"map","value":[[{"type":"null"}]]}"#,
            r#"{"type":"string","value":7}"#,
            r#"{"type":"string","objectId":"zero"}"#,
            r#"["type","null"]"#,
        ] {
            assert!(
                SerializedNode::from_json_text(text).is_err(),
                "{text} should be rejected"
            );
        }
    }
}
