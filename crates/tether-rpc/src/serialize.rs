//! Identity-preserving conversion between [`Value`] graphs and
//! [`SerializedNode`] trees.
//!
//! Both directions walk the input breadth first from a FIFO work list, so a
//! container is always handled before any later reference to it, and nesting
//! depth is limited only by memory. Arrays, sets, objects, maps and errors
//! are identity-bearing: the first occurrence is encoded in full, later
//! occurrences become `{type, objectId}` references. On the way in, any
//! node kind may carry an `objectId` and be referred to later.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, SecondsFormat, Utc};
use tether_core::{ErrorRecord, Fields, HandleDescriptor, RegExpSource, SerializedNode, WireNumber};

use crate::{
    ErrorData, ErrorValue, Host, Hub, RegExp, RemoteHandle, TetherError, Value, WriteChannel,
    value::{Array, Map, Object, Set},
};

/// Classification of a value ahead of encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeName {
    Undefined,
    Null,
    String,
    Boolean,
    Number,
    BigInt,
    Function,
    RemoteObject,
    SendChannel,
    Error,
    Array,
    RegExp,
    Date,
    Map,
    Set,
    Object,
    /// Host-owned value; the category comes from the host classifier.
    Host(String),
}

impl TypeName {
    pub fn as_str(&self) -> &str {
        match self {
            TypeName::Undefined => "undefined",
            TypeName::Null => "null",
            TypeName::String => "string",
            TypeName::Boolean => "boolean",
            TypeName::Number => "number",
            TypeName::BigInt => "bigint",
            TypeName::Function => "function",
            TypeName::RemoteObject => "remoteobject",
            TypeName::SendChannel => "sendchannel",
            TypeName::Error => "error",
            TypeName::Array => "array",
            TypeName::RegExp => "regexp",
            TypeName::Date => "date",
            TypeName::Map => "map",
            TypeName::Set => "set",
            TypeName::Object => "object",
            TypeName::Host(category) => category,
        }
    }
}

/// Category used for host objects the host does not classify.
const UNCLASSIFIED_HOST: &str = "hostobject";

pub fn type_name(value: &Value, host: &dyn Host) -> TypeName {
    match value {
        Value::Undefined => TypeName::Undefined,
        Value::String(_) => TypeName::String,
        Value::Bool(_) => TypeName::Boolean,
        Value::Number(_) => TypeName::Number,
        Value::BigInt(_) => TypeName::BigInt,
        Value::Function(_) => TypeName::Function,
        Value::Null => TypeName::Null,
        Value::Handle(_) => TypeName::RemoteObject,
        Value::Channel(_) => TypeName::SendChannel,
        Value::Error(_) => TypeName::Error,
        Value::Array(_) => TypeName::Array,
        Value::RegExp(_) => TypeName::RegExp,
        Value::Date(_) => TypeName::Date,
        Value::Map(_) => TypeName::Map,
        Value::Set(_) => TypeName::Set,
        Value::Object(_) => TypeName::Object,
        Value::Host(object) => TypeName::Host(
            host.classify(object)
                .unwrap_or_else(|| UNCLASSIFIED_HOST.to_string()),
        ),
    }
}

/// Kinds of identity-bearing nodes.
#[derive(Debug, Clone, Copy)]
enum Identity {
    Error,
    Array,
    Set,
    Object,
    Map,
}

/// One emitted node before its children are attached.
enum Draft {
    Leaf(SerializedNode),
    Error(ErrorRecord),
    Array(Vec<usize>),
    Set(Vec<usize>),
    Object(Vec<(String, usize)>),
    Map(Vec<(usize, Option<usize>)>),
    Reference(Identity, u64),
}

/// Where a work item's node goes once emitted.
#[derive(Debug, Clone)]
enum Slot {
    Root,
    Item(usize),
    Field(usize, String),
    MapKey(usize),
    MapValue(usize),
}

/// Serializes `value` into a single node tree.
pub fn serialize(value: &Value, host: &dyn Host) -> Result<SerializedNode, TetherError> {
    let mut work = VecDeque::from([(value.clone(), Slot::Root)]);
    let mut drafts: Vec<Draft> = Vec::new();
    let mut object_ids: Vec<Option<u64>> = Vec::new();
    let mut seen: HashMap<usize, (usize, Identity)> = HashMap::new();
    let mut next_object_id = 0_u64;
    let mut root = None;

    while let Some((item, slot)) = work.pop_front() {
        let index = drafts.len();
        let draft = match identity_of(&item) {
            Some((key, _)) if seen.contains_key(&key) => {
                let (first, identity) = seen[&key];
                let object_id = *object_ids[first].get_or_insert_with(|| {
                    let id = next_object_id;
                    next_object_id += 1;
                    id
                });
                Draft::Reference(identity, object_id)
            }
            identity => {
                if let Some((key, kind)) = identity {
                    seen.insert(key, (index, kind));
                }
                encode(&item, index, &mut work, host)?
            }
        };
        drafts.push(draft);
        object_ids.push(None);

        match slot {
            Slot::Root => {
                if root.replace(index).is_some() {
                    return Err(TetherError::MultipleRoots);
                }
            }
            Slot::Item(parent) => match &mut drafts[parent] {
                Draft::Array(items) | Draft::Set(items) => items.push(index),
                _ => return Err(TetherError::MultipleRoots),
            },
            Slot::Field(parent, key) => match &mut drafts[parent] {
                Draft::Object(fields) => fields.push((key, index)),
                _ => return Err(TetherError::MultipleRoots),
            },
            Slot::MapKey(parent) => match &mut drafts[parent] {
                Draft::Map(entries) => entries.push((index, None)),
                _ => return Err(TetherError::MultipleRoots),
            },
            Slot::MapValue(parent) => match &mut drafts[parent] {
                Draft::Map(entries) => match entries.last_mut() {
                    Some((_, value @ None)) => *value = Some(index),
                    _ => return Err(TetherError::MultipleRoots),
                },
                _ => return Err(TetherError::MultipleRoots),
            },
        }
    }

    assemble(drafts, object_ids)
}

/// Identity key and kind of identity-bearing values.
fn identity_of(value: &Value) -> Option<(usize, Identity)> {
    match value {
        Value::Error(error) => Some((error.identity(), Identity::Error)),
        Value::Array(array) => Some((array.identity(), Identity::Array)),
        Value::Set(set) => Some((set.identity(), Identity::Set)),
        Value::Object(object) => Some((object.identity(), Identity::Object)),
        Value::Map(map) => Some((map.identity(), Identity::Map)),
        _ => None,
    }
}

/// Encodes one first-seen value and queues its children.
fn encode(
    item: &Value,
    index: usize,
    work: &mut VecDeque<(Value, Slot)>,
    host: &dyn Host,
) -> Result<Draft, TetherError> {
    let leaf = match item {
        Value::Undefined => SerializedNode::UNDEFINED,
        Value::Null => SerializedNode::NULL,
        Value::String(value) => SerializedNode::String {
            value: Some(value.clone()),
            object_id: None,
        },
        Value::Bool(value) => SerializedNode::Boolean {
            value: Some(*value),
            object_id: None,
        },
        Value::Number(value) => SerializedNode::Number {
            value: Some(encode_number(*value)),
            object_id: None,
        },
        Value::BigInt(value) => SerializedNode::Bigint {
            value: Some(value.to_string()),
            object_id: None,
        },
        Value::Function(function) => SerializedNode::Function {
            value: Some(function.source().to_string()),
            object_id: None,
        },
        Value::Handle(handle) => SerializedNode::RemoteObject {
            value: Some(HandleDescriptor {
                category: handle.category.clone(),
                handle_id: handle.handle_id.clone(),
            }),
            object_id: None,
        },
        Value::Channel(channel) => SerializedNode::SendChannel {
            value: Some(channel.endpoint().clone()),
            object_id: None,
        },
        Value::RegExp(regexp) => SerializedNode::Regexp {
            value: Some(RegExpSource {
                pattern: regexp.pattern.clone(),
                flags: regexp.flags.clone(),
            }),
            object_id: None,
        },
        Value::Date(date) => SerializedNode::Date {
            value: Some(date.to_rfc3339_opts(SecondsFormat::Millis, true)),
            object_id: None,
        },
        Value::Error(error) => {
            let data = error.data();
            return Ok(Draft::Error(ErrorRecord {
                kind: data.kind.clone(),
                message: data.message.clone(),
                line_number: data.line_number,
                column_number: data.column_number,
                file_name: data.file_name.clone(),
                stack: data.stack.clone(),
            }));
        }
        Value::Array(array) => {
            work.extend(array.items().into_iter().map(|child| (child, Slot::Item(index))));
            return Ok(Draft::Array(Vec::new()));
        }
        Value::Set(set) => {
            work.extend(set.items().into_iter().map(|child| (child, Slot::Item(index))));
            return Ok(Draft::Set(Vec::new()));
        }
        Value::Object(object) => {
            work.extend(
                object
                    .entries()
                    .into_iter()
                    .map(|(key, child)| (child, Slot::Field(index, key))),
            );
            return Ok(Draft::Object(Vec::new()));
        }
        Value::Map(map) => {
            for (key, child) in map.entries() {
                work.push_back((key, Slot::MapKey(index)));
                work.push_back((child, Slot::MapValue(index)));
            }
            return Ok(Draft::Map(Vec::new()));
        }
        Value::Host(_) => {
            return Err(TetherError::UnsupportedType {
                type_name: type_name(item, host).as_str().to_string(),
            });
        }
    };
    Ok(Draft::Leaf(leaf))
}

fn encode_number(value: f64) -> WireNumber {
    if value.is_nan() {
        WireNumber::Sentinel("NaN".to_string())
    } else if value == f64::INFINITY {
        WireNumber::Sentinel("+Infinity".to_string())
    } else if value == f64::NEG_INFINITY {
        WireNumber::Sentinel("-Infinity".to_string())
    } else if value == 0.0 && value.is_sign_negative() {
        WireNumber::Sentinel("-0".to_string())
    } else {
        WireNumber::Finite(value)
    }
}

/// Builds the final tree bottom-up. Children always have larger indices
/// than their parent, so walking backwards finds every child finished.
fn assemble(
    drafts: Vec<Draft>,
    object_ids: Vec<Option<u64>>,
) -> Result<SerializedNode, TetherError> {
    let mut built: Vec<Option<SerializedNode>> = Vec::with_capacity(drafts.len());
    built.resize_with(drafts.len(), || None);

    for (index, (draft, object_id)) in drafts.into_iter().zip(object_ids).enumerate().rev() {
        let mut take = |child: usize| {
            built
                .get_mut(child)
                .and_then(Option::take)
                .ok_or(TetherError::MultipleRoots)
        };
        let node = match draft {
            Draft::Leaf(node) => node,
            Draft::Error(record) => SerializedNode::Error {
                value: Some(record),
                object_id,
            },
            Draft::Array(items) => SerializedNode::Array {
                value: Some(items.into_iter().map(&mut take).collect::<Result<_, _>>()?),
                object_id,
            },
            Draft::Set(items) => SerializedNode::Set {
                value: Some(items.into_iter().map(&mut take).collect::<Result<_, _>>()?),
                object_id,
            },
            Draft::Object(fields) => {
                let mut members = Vec::with_capacity(fields.len());
                for (key, child) in fields {
                    members.push((key, take(child)?));
                }
                SerializedNode::Object {
                    value: Some(Fields(members)),
                    object_id,
                }
            }
            Draft::Map(entries) => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let value = value.ok_or(TetherError::MultipleRoots)?;
                    pairs.push((take(key)?, take(value)?));
                }
                SerializedNode::Map {
                    value: Some(pairs),
                    object_id,
                }
            }
            Draft::Reference(identity, id) => reference_node(identity, id),
        };
        built[index] = Some(node);
    }

    built
        .first_mut()
        .and_then(Option::take)
        .ok_or(TetherError::MultipleRoots)
}

fn reference_node(identity: Identity, id: u64) -> SerializedNode {
    let object_id = Some(id);
    match identity {
        Identity::Error => SerializedNode::Error {
            value: None,
            object_id,
        },
        Identity::Array => SerializedNode::Array {
            value: None,
            object_id,
        },
        Identity::Set => SerializedNode::Set {
            value: None,
            object_id,
        },
        Identity::Object => SerializedNode::Object {
            value: None,
            object_id,
        },
        Identity::Map => SerializedNode::Map {
            value: None,
            object_id,
        },
    }
}

/// Where a rebuilt value goes.
enum Target {
    Root,
    Array(Array),
    Set(Set),
    Field(Object, String),
    MapKey(Map),
    MapValue(Map),
}

/// Rebuilds a value graph from `node`. Write channels are bound to `hub`,
/// and handles registered in `hub` resolve to their local values.
pub fn deserialize(node: SerializedNode, hub: &Hub) -> Result<Value, TetherError> {
    let mut work = VecDeque::from([(node, Target::Root)]);
    let mut object_map: HashMap<u64, Value> = HashMap::new();
    let mut pending_key: Option<Value> = None;
    let mut root = None;

    while let Some((mut item, target)) = work.pop_front() {
        let value = if item.is_reference() {
            let object_id = item.object_id().unwrap_or_default();
            object_map.get(&object_id).cloned().ok_or_else(|| {
                TetherError::MalformedMessage(format!("unknown objectId {object_id}"))
            })?
        } else {
            let object_id = item.object_id();
            let value = decode(&mut item, &mut work, hub)?;
            if let Some(object_id) = object_id {
                object_map.insert(object_id, value.clone());
            }
            value
        };

        match target {
            Target::Root => {
                if root.replace(value).is_some() {
                    return Err(TetherError::MultipleRoots);
                }
            }
            Target::Array(array) => array.push(value),
            Target::Set(set) => {
                set.add(value);
            }
            Target::Field(object, key) => object.insert(key, value),
            Target::MapKey(_) => pending_key = Some(value),
            Target::MapValue(map) => {
                let key = pending_key.take().ok_or_else(|| {
                    TetherError::MalformedMessage("map value without key".to_string())
                })?;
                map.insert(key, value);
            }
        }
    }

    root.ok_or_else(|| TetherError::MalformedMessage("empty message".to_string()))
}

/// Decodes one non-reference node, queueing its children.
fn decode(
    item: &mut SerializedNode,
    work: &mut VecDeque<(SerializedNode, Target)>,
    hub: &Hub,
) -> Result<Value, TetherError> {
    let kind = item.kind();
    let value = match item {
        SerializedNode::Undefined { .. } => Value::Undefined,
        SerializedNode::Null { .. } => Value::Null,
        SerializedNode::String { value, .. } => {
            Value::String(value.take().ok_or_else(|| missing_value(kind))?)
        }
        SerializedNode::Boolean { value, .. } => {
            Value::Bool(value.ok_or_else(|| missing_value(kind))?)
        }
        SerializedNode::Number { value, .. } => {
            let number = value.as_ref().ok_or_else(|| missing_value(kind))?;
            Value::Number(decode_number(number)?)
        }
        SerializedNode::Bigint { value, .. } => {
            let digits = value.as_deref().ok_or_else(|| missing_value(kind))?;
            Value::BigInt(digits.parse().map_err(|_| {
                TetherError::MalformedMessage(format!("invalid bigint {digits:?}"))
            })?)
        }
        SerializedNode::Function { value, .. } => {
            let source = value.take().ok_or_else(|| missing_value(kind))?;
            match hub.host().compile(&source) {
                Some(function) => Value::Function(function),
                None => return Err(TetherError::UnknownFunction { text: source }),
            }
        }
        SerializedNode::RemoteObject { value, .. } => {
            let descriptor = value.take().ok_or_else(|| missing_value(kind))?;
            let handle = RemoteHandle {
                category: descriptor.category,
                handle_id: descriptor.handle_id,
            };
            hub.handles()
                .resolve(&handle)
                .unwrap_or(Value::Handle(handle))
        }
        SerializedNode::SendChannel { value, .. } => {
            let endpoint = value.take().ok_or_else(|| missing_value(kind))?;
            Value::Channel(WriteChannel::new(hub, endpoint))
        }
        SerializedNode::Regexp { value, .. } => {
            let source = value.take().ok_or_else(|| missing_value(kind))?;
            Value::RegExp(RegExp {
                pattern: source.pattern,
                flags: source.flags,
            })
        }
        SerializedNode::Date { value, .. } => {
            let text = value.as_deref().ok_or_else(|| missing_value(kind))?;
            Value::Date(
                DateTime::parse_from_rfc3339(text)
                    .map_err(|err| {
                        TetherError::MalformedMessage(format!("invalid date {text:?}: {err}"))
                    })?
                    .with_timezone(&Utc),
            )
        }
        SerializedNode::Error { value, .. } => {
            let record = value.take().ok_or_else(|| missing_value(kind))?;
            let kind = if hub.host().recognizes_error_kind(&record.kind) {
                record.kind
            } else {
                "Error".to_string()
            };
            Value::Error(ErrorValue::from(ErrorData {
                kind,
                message: record.message,
                line_number: record.line_number,
                column_number: record.column_number,
                file_name: record.file_name,
                stack: record.stack,
            }))
        }
        SerializedNode::Array { value, .. } => {
            let children = value.take().ok_or_else(|| missing_value(kind))?;
            let array = Array::default();
            work.extend(children.into_iter().map(|child| (child, Target::Array(array.clone()))));
            Value::Array(array)
        }
        SerializedNode::Set { value, .. } => {
            let children = value.take().ok_or_else(|| missing_value(kind))?;
            let set = Set::default();
            work.extend(children.into_iter().map(|child| (child, Target::Set(set.clone()))));
            Value::Set(set)
        }
        SerializedNode::Object { value, .. } => {
            let Fields(fields) = value.take().ok_or_else(|| missing_value(kind))?;
            let object = Object::default();
            work.extend(
                fields
                    .into_iter()
                    .map(|(key, child)| (child, Target::Field(object.clone(), key))),
            );
            Value::Object(object)
        }
        SerializedNode::Map { value, .. } => {
            let entries = value.take().ok_or_else(|| missing_value(kind))?;
            let map = Map::default();
            for (key, child) in entries {
                work.push_back((key, Target::MapKey(map.clone())));
                work.push_back((child, Target::MapValue(map.clone())));
            }
            Value::Map(map)
        }
    };
    Ok(value)
}

fn decode_number(value: &WireNumber) -> Result<f64, TetherError> {
    match value {
        WireNumber::Finite(value) => Ok(*value),
        WireNumber::Sentinel(sentinel) => match sentinel.as_str() {
            "NaN" => Ok(f64::NAN),
            "-0" => Ok(-0.0),
            "+Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => Err(TetherError::MalformedMessage(format!(
                "unexpected number value {other:?}"
            ))),
        },
    }
}

fn missing_value(kind: &str) -> TetherError {
    TetherError::MalformedMessage(format!("{kind} node has neither value nor objectId"))
}
