//! Wire message model and codec.
//!
//! Every frame on a sync link is one line of JSON carrying a small-integer
//! `type` tag, the `{source, id}` envelope, and the kind-specific fields.
//! The codec is written out explicitly rather than via serde enum tagging:
//! the tag is numeric, every field is validated at decode time, and unknown
//! tags are rejected outright.
//!
//! Message ids are a per-node counter starting at 1; the hello frame is the
//! one message sent with `id = 0`, because it precedes the peer knowing who
//! we are.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Upper bound on a single wire frame. Anything longer is a protocol
/// violation and closes the connection.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// The envelope id carried by hello frames.
pub const HELLO_ID: u64 = 0;

/// Deployment environment a node runs in. Nodes refuse to mesh across
/// environments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Prod,
    Dev,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Prod => write!(f, "prod"),
            Environment::Dev => write!(f, "dev"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prod" => Ok(Environment::Prod),
            "dev" => Ok(Environment::Dev),
            other => Err(format!("unknown environment `{other}` (expected prod or dev)")),
        }
    }
}

/// Scope of a configuration cache bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    User,
    Guild,
    Global,
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheScope::User => write!(f, "user"),
            CacheScope::Guild => write!(f, "guild"),
            CacheScope::Global => write!(f, "global"),
        }
    }
}

impl FromStr for CacheScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(CacheScope::User),
            "guild" => Ok(CacheScope::Guild),
            "global" => Ok(CacheScope::Global),
            other => Err(format!("unknown cache scope `{other}`")),
        }
    }
}

/// One module as advertised by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub available: bool,
    pub handling: bool,
}

/// Kind-specific message bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Mandatory first frame in each direction of a connection.
    Hello {
        version: String,
        env: Environment,
        user_id: String,
    },
    /// Periodic liveness beacon. No body.
    Heartbeat,
    /// A node announcing its election rank and dialable address.
    InstanceInfo {
        priority: i64,
        address: Option<String>,
    },
    /// Announcement that a named peer has been detected dead.
    LostPeer { name: String },
    /// Controller verdict: `peer` now handles `module`.
    AssignModule { peer: String, module: String },
    /// Ask the controller to hand us a module.
    RequestModule { module: String },
    /// The controller role moves to the named peer. Carries the peer's
    /// priority so receivers that missed its instanceInfo can still apply
    /// the rank gate.
    ControlSwitch { name: String, priority: i64 },
    /// Full advertisement of the sender's module list.
    ModuleInfo { modules: Vec<ModuleDescriptor> },
    /// Flush the cache bucket named `config_name` for `id` within `scope`.
    /// The bucket id travels as `cacheId` on the wire; the bare `id` slot
    /// belongs to the envelope.
    ExpireConfigCache {
        config_name: String,
        scope: CacheScope,
        id: String,
    },
}

impl Payload {
    /// The wire tag for this kind.
    pub fn tag(&self) -> u64 {
        match self {
            Payload::Hello { .. } => 0,
            Payload::Heartbeat => 1,
            Payload::InstanceInfo { .. } => 2,
            Payload::LostPeer { .. } => 3,
            Payload::AssignModule { .. } => 4,
            Payload::RequestModule { .. } => 5,
            Payload::ControlSwitch { .. } => 6,
            Payload::ModuleInfo { .. } => 7,
            Payload::ExpireConfigCache { .. } => 8,
        }
    }

    /// Short kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Hello { .. } => "hello",
            Payload::Heartbeat => "heartbeat",
            Payload::InstanceInfo { .. } => "instanceInfo",
            Payload::LostPeer { .. } => "lostPeer",
            Payload::AssignModule { .. } => "assignModule",
            Payload::RequestModule { .. } => "requestModule",
            Payload::ControlSwitch { .. } => "controlSwitch",
            Payload::ModuleInfo { .. } => "moduleInfo",
            Payload::ExpireConfigCache { .. } => "expireConfigCache",
        }
    }
}

/// A full message: envelope plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Originating peer name.
    pub source: String,
    /// Monotonic per-source counter; 0 only for hello.
    pub id: u64,
    pub payload: Payload,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("unknown message tag {0}")]
    UnknownTag(u64),
    #[error("invalid value in field `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    Oversize,
}

/// Encode a message as a single JSON line (no trailing newline).
pub fn encode(msg: &Message) -> String {
    let mut obj = match &msg.payload {
        Payload::Hello { version, env, user_id } => json!({
            "version": version,
            "env": env.to_string(),
            "userId": user_id,
        }),
        Payload::Heartbeat => json!({}),
        Payload::InstanceInfo { priority, address } => {
            let mut v = json!({ "priority": priority });
            if let Some(addr) = address {
                v["address"] = json!(addr);
            }
            v
        }
        Payload::LostPeer { name } => json!({ "name": name }),
        Payload::AssignModule { peer, module } => json!({
            "peer": peer,
            "module": module,
        }),
        Payload::RequestModule { module } => json!({ "module": module }),
        Payload::ControlSwitch { name, priority } => json!({
            "name": name,
            "priority": priority,
        }),
        Payload::ModuleInfo { modules } => json!({ "modules": modules }),
        Payload::ExpireConfigCache { config_name, scope, id } => json!({
            "configName": config_name,
            "scope": scope.to_string(),
            "cacheId": id,
        }),
    };
    let map = obj.as_object_mut().expect("payload encodes as an object");
    map.insert("type".into(), json!(msg.payload.tag()));
    map.insert("source".into(), json!(msg.source));
    map.insert("id".into(), json!(msg.id));
    obj.to_string()
}

/// Decode one frame. Rejects oversize frames, non-objects, unknown tags,
/// and any missing or ill-typed field.
pub fn decode(line: &str) -> Result<Message, CodecError> {
    if line.len() > MAX_FRAME_LEN {
        return Err(CodecError::Oversize);
    }
    let value: Value = serde_json::from_str(line)?;
    let obj = value.as_object().ok_or(CodecError::NotAnObject)?;

    let tag = u64_field(obj, "type")?;
    let source = str_field(obj, "source")?;
    let id = u64_field(obj, "id")?;

    let payload = match tag {
        0 => Payload::Hello {
            version: str_field(obj, "version")?,
            env: parse_field(obj, "env")?,
            user_id: str_field(obj, "userId")?,
        },
        1 => Payload::Heartbeat,
        2 => Payload::InstanceInfo {
            priority: i64_field(obj, "priority")?,
            address: opt_str_field(obj, "address")?,
        },
        3 => Payload::LostPeer {
            name: str_field(obj, "name")?,
        },
        4 => Payload::AssignModule {
            peer: str_field(obj, "peer")?,
            module: str_field(obj, "module")?,
        },
        5 => Payload::RequestModule {
            module: str_field(obj, "module")?,
        },
        6 => Payload::ControlSwitch {
            name: str_field(obj, "name")?,
            priority: i64_field(obj, "priority")?,
        },
        7 => Payload::ModuleInfo {
            modules: modules_field(obj, "modules")?,
        },
        8 => Payload::ExpireConfigCache {
            config_name: str_field(obj, "configName")?,
            scope: parse_field(obj, "scope")?,
            id: str_field(obj, "cacheId")?,
        },
        other => return Err(CodecError::UnknownTag(other)),
    };

    Ok(Message { source, id, payload })
}

fn field<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, CodecError> {
    obj.get(name).ok_or(CodecError::MissingField(name))
}

fn str_field(obj: &Map<String, Value>, name: &'static str) -> Result<String, CodecError> {
    field(obj, name)?
        .as_str()
        .map(str::to_owned)
        .ok_or(CodecError::WrongType(name))
}

fn opt_str_field(
    obj: &Map<String, Value>,
    name: &'static str,
) -> Result<Option<String>, CodecError> {
    match obj.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_owned()))
            .ok_or(CodecError::WrongType(name)),
    }
}

fn u64_field(obj: &Map<String, Value>, name: &'static str) -> Result<u64, CodecError> {
    field(obj, name)?.as_u64().ok_or(CodecError::WrongType(name))
}

fn i64_field(obj: &Map<String, Value>, name: &'static str) -> Result<i64, CodecError> {
    field(obj, name)?.as_i64().ok_or(CodecError::WrongType(name))
}

fn parse_field<T: FromStr<Err = String>>(
    obj: &Map<String, Value>,
    name: &'static str,
) -> Result<T, CodecError> {
    let raw = str_field(obj, name)?;
    raw.parse()
        .map_err(|reason| CodecError::InvalidValue { field: name, reason })
}

fn modules_field(
    obj: &Map<String, Value>,
    name: &'static str,
) -> Result<Vec<ModuleDescriptor>, CodecError> {
    let raw = field(obj, name)?;
    if !raw.is_array() {
        return Err(CodecError::WrongType(name));
    }
    serde_json::from_value(raw.clone()).map_err(|_| CodecError::WrongType(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: Payload) {
        let msg = Message {
            source: "node-a".into(),
            id: 7,
            payload,
        };
        let line = encode(&msg);
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrip_all_kinds() {
        roundtrip(Payload::Hello {
            version: "0.1.0".into(),
            env: Environment::Prod,
            user_id: "bot-123".into(),
        });
        roundtrip(Payload::Heartbeat);
        roundtrip(Payload::InstanceInfo {
            priority: 1700000000123,
            address: Some("10.0.0.5:4000".into()),
        });
        roundtrip(Payload::InstanceInfo {
            priority: -3,
            address: None,
        });
        roundtrip(Payload::LostPeer { name: "bravo".into() });
        roundtrip(Payload::AssignModule {
            peer: "charlie".into(),
            module: "metrics".into(),
        });
        roundtrip(Payload::RequestModule { module: "metrics".into() });
        roundtrip(Payload::ControlSwitch {
            name: "alpha".into(),
            priority: 1000,
        });
        roundtrip(Payload::ModuleInfo {
            modules: vec![
                ModuleDescriptor {
                    name: "metrics".into(),
                    available: true,
                    handling: false,
                },
                ModuleDescriptor {
                    name: "greeter".into(),
                    available: true,
                    handling: true,
                },
            ],
        });
        roundtrip(Payload::ExpireConfigCache {
            config_name: "moderation".into(),
            scope: CacheScope::Guild,
            id: "guild-42".into(),
        });
    }

    #[test]
    fn hello_wire_shape() {
        let msg = Message {
            source: "node-a".into(),
            id: HELLO_ID,
            payload: Payload::Hello {
                version: "0.1.0".into(),
                env: Environment::Dev,
                user_id: "bot-123".into(),
            },
        };
        let v: Value = serde_json::from_str(&encode(&msg)).unwrap();
        assert_eq!(v["type"], 0);
        assert_eq!(v["source"], "node-a");
        assert_eq!(v["id"], 0);
        assert_eq!(v["env"], "dev");
        assert_eq!(v["userId"], "bot-123");
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = decode(r#"{"type":99,"source":"x","id":1}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(99)));
    }

    #[test]
    fn missing_envelope_field_rejected() {
        let err = decode(r#"{"type":1,"id":1}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("source")));
    }

    #[test]
    fn wrong_type_rejected() {
        let err = decode(r#"{"type":3,"source":"x","id":1,"name":5}"#).unwrap_err();
        assert!(matches!(err, CodecError::WrongType("name")));
    }

    #[test]
    fn negative_id_rejected() {
        let err = decode(r#"{"type":1,"source":"x","id":-4}"#).unwrap_err();
        assert!(matches!(err, CodecError::WrongType("id")));
    }

    #[test]
    fn unknown_scope_rejected() {
        let err = decode(
            r#"{"type":8,"source":"x","id":1,"configName":"c","scope":"planet","cacheId":"u1"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::InvalidValue { field: "scope", .. }));
    }

    #[test]
    fn non_object_rejected() {
        assert!(matches!(decode("[1,2,3]").unwrap_err(), CodecError::NotAnObject));
    }

    #[test]
    fn oversize_rejected() {
        let line = format!(
            r#"{{"type":1,"source":"{}","id":1}}"#,
            "x".repeat(MAX_FRAME_LEN)
        );
        assert!(matches!(decode(&line).unwrap_err(), CodecError::Oversize));
    }

    #[test]
    fn null_address_is_absent() {
        let msg =
            decode(r#"{"type":2,"source":"x","id":1,"priority":9,"address":null}"#).unwrap();
        assert_eq!(
            msg.payload,
            Payload::InstanceInfo {
                priority: 9,
                address: None
            }
        );
    }
}
