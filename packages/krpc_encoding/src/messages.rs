use crate::errors::{ErrorKind, Result};
use crate::node_id::NodeID;
use crate::node_info::{self, NodeInfo};
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddrV4;

/// Envelope holding what is common to every KRPC message: the transaction
/// id echoed between query and reply, and the optional client version tag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub transaction_id: Vec<u8>,
    pub version: Option<Vec<u8>>,
    pub message: Message,
}

/// The three message kinds distinguished by the top-level `y` key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    Query(Query),
    Response(Response),
    Error(KrpcError),
}

/// The four BEP-5 queries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Query {
    Ping {
        id: NodeID,
    },

    FindNode {
        id: NodeID,
        target: NodeID,
    },

    GetPeers {
        id: NodeID,
        info_hash: NodeID,
    },

    /// `implied_port` is accepted on the wire but this node never stores
    /// announces, so it is carried only for completeness.
    AnnouncePeer {
        id: NodeID,
        info_hash: NodeID,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

/// A reply body (`r` dictionary). Which optional fields are present depends
/// on the query that was answered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub id: NodeID,
    pub nodes: Option<Vec<NodeInfo>>,
    pub token: Option<Vec<u8>>,
    pub values: Option<Vec<SocketAddrV4>>,
}

/// An error reply (`e` list of code and message).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

impl fmt::Display for KrpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        self.to_value().encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        Envelope::from_value(&Value::decode(bytes)?)
    }

    pub fn to_value(&self) -> Value {
        let mut top = BTreeMap::new();
        top.insert(b"t".to_vec(), Value::Bytes(self.transaction_id.clone()));
        if let Some(version) = &self.version {
            top.insert(b"v".to_vec(), Value::Bytes(version.clone()));
        }
        match &self.message {
            Message::Query(query) => {
                top.insert(b"y".to_vec(), Value::from("q"));
                top.insert(b"q".to_vec(), Value::from(query.method_name()));
                top.insert(b"a".to_vec(), query.arguments());
            }
            Message::Response(response) => {
                top.insert(b"y".to_vec(), Value::from("r"));
                top.insert(b"r".to_vec(), response.to_value());
            }
            Message::Error(error) => {
                top.insert(b"y".to_vec(), Value::from("e"));
                top.insert(
                    b"e".to_vec(),
                    Value::List(vec![
                        Value::Integer(error.code),
                        Value::from(error.message.as_str()),
                    ]),
                );
            }
        }
        Value::Dict(top)
    }

    pub fn from_value(value: &Value) -> Result<Envelope> {
        let kind = required_bytes(value, "y")?;
        let message = match kind {
            b"q" => Message::Query(Query::from_value(value)?),
            b"r" => {
                let body = value
                    .get(b"r")
                    .ok_or(ErrorKind::MissingKey { key: "r" })?;
                Message::Response(Response::from_value(body)?)
            }
            b"e" => Message::Error(KrpcError::from_value(
                value.get(b"e").ok_or(ErrorKind::MissingKey { key: "e" })?,
            )?),
            other => {
                return Err(ErrorKind::UnknownMessageKind {
                    kind: String::from_utf8_lossy(other).into_owned(),
                }
                .into())
            }
        };

        // Some clients omit `t` on error replies; tolerate that one case so
        // the transport can log the error instead of dropping it unseen.
        let transaction_id = match value.get(b"t").and_then(Value::as_bytes) {
            Some(t) => t.to_vec(),
            None if kind == &b"e"[..] => Vec::new(),
            None => return Err(ErrorKind::MissingKey { key: "t" }.into()),
        };

        Ok(Envelope {
            transaction_id,
            version: value.get(b"v").and_then(Value::as_bytes).map(<[u8]>::to_vec),
            message,
        })
    }
}

impl Query {
    pub fn method_name(&self) -> &'static str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }

    /// Node id of the querying node, present in every method's arguments.
    pub fn id(&self) -> &NodeID {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. } => id,
        }
    }

    fn arguments(&self) -> Value {
        let mut args = BTreeMap::new();
        args.insert(b"id".to_vec(), Value::from(&self.id().as_bytes()[..]));
        match self {
            Query::Ping { .. } => {}
            Query::FindNode { target, .. } => {
                args.insert(b"target".to_vec(), Value::from(&target.as_bytes()[..]));
            }
            Query::GetPeers { info_hash, .. } => {
                args.insert(b"info_hash".to_vec(), Value::from(&info_hash.as_bytes()[..]));
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
                ..
            } => {
                args.insert(b"info_hash".to_vec(), Value::from(&info_hash.as_bytes()[..]));
                args.insert(b"port".to_vec(), Value::Integer(i64::from(*port)));
                args.insert(b"token".to_vec(), Value::Bytes(token.clone()));
                if *implied_port {
                    args.insert(b"implied_port".to_vec(), Value::Boolean(true));
                }
            }
        }
        Value::Dict(args)
    }

    fn from_value(top: &Value) -> Result<Query> {
        let method = required_bytes(top, "q")?.to_vec();
        let args = top.get(b"a").ok_or(ErrorKind::MissingKey { key: "a" })?;

        match method.as_slice() {
            b"ping" => Ok(Query::Ping {
                id: id_field(args, "id")?,
            }),
            b"find_node" => Ok(Query::FindNode {
                id: id_field(args, "id")?,
                target: id_field(args, "target")?,
            }),
            b"get_peers" => Ok(Query::GetPeers {
                id: id_field(args, "id")?,
                info_hash: id_field(args, "info_hash")?,
            }),
            b"announce_peer" => {
                let port = args
                    .get(b"port")
                    .and_then(Value::as_integer)
                    .filter(|port| (0..=i64::from(u16::MAX)).contains(port))
                    .ok_or(ErrorKind::WrongType { key: "port" })?;
                let token = args
                    .get(b"token")
                    .and_then(Value::as_bytes)
                    .ok_or(ErrorKind::MissingKey { key: "token" })?;
                let implied_port = args
                    .get(b"implied_port")
                    .and_then(Value::as_integer)
                    .map_or(false, |flag| flag != 0);
                Ok(Query::AnnouncePeer {
                    id: id_field(args, "id")?,
                    info_hash: id_field(args, "info_hash")?,
                    port: port as u16,
                    token: token.to_vec(),
                    implied_port,
                })
            }
            other => Err(ErrorKind::UnknownMethod {
                method: String::from_utf8_lossy(other).into_owned(),
            }
            .into()),
        }
    }
}

impl Response {
    /// A reply carrying nothing but the responder's id, the shape used for
    /// `ping` and `announce_peer`.
    pub fn only_id(id: NodeID) -> Response {
        Response {
            id,
            nodes: None,
            token: None,
            values: None,
        }
    }

    fn to_value(&self) -> Value {
        let mut body = BTreeMap::new();
        body.insert(b"id".to_vec(), Value::from(&self.id.as_bytes()[..]));
        if let Some(nodes) = &self.nodes {
            body.insert(b"nodes".to_vec(), Value::Bytes(NodeInfo::encode_list(nodes)));
        }
        if let Some(token) = &self.token {
            body.insert(b"token".to_vec(), Value::Bytes(token.clone()));
        }
        if let Some(values) = &self.values {
            body.insert(
                b"values".to_vec(),
                Value::List(
                    values
                        .iter()
                        .map(|addr| Value::Bytes(node_info::encode_peer(addr).to_vec()))
                        .collect(),
                ),
            );
        }
        Value::Dict(body)
    }

    fn from_value(body: &Value) -> Result<Response> {
        let id = id_field(body, "id")?;

        // A ragged compact blob invalidates the field, not the message.
        let nodes = match body.get(b"nodes").and_then(Value::as_bytes) {
            Some(blob) => match NodeInfo::decode_list(blob) {
                Ok(nodes) => Some(nodes),
                Err(err) => {
                    log::debug!("dropping nodes field: {}", err);
                    None
                }
            },
            None => None,
        };

        let values = match body.get(b"values").and_then(Value::as_list) {
            Some(entries) => {
                let decoded: Result<Vec<SocketAddrV4>> = entries
                    .iter()
                    .map(|entry| {
                        entry
                            .as_bytes()
                            .ok_or_else(|| ErrorKind::WrongType { key: "values" }.into())
                            .and_then(node_info::decode_peer)
                    })
                    .collect();
                match decoded {
                    Ok(peers) => Some(peers),
                    Err(err) => {
                        log::debug!("dropping values field: {}", err);
                        None
                    }
                }
            }
            None => None,
        };

        Ok(Response {
            id,
            nodes,
            token: body.get(b"token").and_then(Value::as_bytes).map(<[u8]>::to_vec),
            values,
        })
    }
}

impl KrpcError {
    fn from_value(value: &Value) -> Result<KrpcError> {
        let entries = value.as_list().ok_or(ErrorKind::WrongType { key: "e" })?;
        let code = entries
            .first()
            .and_then(Value::as_integer)
            .ok_or(ErrorKind::WrongType { key: "e" })?;
        let message = entries
            .get(1)
            .and_then(Value::as_bytes)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default();
        Ok(KrpcError { code, message })
    }
}

fn required_bytes<'a>(value: &'a Value, key: &'static str) -> Result<&'a [u8]> {
    value
        .get(key.as_bytes())
        .ok_or(ErrorKind::MissingKey { key })?
        .as_bytes()
        .ok_or_else(|| ErrorKind::WrongType { key }.into())
}

fn id_field(args: &Value, key: &'static str) -> Result<NodeID> {
    let bytes = args
        .get(key.as_bytes())
        .ok_or(ErrorKind::MissingKey { key })?
        .as_bytes()
        .ok_or(ErrorKind::WrongType { key })?;
    NodeID::from_slice(bytes)
}
