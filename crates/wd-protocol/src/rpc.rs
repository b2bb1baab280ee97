//! RPC request and reply unions.
//!
//! A `Request` is a struct with one optional payload per tag; exactly one
//! must be populated.  Stream-carrying requests also name the sub-channels
//! (client-allocated IDs, see [`crate::frame`]) on which the reply and the
//! subscription items flow.

use serde::{Deserialize, Serialize};

use crate::message::{RFMessage, SensorInfo};

/// Identifies one multiplexed sub-channel within a connection.
pub type ChannelId = u32;

// ---------------------------------------------------------------------------
// Reply codes
// ---------------------------------------------------------------------------

/// Reply status, carried as a bare integer on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Code {
    #[default]
    Ok = 0,
    ClientError = 1,
    ServerError = 2,
}

impl Serialize for Code {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Code {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Code::Ok),
            1 => Ok(Code::ClientError),
            2 => Ok(Code::ServerError),
            v => Err(serde::de::Error::custom(format!("unknown reply code {v}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EchoRequest {
    pub text: String,
}

/// Subscribe to the RF message stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RFSubRequest {
    /// Replay history from here (ms since epoch); `<= 0` means live only.
    pub start_at: i64,
    /// When non-empty, only messages whose tag starts with this prefix are
    /// delivered (e.g. `"RFg212"`).
    #[serde(rename = "Match", default)]
    pub match_tag: String,
    /// Sub-channel the messages stream on.
    pub messages: ChannelId,
}

/// Transmit one RF message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RFSendRequest(pub RFMessage);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorInfoRequest {
    pub name: String,
}

/// Push a stream of values for one sensor (client -> server).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorDataRequest {
    pub name: String,
    pub info: SensorInfo,
    /// Sub-channel the values arrive on.
    pub values: ChannelId,
}

/// Read an interpolated range of one sensor (server -> client stream).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorReadRequest {
    pub name: String,
    pub start_at: i64,
    pub end_at: i64,
    /// Output slot width in milliseconds.
    pub step: i64,
    pub values: ChannelId,
}

/// Subscribe to one sensor's value stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SensorSubRequest {
    pub name: String,
    pub start_at: i64,
    pub values: ChannelId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParamPutRequest {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParamGetRequest {
    pub name: String,
}

// ---------------------------------------------------------------------------
// Request union
// ---------------------------------------------------------------------------

/// A request on the main channel.  Exactly one payload field is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Sub-channel the reply must be sent on.
    #[serde(rename = "Reply", default)]
    pub reply: ChannelId,
    #[serde(rename = "ER", default, skip_serializing_if = "Option::is_none")]
    pub er: Option<EchoRequest>,
    #[serde(rename = "RFS", default, skip_serializing_if = "Option::is_none")]
    pub rfs: Option<RFSubRequest>,
    #[serde(rename = "RF", default, skip_serializing_if = "Option::is_none")]
    pub rf: Option<RFSendRequest>,
    #[serde(rename = "SI", default, skip_serializing_if = "Option::is_none")]
    pub si: Option<SensorInfoRequest>,
    #[serde(rename = "SD", default, skip_serializing_if = "Option::is_none")]
    pub sd: Option<SensorDataRequest>,
    #[serde(rename = "SR", default, skip_serializing_if = "Option::is_none")]
    pub sr: Option<SensorReadRequest>,
    #[serde(rename = "SS", default, skip_serializing_if = "Option::is_none")]
    pub ss: Option<SensorSubRequest>,
    #[serde(rename = "PP", default, skip_serializing_if = "Option::is_none")]
    pub pp: Option<ParamPutRequest>,
    #[serde(rename = "PG", default, skip_serializing_if = "Option::is_none")]
    pub pg: Option<ParamGetRequest>,
}

impl Request {
    /// How many payload fields are populated; a valid request has one.
    pub fn populated(&self) -> usize {
        usize::from(self.er.is_some())
            + usize::from(self.rfs.is_some())
            + usize::from(self.rf.is_some())
            + usize::from(self.si.is_some())
            + usize::from(self.sd.is_some())
            + usize::from(self.sr.is_some())
            + usize::from(self.ss.is_some())
            + usize::from(self.pp.is_some())
            + usize::from(self.pg.is_some())
    }

    pub fn echo(text: impl Into<String>) -> Self {
        Request { er: Some(EchoRequest { text: text.into() }), ..Default::default() }
    }

    pub fn rf_send(m: RFMessage) -> Self {
        Request { rf: Some(RFSendRequest(m)), ..Default::default() }
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParamReply {
    pub name: String,
    pub value: String,
}

/// Reply to any request: a code, an error text, and at most one typed
/// payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "Code")]
    pub code: Code,
    #[serde(rename = "Error", default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(rename = "ER", default, skip_serializing_if = "Option::is_none")]
    pub er: Option<String>,
    #[serde(rename = "PR", default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<ParamReply>,
    #[serde(rename = "SI", default, skip_serializing_if = "Option::is_none")]
    pub si: Option<SensorInfo>,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::default()
    }

    pub fn client_error(error: impl Into<String>) -> Self {
        Reply { code: Code::ClientError, error: error.into(), ..Default::default() }
    }

    pub fn server_error(error: impl Into<String>) -> Self {
        Reply { code: Code::ServerError, error: error.into(), ..Default::default() }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}
