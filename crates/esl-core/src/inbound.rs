//! Parsing of result frames reported by APs.
//!
//! `<` frames acknowledge a data batch with 28-character node records, `>`
//! frames answer a query with 64-character records. A data-ack starting with
//! the error sentinel carries a single status character instead of nodes.

use crate::error::CodecError;
use crate::wire::parse_hex_field;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const ERROR_SENTINEL: &str = "<00001CFFFFFFFF";
pub const DATA_NODE_LEN: usize = 28;
pub const QUERY_NODE_LEN: usize = 64;

const ERROR_CODE_OFFSET: usize = 18;
const NODES_OFFSET: usize = 7;
/// RF reading reported for a tag that did not answer.
pub const RF_ABSENT: i32 = -256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    SendData,
    Query,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApResultCode {
    I00Ok,
    E00ArmSysError,
    E01TagOtaResp,
    I02ApOtaOk,
    E03DataCrcInvalid,
    E04ApOtaCrcInvalid,
    E05TagOtaCrcInvalid,
    E06ApDataTimeout,
    E07ApReset,
    E08ApRecvTimeout,
    E09ApNoData,
    E10DataHeaderError,
    E11DataPareError,
    E12DataOtaError,
    E98UnknownData,
    E99SdkSysError,
}

impl ApResultCode {
    fn from_sentinel(code: char) -> Self {
        match code {
            '0' => ApResultCode::E00ArmSysError,
            '1' => ApResultCode::E01TagOtaResp,
            '2' => ApResultCode::I02ApOtaOk,
            '3' => ApResultCode::E03DataCrcInvalid,
            '4' => ApResultCode::E04ApOtaCrcInvalid,
            '5' => ApResultCode::E05TagOtaCrcInvalid,
            '6' => ApResultCode::E06ApDataTimeout,
            '7' => ApResultCode::E07ApReset,
            '8' => ApResultCode::E08ApRecvTimeout,
            '9' => ApResultCode::E09ApNoData,
            'a' => ApResultCode::E10DataHeaderError,
            'b' => ApResultCode::E11DataPareError,
            'c' => ApResultCode::E12DataOtaError,
            _ => ApResultCode::E98UnknownData,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ApResultCode::I00Ok | ApResultCode::I02ApOtaOk)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApResultCode::I00Ok => "I00_OK",
            ApResultCode::E00ArmSysError => "E00_ARM_SYS_ERROR",
            ApResultCode::E01TagOtaResp => "E01_TAG_OTA_RESP",
            ApResultCode::I02ApOtaOk => "I02_AP_OTA_OK",
            ApResultCode::E03DataCrcInvalid => "E03_DATA_CRC_INVALID",
            ApResultCode::E04ApOtaCrcInvalid => "E04_AP_OTA_CRC_INVALID",
            ApResultCode::E05TagOtaCrcInvalid => "E05_TAG_OTA_CRC_INVALID",
            ApResultCode::E06ApDataTimeout => "E06_AP_DATA_TIMEOUT",
            ApResultCode::E07ApReset => "E07_AP_RESET",
            ApResultCode::E08ApRecvTimeout => "E08_AP_RECV_TIMEOUT",
            ApResultCode::E09ApNoData => "E09_AP_NO_DATA",
            ApResultCode::E10DataHeaderError => "E10_DATA_HEADER_ERROR",
            ApResultCode::E11DataPareError => "E11_DATA_PARE_ERROR",
            ApResultCode::E12DataOtaError => "E12_DATA_OTA_ERROR",
            ApResultCode::E98UnknownData => "E98_UNKNOWN_DATA",
            ApResultCode::E99SdkSysError => "E99_SDK_SYS_ERROR",
        }
    }
}

impl fmt::Display for ApResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagOutcome {
    Unknown,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDetail {
    pub group: u16,
    pub index: u8,
    pub wakeup: u8,
    pub scan: u8,
    pub key: String,
}

/// One tag's report inside a result frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagReport {
    pub tag_id: String,
    pub rf_power: i32,
    pub token: u16,
    /// Raw battery reading in tenths of a volt; 0 when out of range.
    pub battery: u8,
    pub version: String,
    pub screen: String,
    pub temperature: i32,
    pub query: Option<QueryDetail>,
}

impl TagReport {
    pub fn outcome(&self) -> TagOutcome {
        match self.rf_power {
            0 => TagOutcome::Unknown,
            RF_ABSENT => TagOutcome::Failed,
            _ => TagOutcome::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultFrame {
    pub kind: ResultKind,
    pub code: ApResultCode,
    pub reports: Vec<TagReport>,
}

/// Interprets a complete frame. A node that fails to parse rejects the whole
/// frame so that no partial results are applied.
pub fn parse_result_frame(data: &str) -> Result<ResultFrame, CodecError> {
    let kind = match data.chars().next() {
        Some('<') => ResultKind::SendData,
        Some('>') => ResultKind::Query,
        Some(_) => {
            return Ok(ResultFrame {
                kind: ResultKind::Error,
                code: ApResultCode::E98UnknownData,
                reports: Vec::new(),
            })
        }
        None => return Err(CodecError::EmptyFrame),
    };

    if data.starts_with(ERROR_SENTINEL) {
        let code = data
            .chars()
            .nth(ERROR_CODE_OFFSET)
            .map(ApResultCode::from_sentinel)
            .unwrap_or(ApResultCode::E98UnknownData);
        return Ok(ResultFrame {
            kind,
            code,
            reports: Vec::new(),
        });
    }

    let node_len = match kind {
        ResultKind::Query => QUERY_NODE_LEN,
        _ => DATA_NODE_LEN,
    };
    let nodes = data.get(NODES_OFFSET..).unwrap_or("");
    if !nodes.is_ascii() {
        return Err(CodecError::Node {
            node: 0,
            field: "encoding",
        });
    }
    let reports = nodes
        .as_bytes()
        .chunks_exact(node_len)
        .enumerate()
        .map(|(node, chunk)| parse_node(node, chunk, node_len))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ResultFrame {
        kind,
        code: ApResultCode::I00Ok,
        reports,
    })
}

fn parse_node(node: usize, chunk: &[u8], node_len: usize) -> Result<TagReport, CodecError> {
    // chunk is ascii, checked by the caller
    let text = std::str::from_utf8(chunk).map_err(|_| CodecError::Node {
        node,
        field: "encoding",
    })?;
    let field = |range: std::ops::Range<usize>, name: &'static str| {
        text.get(range).ok_or(CodecError::Node { node, field: name })
    };
    let hex = |range: std::ops::Range<usize>, name: &'static str| {
        field(range, name).and_then(|raw| {
            parse_hex_field(raw).ok_or(CodecError::Node { node, field: name })
        })
    };

    let tag_id = field(0..12, "tag_id")?.to_string();
    let rf_power = hex(12..14, "rf_power")? as i32 - 256;
    let token = hex(22..26, "token")? as u16;
    let mut report = TagReport {
        tag_id,
        rf_power,
        token,
        battery: 0,
        version: String::new(),
        screen: String::new(),
        temperature: 0,
        query: None,
    };
    if rf_power == RF_ABSENT {
        return Ok(report);
    }

    let battery = hex(14..16, "battery")?;
    report.battery = if (15..=35).contains(&battery) {
        battery as u8
    } else {
        0
    };
    report.version = field(16..19, "version")?.to_string();
    report.screen = field(19..22, "screen")?.to_string();
    if node_len == QUERY_NODE_LEN {
        report.temperature = signed_byte(hex(32..34, "temperature")?);
        report.query = Some(QueryDetail {
            group: hex(26..30, "group")? as u16,
            index: hex(30..32, "index")? as u8,
            wakeup: hex(34..36, "wakeup")? as u8,
            scan: hex(36..38, "scan")? as u8,
            key: field(38..56, "key")?.to_string(),
        });
    } else {
        report.temperature = signed_byte(hex(26..28, "temperature")?);
    }
    Ok(report)
}

fn signed_byte(raw: u32) -> i32 {
    if raw > 127 {
        raw as i32 - 256
    } else {
        raw as i32
    }
}
