use serde::Deserialize;
use serde_json::Value;

use applier_base::{err, Error};

use crate::ids::{CollectionId, IndexId, Tick, TransactionId};

// Wire-level numeric marker codes. These are the follower's own convention
// for this contract (the master is a collaborator we don't own the source
// of here); they exist purely to round-trip through `type:int` on the wire.
pub mod wire_type {
    pub const DOC_INSERT: i64 = 2300;
    pub const EDGE_INSERT: i64 = 2301;
    pub const DOC_REMOVE: i64 = 2302;
    pub const TXN_START: i64 = 2400;
    pub const TXN_COMMIT: i64 = 2401;
    pub const TXN_ABORT: i64 = 2402;
    pub const COL_CREATE: i64 = 2500;
    pub const COL_DROP: i64 = 2501;
    pub const COL_RENAME: i64 = 2502;
    pub const COL_CHANGE: i64 = 2503;
    pub const IDX_CREATE: i64 = 2600;
    pub const IDX_DROP: i64 = 2601;
}

#[derive(Clone, Debug, PartialEq)]
pub enum Marker {
    DocInsert {
        tick: Tick,
        tid: Option<TransactionId>,
        cid: CollectionId,
        cname: Option<String>,
        key: String,
        rev: u64,
        data: Value,
        is_edge: bool,
    },
    DocRemove {
        tick: Tick,
        tid: Option<TransactionId>,
        cid: CollectionId,
        cname: Option<String>,
        key: String,
        rev: u64,
    },
    TxnStart {
        tick: Tick,
        tid: TransactionId,
    },
    TxnCommit {
        tick: Tick,
        tid: TransactionId,
    },
    TxnAbort {
        tick: Tick,
        tid: TransactionId,
    },
    ColCreate {
        tick: Tick,
        cid: CollectionId,
        collection: Value,
    },
    ColDrop {
        tick: Tick,
        cid: CollectionId,
    },
    ColRename {
        tick: Tick,
        cid: CollectionId,
        new_name: String,
    },
    ColChange {
        tick: Tick,
        cid: CollectionId,
        properties: Value,
    },
    IdxCreate {
        tick: Tick,
        cid: CollectionId,
        index: Value,
    },
    IdxDrop {
        tick: Tick,
        cid: CollectionId,
        idx: IndexId,
    },
}

impl Marker {
    pub fn tick(&self) -> Tick {
        match self {
            Marker::DocInsert { tick, .. }
            | Marker::DocRemove { tick, .. }
            | Marker::TxnStart { tick, .. }
            | Marker::TxnCommit { tick, .. }
            | Marker::TxnAbort { tick, .. }
            | Marker::ColCreate { tick, .. }
            | Marker::ColDrop { tick, .. }
            | Marker::ColRename { tick, .. }
            | Marker::ColChange { tick, .. }
            | Marker::IdxCreate { tick, .. }
            | Marker::IdxDrop { tick, .. } => *tick,
        }
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Marker::DocInsert { tid, .. } | Marker::DocRemove { tid, .. } => *tid,
            Marker::TxnStart { tid, .. }
            | Marker::TxnCommit { tid, .. }
            | Marker::TxnAbort { tid, .. } => Some(*tid),
            _ => None,
        }
    }

    pub fn collection_name(&self) -> Option<&str> {
        match self {
            Marker::DocInsert { cname, .. } | Marker::DocRemove { cname, .. } => {
                cname.as_deref()
            }
            _ => None,
        }
    }

    pub fn is_document_op(&self) -> bool {
        matches!(self, Marker::DocInsert { .. } | Marker::DocRemove { .. })
    }

    pub fn is_transaction_control(&self) -> bool {
        matches!(
            self,
            Marker::TxnStart { .. } | Marker::TxnCommit { .. } | Marker::TxnAbort { .. }
        )
    }
}

#[derive(Deserialize)]
struct RawMarker {
    tick: String,
    #[serde(rename = "type")]
    kind: i64,
    tid: Option<String>,
    cid: Option<String>,
    cname: Option<String>,
    key: Option<String>,
    rev: Option<String>,
    data: Option<Value>,
    collection: Option<Value>,
    #[serde(default)]
    index: Option<Value>,
    #[serde(default)]
    new_name: Option<String>,
}

fn req_tick(s: &str) -> Result<Tick, Error> {
    s.parse()
}

fn req_u64(s: Option<&str>, field: &'static str) -> Result<u64, Error> {
    s.and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| err(format!("missing or malformed field: {field}")))
}

fn req_str<'a>(s: &'a Option<String>, field: &'static str) -> Result<&'a str, Error> {
    s.as_deref()
        .ok_or_else(|| err(format!("missing field: {field}")))
}

fn req_value(v: &Option<Value>, field: &'static str) -> Result<Value, Error> {
    v.clone().ok_or_else(|| err(format!("missing field: {field}")))
}

impl TryFrom<RawMarker> for Marker {
    type Error = Error;

    fn try_from(raw: RawMarker) -> Result<Marker, Error> {
        let tick = req_tick(&raw.tick)?;
        let tid = raw
            .tid
            .as_deref()
            .map(|s| s.parse::<TransactionId>())
            .transpose()?;
        let cid_of = |raw: &RawMarker| -> Result<CollectionId, Error> {
            Ok(CollectionId(req_u64(raw.cid.as_deref(), "cid")?))
        };

        match raw.kind {
            wire_type::DOC_INSERT | wire_type::EDGE_INSERT => Ok(Marker::DocInsert {
                tick,
                tid,
                cid: cid_of(&raw)?,
                cname: raw.cname.clone(),
                key: req_str(&raw.key, "key")?.to_owned(),
                rev: req_u64(raw.rev.as_deref(), "rev")?,
                data: req_value(&raw.data, "data")?,
                is_edge: raw.kind == wire_type::EDGE_INSERT,
            }),
            wire_type::DOC_REMOVE => Ok(Marker::DocRemove {
                tick,
                tid,
                cid: cid_of(&raw)?,
                cname: raw.cname.clone(),
                key: req_str(&raw.key, "key")?.to_owned(),
                rev: req_u64(raw.rev.as_deref(), "rev")?,
            }),
            wire_type::TXN_START => Ok(Marker::TxnStart {
                tick,
                tid: tid.ok_or_else(|| err("txn start missing tid"))?,
            }),
            wire_type::TXN_COMMIT => Ok(Marker::TxnCommit {
                tick,
                tid: tid.ok_or_else(|| err("txn commit missing tid"))?,
            }),
            wire_type::TXN_ABORT => Ok(Marker::TxnAbort {
                tick,
                tid: tid.ok_or_else(|| err("txn abort missing tid"))?,
            }),
            wire_type::COL_CREATE => Ok(Marker::ColCreate {
                tick,
                cid: cid_of(&raw)?,
                collection: req_value(&raw.collection, "collection")?,
            }),
            wire_type::COL_DROP => Ok(Marker::ColDrop {
                tick,
                cid: cid_of(&raw)?,
            }),
            wire_type::COL_RENAME => Ok(Marker::ColRename {
                tick,
                cid: cid_of(&raw)?,
                new_name: req_str(&raw.new_name, "new_name")?.to_owned(),
            }),
            wire_type::COL_CHANGE => Ok(Marker::ColChange {
                tick,
                cid: cid_of(&raw)?,
                properties: req_value(&raw.collection, "collection")?,
            }),
            wire_type::IDX_CREATE => Ok(Marker::IdxCreate {
                tick,
                cid: cid_of(&raw)?,
                index: req_value(&raw.index, "index")?,
            }),
            wire_type::IDX_DROP => Ok(Marker::IdxDrop {
                tick,
                cid: cid_of(&raw)?,
                idx: IndexId(req_u64(
                    raw.index.as_ref().and_then(|v| v.get("id")).and_then(Value::as_str),
                    "index.id",
                )?),
            }),
            other => Err(err(format!("unexpected marker type {other}"))),
        }
    }
}

/// Decodes a newline-delimited chunk of marker records. A line shorter than
/// two bytes (bare `\n` or empty trailing line) ends the batch. A line that
/// fails to parse is either skipped (consuming one unit of `ignore_errors`)
/// or surfaced as an error, depending on the caller's remaining budget.
pub fn decode_markers(body: &str, mut ignore_errors: i64) -> Result<Vec<Marker>, Error> {
    let mut markers = Vec::new();
    for line in body.split('\n') {
        if line.len() < 2 {
            break;
        }
        match decode_one(line) {
            Ok(marker) => markers.push(marker),
            Err(e) => {
                if ignore_errors > 0 {
                    ignore_errors -= 1;
                    tracing::warn!(target: "applier", line = %truncate(line), error = ?e, "skipping malformed marker");
                } else {
                    let mut msg = String::from("invalid marker: ");
                    msg.push_str(&truncate(line));
                    return Err(err(msg));
                }
            }
        }
    }
    Ok(markers)
}

fn decode_one(line: &str) -> Result<Marker, Error> {
    let raw: RawMarker = serde_json::from_str(line)?;
    Marker::try_from(raw)
}

fn truncate(line: &str) -> String {
    if line.len() > 256 {
        format!("{}...", &line[..256])
    } else {
        line.to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn decodes_insert_and_remove() {
        let body = format!(
            "{{\"tick\":\"1001\",\"type\":{},\"cid\":\"7\",\"key\":\"a\",\"rev\":\"1\",\"data\":{{\"a\":1}}}}\n\
             {{\"tick\":\"1002\",\"type\":{},\"cid\":\"7\",\"key\":\"a\",\"rev\":\"2\"}}\n",
            wire_type::DOC_INSERT,
            wire_type::DOC_REMOVE
        );
        let markers = decode_markers(&body, 0).unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].tick(), Tick(1001));
        assert!(markers[0].is_document_op());
        assert_eq!(markers[1].tick(), Tick(1002));
    }

    #[test]
    fn malformed_line_errors_when_budget_exhausted() {
        let body = "not json at all\n";
        assert!(decode_markers(body, 0).is_err());
        assert!(decode_markers(body, 1).is_ok());
    }

    #[test]
    fn short_line_terminates_batch() {
        let body = format!(
            "{{\"tick\":\"1\",\"type\":{},\"tid\":\"9\"}}\n\n{{\"tick\":\"2\",\"type\":{},\"tid\":\"9\"}}\n",
            wire_type::TXN_START,
            wire_type::TXN_COMMIT
        );
        // the blank line ends the batch; the commit after it must not be parsed
        let markers = decode_markers(&body, 0).unwrap();
        assert_eq!(markers.len(), 1);
        assert!(matches!(markers[0], Marker::TxnStart { .. }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let body = "{\"tick\":\"1\",\"type\":9999}\n";
        assert!(decode_markers(body, 0).is_err());
    }
}
