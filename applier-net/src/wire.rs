use std::time::Duration as StdDuration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;

use crate::ids::{ServerId, Tick, TransactionId};

/// Errors from the wire layer. `NoResponse` and `MasterError` are transient
/// (retried by the follower loop); `InvalidResponse` is fatal.
#[derive(Debug)]
pub enum WireError {
    NoResponse(String),
    MasterError { status: u16, message: String },
    InvalidResponse(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::NoResponse(msg) => write!(f, "no response from master: {msg}"),
            WireError::MasterError { status, message } => {
                write!(f, "master returned {status}: {message}")
            }
            WireError::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
        }
    }
}

impl std::error::Error for WireError {}

pub struct MasterInfo {
    pub server_id: ServerId,
    pub major_version: u32,
    pub minor_version: u32,
    pub endpoint: String,
}

impl MasterInfo {
    /// The ">= 2.7" feature level: PUT follow-log with a request body
    /// carrying open transaction ids for the bridge.
    pub fn supports_open_transactions_bridge(&self) -> bool {
        (self.major_version, self.minor_version) >= (2, 7)
    }
}

pub struct OpenTransactionsResponse {
    pub start_tick: Tick,
    pub from_present: bool,
    pub ids: Vec<TransactionId>,
}

pub struct FollowLogResponse {
    pub check_more: bool,
    pub from_present: bool,
    pub active: bool,
    pub last_included: Tick,
    pub last_tick: Tick,
    pub body: String,
}

/// The three calls the core consumes. Kept as a trait so the follower loop
/// and apply engine can be tested against an in-memory double instead of a
/// real HTTP master.
pub trait WireClient: Send {
    fn master_info(&self) -> Result<MasterInfo, WireError>;

    fn open_transactions(
        &self,
        from: Tick,
        to: Tick,
    ) -> Result<OpenTransactionsResponse, WireError>;

    fn follow_log(
        &self,
        fetch_tick: Tick,
        first_regular: Tick,
        include_system: bool,
        chunk_size: usize,
        open_transactions: &[TransactionId],
        use_put_bridge: bool,
    ) -> Result<FollowLogResponse, WireError>;
}

/// Blocking HTTP implementation of [`WireClient`] against a master's
/// replication endpoints. Request timeouts are this client's concern;
/// retry/backoff across calls belongs to the follower loop.
/// Floor under the per-call body cap, for the handshake and
/// open-transactions calls that carry no `chunk_size` hint to derive one
/// from.
const MIN_BODY_CAP_BYTES: usize = 1024 * 1024;

pub struct HttpWireClient {
    client: Client,
    base_url: String,
    server_id: ServerId,
    /// Multiplier applied to a `follow_log` call's `chunk_size` hint to get
    /// that call's body cap: the master's `chunkSize` is advisory only, so
    /// we still refuse to buffer past a bounded multiple of what we asked
    /// for rather than grow unbounded.
    body_cap_multiplier: usize,
}

impl HttpWireClient {
    pub fn new(base_url: impl Into<String>, server_id: ServerId) -> Self {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(60))
            .build()
            .expect("reqwest client builds with a fixed config");
        HttpWireClient {
            client,
            base_url: base_url.into(),
            server_id,
            body_cap_multiplier: 4,
        }
    }

    pub fn with_body_cap_multiplier(mut self, multiplier: usize) -> Self {
        self.body_cap_multiplier = multiplier;
        self
    }

    fn body_cap_for(&self, chunk_size: usize) -> usize {
        chunk_size
            .saturating_mul(self.body_cap_multiplier)
            .max(MIN_BODY_CAP_BYTES)
    }

    fn read_body_capped(&self, resp: Response, cap: usize) -> Result<String, WireError> {
        use std::io::Read;
        let mut reader = resp.take(cap as u64 + 1);
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|e| WireError::NoResponse(e.to_string()))?;
        if buf.len() > cap {
            return Err(WireError::InvalidResponse(format!(
                "response body exceeded cap of {cap} bytes"
            )));
        }
        Ok(buf)
    }

    fn header_str<'a>(resp: &'a reqwest::blocking::Response, name: &str) -> Option<&'a str> {
        resp.headers().get(name).and_then(|v| v.to_str().ok())
    }

    fn required_header(
        resp: &reqwest::blocking::Response,
        name: &str,
    ) -> Result<String, WireError> {
        Self::header_str(resp, name)
            .map(str::to_owned)
            .ok_or_else(|| WireError::InvalidResponse(format!("missing header {name}")))
    }

    fn required_bool_header(
        resp: &reqwest::blocking::Response,
        name: &str,
    ) -> Result<bool, WireError> {
        let v = Self::required_header(resp, name)?;
        v.parse::<bool>()
            .map_err(|_| WireError::InvalidResponse(format!("malformed bool header {name}")))
    }

    fn required_tick_header(
        resp: &reqwest::blocking::Response,
        name: &str,
    ) -> Result<Tick, WireError> {
        let v = Self::required_header(resp, name)?;
        v.parse::<u64>()
            .map(Tick)
            .map_err(|_| WireError::InvalidResponse(format!("malformed tick header {name}")))
    }
}

impl WireClient for HttpWireClient {
    fn master_info(&self) -> Result<MasterInfo, WireError> {
        let url = format!("{}/_api/replication/logger-state", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| WireError::NoResponse(e.to_string()))?;
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(WireError::MasterError {
                status: status.as_u16(),
                message: status_text(status),
            });
        }
        let body = self.read_body_capped(resp, MIN_BODY_CAP_BYTES)?;
        #[derive(serde::Deserialize)]
        struct Wire {
            server_id: String,
            major_version: u32,
            minor_version: u32,
            endpoint: String,
        }
        let w: Wire = serde_json::from_str(&body)
            .map_err(|e| WireError::InvalidResponse(e.to_string()))?;
        let server_id = w
            .server_id
            .parse::<u64>()
            .map(ServerId)
            .map_err(|_| WireError::InvalidResponse("malformed server id".into()))?;
        Ok(MasterInfo {
            server_id,
            major_version: w.major_version,
            minor_version: w.minor_version,
            endpoint: w.endpoint,
        })
    }

    fn open_transactions(
        &self,
        from: Tick,
        to: Tick,
    ) -> Result<OpenTransactionsResponse, WireError> {
        let url = format!(
            "{}/_api/replication/determine-open-transactions?serverId={}&from={}&to={}",
            self.base_url, self.server_id, from, to
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| WireError::NoResponse(e.to_string()))?;
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(WireError::MasterError {
                status: status.as_u16(),
                message: status_text(status),
            });
        }
        let from_present = Self::required_bool_header(&resp, "x-arango-replication-frompresent")?;
        let start_tick = Self::required_tick_header(&resp, "x-arango-replication-lasttick")?;
        let body = self.read_body_capped(resp, MIN_BODY_CAP_BYTES)?;
        let ids: Vec<String> =
            serde_json::from_str(&body).map_err(|e| WireError::InvalidResponse(e.to_string()))?;
        let ids = ids
            .into_iter()
            .map(|s| {
                s.parse::<u64>()
                    .map(TransactionId)
                    .map_err(|_| WireError::InvalidResponse("malformed transaction id".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OpenTransactionsResponse {
            start_tick,
            from_present,
            ids,
        })
    }

    fn follow_log(
        &self,
        fetch_tick: Tick,
        first_regular: Tick,
        include_system: bool,
        chunk_size: usize,
        open_transactions: &[TransactionId],
        use_put_bridge: bool,
    ) -> Result<FollowLogResponse, WireError> {
        let url = format!(
            "{}/_api/replication/logger-follow?chunkSize={}&from={}&firstRegular={}&serverId={}&includeSystem={}",
            self.base_url, chunk_size, fetch_tick, first_regular, self.server_id, include_system
        );

        let resp = if use_put_bridge {
            let ids: Vec<String> = open_transactions.iter().map(|t| t.0.to_string()).collect();
            self.client
                .put(&url)
                .json(&ids)
                .send()
                .map_err(|e| WireError::NoResponse(e.to_string()))?
        } else {
            self.client
                .get(&url)
                .send()
                .map_err(|e| WireError::NoResponse(e.to_string()))?
        };

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(WireError::MasterError {
                status: status.as_u16(),
                message: status_text(status),
            });
        }

        let check_more = Self::required_bool_header(&resp, "x-arango-replication-checkmore")?;
        let from_present = Self::required_bool_header(&resp, "x-arango-replication-frompresent")?;
        let active = Self::required_bool_header(&resp, "x-arango-replication-active")?;
        let last_included = Self::required_tick_header(&resp, "x-arango-replication-lastincluded")?;
        let last_tick = Self::required_tick_header(&resp, "x-arango-replication-lasttick")?;
        let body = self.read_body_capped(resp, self.body_cap_for(chunk_size))?;

        Ok(FollowLogResponse {
            check_more,
            from_present,
            active,
            last_included,
            last_tick,
            body,
        })
    }
}

fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("unknown status")
        .to_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn feature_level_gates_the_bridge() {
        let info = MasterInfo {
            server_id: ServerId(1),
            major_version: 2,
            minor_version: 7,
            endpoint: "tcp://x".into(),
        };
        assert!(info.supports_open_transactions_bridge());

        let legacy = MasterInfo {
            major_version: 2,
            minor_version: 6,
            ..info
        };
        assert!(!legacy.supports_open_transactions_bridge());
    }

    #[test]
    fn body_cap_scales_with_chunk_size_but_never_below_the_floor() {
        let client = HttpWireClient::new("http://x", ServerId(1));
        assert_eq!(client.body_cap_for(1024), MIN_BODY_CAP_BYTES);
        assert_eq!(client.body_cap_for(10 * 1024 * 1024), 40 * 1024 * 1024);

        let client = client.with_body_cap_multiplier(2);
        assert_eq!(client.body_cap_for(10 * 1024 * 1024), 20 * 1024 * 1024);
    }
}
