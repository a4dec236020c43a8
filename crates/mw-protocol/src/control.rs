//! Control messages (`^` lines).
//!
//! All control messages are comma-separated with escaped atoms. The code
//! after the caret selects the message; the layouts are frozen:
//!
//! ```text
//! ^L,role,app_name,app_version,core_version,compress_mask,alert_flag,app_uuid,user_id
//! ^LA,OK|FAIL,compress_mask,app_name,app_version,core_version,alert_flag,app_uuid,user_id
//! ^RESET,type_list,ts,reset_seq,requester_uuid,target_uuid_or_*,deploy_time,origin_uuid,params,app_name,version,core,remote_addr
//! ^REMOVE_NODES,uuid1;uuid2;…
//! ^ACK,type,origin_uuid,destination_uuid,ack_seq
//! ^PING,send_ts
//! ^PONG,pong_ts,echoed_send_ts
//! ^COMPRESS_REQ / ^COMPRESS_ACK
//! ```

use uuid::Uuid;

use crate::ProtocolError;
use mw_codec::escape::{escape, split_raw, unescape};

// ---------------------------------------------------------------------------
// Pieces
// ---------------------------------------------------------------------------

/// Channel role announced at login. Login direction is consumer→producer
/// only; the answering side refuses a role collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    fn encode(self) -> &'static str {
        match self {
            Role::Producer => "P",
            Role::Consumer => "C",
        }
    }

    fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "P" => Ok(Role::Producer),
            "C" => Ok(Role::Consumer),
            other => Err(ProtocolError::BadControl(format!("bad role {other:?}"))),
        }
    }
}

/// Identity block shared by `Login` and `LoginAck`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub app_name: String,
    pub app_version: String,
    pub core_version: String,
    pub app_uuid: Uuid,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub role: Role,
    pub info: AppInfo,
    /// Bit 0: peer can gzip its output.
    pub compress_mask: u32,
    /// Alert policy bits, forwarded to the external alert collaborator.
    pub alert_flag: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    pub ok: bool,
    pub compress_mask: u32,
    pub alert_flag: u32,
    pub info: AppInfo,
}

/// Reset request. `(ts, reset_seq)` are compared per origin to suppress
/// loops; `deploy_time` distinguishes counter restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRequest {
    pub types: Vec<String>,
    pub ts: String,
    pub reset_seq: u32,
    pub requester: Uuid,
    /// `None` = broadcast target (`*` on the wire).
    pub target: Option<Uuid>,
    pub deploy_time: String,
    pub origin: Uuid,
    pub params: String,
    pub app_name: String,
    pub app_version: String,
    pub core_version: String,
    pub remote_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveNodes {
    pub uuids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub type_code: String,
    pub origin: Uuid,
    pub destination: Uuid,
    pub ack_seq: u64,
}

// ---------------------------------------------------------------------------
// Control enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Login(Login),
    LoginAck(LoginAck),
    Reset(ResetRequest),
    RemoveNodes(RemoveNodes),
    Ack(Ack),
    Ping { send_ts: String },
    Pong { pong_ts: String, echoed_send_ts: String },
    CompressReq,
    CompressAck,
}

impl Control {
    /// Encode to a wire line (no trailing newline).
    pub fn encode(&self) -> String {
        match self {
            Control::Login(l) => format!(
                "^L,{},{},{},{},{},{},{},{}",
                l.role.encode(),
                escape(&l.info.app_name),
                escape(&l.info.app_version),
                escape(&l.info.core_version),
                l.compress_mask,
                l.alert_flag,
                l.info.app_uuid,
                escape(l.info.user_id.as_deref().unwrap_or("")),
            ),
            Control::LoginAck(a) => format!(
                "^LA,{},{},{},{},{},{},{},{}",
                if a.ok { "OK" } else { "FAIL" },
                a.compress_mask,
                escape(&a.info.app_name),
                escape(&a.info.app_version),
                escape(&a.info.core_version),
                a.alert_flag,
                a.info.app_uuid,
                escape(a.info.user_id.as_deref().unwrap_or("")),
            ),
            Control::Reset(r) => format!(
                "^RESET,{},{},{},{},{},{},{},{},{},{},{},{}",
                r.types
                    .iter()
                    .map(|t| escape(t))
                    .collect::<Vec<_>>()
                    .join(";"),
                r.ts,
                r.reset_seq,
                r.requester,
                r.target.map_or_else(|| "*".to_owned(), |u| u.to_string()),
                r.deploy_time,
                r.origin,
                escape(&r.params),
                escape(&r.app_name),
                escape(&r.app_version),
                escape(&r.core_version),
                escape(&r.remote_addr),
            ),
            Control::RemoveNodes(r) => format!(
                "^REMOVE_NODES,{}",
                r.uuids
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>()
                    .join(";")
            ),
            Control::Ack(a) => format!(
                "^ACK,{},{},{},{}",
                escape(&a.type_code),
                a.origin,
                a.destination,
                a.ack_seq
            ),
            Control::Ping { send_ts } => format!("^PING,{send_ts}"),
            Control::Pong { pong_ts, echoed_send_ts } => {
                format!("^PONG,{pong_ts},{echoed_send_ts}")
            }
            Control::CompressReq => "^COMPRESS_REQ".to_owned(),
            Control::CompressAck => "^COMPRESS_ACK".to_owned(),
        }
    }

    /// Parse a `^` wire line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let rest = line
            .strip_prefix('^')
            .ok_or_else(|| ProtocolError::BadControl(format!("not a control line: {line:?}")))?;
        let parts = split_raw(rest, ',', 0);
        let bad = |msg: &str| ProtocolError::BadControl(format!("{msg} in {line:?}"));

        match parts[0] {
            "L" => {
                if parts.len() != 9 {
                    return Err(bad("^L needs 9 fields"));
                }
                Ok(Control::Login(Login {
                    role: Role::parse(parts[1])?,
                    compress_mask: parts[5].parse().map_err(|_| bad("bad compress mask"))?,
                    alert_flag: parts[6].parse().map_err(|_| bad("bad alert flag"))?,
                    info: parse_app_info(parts[2], parts[3], parts[4], parts[7], parts[8])?,
                }))
            }
            "LA" => {
                if parts.len() != 9 {
                    return Err(bad("^LA needs 9 fields"));
                }
                let ok = match parts[1] {
                    "OK" => true,
                    "FAIL" => false,
                    _ => return Err(bad("bad ack status")),
                };
                Ok(Control::LoginAck(LoginAck {
                    ok,
                    compress_mask: parts[2].parse().map_err(|_| bad("bad compress mask"))?,
                    alert_flag: parts[6].parse().map_err(|_| bad("bad alert flag"))?,
                    info: parse_app_info(parts[3], parts[4], parts[5], parts[7], parts[8])?,
                }))
            }
            "RESET" => {
                if parts.len() != 13 {
                    return Err(bad("^RESET needs 13 fields"));
                }
                let types = parts[1]
                    .split(';')
                    .filter(|t| !t.is_empty())
                    .map(unescape)
                    .collect::<Result<Vec<_>, _>>()?;
                let target = match parts[5] {
                    "*" => None,
                    u => Some(u.parse().map_err(|_| bad("bad target uuid"))?),
                };
                Ok(Control::Reset(ResetRequest {
                    types,
                    ts: parts[2].to_owned(),
                    reset_seq: parts[3].parse().map_err(|_| bad("bad reset seq"))?,
                    requester: parts[4].parse().map_err(|_| bad("bad requester uuid"))?,
                    target,
                    deploy_time: parts[6].to_owned(),
                    origin: parts[7].parse().map_err(|_| bad("bad origin uuid"))?,
                    params: unescape(parts[8])?,
                    app_name: unescape(parts[9])?,
                    app_version: unescape(parts[10])?,
                    core_version: unescape(parts[11])?,
                    remote_addr: unescape(parts[12])?,
                }))
            }
            "REMOVE_NODES" => {
                if parts.len() != 2 {
                    return Err(bad("^REMOVE_NODES needs 2 fields"));
                }
                let uuids = parts[1]
                    .split(';')
                    .filter(|u| !u.is_empty())
                    .map(|u| u.parse().map_err(|_| bad("bad node uuid")))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Control::RemoveNodes(RemoveNodes { uuids }))
            }
            "ACK" => {
                if parts.len() != 5 {
                    return Err(bad("^ACK needs 5 fields"));
                }
                Ok(Control::Ack(Ack {
                    type_code: unescape(parts[1])?,
                    origin: parts[2].parse().map_err(|_| bad("bad origin uuid"))?,
                    destination: parts[3].parse().map_err(|_| bad("bad destination uuid"))?,
                    ack_seq: parts[4].parse().map_err(|_| bad("bad ack seq"))?,
                }))
            }
            "PING" => {
                if parts.len() != 2 {
                    return Err(bad("^PING needs 2 fields"));
                }
                Ok(Control::Ping { send_ts: parts[1].to_owned() })
            }
            "PONG" => {
                if parts.len() != 3 {
                    return Err(bad("^PONG needs 3 fields"));
                }
                Ok(Control::Pong {
                    pong_ts: parts[1].to_owned(),
                    echoed_send_ts: parts[2].to_owned(),
                })
            }
            "COMPRESS_REQ" => Ok(Control::CompressReq),
            "COMPRESS_ACK" => Ok(Control::CompressAck),
            other => Err(ProtocolError::BadControl(format!(
                "unknown control code {other:?}"
            ))),
        }
    }
}

fn parse_app_info(
    name: &str,
    version: &str,
    core: &str,
    uuid: &str,
    user: &str,
) -> Result<AppInfo, ProtocolError> {
    let user_id = unescape(user)?;
    Ok(AppInfo {
        app_name: unescape(name)?,
        app_version: unescape(version)?,
        core_version: unescape(core)?,
        app_uuid: uuid
            .parse()
            .map_err(|_| ProtocolError::BadControl(format!("bad app uuid {uuid:?}")))?,
        user_id: if user_id.is_empty() { None } else { Some(user_id) },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> AppInfo {
        AppInfo {
            app_name: "ticker, east".to_owned(),
            app_version: "2.1".to_owned(),
            core_version: "0.3.0".to_owned(),
            app_uuid: "6d1f7a4e-9f10-4c2e-8b67-0a3a5d2a9c11".parse().unwrap(),
            user_id: Some("ops".to_owned()),
        }
    }

    #[test]
    fn login_round_trip() {
        let msg = Control::Login(Login {
            role: Role::Consumer,
            info: info(),
            compress_mask: 1,
            alert_flag: 3,
        });
        assert_eq!(Control::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn login_ack_round_trip() {
        let msg = Control::LoginAck(LoginAck {
            ok: false,
            compress_mask: 0,
            alert_flag: 0,
            info: AppInfo { user_id: None, ..info() },
        });
        assert_eq!(Control::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn reset_round_trip() {
        let msg = Control::Reset(ResetRequest {
            types: vec!["Px".to_owned(), "Qy".to_owned()],
            ts: "140326092653589".to_owned(),
            reset_seq: 7,
            requester: Uuid::nil(),
            target: None,
            deploy_time: "140326090000000".to_owned(),
            origin: Uuid::nil(),
            params: String::new(),
            app_name: "ticker".to_owned(),
            app_version: "2.1".to_owned(),
            core_version: "0.3.0".to_owned(),
            remote_addr: "10.0.0.7:4455".to_owned(),
        });
        assert_eq!(Control::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn small_messages_round_trip() {
        let cases = [
            Control::RemoveNodes(RemoveNodes {
                uuids: vec![Uuid::nil(), "6d1f7a4e-9f10-4c2e-8b67-0a3a5d2a9c11".parse().unwrap()],
            }),
            Control::Ack(Ack {
                type_code: "Px".to_owned(),
                origin: Uuid::nil(),
                destination: Uuid::nil(),
                ack_seq: 991,
            }),
            Control::Ping { send_ts: "140326092653589".to_owned() },
            Control::Pong {
                pong_ts: "140326092653600".to_owned(),
                echoed_send_ts: "140326092653589".to_owned(),
            },
            Control::CompressReq,
            Control::CompressAck,
        ];
        for msg in cases {
            assert_eq!(Control::parse(&msg.encode()).unwrap(), msg, "{msg:?}");
        }
    }

    #[test]
    fn malformed_controls_are_rejected() {
        assert!(Control::parse("^L,producer").is_err());
        assert!(Control::parse("^NOPE,1").is_err());
        assert!(Control::parse("$Px,a,b").is_err());
        assert!(Control::parse("^ACK,Px,not-a-uuid,x,1").is_err());
    }
}
