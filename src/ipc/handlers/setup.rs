use crate::approval;
use crate::auth::Capability;
use crate::calc::{ComponentWeights, GradingConfig, GradingPolicy};
use crate::db;
use crate::fees::FeeStatus;
use crate::ipc::error::{respond, IpcError};
use crate::ipc::helpers::{db_conn, parse_session, parse_term, require};
use crate::ipc::types::{AppState, Request};
use crate::printable::SchoolHeader;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

pub const DEFAULT_SCHOOL_NAME: &str = "Graceland Royal Academy";

#[derive(Clone, Copy)]
enum SetupSection {
    School,
    Grading,
    Approval,
    Notifications,
}

impl SetupSection {
    const ALL: [SetupSection; 4] = [
        SetupSection::School,
        SetupSection::Grading,
        SetupSection::Approval,
        SetupSection::Notifications,
    ];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "grading" => Some(Self::Grading),
            "approval" => Some(Self::Approval),
            "notifications" => Some(Self::Notifications),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::School => "school",
            Self::Grading => "grading",
            Self::Approval => "approval",
            Self::Notifications => "notifications",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "setup.school",
            Self::Grading => "setup.grading",
            Self::Approval => "setup.approval",
            Self::Notifications => "setup.notifications",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "name": DEFAULT_SCHOOL_NAME,
            "address": "",
            "motto": "",
            "currentTerm": null,
            "currentSession": null
        }),
        SetupSection::Grading => json!({
            "policy": "raw_sum",
            "test1Weight": 20.0,
            "test2Weight": 20.0,
            "examWeight": 60.0
        }),
        SetupSection::Approval => json!({
            "minimumFeeStatus": "partial",
            "notifyParents": true
        }),
        SetupSection::Notifications => json!({
            "maxPerUser": 200
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "name" => {
                    let s = parse_string_max(v, k, 120)?;
                    if s.is_empty() {
                        return Err("name must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "address" | "motto" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                "currentTerm" => {
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                    } else {
                        let raw = parse_string_max(v, k, 32)?;
                        let term = parse_term(&raw).map_err(|e| e.to_string())?;
                        obj.insert(k.clone(), Value::String(term));
                    }
                }
                "currentSession" => {
                    if v.is_null() {
                        obj.insert(k.clone(), Value::Null);
                    } else {
                        let raw = parse_string_max(v, k, 16)?;
                        let session = parse_session(&raw).map_err(|e| e.to_string())?;
                        obj.insert(k.clone(), Value::String(session));
                    }
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Grading => match k.as_str() {
                "policy" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(policy) = GradingPolicy::parse(&s) else {
                        return Err("policy must be one of: raw_sum, weighted, direct".into());
                    };
                    obj.insert(k.clone(), Value::String(policy.as_str().to_string()));
                }
                "test1Weight" | "test2Weight" | "examWeight" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Approval => match k.as_str() {
                "minimumFeeStatus" => {
                    let s = parse_string_max(v, k, 16)?;
                    let Some(min) = approval::parse_minimum_fee_status(&s) else {
                        return Err("minimumFeeStatus must be one of: partial, paid".into());
                    };
                    obj.insert(k.clone(), Value::String(min.as_str().to_string()));
                }
                "notifyParents" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown approval field: {}", k)),
            },
            SetupSection::Notifications => match k.as_str() {
                "maxPerUser" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 10, 1000)?));
                }
                _ => return Err(format!("unknown notifications field: {}", k)),
            },
        }
    }
    Ok(())
}

/// Cross-field checks that only make sense after a patch has been merged.
fn validate_section(section: SetupSection, current: &Value) -> Result<(), String> {
    if let SetupSection::Grading = section {
        weights_from(current)
            .validate()
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn weights_from(grading: &Value) -> ComponentWeights {
    let d = ComponentWeights::default();
    ComponentWeights {
        test1: grading["test1Weight"].as_f64().unwrap_or(d.test1),
        test2: grading["test2Weight"].as_f64().unwrap_or(d.test2),
        exam: grading["examWeight"].as_f64().unwrap_or(d.exam),
    }
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

pub fn grading_config(conn: &Connection) -> Result<GradingConfig, IpcError> {
    let grading = load_section(conn, SetupSection::Grading).map_err(IpcError::settings)?;
    let policy = grading["policy"]
        .as_str()
        .and_then(GradingPolicy::parse)
        .unwrap_or_default();
    let weights = weights_from(&grading);
    if weights.validate().is_err() {
        return Ok(GradingConfig {
            policy,
            weights: ComponentWeights::default(),
        });
    }
    Ok(GradingConfig { policy, weights })
}

pub struct ApprovalSettings {
    pub minimum_fee_status: FeeStatus,
    pub notify_parents: bool,
}

pub fn approval_settings(conn: &Connection) -> Result<ApprovalSettings, IpcError> {
    let v = load_section(conn, SetupSection::Approval).map_err(IpcError::settings)?;
    Ok(ApprovalSettings {
        minimum_fee_status: v["minimumFeeStatus"]
            .as_str()
            .and_then(approval::parse_minimum_fee_status)
            .unwrap_or(FeeStatus::Partial),
        notify_parents: v["notifyParents"].as_bool().unwrap_or(true),
    })
}

pub fn max_notifications_per_user(conn: &Connection) -> Result<i64, IpcError> {
    let v = load_section(conn, SetupSection::Notifications).map_err(IpcError::settings)?;
    Ok(v["maxPerUser"].as_i64().unwrap_or(200))
}

pub fn current_period(conn: &Connection) -> Result<(Option<String>, Option<String>), IpcError> {
    let v = load_section(conn, SetupSection::School).map_err(IpcError::settings)?;
    Ok((
        v["currentTerm"].as_str().map(str::to_string),
        v["currentSession"].as_str().map(str::to_string),
    ))
}

pub fn school_header(conn: &Connection) -> Result<SchoolHeader, IpcError> {
    let v = load_section(conn, SetupSection::School).map_err(IpcError::settings)?;
    Ok(SchoolHeader {
        name: v["name"].as_str().unwrap_or(DEFAULT_SCHOOL_NAME).to_string(),
        address: v["address"].as_str().unwrap_or_default().to_string(),
        motto: v["motto"].as_str().unwrap_or_default().to_string(),
    })
}

fn handle_setup_get(state: &mut AppState, _req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    crate::ipc::helpers::session(state)?;
    let mut out = Map::new();
    for section in SetupSection::ALL {
        let v = load_section(conn, section).map_err(IpcError::settings)?;
        out.insert(section.name().to_string(), v);
    }
    Ok(Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Result<Value, IpcError> {
    let conn = db_conn(state)?;
    require(state, Capability::ManageSchool)?;
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return Err(IpcError::bad("missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(IpcError::bad_with(
            "unknown section",
            json!({ "section": section_raw }),
        ));
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(IpcError::bad("patch must be an object"));
    };

    let mut current = load_section(conn, section).map_err(IpcError::settings)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(IpcError::bad)?;
    validate_section(section, &current).map_err(IpcError::bad)?;
    db::settings_set_json(conn, section.key(), &current).map_err(IpcError::settings)?;
    tracing::info!(section = section.name(), "setup section updated");
    Ok(json!({ "section": section.name(), "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let outcome = match req.method.as_str() {
        "setup.get" => handle_setup_get(state, req),
        "setup.update" => handle_setup_update(state, req),
        _ => return None,
    };
    Some(respond(&req.id, outcome))
}
