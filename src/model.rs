use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

pub const DEFAULT_INCIDENT_MESSAGE: &str = "Emergency alert";
const UNKNOWN_USER_NAME: &str = "Unknown";

pub type Fields = Map<String, JsonValue>;

/// A document as delivered by the remote store: backend id plus raw fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field)
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(|value| value.as_bool())
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("document {id} is malformed: {source}")]
    Malformed {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("document {id} has no usable coordinates")]
    MissingPosition { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        let point = Self::new(latitude?, longitude?);
        point.is_valid().then_some(point)
    }
}

/// Backend timestamps arrive as RFC3339 strings, epoch milliseconds, or float epoch seconds.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Str(String),
    Int(i64),
    Float(f64),
}

impl RawTimestamp {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            RawTimestamp::Int(ms) => Utc.timestamp_millis_opt(*ms).single(),
            RawTimestamp::Float(secs) if secs.is_finite() => {
                Utc.timestamp_millis_opt((*secs * 1000.0) as i64).single()
            }
            RawTimestamp::Float(_) => None,
        }
    }
}

fn parse_timestamp(raw: Option<RawTimestamp>) -> Option<DateTime<Utc>> {
    raw.as_ref().and_then(RawTimestamp::to_datetime)
}

pub fn timestamp_value(ts: DateTime<Utc>) -> JsonValue {
    JsonValue::String(ts.to_rfc3339())
}

pub fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "unknown time".to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationFields {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    updated_at: Option<RawTimestamp>,
    #[serde(default)]
    is_admin: Option<bool>,
}

/// One per user, written by that user's own client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRecord {
    pub user_id: String,
    pub user_name: String,
    pub position: GeoPoint,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_admin: bool,
}

impl LocationRecord {
    pub fn from_document(doc: &Document) -> Result<Self, RecordError> {
        let raw: LocationFields = serde_json::from_value(JsonValue::Object(doc.fields.clone()))
            .map_err(|source| RecordError::Malformed {
                id: doc.id.clone(),
                source,
            })?;
        let position = GeoPoint::from_parts(raw.latitude, raw.longitude)
            .ok_or_else(|| RecordError::MissingPosition { id: doc.id.clone() })?;
        let user_id = raw
            .user_id
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| doc.id.clone());
        Ok(Self {
            user_id,
            user_name: non_blank(raw.user_name).unwrap_or_else(|| UNKNOWN_USER_NAME.to_string()),
            position,
            updated_at: parse_timestamp(raw.updated_at),
            is_admin: raw.is_admin.unwrap_or(false),
        })
    }

    /// Only the fields the reporting user owns; written with merge semantics.
    pub fn owned_fields(user_id: &str, user_name: &str, position: GeoPoint, now: DateTime<Utc>) -> Fields {
        let mut fields = Fields::new();
        fields.insert("userId".to_string(), json!(user_id));
        fields.insert("userName".to_string(), json!(user_name));
        fields.insert("latitude".to_string(), json!(position.latitude));
        fields.insert("longitude".to_string(), json!(position.longitude));
        fields.insert("updatedAt".to_string(), timestamp_value(now));
        fields
    }
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncidentFields {
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    location: Option<RawLocation>,
    #[serde(default)]
    reported_by: Option<String>,
    #[serde(default)]
    resolved: Option<bool>,
    #[serde(default)]
    created_at: Option<RawTimestamp>,
    #[serde(default)]
    resolved_by: Option<String>,
    #[serde(default)]
    resolved_at: Option<RawTimestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: String,
    pub user_name: String,
    pub message: String,
    pub location: Option<GeoPoint>,
    pub reported_by: String,
    pub resolved: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// A missing or out-of-range location is not an error: the incident stays
    /// active, it just cannot be drawn.
    pub fn from_document(doc: &Document) -> Result<Self, RecordError> {
        let raw: IncidentFields = serde_json::from_value(JsonValue::Object(doc.fields.clone()))
            .map_err(|source| RecordError::Malformed {
                id: doc.id.clone(),
                source,
            })?;
        let location = raw
            .location
            .and_then(|loc| GeoPoint::from_parts(loc.latitude, loc.longitude));
        Ok(Self {
            id: doc.id.clone(),
            user_name: non_blank(raw.user_name).unwrap_or_else(|| UNKNOWN_USER_NAME.to_string()),
            message: raw.message.unwrap_or_default(),
            location,
            reported_by: raw.reported_by.unwrap_or_default(),
            resolved: raw.resolved.unwrap_or(false),
            created_at: parse_timestamp(raw.created_at),
            resolved_by: non_blank(raw.resolved_by),
            resolved_at: parse_timestamp(raw.resolved_at),
        })
    }

    pub fn display_message(&self) -> &str {
        let trimmed = self.message.trim();
        if trimmed.is_empty() {
            DEFAULT_INCIDENT_MESSAGE
        } else {
            trimmed
        }
    }

    pub fn new_report_fields(
        reporter_id: &str,
        reporter_name: &str,
        message: &str,
        position: GeoPoint,
        now: DateTime<Utc>,
    ) -> Fields {
        let message = match message.trim() {
            "" => DEFAULT_INCIDENT_MESSAGE,
            trimmed => trimmed,
        };
        let mut fields = Fields::new();
        fields.insert("userName".to_string(), json!(reporter_name));
        fields.insert("message".to_string(), json!(message));
        fields.insert(
            "location".to_string(),
            json!({ "latitude": position.latitude, "longitude": position.longitude }),
        );
        fields.insert("reportedBy".to_string(), json!(reporter_id));
        fields.insert("resolved".to_string(), json!(false));
        fields.insert("createdAt".to_string(), timestamp_value(now));
        fields
    }

    pub fn resolution_fields(resolved_by: &str, now: DateTime<Utc>) -> Fields {
        let mut fields = Fields::new();
        fields.insert("resolved".to_string(), json!(true));
        fields.insert("resolvedBy".to_string(), json!(resolved_by));
        fields.insert("resolvedAt".to_string(), timestamp_value(now));
        fields
    }
}

/// Roster row published to admin viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPresence {
    pub user_id: String,
    pub user_name: String,
    pub online: bool,
    pub is_admin: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// User-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
