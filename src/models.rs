// Core data structures for slotcast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::scheduler::cron::CronSchedule;

pub type GroupId = i64;
pub type UnitId = i64;
pub type ContentId = i64;
pub type DestinationId = i64;
pub type PlacementId = i64;

/// Error returned when a stored enum value is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// Schedule Unit
// ============================================================================

/// How a unit picks its content on each cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// The single enabled item bound to the unit goes everywhere
    #[default]
    Fixed,
    /// Deterministic daily permutation walked from the rotation offset
    Random,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Random => "random",
        }
    }
}

impl FromStr for SelectionMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "random" => Ok(Self::Random),
            other => Err(UnknownVariant::new("selection mode", other)),
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to a placement after it is published
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    /// Stays until superseded or cleared
    #[default]
    None,
    /// Removed by the expiry sweeper once the duration has elapsed
    AfterDuration(Duration),
    /// Removed by a separate deletion trigger (expression is stored only)
    Cron(CronSchedule),
}

impl DeletePolicy {
    /// Storage name of the policy
    pub fn mode(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AfterDuration(_) => "after_duration",
            Self::Cron(_) => "cron",
        }
    }

    /// When a placement published at `published_at` should be swept
    pub fn scheduled_delete_at(&self, published_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::AfterDuration(duration) => chrono::Duration::from_std(*duration)
                .ok()
                .and_then(|d| published_at.checked_add_signed(d)),
            Self::None | Self::Cron(_) => None,
        }
    }
}

/// An independently time-triggered publication slot
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleUnit {
    pub id: UnitId,
    pub group_id: GroupId,

    /// Position of the unit within its group (unique per group)
    pub ordinal: u32,

    pub name: Option<String>,
    pub mode: SelectionMode,
    pub enabled: bool,
    pub publish_cron: CronSchedule,
    pub delete_policy: DeletePolicy,

    /// Cursor into the daily permutation, only meaningful in random mode
    pub rotation_offset: u32,
}

impl ScheduleUnit {
    /// Human readable label used in logs
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("#{} ({})", self.id, name),
            None => format!("#{} (group {} / slot {})", self.id, self.group_id, self.ordinal),
        }
    }
}

/// Fields required to persist a new unit
#[derive(Debug, Clone)]
pub struct NewUnit {
    pub group_id: GroupId,
    pub ordinal: u32,
    pub name: Option<String>,
    pub mode: SelectionMode,
    pub enabled: bool,
    pub publish_cron: CronSchedule,
    pub delete_policy: DeletePolicy,
}

impl NewUnit {
    /// Enabled fixed-mode unit with no deletion policy
    pub fn new(group_id: GroupId, ordinal: u32, publish_cron: CronSchedule) -> Self {
        Self {
            group_id,
            ordinal,
            name: None,
            mode: SelectionMode::Fixed,
            enabled: true,
            publish_cron,
            delete_policy: DeletePolicy::None,
        }
    }

    pub fn with_mode(mut self, mode: SelectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ============================================================================
// Content
// ============================================================================

/// Kind of media attached to a content item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Animation,
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Animation => "animation",
            Self::Document => "document",
        }
    }
}

impl FromStr for MediaKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "photo" => Ok(Self::Photo),
            "video" => Ok(Self::Video),
            "animation" => Ok(Self::Animation),
            "document" => Ok(Self::Document),
            other => Err(UnknownVariant::new("media kind", other)),
        }
    }
}

/// The publishable material itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBody {
    /// Copy an existing message without attribution
    Copy {
        source_chat: String,
        source_message: i64,
    },
    /// Plain text message
    Text { text: String },
    /// Media with optional caption
    Media {
        kind: MediaKind,
        file_id: String,
        caption: Option<String>,
    },
}

impl ContentBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Copy { .. } => "copy",
            Self::Text { .. } => "text",
            Self::Media { .. } => "media",
        }
    }
}

/// A single inline button under a published message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
}

impl Button {
    /// A button needs a label and exactly one action
    pub fn is_valid(&self) -> bool {
        !self.text.is_empty() && (self.url.is_some() != self.callback_data.is_some())
    }
}

/// Rows of inline buttons
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ButtonLayout {
    pub rows: Vec<Vec<Button>>,
}

impl ButtonLayout {
    /// Parse a stored layout, rejecting rows with invalid buttons
    pub fn from_json(json: &str) -> Result<Self, String> {
        let layout: Self = serde_json::from_str(json).map_err(|e| e.to_string())?;
        if let Some(bad) = layout.rows.iter().flatten().find(|b| !b.is_valid()) {
            return Err(format!("button '{}' must have exactly one of url or callback_data", bad.text));
        }
        Ok(layout)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|row| row.is_empty())
    }
}

/// A piece of publishable material (the creative)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    pub id: ContentId,

    /// Unbound items are never published
    pub unit_id: Option<UnitId>,

    pub enabled: bool,
    pub body: ContentBody,
    pub buttons: Option<ButtonLayout>,
}

impl ContentItem {
    /// Whether this item may be published by `unit_id`
    pub fn is_eligible_for(&self, unit_id: UnitId) -> bool {
        self.enabled && self.unit_id == Some(unit_id)
    }
}

/// Fields required to persist a new content item
#[derive(Debug, Clone)]
pub struct NewContent {
    pub unit_id: Option<UnitId>,
    pub enabled: bool,
    pub body: ContentBody,
    pub buttons: Option<ButtonLayout>,
}

impl NewContent {
    pub fn text(unit_id: Option<UnitId>, text: impl Into<String>) -> Self {
        Self {
            unit_id,
            enabled: true,
            body: ContentBody::Text { text: text.into() },
            buttons: None,
        }
    }

    pub fn copy_of(unit_id: Option<UnitId>, source_chat: impl Into<String>, source_message: i64) -> Self {
        Self {
            unit_id,
            enabled: true,
            body: ContentBody::Copy {
                source_chat: source_chat.into(),
                source_message,
            },
            buttons: None,
        }
    }

    pub fn with_buttons(mut self, buttons: ButtonLayout) -> Self {
        self.buttons = Some(buttons);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ============================================================================
// Destination
// ============================================================================

/// Lifecycle status of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationStatus {
    #[default]
    Active,
    Removed,
}

impl DestinationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Removed => "removed",
        }
    }
}

impl FromStr for DestinationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "removed" | "left" => Ok(Self::Removed),
            other => Err(UnknownVariant::new("destination status", other)),
        }
    }
}

/// A messaging target channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub id: DestinationId,

    /// Platform address (chat id or public handle)
    pub address: String,

    pub title: String,
    pub status: DestinationStatus,

    /// Advisory; the gateway rejects with a permanent error when wrong
    pub permissions_ok: bool,
}

impl Destination {
    /// Only active destinations with permissions take part in cycles
    pub fn participates(&self) -> bool {
        self.status == DestinationStatus::Active && self.permissions_ok
    }
}

/// Fields required to persist a new destination
#[derive(Debug, Clone)]
pub struct NewDestination {
    pub address: String,
    pub title: String,
    pub permissions_ok: bool,
}

impl NewDestination {
    pub fn new(address: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            title: title.into(),
            permissions_ok: true,
        }
    }
}

// ============================================================================
// Placement
// ============================================================================

/// Reference to a message living on the remote platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageRef(pub i64);

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What is (or was most recently) posted for a destination/unit pair
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub id: PlacementId,
    pub destination_id: DestinationId,
    pub unit_id: UnitId,
    pub content_id: Option<ContentId>,
    pub message: Option<MessageRef>,
    pub pinned: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub scheduled_delete_at: Option<DateTime<Utc>>,

    /// `None` while the remote post is live
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Placement {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Values written by a successful publish
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementDraft {
    pub destination_id: DestinationId,
    pub unit_id: UnitId,
    pub content_id: ContentId,
    pub message: MessageRef,
    pub pinned: bool,
    pub published_at: DateTime<Utc>,
    pub scheduled_delete_at: Option<DateTime<Utc>>,
}

/// A remote post captured for background removal
#[derive(Debug, Clone, PartialEq)]
pub struct RemovalTarget {
    pub placement_id: PlacementId,
    pub unit_id: UnitId,
    pub content_id: Option<ContentId>,
    pub destination: Destination,
    pub message: MessageRef,
}

// ============================================================================
// Audit
// ============================================================================

/// Side effect recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOp {
    Publish,
    Pin,
    Unpin,
    Delete,
}

impl AuditOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Pin => "pin",
            Self::Unpin => "unpin",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for AuditOp {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish" => Ok(Self::Publish),
            "pin" => Ok(Self::Pin),
            "unpin" => Ok(Self::Unpin),
            "delete" => Ok(Self::Delete),
            other => Err(UnknownVariant::new("audit op", other)),
        }
    }
}

/// Outcome of an audited side effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant::new("audit status", other)),
        }
    }
}

/// Append-only record of one attempted side effect
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    /// Assigned by the store
    pub id: Option<i64>,
    pub op: AuditOp,
    pub status: AuditStatus,
    pub unit_id: Option<UnitId>,
    pub destination_id: Option<DestinationId>,
    pub content_id: Option<ContentId>,
    pub message: Option<MessageRef>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn success(op: AuditOp, at: DateTime<Utc>) -> Self {
        Self::new(op, AuditStatus::Success, at)
    }

    pub fn failed(op: AuditOp, error: impl fmt::Display, at: DateTime<Utc>) -> Self {
        let mut record = Self::new(op, AuditStatus::Failed, at);
        record.error = Some(error.to_string());
        record
    }

    fn new(op: AuditOp, status: AuditStatus, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            op,
            status,
            unit_id: None,
            destination_id: None,
            content_id: None,
            message: None,
            error: None,
            created_at: at,
        }
    }

    pub fn for_pair(mut self, unit_id: UnitId, destination_id: DestinationId) -> Self {
        self.unit_id = Some(unit_id);
        self.destination_id = Some(destination_id);
        self
    }

    pub fn with_content(mut self, content_id: Option<ContentId>) -> Self {
        self.content_id = content_id;
        self
    }

    pub fn with_message(mut self, message: Option<MessageRef>) -> Self {
        self.message = message;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AuditStatus::Success
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<7} {:<7} unit={} dest={} content={} msg={}",
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.op.as_str(),
            self.status.as_str(),
            opt(self.unit_id),
            opt(self.destination_id),
            opt(self.content_id),
            opt(self.message),
        )?;
        if let Some(error) = &self.error {
            write!(f, " error={error}")?;
        }
        Ok(())
    }
}

fn opt<T: fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_delete_policy_after_duration() {
        let published = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let policy = DeletePolicy::AfterDuration(Duration::from_secs(60));

        assert_eq!(
            policy.scheduled_delete_at(published),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 0).unwrap())
        );
        assert_eq!(DeletePolicy::None.scheduled_delete_at(published), None);
    }

    #[test]
    fn test_selection_mode_parse() {
        assert_eq!("random".parse::<SelectionMode>().unwrap(), SelectionMode::Random);
        assert!("sometimes".parse::<SelectionMode>().is_err());
    }

    #[test]
    fn test_button_layout_rejects_ambiguous_button() {
        let ok = ButtonLayout::from_json(r#"[[{"text":"Open","url":"https://example.com"}]]"#);
        assert!(ok.is_ok());

        let both = ButtonLayout::from_json(
            r#"[[{"text":"Open","url":"https://example.com","callback_data":"x"}]]"#,
        );
        assert!(both.is_err());

        let neither = ButtonLayout::from_json(r#"[[{"text":"Open"}]]"#);
        assert!(neither.is_err());
    }

    #[test]
    fn test_destination_participation() {
        let mut dest = Destination {
            id: 1,
            address: "-1001".to_string(),
            title: "News".to_string(),
            status: DestinationStatus::Active,
            permissions_ok: true,
        };
        assert!(dest.participates());

        dest.permissions_ok = false;
        assert!(!dest.participates());

        dest.permissions_ok = true;
        dest.status = DestinationStatus::Removed;
        assert!(!dest.participates());
    }

    #[test]
    fn test_content_eligibility() {
        let item = ContentItem {
            id: 3,
            unit_id: Some(7),
            enabled: true,
            body: ContentBody::Text {
                text: "hello".to_string(),
            },
            buttons: None,
        };
        assert!(item.is_eligible_for(7));
        assert!(!item.is_eligible_for(8));
    }

    #[test]
    fn test_audit_record_display() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let record = AuditRecord::failed(AuditOp::Publish, "forbidden", at)
            .for_pair(1, 2)
            .with_content(Some(3));

        let line = record.to_string();
        assert!(line.contains("publish"));
        assert!(line.contains("failed"));
        assert!(line.contains("error=forbidden"));
        assert!(line.contains("msg=-"));
    }
}
