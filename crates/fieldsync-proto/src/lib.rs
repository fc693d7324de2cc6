use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub const LEADS_TABLE: &str = "leads";
pub const INVOICES_TABLE: &str = "invoices";
pub const EQUIPMENT_TABLE: &str = "equipment";
pub const AGENT_LOCATIONS_TABLE: &str = "agent_locations";
pub const PHOTOS_TABLE: &str = "job_photos";

/// A single queued intent together with its payload.
///
/// Serialized as `{"operation_type": "...", "data": {...}}` so the stored
/// form always names the variant next to its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation_type", content = "data", rename_all = "snake_case")]
pub enum Operation {
    UpdateLead(LeadUpdate),
    UpdateJobStatus(LeadUpdate),
    CreateInvoice(InvoiceDraft),
    UpdateInvoice(InvoiceUpdate),
    UpdateEquipment(EquipmentUpdate),
    UpdateAgentLocation(AgentLocation),
    UploadPhoto(PhotoUpload),
    DeletePhoto(PhotoDeletion),
    UpdateTimerLog(TimerLogUpdate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    UpdateLead,
    UpdateJobStatus,
    CreateInvoice,
    UpdateInvoice,
    UpdateEquipment,
    UpdateAgentLocation,
    UploadPhoto,
    DeletePhoto,
    UpdateTimerLog,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::UpdateLead => "update_lead",
            OperationKind::UpdateJobStatus => "update_job_status",
            OperationKind::CreateInvoice => "create_invoice",
            OperationKind::UpdateInvoice => "update_invoice",
            OperationKind::UpdateEquipment => "update_equipment",
            OperationKind::UpdateAgentLocation => "update_agent_location",
            OperationKind::UploadPhoto => "upload_photo",
            OperationKind::DeletePhoto => "delete_photo",
            OperationKind::UpdateTimerLog => "update_timer_log",
        }
    }

}

/// Returned when a stored or wire string names no known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value}")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

impl FromStr for OperationKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "update_lead" => OperationKind::UpdateLead,
            "update_job_status" => OperationKind::UpdateJobStatus,
            "create_invoice" => OperationKind::CreateInvoice,
            "update_invoice" => OperationKind::UpdateInvoice,
            "update_equipment" => OperationKind::UpdateEquipment,
            "update_agent_location" => OperationKind::UpdateAgentLocation,
            "upload_photo" => OperationKind::UploadPhoto,
            "delete_photo" => OperationKind::DeletePhoto,
            "update_timer_log" => OperationKind::UpdateTimerLog,
            _ => {
                return Err(UnknownVariant {
                    what: "operation type",
                    value: s.to_string(),
                })
            }
        };
        Ok(kind)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How an operation lands on its remote table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::UpdateLead(_) => OperationKind::UpdateLead,
            Operation::UpdateJobStatus(_) => OperationKind::UpdateJobStatus,
            Operation::CreateInvoice(_) => OperationKind::CreateInvoice,
            Operation::UpdateInvoice(_) => OperationKind::UpdateInvoice,
            Operation::UpdateEquipment(_) => OperationKind::UpdateEquipment,
            Operation::UpdateAgentLocation(_) => OperationKind::UpdateAgentLocation,
            Operation::UploadPhoto(_) => OperationKind::UploadPhoto,
            Operation::DeletePhoto(_) => OperationKind::DeletePhoto,
            Operation::UpdateTimerLog(_) => OperationKind::UpdateTimerLog,
        }
    }

    pub fn mutation_kind(&self) -> MutationKind {
        match self {
            Operation::CreateInvoice(_) | Operation::UploadPhoto(_) => MutationKind::Insert,
            Operation::UpdateAgentLocation(_) => MutationKind::Upsert,
            Operation::DeletePhoto(_) => MutationKind::Delete,
            Operation::UpdateLead(_)
            | Operation::UpdateJobStatus(_)
            | Operation::UpdateInvoice(_)
            | Operation::UpdateEquipment(_)
            | Operation::UpdateTimerLog(_) => MutationKind::Update,
        }
    }

    /// Table the operation targets when the caller has no reason to pick another.
    pub fn default_table(&self) -> &'static str {
        match self {
            Operation::UpdateLead(_)
            | Operation::UpdateJobStatus(_)
            | Operation::UpdateTimerLog(_) => LEADS_TABLE,
            Operation::CreateInvoice(_) | Operation::UpdateInvoice(_) => INVOICES_TABLE,
            Operation::UpdateEquipment(_) => EQUIPMENT_TABLE,
            Operation::UpdateAgentLocation(_) => AGENT_LOCATIONS_TABLE,
            Operation::UploadPhoto(_) | Operation::DeletePhoto(_) => PHOTOS_TABLE,
        }
    }

    pub fn is_create(&self) -> bool {
        self.mutation_kind() == MutationKind::Insert
    }

    /// Column values this operation writes. Empty for deletes.
    pub fn payload(&self) -> Map<String, Value> {
        match self {
            Operation::UpdateLead(p) | Operation::UpdateJobStatus(p) => object(p),
            Operation::CreateInvoice(p) => object(p),
            Operation::UpdateInvoice(p) => object(p),
            Operation::UpdateEquipment(p) => object(p),
            Operation::UpdateAgentLocation(p) => object(p),
            Operation::UploadPhoto(p) => p.row(),
            Operation::DeletePhoto(_) => Map::new(),
            Operation::UpdateTimerLog(p) => object(p),
        }
    }
}

fn object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

/// Partial update of a lead/job row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl LeadUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl LineItem {
    pub fn amount_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

/// Invoice insert with totals computed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub id: Uuid,
    pub lead_id: String,
    pub line_items: Vec<LineItem>,
    /// Tax rate in basis points (1825 = 18.25%)
    pub tax_rate_bps: u32,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status: InvoiceStatus,
    pub issued_at: DateTime<Utc>,
}

impl InvoiceDraft {
    pub fn new(lead_id: impl Into<String>, line_items: Vec<LineItem>, tax_rate_bps: u32) -> Self {
        let subtotal_cents: i64 = line_items.iter().map(LineItem::amount_cents).sum();
        let tax_cents = tax_for(subtotal_cents, tax_rate_bps);
        Self {
            id: Uuid::new_v4(),
            lead_id: lead_id.into(),
            line_items,
            tax_rate_bps,
            subtotal_cents,
            tax_cents,
            total_cents: subtotal_cents + tax_cents,
            notes: None,
            status: InvoiceStatus::Draft,
            issued_at: Utc::now(),
        }
    }
}

/// Rounds half away from zero to the nearest cent.
fn tax_for(subtotal_cents: i64, tax_rate_bps: u32) -> i64 {
    let raw = subtotal_cents * i64::from(tax_rate_bps);
    if raw >= 0 {
        (raw + 5_000) / 10_000
    } else {
        (raw - 5_000) / 10_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Void,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InvoiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquipmentUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_service_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_service_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLocation {
    pub agent_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub is_available: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoType {
    Before,
    After,
}

impl PhotoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoType::Before => "before",
            PhotoType::After => "after",
        }
    }
}

impl FromStr for PhotoType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before" => Ok(PhotoType::Before),
            "after" => Ok(PhotoType::After),
            _ => Err(UnknownVariant {
                what: "photo type",
                value: s.to_string(),
            }),
        }
    }
}

/// Upload of a locally held photo blob plus its metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoUpload {
    pub local_photo_id: i64,
    /// Id of the metadata row, generated on the device
    pub remote_id: Uuid,
    pub lead_id: String,
    pub photo_type: PhotoType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub storage_path: String,
}

impl PhotoUpload {
    pub fn row(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("id".into(), Value::String(self.remote_id.to_string()));
        row.insert("lead_id".into(), Value::String(self.lead_id.clone()));
        row.insert(
            "photo_type".into(),
            Value::String(self.photo_type.as_str().to_string()),
        );
        row.insert("storage_path".into(), Value::String(self.storage_path.clone()));
        if let Some(caption) = &self.caption {
            row.insert("caption".into(), Value::String(caption.clone()));
        }
        row
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoDeletion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_photo_id: Option<i64>,
    pub remote_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerLogUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_end_at: Option<DateTime<Utc>>,
}
