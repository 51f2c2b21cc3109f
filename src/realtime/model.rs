//! Register and sale records pushed by the realtime server.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStatus {
    Active,
    LockedByAdmin,
    ShiftClosed,
    Offline,
}

/// Last known state of one cashier terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterState {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    pub status: RegisterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_cashier: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub shift_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub today_sales_total: Option<f64>,
    /// Server revision; higher wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Partial register record carried by `register.updated`.
///
/// Outer `None` means the field was absent and keeps its old value;
/// `Some(None)` is an explicit `null` and clears it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RegisterUpdate {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub branch_id: Option<Option<String>>,
    #[serde(default)]
    pub status: Option<RegisterStatus>,
    #[serde(default, deserialize_with = "present")]
    pub current_cashier: Option<Option<String>>,
    #[serde(default, deserialize_with = "present_lenient_string")]
    pub shift_duration: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub today_sales_total: Option<Option<f64>>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl RegisterUpdate {
    /// Entry for a register seen for the first time.
    pub(crate) fn into_new_state(self) -> RegisterState {
        RegisterState {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            branch_id: self.branch_id.flatten(),
            status: self.status.unwrap_or(RegisterStatus::Active),
            current_cashier: self.current_cashier.flatten(),
            shift_duration: self.shift_duration.flatten(),
            today_sales_total: self.today_sales_total.flatten(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }

    /// Field-by-field shallow merge onto an existing entry.
    pub(crate) fn merge_into(self, state: &mut RegisterState) {
        if let Some(name) = self.name {
            state.name = name;
        }
        if let Some(branch_id) = self.branch_id {
            state.branch_id = branch_id;
        }
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(cashier) = self.current_cashier {
            state.current_cashier = cashier;
        }
        if let Some(duration) = self.shift_duration {
            state.shift_duration = duration;
        }
        if let Some(total) = self.today_sales_total {
            state.today_sales_total = total;
        }
        if self.version.is_some() {
            state.version = self.version;
        }
        if self.updated_at.is_some() {
            state.updated_at = self.updated_at;
        }
    }
}

/// One completed sale for the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalePreview {
    pub id: String,
    pub total: f64,
    pub items_count: u32,
    pub created_at: String,
    pub branch_id: String,
    pub register_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashier_name: Option<String>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Durations arrive either as display strings ("3h 12m") or as minutes.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn present_lenient_string<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_string(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_distinguishes_absent_from_null() {
        let update: RegisterUpdate = serde_json::from_value(json!({
            "id": "r1",
            "status": "shift_closed",
            "current_cashier": null
        }))
        .unwrap();
        assert_eq!(update.status, Some(RegisterStatus::ShiftClosed));
        assert_eq!(update.current_cashier, Some(None));
        assert_eq!(update.today_sales_total, None);
        assert_eq!(update.branch_id, None);
    }

    #[test]
    fn test_shift_duration_accepts_numbers() {
        let state: RegisterState = serde_json::from_value(json!({
            "id": "r2",
            "name": "Bar",
            "status": "active",
            "shift_duration": 95
        }))
        .unwrap();
        assert_eq!(state.shift_duration.as_deref(), Some("95"));
    }

    #[test]
    fn test_new_state_defaults() {
        let update: RegisterUpdate =
            serde_json::from_value(json!({ "id": "r9", "today_sales_total": 12.5 })).unwrap();
        let state = update.into_new_state();
        assert_eq!(state.name, "r9");
        assert_eq!(state.status, RegisterStatus::Active);
        assert_eq!(state.today_sales_total, Some(12.5));
    }

    #[test]
    fn test_sale_preview_shape() {
        let sale: SalePreview = serde_json::from_value(json!({
            "id": "s1",
            "total": 9.75,
            "items_count": 3,
            "created_at": "2026-10-19T12:00:00Z",
            "branch_id": "b1",
            "register_id": "r1"
        }))
        .unwrap();
        assert_eq!(sale.cashier_name, None);
        assert_eq!(sale.items_count, 3);
    }
}
