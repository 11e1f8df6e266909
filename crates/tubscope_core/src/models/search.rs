//! Device-owner lookup models.

use serde::{Deserialize, Serialize};

/// Column of the user profile table a search matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchField {
    #[default]
    FullName,
    UserId,
}

impl SearchField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullName => "full_name",
            Self::UserId => "user_id",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "full_name" | "name" => Some(Self::FullName),
            "user_id" | "user" | "id" => Some(Self::UserId),
            _ => None,
        }
    }
}

/// One (user, device) pairing. Users without devices have no `esp_ble_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOwner {
    pub user_id: String,
    pub full_name: String,
    pub esp_ble_id: Option<String>,
}

impl DeviceOwner {
    /// Label shown for the device column.
    pub fn device_label(&self) -> &str {
        self.esp_ble_id.as_deref().unwrap_or("No device")
    }
}
