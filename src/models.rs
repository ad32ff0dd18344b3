use serde::{Deserialize, Serialize};

pub const MASKED_KEY: &str = "••••••••••••";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationStatus {
    Online,
    #[default]
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub description: String,
    pub stream_url: String,
    #[serde(default, alias = "coverArt")]
    pub cover_image: String,
    #[serde(default)]
    pub listeners: u32,
    #[serde(default)]
    pub status: StationStatus,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub stream_key: String,
}

impl Station {
    pub fn is_live(&self) -> bool {
        self.status == StationStatus::Online
    }

    /// Stream key as shown on the dashboard; masked unless the user revealed it.
    pub fn display_key(&self, revealed: bool) -> &str {
        if revealed {
            &self.stream_key
        } else {
            MASKED_KEY
        }
    }
}

/// Fields of the "new station" form, before defaults and validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewStation {
    pub name: String,
    pub genre: String,
    pub stream_url: String,
    pub description: String,
    pub cover_image: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plan {
    #[default]
    Free,
    #[serde(rename = "PRO")]
    Pro,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub plan: Plan,
}

impl User {
    pub fn demo() -> Self {
        Self {
            name: "Edgard".to_string(),
            email: "pro@edradio.global".to_string(),
            plan: Plan::Free,
        }
    }
}

pub fn seed_stations() -> Vec<Station> {
    vec![Station {
        id: "st-01".to_string(),
        name: "EdRadio Principal".to_string(),
        genre: "Variado / Internacional".to_string(),
        description: "La emisora madre de la red global de streamers.".to_string(),
        stream_url: "https://stream.edradio.global/live/main".to_string(),
        cover_image: "https://images.unsplash.com/photo-1598488035139-bdbb2231ce04?q=80&w=400&auto=format&fit=crop".to_string(),
        listeners: 1240,
        status: StationStatus::Online,
        is_premium: true,
        stream_key: "ed_live_main_9988".to_string(),
    }]
}
