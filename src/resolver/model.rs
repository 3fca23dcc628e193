use serde::{Deserialize, Serialize};

/// the player page a resolution starts from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerReference {
    pub player_url: String,
}

impl PlayerReference {
    pub fn new(player_url: impl Into<String>) -> Self {
        Self {
            player_url: player_url.into(),
        }
    }
}

/// outcome of a resolution, `raw_url` is always the bare origin manifest while `stream_url` can be
/// the same thing or already wrapped in a relay link depending on who produced it
///
/// whatever headers the origin wants travel with it, nothing downstream fetches `raw_url` without
/// them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStream {
    pub stream_url: String,
    pub raw_url: String,
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub is_live: bool,
}

impl ResolvedStream {
    pub fn direct(raw_url: String) -> Self {
        Self {
            stream_url: raw_url.clone(),
            raw_url,
            cookie: None,
            user_agent: None,
            referer: None,
            is_live: true,
        }
    }
}

/// catalog timestamps show up as unix seconds on events and as strings on some channels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CatalogTimestamp {
    Unix(i64),
    Text(String),
}

/// channel or event as the catalog api hands it out, only `url` matters for resolving
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    pub url: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tournament: Option<String>,
    #[serde(default)]
    pub home_team: Option<String>,
    #[serde(default)]
    pub away_team: Option<String>,
    #[serde(default)]
    pub start: Option<CatalogTimestamp>,
    #[serde(default)]
    pub end: Option<CatalogTimestamp>,
    #[serde(default, rename = "gameID")]
    pub game_id: Option<serde_json::Value>,
}

impl From<&CatalogRecord> for PlayerReference {
    fn from(record: &CatalogRecord) -> Self {
        PlayerReference::new(record.url.clone())
    }
}
