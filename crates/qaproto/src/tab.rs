//! Browser tabs and the messages the recorder sends into pages.

use crate::ids::TabId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: TabId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Environment reported by the page script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEnvironment {
    #[serde(default)]
    pub viewport: Option<Value>,
    #[serde(default)]
    pub screen: Option<Value>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub user_agent_data: Option<Value>,
}

/// Messages delivered to the page script of a tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TabMessage {
    HideResumePrompt,
    ShowResumePrompt { reason: String },
    OpenMarker,
    MarkerToast,
    OpenAnnotation,
    DebugLog { message: String, detail: Value },
}
