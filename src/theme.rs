use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Presentation settings for the widget chrome. The engine never interprets
/// these; they travel with the document and are handed to the renderer as-is.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    pub primary_color: String,
    pub background_color: String,
    pub header_color: String,
    pub bot_message_color: String,
    pub user_message_color: String,
    pub message_color: String,
    pub bot_text_color: String,
    pub user_text_color: String,
    pub header_text_color: String,
    pub input_color: String,
    pub font_family: String,
    pub border_radius: String,
    #[serde(default)]
    pub show_message_icons: bool,
}

impl Default for Theme {
    fn default() -> Self {
        Theme {
            primary_color: "#a7e154".into(),
            background_color: "#1a1a1a".into(),
            header_color: "#232323".into(),
            bot_message_color: "#232323".into(),
            user_message_color: "#a7e154".into(),
            message_color: "#232323".into(),
            bot_text_color: "#ffffff".into(),
            user_text_color: "#000000".into(),
            header_text_color: "#ffffff".into(),
            input_color: "#1a1a1a".into(),
            font_family: "system-ui".into(),
            border_radius: "0.5rem".into(),
            show_message_icons: true,
        }
    }
}
