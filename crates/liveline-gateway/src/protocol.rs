use serde::{Deserialize, Serialize};

/// Config body carried by the client's first frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConfigPayload {
    #[serde(rename = "systemPrompt", alias = "system_prompt")]
    pub system_prompt: String,

    #[serde(default)]
    pub voice: Option<String>,
}

/// Inbound messages from WebSocket clients
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Config { config: ConfigPayload },
    Text { data: String },
    Audio { data: String },
    Image { data: String },
}

/// Outbound messages to WebSocket clients
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Text { text: String },
    Audio { data: String },
    Image { data: String },
    TurnComplete { data: bool },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_config() {
        let json = r#"{"type": "config", "config": {"systemPrompt": "be kind", "voice": "Puck"}}"#;
        let msg: ClientEnvelope = serde_json::from_str(json).unwrap();
        match msg {
            ClientEnvelope::Config { config } => {
                assert_eq!(config.system_prompt, "be kind");
                assert_eq!(config.voice.as_deref(), Some("Puck"));
            }
            _ => panic!("Expected Config"),
        }
    }

    #[test]
    fn test_deserialize_config_without_voice() {
        let json = r#"{"type": "config", "config": {"systemPrompt": "hi"}}"#;
        let msg: ClientEnvelope = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientEnvelope::Config { config: ConfigPayload { voice: None, .. } }
        ));
    }

    #[test]
    fn test_config_without_system_prompt_is_rejected() {
        let json = r#"{"type": "config", "config": {"voice": "Puck"}}"#;
        assert!(serde_json::from_str::<ClientEnvelope>(json).is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let json = r#"{"type": "video", "data": "AAAA"}"#;
        assert!(serde_json::from_str::<ClientEnvelope>(json).is_err());
    }

    #[test]
    fn test_serialize_turn_complete() {
        let json = serde_json::to_string(&ServerEnvelope::TurnComplete { data: true }).unwrap();
        assert_eq!(json, r#"{"type":"turn_complete","data":true}"#);
    }

    #[test]
    fn test_serialize_error() {
        let resp = ServerEnvelope::Error {
            message: "quota exceeded".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"type":"error","message":"quota exceeded"}"#);
    }
}
