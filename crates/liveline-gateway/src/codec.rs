//! Translation between the client envelope, the upstream envelope and the
//! normalized message type the pumps move around.
//!
//! Everything here is a pure function of its input. Decoding failures are
//! reported as [`DecodeError`] so the caller can skip one frame and carry on.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::DecodeError;
use crate::protocol::{ClientEnvelope, ConfigPayload, ServerEnvelope};

pub const AUDIO_MIME_TYPE: &str = "audio/pcm";
pub const IMAGE_MIME_TYPE: &str = "image/jpeg";

/// Payload moving through the bridge, independent of either wire format.
///
/// `Audio` and `Image` carry base64 text exactly as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedMessage {
    Text(String),
    Audio(String),
    Image(String),
    TurnComplete,
    Error(String),
}

/// Result of decoding one client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInbound {
    Config(ConfigPayload),
    Message(NormalizedMessage),
}

impl ClientInbound {
    /// Short name for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientInbound::Config(_) => "config",
            ClientInbound::Message(msg) => msg.kind(),
        }
    }
}

impl NormalizedMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizedMessage::Text(_) => "text",
            NormalizedMessage::Audio(_) => "audio",
            NormalizedMessage::Image(_) => "image",
            NormalizedMessage::TurnComplete => "turn_complete",
            NormalizedMessage::Error(_) => "error",
        }
    }
}

// ============================================================================
// Client envelope
// ============================================================================

/// Payload of a binary WebSocket frame as text. Frames that are not valid
/// UTF-8 are rejected rather than repaired.
pub fn frame_text(bytes: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| {
            DecodeError::new(
                format!("binary frame is not valid UTF-8: {e}"),
                String::from_utf8_lossy(bytes),
            )
        })
}

pub fn decode_client_frame(raw: &str) -> Result<ClientInbound, DecodeError> {
    let envelope: ClientEnvelope =
        serde_json::from_str(raw).map_err(|e| DecodeError::new(e.to_string(), raw))?;

    let inbound = match envelope {
        ClientEnvelope::Config { config } => ClientInbound::Config(config),
        ClientEnvelope::Text { data } => ClientInbound::Message(NormalizedMessage::Text(data)),
        ClientEnvelope::Audio { data } => {
            ensure_base64(&data, raw)?;
            ClientInbound::Message(NormalizedMessage::Audio(data))
        }
        ClientEnvelope::Image { data } => {
            ensure_base64(&data, raw)?;
            ClientInbound::Message(NormalizedMessage::Image(data))
        }
    };

    Ok(inbound)
}

fn ensure_base64(data: &str, raw: &str) -> Result<(), DecodeError> {
    STANDARD
        .decode(data)
        .map(|_| ())
        .map_err(|e| DecodeError::new(format!("invalid base64 payload: {e}"), raw))
}

pub fn encode_client_frame(msg: &NormalizedMessage) -> String {
    let envelope = match msg {
        NormalizedMessage::Text(text) => ServerEnvelope::Text { text: text.clone() },
        NormalizedMessage::Audio(data) => ServerEnvelope::Audio { data: data.clone() },
        NormalizedMessage::Image(data) => ServerEnvelope::Image { data: data.clone() },
        NormalizedMessage::TurnComplete => ServerEnvelope::TurnComplete { data: true },
        NormalizedMessage::Error(message) => ServerEnvelope::Error {
            message: message.clone(),
        },
    };
    serde_json::to_string(&envelope).unwrap_or_default()
}

// ============================================================================
// Upstream envelope (requests)
// ============================================================================

/// Frames the bridge sends upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamRequest {
    Setup(SetupPayload),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

pub fn encode_upstream_setup(model: &str, config: &SessionConfig) -> String {
    let mut response_modalities = vec!["TEXT".to_string()];
    let speech_config = config.voice.as_ref().map(|voice| {
        response_modalities.push("AUDIO".to_string());
        SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.clone(),
                },
            },
        }
    });

    let setup = UpstreamRequest::Setup(SetupPayload {
        model: model.to_string(),
        generation_config: GenerationConfig {
            response_modalities,
            speech_config,
        },
        system_instruction: Content {
            role: None,
            parts: vec![TextPart {
                text: config.system_prompt.clone(),
            }],
        },
    });
    serde_json::to_string(&setup).unwrap_or_default()
}

/// Encode a client-originated message as an upstream content frame.
///
/// Returns `None` for variants that only ever flow toward the client.
pub fn encode_upstream_content(msg: &NormalizedMessage) -> Option<String> {
    let request = match msg {
        NormalizedMessage::Text(text) => UpstreamRequest::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![TextPart { text: text.clone() }],
            }],
            turn_complete: true,
        }),
        NormalizedMessage::Audio(data) => media_chunk(AUDIO_MIME_TYPE, data),
        NormalizedMessage::Image(data) => media_chunk(IMAGE_MIME_TYPE, data),
        NormalizedMessage::TurnComplete | NormalizedMessage::Error(_) => return None,
    };
    serde_json::to_string(&request).ok()
}

fn media_chunk(mime_type: &str, data: &str) -> UpstreamRequest {
    UpstreamRequest::RealtimeInput(RealtimeInput {
        media_chunks: vec![MediaChunk {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        }],
    })
}

// ============================================================================
// Upstream envelope (responses)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamResponse {
    #[serde(default, alias = "setup_complete")]
    setup_complete: Option<serde_json::Value>,
    #[serde(default, alias = "server_content")]
    server_content: Option<ServerContent>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default, alias = "model_turn")]
    model_turn: Option<ModelTurn>,
    #[serde(default, alias = "turn_complete")]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "inline_data")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default, alias = "mime_type")]
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    fn into_message(self) -> String {
        self.message
            .unwrap_or_else(|| "upstream reported an error".to_string())
    }
}

/// Decode one upstream frame into zero or more normalized messages.
///
/// Parts are emitted in order, followed by `TurnComplete` and then `Error`.
pub fn decode_upstream_frame(raw: &str) -> Result<Vec<NormalizedMessage>, DecodeError> {
    let response: UpstreamResponse =
        serde_json::from_str(raw).map_err(|e| DecodeError::new(e.to_string(), raw))?;

    let mut messages = Vec::new();

    if let Some(content) = response.server_content {
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for part in parts {
            if let Some(text) = part.text {
                messages.push(NormalizedMessage::Text(text));
            }
            if let Some(inline) = part.inline_data {
                let is_image = inline
                    .mime_type
                    .as_deref()
                    .is_some_and(|mime| mime.starts_with("image/"));
                messages.push(if is_image {
                    NormalizedMessage::Image(inline.data)
                } else {
                    NormalizedMessage::Audio(inline.data)
                });
            }
        }
        if content.turn_complete {
            messages.push(NormalizedMessage::TurnComplete);
        }
    }

    if let Some(error) = response.error {
        messages.push(NormalizedMessage::Error(error.into_message()));
    }

    Ok(messages)
}

/// How the upstream answered the setup frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Accepted,
    Rejected(String),
}

pub fn decode_handshake_reply(raw: &str) -> Result<HandshakeReply, DecodeError> {
    let response: UpstreamResponse =
        serde_json::from_str(raw).map_err(|e| DecodeError::new(e.to_string(), raw))?;

    if let Some(error) = response.error {
        return Ok(HandshakeReply::Rejected(error.into_message()));
    }
    if response.setup_complete.is_some() {
        return Ok(HandshakeReply::Accepted);
    }
    Ok(HandshakeReply::Rejected(
        "expected setupComplete acknowledgement".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parse(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_decode_config_frame() {
        let inbound =
            decode_client_frame(r#"{"type":"config","config":{"systemPrompt":"hi"}}"#).unwrap();
        match inbound {
            ClientInbound::Config(payload) => {
                assert_eq!(payload.system_prompt, "hi");
                assert!(payload.voice.is_none());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_text_frame() {
        let inbound = decode_client_frame(r#"{"type":"text","data":"hello"}"#).unwrap();
        assert_eq!(
            inbound,
            ClientInbound::Message(NormalizedMessage::Text("hello".to_string()))
        );
    }

    #[test]
    fn test_decode_audio_and_image_frames() {
        let audio = decode_client_frame(r#"{"type":"audio","data":"AAECAw=="}"#).unwrap();
        assert_eq!(
            audio,
            ClientInbound::Message(NormalizedMessage::Audio("AAECAw==".to_string()))
        );

        let image = decode_client_frame(r#"{"type":"image","data":"/9j/4A=="}"#).unwrap();
        assert_eq!(
            image,
            ClientInbound::Message(NormalizedMessage::Image("/9j/4A==".to_string()))
        );
    }

    #[test]
    fn test_decode_malformed_json_keeps_raw() {
        let err = decode_client_frame("{not json").unwrap_err();
        assert_eq!(err.raw, "{not json");
    }

    #[test]
    fn test_decode_missing_field() {
        let err = decode_client_frame(r#"{"type":"text"}"#).unwrap_err();
        assert!(err.reason.contains("data"));
    }

    #[test]
    fn test_frame_text_rejects_invalid_utf8() {
        let raw = b"{\"type\":\"text\",\"data\":\"ok\xff\xfe\"}";
        let err = frame_text(raw).unwrap_err();
        assert!(err.reason.contains("UTF-8"));
        assert!(err.raw.starts_with("{\"type\":\"text\""));

        let text = frame_text(br#"{"type":"text","data":"ok"}"#).unwrap();
        assert!(matches!(
            decode_client_frame(&text),
            Ok(ClientInbound::Message(NormalizedMessage::Text(data))) if data == "ok"
        ));
    }

    #[test]
    fn test_decode_invalid_base64_audio() {
        let err = decode_client_frame(r#"{"type":"audio","data":"not base64!"}"#).unwrap_err();
        assert!(err.reason.contains("base64"));
    }

    #[test]
    fn test_encode_client_frames() {
        assert_eq!(
            parse(&encode_client_frame(&NormalizedMessage::Text("hi there".into()))),
            json!({"type": "text", "text": "hi there"})
        );
        assert_eq!(
            parse(&encode_client_frame(&NormalizedMessage::Audio("AAAA".into()))),
            json!({"type": "audio", "data": "AAAA"})
        );
        assert_eq!(
            parse(&encode_client_frame(&NormalizedMessage::TurnComplete)),
            json!({"type": "turn_complete", "data": true})
        );
        assert_eq!(
            parse(&encode_client_frame(&NormalizedMessage::Error("quota exceeded".into()))),
            json!({"type": "error", "message": "quota exceeded"})
        );
    }

    #[test]
    fn test_setup_without_voice_requests_text_only() {
        let raw = encode_upstream_setup("models/test", &SessionConfig::new("be brief"));
        let value = parse(&raw);
        assert_eq!(value["setup"]["model"], "models/test");
        assert_eq!(
            value["setup"]["generation_config"]["response_modalities"],
            json!(["TEXT"])
        );
        assert!(value["setup"]["generation_config"].get("speech_config").is_none());
        assert_eq!(
            value["setup"]["system_instruction"]["parts"][0]["text"],
            "be brief"
        );
    }

    #[test]
    fn test_setup_with_voice_adds_audio_and_voice() {
        let config = SessionConfig::new("be brief").with_voice("Kore");
        let value = parse(&encode_upstream_setup("models/test", &config));
        let generation = &value["setup"]["generation_config"];
        assert_eq!(generation["response_modalities"], json!(["TEXT", "AUDIO"]));
        assert_eq!(
            generation["speech_config"]["voice_config"]["prebuilt_voice_config"]["voice_name"],
            "Kore"
        );
    }

    #[test]
    fn test_encode_text_content_is_complete_turn() {
        let raw = encode_upstream_content(&NormalizedMessage::Text("hello".into())).unwrap();
        let request: UpstreamRequest = serde_json::from_str(&raw).unwrap();
        match request {
            UpstreamRequest::ClientContent(content) => {
                assert!(content.turn_complete);
                assert_eq!(content.turns.len(), 1);
                assert_eq!(content.turns[0].role.as_deref(), Some("user"));
                assert_eq!(content.turns[0].parts[0].text, "hello");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_audio_content_round_trip() {
        let raw = encode_upstream_content(&NormalizedMessage::Audio("UENNREFUQQ==".into())).unwrap();
        assert!(parse(&raw).get("realtime_input").is_some());

        let request: UpstreamRequest = serde_json::from_str(&raw).unwrap();
        match request {
            UpstreamRequest::RealtimeInput(input) => {
                assert_eq!(input.media_chunks.len(), 1);
                assert_eq!(input.media_chunks[0].data, "UENNREFUQQ==");
                assert_eq!(input.media_chunks[0].mime_type, "audio/pcm");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_image_content_uses_jpeg_mime() {
        let raw = encode_upstream_content(&NormalizedMessage::Image("/9j/".into())).unwrap();
        let value = parse(&raw);
        assert_eq!(value["realtime_input"]["media_chunks"][0]["mime_type"], "image/jpeg");
    }

    #[test]
    fn test_control_messages_are_not_sent_upstream() {
        assert!(encode_upstream_content(&NormalizedMessage::TurnComplete).is_none());
        assert!(encode_upstream_content(&NormalizedMessage::Error("x".into())).is_none());
    }

    #[test]
    fn test_decode_text_before_turn_complete() {
        let raw = json!({
            "serverContent": {
                "modelTurn": {"parts": [{"text": "hi there"}]},
                "turnComplete": true
            }
        })
        .to_string();
        let messages = decode_upstream_frame(&raw).unwrap();
        assert_eq!(
            messages,
            vec![
                NormalizedMessage::Text("hi there".to_string()),
                NormalizedMessage::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_decode_mixed_parts_in_order() {
        let raw = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"text": "one"},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
                    {"inlineData": {"mimeType": "image/png", "data": "iVBO"}},
                    {"text": "two"}
                ]}
            }
        })
        .to_string();
        let messages = decode_upstream_frame(&raw).unwrap();
        assert_eq!(
            messages,
            vec![
                NormalizedMessage::Text("one".to_string()),
                NormalizedMessage::Audio("AAAA".to_string()),
                NormalizedMessage::Image("iVBO".to_string()),
                NormalizedMessage::Text("two".to_string()),
            ]
        );
    }

    #[test]
    fn test_decode_error_frame() {
        let messages = decode_upstream_frame(r#"{"error":{"message":"quota exceeded"}}"#).unwrap();
        assert_eq!(
            messages,
            vec![NormalizedMessage::Error("quota exceeded".to_string())]
        );
    }

    #[test]
    fn test_decode_setup_complete_yields_nothing() {
        assert!(decode_upstream_frame(r#"{"setupComplete":{}}"#).unwrap().is_empty());
    }

    #[test]
    fn test_decode_upstream_rejects_non_object() {
        let err = decode_upstream_frame("[1, 2, 3]").unwrap_err();
        assert_eq!(err.raw, "[1, 2, 3]");
    }

    #[test]
    fn test_handshake_reply() {
        assert_eq!(
            decode_handshake_reply(r#"{"setupComplete":{}}"#).unwrap(),
            HandshakeReply::Accepted
        );
        assert_eq!(
            decode_handshake_reply(r#"{"error":{"message":"bad model"}}"#).unwrap(),
            HandshakeReply::Rejected("bad model".to_string())
        );
        assert!(matches!(
            decode_handshake_reply(r#"{"serverContent":{}}"#).unwrap(),
            HandshakeReply::Rejected(_)
        ));
    }
}
