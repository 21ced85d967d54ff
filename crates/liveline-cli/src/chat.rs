//! Terminal client for a running gateway.
//!
//! Lines typed on stdin are sent as `text` frames. `/audio <path>` and
//! `/image <path>` send a file's bytes base64-encoded. An empty line or
//! `/quit` ends the session.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use colored::Colorize;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, PartialEq, Eq)]
enum InputAction {
    Quit,
    Text(String),
    Audio(PathBuf),
    Image(PathBuf),
}

fn parse_input(line: &str) -> InputAction {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed == "/quit" {
        return InputAction::Quit;
    }
    if let Some(path) = trimmed.strip_prefix("/audio ") {
        return InputAction::Audio(PathBuf::from(path.trim()));
    }
    if let Some(path) = trimmed.strip_prefix("/image ") {
        return InputAction::Image(PathBuf::from(path.trim()));
    }
    InputAction::Text(trimmed.to_string())
}

fn session_url(base: &str, client_id: &str) -> String {
    format!("{}/ws/{}", base.trim_end_matches('/'), client_id)
}

fn config_frame(system_prompt: &str, voice: Option<&str>) -> String {
    let mut config = json!({ "systemPrompt": system_prompt });
    if let Some(voice) = voice {
        config["voice"] = json!(voice);
    }
    json!({ "type": "config", "config": config }).to_string()
}

/// One printable line for a gateway frame, if it has anything to show.
fn render_frame(frame: &Value) -> Option<String> {
    match frame["type"].as_str()? {
        "text" => Some(format!(
            "{} {}",
            "Model:".blue().bold(),
            frame["text"].as_str().unwrap_or_default()
        )),
        "audio" => {
            let data = frame["data"].as_str().unwrap_or_default();
            let size = STANDARD.decode(data).map(|b| b.len()).unwrap_or(data.len());
            Some(format!("[audio chunk: {} bytes]", size).dimmed().to_string())
        }
        "image" => {
            let data = frame["data"].as_str().unwrap_or_default();
            Some(format!("[image: {} base64 chars]", data.len()).dimmed().to_string())
        }
        "turn_complete" => Some("-- turn complete --".dimmed().to_string()),
        "error" => Some(format!(
            "{} {}",
            "Error:".red().bold(),
            frame["message"].as_str().unwrap_or_default()
        )),
        _ => None,
    }
}

pub async fn run(
    url: &str,
    client_id: &str,
    system_prompt: &str,
    voice: Option<&str>,
) -> Result<()> {
    let target = session_url(url, client_id);
    liveline_gateway::ensure_crypto_provider();
    let (socket, _) = tokio_tungstenite::connect_async(&target)
        .await
        .with_context(|| format!("failed to connect to {}", target))?;
    println!("{} {}", "Connected to".cyan().bold(), target);

    let (mut sink, mut stream) = socket.split();
    sink.send(Message::Text(config_frame(system_prompt, voice).into()))
        .await
        .context("failed to send config frame")?;
    println!(
        "{}",
        "Type a message, /audio <path>, /image <path>, or an empty line to quit.".dimmed()
    );

    // Whichever loop ends first drops the other.
    let result = tokio::select! {
        result = input_loop(&mut sink) => result,
        result = output_loop(&mut stream) => result,
    };

    let _ = sink.close().await;
    result
}

async fn input_loop(sink: &mut SplitSink<Socket, Message>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let frame = match parse_input(&line) {
            InputAction::Quit => break,
            InputAction::Text(text) => json!({ "type": "text", "data": text }),
            InputAction::Audio(path) => {
                let data = encode_file(&path).await?;
                json!({ "type": "audio", "data": data })
            }
            InputAction::Image(path) => {
                let data = encode_file(&path).await?;
                json!({ "type": "image", "data": data })
            }
        };
        sink.send(Message::Text(frame.to_string().into()))
            .await
            .context("gateway connection lost")?;
    }
    Ok(())
}

async fn output_loop(stream: &mut SplitStream<Socket>) -> Result<()> {
    while let Some(message) = stream.next().await {
        match message.context("gateway connection lost")? {
            Message::Text(text) => match serde_json::from_str::<Value>(text.as_str()) {
                Ok(frame) => {
                    if let Some(line) = render_frame(&frame) {
                        println!("{}", line);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Unreadable frame from gateway"),
            },
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    println!(
                        "{} {} {}",
                        "Closed:".yellow().bold(),
                        u16::from(frame.code),
                        frame.reason.as_str()
                    );
                }
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

async fn encode_file(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input(""), InputAction::Quit);
        assert_eq!(parse_input("   "), InputAction::Quit);
        assert_eq!(parse_input("/quit"), InputAction::Quit);
        assert_eq!(parse_input("hello"), InputAction::Text("hello".into()));
        assert_eq!(
            parse_input("/audio clip.pcm"),
            InputAction::Audio(PathBuf::from("clip.pcm"))
        );
        assert_eq!(
            parse_input("/image  photo.jpg "),
            InputAction::Image(PathBuf::from("photo.jpg"))
        );
    }

    #[test]
    fn test_session_url() {
        assert_eq!(session_url("ws://127.0.0.1:8000/", "cli"), "ws://127.0.0.1:8000/ws/cli");
        assert_eq!(session_url("ws://host", "a"), "ws://host/ws/a");
    }

    #[test]
    fn test_config_frame() {
        let frame: Value = serde_json::from_str(&config_frame("be brief", None)).unwrap();
        assert_eq!(frame["type"], "config");
        assert_eq!(frame["config"]["systemPrompt"], "be brief");
        assert!(frame["config"].get("voice").is_none());

        let frame: Value = serde_json::from_str(&config_frame("hi", Some("Puck"))).unwrap();
        assert_eq!(frame["config"]["voice"], "Puck");
    }

    #[test]
    fn test_render_frame() {
        colored::control::set_override(false);

        let text = render_frame(&json!({"type": "text", "text": "hi there"})).unwrap();
        assert_eq!(text, "Model: hi there");

        let audio = render_frame(&json!({"type": "audio", "data": "AAECAw=="})).unwrap();
        assert_eq!(audio, "[audio chunk: 4 bytes]");

        let error = render_frame(&json!({"type": "error", "message": "quota"})).unwrap();
        assert_eq!(error, "Error: quota");

        assert!(render_frame(&json!({"type": "turn_complete", "data": true})).is_some());
        assert!(render_frame(&json!({"type": "unknown"})).is_none());
        assert!(render_frame(&json!({"text": "no type"})).is_none());
    }
}
