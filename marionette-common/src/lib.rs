// Copyright (C) 2026 Marionette
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_GAME_PORT: u16 = 25565;
pub const MIN_BOT_NAME_CHARS: usize = 3;
pub const MIN_BOT_COUNT: u32 = 1;
pub const MAX_BOT_COUNT: u32 = 10;
pub const CHAT_HISTORY_CAP: usize = 100;
pub const MAX_STAT_VALUE: f32 = 20.0;

/// Speaker recorded for chat lines that have no identifiable sender.
pub const SERVER_CHAT_USERNAME: &str = "SERVER";
pub const UNKNOWN_KICK_REASON: &str = "unknown";

pub type ClientId = String;
pub type SessionId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Forward,
    Back,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
    Jump,
    Attack,
    Use,
}

impl ControlAction {
    /// Actions outside this table are deliberately not an error; the channel
    /// contract treats them as no-ops.
    pub fn parse(raw: &str) -> Option<ControlAction> {
        match raw {
            "forward" => Some(ControlAction::Forward),
            "backward" => Some(ControlAction::Backward),
            "left" => Some(ControlAction::Left),
            "right" => Some(ControlAction::Right),
            "stop" => Some(ControlAction::Stop),
            "jump" => Some(ControlAction::Jump),
            "attack" => Some(ControlAction::Attack),
            "use" => Some(ControlAction::Use),
            _ => None,
        }
    }
}

/// Messages a browser client sends over the piloting channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Connect { data: ConnectRequest },
    Disconnect,
    Cancel,
    GetBotInfo,
    Control { action: String },
    Chat { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub bot_name: String,
    pub bot_count: u32,
    pub server_ip: String,
}

/// Pushes the service sends back over the piloting channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerPush {
    Info { message: String },
    Connected,
    Disconnected,
    Error { message: String },
    BotInfo { data: BotInfo },
    Chat { message: ChatEntry },
}

/// Snapshot shown in the browser sidebar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BotInfo {
    pub name: String,
    pub count: u32,
    pub server_ip: String,
    pub health: u8,
    pub food: u8,
}

/// Last-known in-memory state of one bot session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BotStatus {
    pub health: f32,
    pub food: f32,
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub username: String,
    pub content: String,
    #[serde(rename = "timestamp")]
    pub timestamp_millis: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectValidationError {
    NameTooShort,
    BotCountOutOfRange,
    MalformedServerAddress,
}

impl ConnectValidationError {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectValidationError::NameTooShort => "bot name must be at least 3 characters",
            ConnectValidationError::BotCountOutOfRange => "bot count must be between 1 and 10",
            ConnectValidationError::MalformedServerAddress => {
                "server address must look like host or host:port"
            }
        }
    }
}

/// Parse `host[:port]`, defaulting the port when omitted.
pub fn parse_server_address(raw: &str) -> Option<ServerAddress> {
    let re = Regex::new(r"^([A-Za-z0-9][A-Za-z0-9.\-]*)(?::(\d{1,5}))?$").unwrap();
    let caps = re.captures(raw.trim())?;
    let host = caps[1].to_string();
    let port = match caps.get(2) {
        Some(digits) => digits.as_str().parse::<u16>().ok()?,
        None => DEFAULT_GAME_PORT,
    };
    Some(ServerAddress { host, port })
}

/// Validate an inbound connect payload against the channel contract.
pub fn validate_connect_request(
    request: &ConnectRequest,
) -> Result<ServerAddress, ConnectValidationError> {
    if request.bot_name.trim().chars().count() < MIN_BOT_NAME_CHARS {
        return Err(ConnectValidationError::NameTooShort);
    }
    if request.bot_count < MIN_BOT_COUNT || request.bot_count > MAX_BOT_COUNT {
        return Err(ConnectValidationError::BotCountOutOfRange);
    }
    parse_server_address(&request.server_ip).ok_or(ConnectValidationError::MalformedServerAddress)
}

/// Flatten a kick reason into one readable line.
///
/// Game servers deliver kick payloads either as plain strings or as
/// translate-style objects like `{"translate": "...", "with": [...]}`.
pub fn describe_kick_reason(reason: &Value) -> String {
    match reason {
        Value::String(text) => text.clone(),
        Value::Object(fields) => {
            if let Some(translate) = fields.get("translate").and_then(Value::as_str) {
                let args: Vec<String> = fields
                    .get("with")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().map(flatten_reason_fragment).collect())
                    .unwrap_or_default();
                if args.is_empty() {
                    translate.to_string()
                } else {
                    format!("{}: {}", translate, args.join(", "))
                }
            } else if let Some(text) = fields.get("text").and_then(Value::as_str) {
                text.to_string()
            } else {
                UNKNOWN_KICK_REASON.to_string()
            }
        }
        _ => UNKNOWN_KICK_REASON.to_string(),
    }
}

fn flatten_reason_fragment(fragment: &Value) -> String {
    match fragment {
        Value::String(text) => text.clone(),
        Value::Object(fields) => fields
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| fragment.to_string()),
        other => other.to_string(),
    }
}

/// Detect a protocol-version mismatch error and pull out the version the
/// server advertises, e.g. "outdated server! I'm still on version 1.20.1".
pub fn extract_mismatched_version(message: &str) -> Option<String> {
    let lowered = message.to_ascii_lowercase();
    if !lowered.contains("outdated") && !lowered.contains("unsupported protocol") {
        return None;
    }
    let re = Regex::new(r"\d+\.\d+(?:\.\d+)?").unwrap();
    re.find(message).map(|hit| hit.as_str().to_string())
}

/// Map transport-level failure text onto something a player can act on.
/// Unrecognized messages pass through untouched.
pub fn describe_connection_failure(message: &str, server: &ServerAddress) -> String {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("econnrefused") || lowered.contains("connection refused") {
        format!("{} refused the connection", server)
    } else if lowered.contains("econnreset") || lowered.contains("connection reset") {
        format!("{} closed the connection unexpectedly", server)
    } else if lowered.contains("etimedout") || lowered.contains("timed out") {
        format!("connection to {} timed out", server)
    } else if lowered.contains("enotfound")
        || lowered.contains("getaddrinfo")
        || lowered.contains("failed to lookup")
    {
        format!("could not resolve {}", server.host)
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_server_address_defaults_the_port() {
        let address = parse_server_address("play.example.com").unwrap();
        assert_eq!(address.host, "play.example.com");
        assert_eq!(address.port, DEFAULT_GAME_PORT);
    }

    #[test]
    fn parse_server_address_accepts_explicit_port() {
        let address = parse_server_address("play.example.com:25570").unwrap();
        assert_eq!(address.host, "play.example.com");
        assert_eq!(address.port, 25570);
        assert_eq!(address.to_string(), "play.example.com:25570");
    }

    #[test]
    fn parse_server_address_trims_whitespace() {
        let address = parse_server_address("  10.0.0.7:2556  ").unwrap();
        assert_eq!(address.host, "10.0.0.7");
        assert_eq!(address.port, 2556);
    }

    #[test]
    fn parse_server_address_rejects_malformed_input() {
        assert!(parse_server_address("").is_none());
        assert!(parse_server_address("host with spaces").is_none());
        assert!(parse_server_address("host:notaport").is_none());
        assert!(parse_server_address("host:70000").is_none());
        assert!(parse_server_address("host:1:2").is_none());
        assert!(parse_server_address("-leading.dash").is_none());
    }

    #[test]
    fn validate_connect_request_accepts_typical_payload() {
        let request = ConnectRequest {
            bot_name: "Scout".to_string(),
            bot_count: 1,
            server_ip: "play.example.com:25565".to_string(),
        };
        let address = validate_connect_request(&request).unwrap();
        assert_eq!(address.host, "play.example.com");
        assert_eq!(address.port, 25565);
    }

    #[test]
    fn validate_connect_request_rejects_short_names() {
        let request = ConnectRequest {
            bot_name: "ab".to_string(),
            bot_count: 1,
            server_ip: "play.example.com".to_string(),
        };
        assert_eq!(
            validate_connect_request(&request),
            Err(ConnectValidationError::NameTooShort)
        );
    }

    #[test]
    fn validate_connect_request_rejects_bad_bot_counts() {
        for count in [0, 11, 500] {
            let request = ConnectRequest {
                bot_name: "Scout".to_string(),
                bot_count: count,
                server_ip: "play.example.com".to_string(),
            };
            assert_eq!(
                validate_connect_request(&request),
                Err(ConnectValidationError::BotCountOutOfRange)
            );
        }
    }

    #[test]
    fn validate_connect_request_rejects_malformed_address() {
        let request = ConnectRequest {
            bot_name: "Scout".to_string(),
            bot_count: 1,
            server_ip: "play .example".to_string(),
        };
        assert_eq!(
            validate_connect_request(&request),
            Err(ConnectValidationError::MalformedServerAddress)
        );
    }

    #[test]
    fn control_action_parse_covers_the_action_table() {
        assert_eq!(ControlAction::parse("forward"), Some(ControlAction::Forward));
        assert_eq!(ControlAction::parse("backward"), Some(ControlAction::Backward));
        assert_eq!(ControlAction::parse("left"), Some(ControlAction::Left));
        assert_eq!(ControlAction::parse("right"), Some(ControlAction::Right));
        assert_eq!(ControlAction::parse("stop"), Some(ControlAction::Stop));
        assert_eq!(ControlAction::parse("jump"), Some(ControlAction::Jump));
        assert_eq!(ControlAction::parse("attack"), Some(ControlAction::Attack));
        assert_eq!(ControlAction::parse("use"), Some(ControlAction::Use));
        assert_eq!(ControlAction::parse("dance"), None);
    }

    #[test]
    fn describe_kick_reason_flattens_translate_objects() {
        let reason = json!({
            "translate": "multiplayer.disconnected.generic",
            "with": ["Server closed"],
        });
        assert_eq!(
            describe_kick_reason(&reason),
            "multiplayer.disconnected.generic: Server closed"
        );
    }

    #[test]
    fn describe_kick_reason_handles_plain_and_text_shapes() {
        assert_eq!(describe_kick_reason(&json!("You are banned")), "You are banned");
        assert_eq!(
            describe_kick_reason(&json!({"text": "Restarting"})),
            "Restarting"
        );
        assert_eq!(
            describe_kick_reason(&json!({"translate": "multiplayer.disconnected.server_shutdown"})),
            "multiplayer.disconnected.server_shutdown"
        );
    }

    #[test]
    fn describe_kick_reason_falls_back_to_unknown() {
        assert_eq!(describe_kick_reason(&json!(null)), UNKNOWN_KICK_REASON);
        assert_eq!(describe_kick_reason(&json!(42)), UNKNOWN_KICK_REASON);
        assert_eq!(describe_kick_reason(&json!({"color": "red"})), UNKNOWN_KICK_REASON);
    }

    #[test]
    fn extract_mismatched_version_pulls_the_advertised_version() {
        assert_eq!(
            extract_mismatched_version("outdated server! I'm still on version 1.20.1"),
            Some("1.20.1".to_string())
        );
        assert_eq!(
            extract_mismatched_version("Outdated client! Please use 1.21"),
            Some("1.21".to_string())
        );
    }

    #[test]
    fn extract_mismatched_version_ignores_other_errors() {
        assert_eq!(extract_mismatched_version("connect ECONNREFUSED 10.0.0.7:25565"), None);
        assert_eq!(extract_mismatched_version("outdated server!"), None);
        assert_eq!(extract_mismatched_version("you moved 1.5 blocks"), None);
    }

    #[test]
    fn describe_connection_failure_classifies_known_categories() {
        let server = ServerAddress {
            host: "play.example.com".to_string(),
            port: 25565,
        };
        assert_eq!(
            describe_connection_failure("connect ECONNREFUSED 1.2.3.4:25565", &server),
            "play.example.com:25565 refused the connection"
        );
        assert_eq!(
            describe_connection_failure("read ECONNRESET", &server),
            "play.example.com:25565 closed the connection unexpectedly"
        );
        assert_eq!(
            describe_connection_failure("connect ETIMEDOUT 1.2.3.4:25565", &server),
            "connection to play.example.com:25565 timed out"
        );
        assert_eq!(
            describe_connection_failure("getaddrinfo ENOTFOUND play.example.com", &server),
            "could not resolve play.example.com"
        );
    }

    #[test]
    fn describe_connection_failure_passes_through_everything_else() {
        let server = ServerAddress {
            host: "play.example.com".to_string(),
            port: 25565,
        };
        assert_eq!(
            describe_connection_failure("some bespoke failure", &server),
            "some bespoke failure"
        );
    }

    #[test]
    fn client_message_parses_the_channel_shapes() {
        let connect: ClientMessage = serde_json::from_str(
            r#"{"type":"connect","data":{"botName":"Scout","botCount":1,"serverIp":"play.example.com:25565"}}"#,
        )
        .unwrap();
        assert_eq!(
            connect,
            ClientMessage::Connect {
                data: ConnectRequest {
                    bot_name: "Scout".to_string(),
                    bot_count: 1,
                    server_ip: "play.example.com:25565".to_string(),
                }
            }
        );

        let control: ClientMessage =
            serde_json::from_str(r#"{"type":"control","action":"jump"}"#).unwrap();
        assert_eq!(
            control,
            ClientMessage::Control {
                action: "jump".to_string()
            }
        );

        let bare: ClientMessage = serde_json::from_str(r#"{"type":"getBotInfo"}"#).unwrap();
        assert_eq!(bare, ClientMessage::GetBotInfo);
    }

    #[test]
    fn server_push_serializes_the_channel_shapes() {
        assert_eq!(
            serde_json::to_string(&ServerPush::Connected).unwrap(),
            r#"{"type":"connected"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerPush::Error {
                message: "boom".to_string()
            })
            .unwrap(),
            r#"{"type":"error","message":"boom"}"#
        );

        let info = ServerPush::BotInfo {
            data: BotInfo {
                name: "Scout".to_string(),
                count: 1,
                server_ip: "play.example.com:25565".to_string(),
                health: 20,
                food: 18,
            },
        };
        assert_eq!(
            serde_json::to_string(&info).unwrap(),
            r#"{"type":"botInfo","data":{"name":"Scout","count":1,"serverIp":"play.example.com:25565","health":20,"food":18}}"#
        );

        let chat = ServerPush::Chat {
            message: ChatEntry {
                username: SERVER_CHAT_USERNAME.to_string(),
                content: "Server restarting".to_string(),
                timestamp_millis: 1_700_000_000_000,
            },
        };
        assert_eq!(
            serde_json::to_string(&chat).unwrap(),
            r#"{"type":"chat","message":{"username":"SERVER","content":"Server restarting","timestamp":1700000000000}}"#
        );
    }
}
