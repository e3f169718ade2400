//! JSON frames exchanged with the conversational agent.

use serde::{Deserialize, Serialize};

/// Frames sent to the agent.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ClientMessage {
    ConversationInitiation {
        r#type: &'static str,
        conversation_initiation_client_data: InitiationClientData,
    },
    UserAudioChunk {
        user_audio_chunk: String,
    },
    Pong {
        r#type: &'static str,
        event_id: u64,
    },
}

impl ClientMessage {
    pub fn conversation_initiation() -> Self {
        Self::ConversationInitiation {
            r#type: "conversation_initiation_client_data",
            conversation_initiation_client_data: InitiationClientData::default(),
        }
    }

    pub fn user_audio_chunk(base64_pcm16: String) -> Self {
        Self::UserAudioChunk {
            user_audio_chunk: base64_pcm16,
        }
    }

    pub fn pong(event_id: u64) -> Self {
        Self::Pong {
            r#type: "pong",
            event_id,
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct InitiationClientData {
    pub custom_llm_extra_body: serde_json::Map<String, serde_json::Value>,
}

/// Frames received from the agent. Unrecognized `type` tags map to [`ServerMessage::Unknown`].
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: ConversationMetadataEvent,
    },
    Ping {
        ping_event: PingEvent,
    },
    UserTranscript {
        user_transcription_event: UserTranscriptionEvent,
    },
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },
    Audio {
        audio_event: AudioEvent,
    },
    Interruption {
        interruption_event: InterruptionEvent,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ConversationMetadataEvent {
    pub conversation_id: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PingEvent {
    pub event_id: u64,
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct UserTranscriptionEvent {
    pub user_transcript: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AgentResponseEvent {
    pub agent_response: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AudioEvent {
    pub audio_base_64: String,
    pub event_id: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct InterruptionEvent {
    #[serde(default)]
    pub reason: String,
}
