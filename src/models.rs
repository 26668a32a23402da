use serde::{Deserialize, Serialize};

// -- Client wire contract ---------------------------------------------------

/// Inbound "send message" event from the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    pub message: String,
}

/// Outbound events pushed to the client connection.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Stream {
        text: String,
        partial: bool,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        complete: bool,
    },
    Error {
        message: String,
    },
}

// -- Ollama-style NDJSON API ------------------------------------------------

#[derive(Debug, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub options: GenerateOptions,
}

#[derive(Debug, Serialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

/// One newline-terminated object of the generate stream. Extra fields the
/// backend emits (timings, context) are ignored.
#[derive(Debug, Deserialize)]
pub struct GenerateChunk {
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Deserialize)]
pub struct TagsResponse {
    #[serde(default)]
    pub models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TagEntry {
    pub name: String,
}

// -- OpenAI-compatible SSE API ----------------------------------------------

#[derive(Debug, Serialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub delta: ChatDelta,
    #[allow(dead_code)]
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModelsResponse {
    #[serde(default)]
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ModelEntry {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_event_omits_complete_when_false() {
        let event = ServerEvent::Stream {
            text: "Hel".to_string(),
            partial: true,
            complete: false,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"type\":\"stream\""));
        assert!(json.contains("\"partial\":true"));
        assert!(!json.contains("complete"));
    }

    #[test]
    fn stream_event_carries_complete_when_true() {
        let event = ServerEvent::Stream {
            text: "Hello".to_string(),
            partial: false,
            complete: true,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"complete\":true"));
    }

    #[test]
    fn error_event_is_tagged() {
        let event = ServerEvent::Error {
            message: "Message cannot be empty.".to_string(),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("Message cannot be empty."));
    }

    #[test]
    fn client_message_deserializes() {
        let inbound: ClientMessage =
            serde_json::from_str(r#"{"message":"hello"}"#).expect("deserialize");
        assert_eq!(inbound.message, "hello");
    }

    #[test]
    fn generate_chunk_deserializes_fragment() {
        let chunk: GenerateChunk =
            serde_json::from_str(r#"{"model":"llama3","response":"Hi","done":false}"#)
                .expect("deserialize");
        assert_eq!(chunk.response.as_deref(), Some("Hi"));
        assert!(!chunk.done);
    }

    #[test]
    fn generate_chunk_deserializes_terminal_marker() {
        let chunk: GenerateChunk =
            serde_json::from_str(r#"{"done":true,"total_duration":12345}"#).expect("deserialize");
        assert!(chunk.response.is_none());
        assert!(chunk.done);
    }

    #[test]
    fn generate_request_serializes_options() {
        let request = GenerateRequest {
            model: "llama3".to_string(),
            prompt: "hello".to_string(),
            stream: true,
            options: GenerateOptions {
                temperature: 0.7,
                top_p: 0.9,
                top_k: 40,
            },
        };
        let json = serde_json::to_string(&request).expect("serialize");
        assert!(json.contains("\"stream\":true"));
        assert!(json.contains("\"top_k\":40"));
    }

    #[test]
    fn chat_chunk_deserializes_delta_content() {
        let json = r#"{"id":"chatcmpl-abc","choices":[{"index":0,"delta":{"content":"Bon"},"finish_reason":null}]}"#;
        let chunk: ChatChunk = serde_json::from_str(json).expect("deserialize");
        assert_eq!(
            chunk.choices.first().and_then(|c| c.delta.content.as_deref()),
            Some("Bon")
        );
    }

    #[test]
    fn chat_chunk_tolerates_empty_delta_and_no_choices() {
        let chunk: ChatChunk =
            serde_json::from_str(r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#)
                .expect("deserialize");
        assert!(chunk.choices[0].delta.content.is_none());

        let empty: ChatChunk = serde_json::from_str(r#"{"choices":[]}"#).expect("deserialize");
        assert!(empty.choices.is_empty());
    }

    #[test]
    fn tags_response_deserializes_model_names() {
        let tags: TagsResponse =
            serde_json::from_str(r#"{"models":[{"name":"llama3:latest","size":123}]}"#)
                .expect("deserialize");
        assert_eq!(tags.models[0].name, "llama3:latest");
    }

    #[test]
    fn models_response_deserializes_ids() {
        let models: ModelsResponse =
            serde_json::from_str(r#"{"object":"list","data":[{"id":"gpt-4o-mini"}]}"#)
                .expect("deserialize");
        assert_eq!(models.data[0].id, "gpt-4o-mini");
    }
}
