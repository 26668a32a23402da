pub const ROLE_USER: &str = "user";

pub const SSE_DATA_PREFIX: &str = "data:";
pub const SSE_DONE_SENTINEL: &str = "[DONE]";

pub const GENERATE_PATH: &str = "/api/generate";
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
pub const TAGS_PATH: &str = "/api/tags";
pub const MODELS_PATH: &str = "/v1/models";

pub const PROBE_TIMEOUT_SECS: u64 = 10;

/// Canned replies delivered as the terminal answer when the inference
/// backend fails. Kept in the same voice as normal answers so the chat UI
/// needs no special-case rendering.
pub const FALLBACK_REPLIES: [&str; 3] = [
    "I'm sorry, I'm having trouble reaching the assistant right now. Please try again in a few minutes.",
    "Something went wrong while preparing a response. Please try again shortly, or contact a professional directly if your question is urgent.",
    "The assistant is temporarily unavailable. Your message was not lost, please send it again in a moment.",
];
