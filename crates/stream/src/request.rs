use serde::Serialize;

/// Wire-level speaker role, intentionally decoupled from thread-model enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    System,
    User,
    Assistant,
}

/// One message of the backend request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireMessage {
    pub role: WireRole,
    pub content: String,
}

impl WireMessage {
    pub fn new(role: WireRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// JSON body POSTed to the answer endpoint. Field names are the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerRequest {
    pub messages: Vec<WireMessage>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}
