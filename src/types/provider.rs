//! Provider identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::HeimdallError;

/// Closed set of backends the gateway can route to.
///
/// Every per-provider structure (buckets, health records, usage counters,
/// adapters) is keyed on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// Local runtime (Ollama-compatible).
    Ollama,
    /// OpenAI cloud API.
    OpenAi,
    /// Anthropic cloud API.
    Anthropic,
    /// Google Gemini cloud API.
    Gemini,
    /// Regional vendor (Alibaba DashScope / Qwen).
    Qwen,
}

impl ProviderId {
    /// All providers, in declaration order.
    pub const ALL: [ProviderId; 5] = [
        ProviderId::Ollama,
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Gemini,
        ProviderId::Qwen,
    ];

    /// Stable lowercase name, used in config files, logs and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            ProviderId::Ollama => "ollama",
            ProviderId::OpenAi => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Gemini => "gemini",
            ProviderId::Qwen => "qwen",
        }
    }

    /// Whether the backend runs on the local machine.
    pub const fn is_local(self) -> bool {
        matches!(self, ProviderId::Ollama)
    }

    /// Environment variable consulted for this provider's credential.
    pub const fn api_key_env(self) -> &'static str {
        match self {
            ProviderId::Ollama => "OLLAMA_API_KEY",
            ProviderId::OpenAi => "OPENAI_API_KEY",
            ProviderId::Anthropic => "ANTHROPIC_API_KEY",
            ProviderId::Gemini => "GEMINI_API_KEY",
            ProviderId::Qwen => "DASHSCOPE_API_KEY",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = HeimdallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| HeimdallError::InvalidConfiguration(format!("unknown provider: {s}")))
    }
}
