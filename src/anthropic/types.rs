//! Tipos de dados para requisições e respostas da API Anthropic Messages.
//!
//! Os nomes dos campos seguem o JSON esperado pelo endpoint `v1/messages`.

use serde::{Deserialize, Serialize};

/// Corpo da requisição para o endpoint `/v1/messages`.
///
/// O colaborador monta uma requisição por estágio: a análise de
/// compatibilidade e a geração da carta usam prompts de sistema distintos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Identificador do modelo (ex.: "claude-sonnet-4-5").
    pub model: String,
    /// Número máximo de tokens na resposta gerada.
    pub max_tokens: u32,
    /// Prompt de sistema opcional; omitido do JSON quando ausente.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Mensagens que compõem a conversa.
    pub messages: Vec<Message>,
}

/// Uma única mensagem da conversa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Papel do remetente: "user" ou "assistant".
    pub role: String,
    /// Conteúdo textual da mensagem.
    pub content: String,
}

impl Message {
    /// Mensagem com papel "user".
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Resposta retornada pelo endpoint `/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Identificador único da resposta (gerado pela API).
    pub id: String,
    /// Blocos de conteúdo gerados (normalmente texto).
    pub content: Vec<ContentBlock>,
    /// Modelo que gerou a resposta.
    pub model: String,
    /// Motivo da parada da geração (ex.: "end_turn", "max_tokens").
    /// `None` se ainda em progresso.
    pub stop_reason: Option<String>,
    /// Tokens consumidos na entrada e na saída.
    pub usage: Usage,
}

impl MessagesResponse {
    /// Texto concatenado de todos os blocos do tipo texto.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Um bloco de conteúdo dentro da resposta.
///
/// O campo `content_type` é serializado como `"type"` no JSON, seguindo o
/// formato da API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    /// Tipo do bloco (ex.: "text").
    #[serde(rename = "type")]
    pub content_type: String,
    /// Texto do bloco; vazio para blocos que não são texto.
    #[serde(default)]
    pub text: String,
}

/// Contagem de tokens de uma chamada.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumidos pelo prompt.
    pub input_tokens: u32,
    /// Tokens gerados na resposta.
    pub output_tokens: u32,
}
