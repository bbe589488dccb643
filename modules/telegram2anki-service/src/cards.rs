//! Turns collected messages into flashcards with the language model.

use crate::gemini_api::TextGenerator;
use telegram2anki_types::{CardBatch, Flashcard, InboxMessage};

/// Sent ahead of every message; the model answers in the message's language.
pub const CARD_PROMPT: &str = r#"Eres un experto en escribir tarjetas de Anki efectivas.

Convierte el dato o la información de abajo en una o más tarjetas.
Elige el formato que mejor encaje con el contenido:

1. "basic" (pregunta/respuesta): hechos directos, fechas, definiciones simples
2. "cloze" (texto con huecos): definiciones con contexto, frases donde hay que recordar un elemento clave

REGLAS:
- Sé conciso pero informativo
- Las preguntas deben ser claras y concretas
- Las respuestas deben ser fáciles de recordar
- En las tarjetas cloze usa la sintaxis {{c1::texto oculto}}
- Escribe entre 1 y 3 tarjetas según lo rico que sea el dato
- Escribe las tarjetas en el mismo idioma que el texto original

Responde SOLO con JSON válido exactamente en este formato:
{
  "cards": [
    {"type": "basic", "front": "pregunta", "back": "respuesta"},
    {"type": "cloze", "text": "La capital de Francia es {{c1::París}}"}
  ]
}

DATO A CONVERTIR:
"#;

#[derive(Debug, thiserror::Error)]
pub enum CardParseError {
    #[error("model answer is not valid card JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Cards generated for one inbox message
#[derive(Debug, Clone)]
pub struct GeneratedCards {
    pub message_id: i64,
    pub cards: Vec<Flashcard>,
}

pub fn build_prompt(text: &str) -> String {
    format!("{}{}", CARD_PROMPT, text.trim())
}

/// Parses the model's answer, keeping only cards that can be packaged.
pub fn parse_cards(response: &str) -> Result<Vec<Flashcard>, CardParseError> {
    let json = strip_code_fence(response);
    let batch: CardBatch = serde_json::from_str(json)?;
    Ok(batch.into_valid_cards())
}

/// Models like to wrap JSON in ```json fences even when told not to.
fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }

    let body = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return trimmed.trim_start_matches('`'),
    };
    body.trim_end().trim_end_matches("```").trim()
}

pub struct CardGenerator<G> {
    generator: G,
}

impl<G: TextGenerator> CardGenerator<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }

    /// Cards for one piece of text. A failed call or an unusable answer yields
    /// no cards rather than an error, so one bad message doesn't sink the run.
    pub async fn generate_cards(&self, text: &str) -> Vec<Flashcard> {
        let response = match self.generator.generate_text(&build_prompt(text)).await {
            Ok(r) => r,
            Err(e) => {
                log::error!("[CARDS] Generation failed: {}", e);
                return Vec::new();
            }
        };

        match parse_cards(&response) {
            Ok(cards) => cards,
            Err(e) => {
                log::error!("[CARDS] {}", e);
                log::debug!("[CARDS] Response was: {}", preview(&response, 500));
                Vec::new()
            }
        }
    }

    /// Generates cards message by message, in order.
    pub async fn generate_for_messages(&self, messages: &[InboxMessage]) -> Vec<GeneratedCards> {
        let total = messages.len();
        let mut results = Vec::with_capacity(total);

        for (i, message) in messages.iter().enumerate() {
            log::info!(
                "[CARDS] Processing {}/{}: {}",
                i + 1,
                total,
                preview(&message.text, 50)
            );
            let cards = self.generate_cards(&message.text).await;
            log::info!("[CARDS]   -> generated {} cards", cards.len());
            results.push(GeneratedCards {
                message_id: message.id,
                cards,
            });
        }

        results
    }
}

/// First `max` characters of `text`, with an ellipsis when cut.
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
