//! Raw Mixpanel results → short natural-language summary.

use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LanguageModel};
use crate::trace::DebugTrace;
use serde_json::Value;
use std::sync::Arc;

const SUMMARIZATION_PROMPT: &str = r#"You are a data analyst. Given the user's original question and the raw data from Mixpanel, provide a concise natural language summary of the findings.

Guidelines:
- Be specific with numbers and percentages
- Highlight key trends or notable patterns
- Keep it brief (2-4 sentences)
- If the data is empty or shows no results, say so clearly"#;

#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub trace: DebugTrace,
}

pub struct Summarizer {
    llm: Arc<dyn LanguageModel>,
}

impl Summarizer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    pub async fn summarize(&self, question: &str, data: &Value) -> Result<Summary> {
        let messages = vec![
            ChatMessage::system(SUMMARIZATION_PROMPT),
            ChatMessage::user(format!(
                "Question: {}\n\nData:\n{}",
                question,
                serde_json::to_string_pretty(data)?
            )),
        ];
        let request = CompletionRequest::new(self.llm.model(), messages, 0.3);

        let completion = self.llm.complete(&request).await?;
        let text = completion.content.trim().to_string();

        Ok(Summary {
            trace: completion.trace(&request, Value::String(text.clone())),
            text,
        })
    }
}
