use std::time::Instant;

use crate::dispatch::ExecutionResult;
use crate::prompts::Action;

const CODE_PREVIEW_CHARS: usize = 300;
const RESULT_PREVIEW_CHARS: usize = 500;

/// Per-dispatch log lines with bounded previews of code and results.
#[derive(Clone, Debug)]
pub struct RequestLogger {
    enabled: bool,
    started: Option<Instant>,
}

impl RequestLogger {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            started: None,
        }
    }

    pub fn log_request_start(&mut self, action: &str, model: &str, code: &str) {
        self.started = Some(Instant::now());
        if !self.enabled {
            return;
        }
        tracing::info!(action, model, code_len = code.len(), "dispatch started");
        tracing::debug!(code = %truncate(code, CODE_PREVIEW_CHARS), "submitted code");
    }

    pub fn log_prompt(&self, action: Action, prompt: &str) {
        if !self.enabled {
            return;
        }
        tracing::debug!(%action, prompt = %truncate(prompt, CODE_PREVIEW_CHARS), "inference prompt");
    }

    pub fn log_result(&self, result: &ExecutionResult) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self
            .started
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or_default();
        match result.fault {
            None => tracing::info!(
                elapsed_ms,
                has_image = result.image_path.is_some(),
                "dispatch finished"
            ),
            Some(fault) => tracing::warn!(
                elapsed_ms,
                ?fault,
                text = %truncate(&result.text, RESULT_PREVIEW_CHARS),
                "dispatch failed"
            ),
        }
    }
}

pub fn truncate(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_owned();
    }
    let truncated = text.len() - max_len;
    format!(
        "{}... [TRUNCATED {truncated} bytes]",
        slice_to_boundary(text, max_len)
    )
}

fn slice_to_boundary(text: &str, max_len: usize) -> &str {
    let mut end = max_len.min(text.len());
    while !text.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    &text[..end]
}
