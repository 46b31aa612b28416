//! Task prompts for the non-chat endpoints (completion, edit, next-edit, title) and
//! parsers for their model output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::CanonicalChatRequest;

/// System prompt + user prompt pair for a one-shot call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPrompt {
    pub system: String,
    pub user: String,
}

/// Non-chat task served by a one-shot or text-streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Completion,
    Edit,
    NextEdit,
    NextEditLocation,
    Title,
}

impl TaskKind {
    /// Task of a canonical endpoint, if it is one of the task endpoints.
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        match endpoint.trim().trim_matches('/') {
            "completion" | "chat-input-completion" => Some(TaskKind::Completion),
            "edit" | "instruction-stream" | "smart-paste-stream" => Some(TaskKind::Edit),
            "next-edit-stream" | "next_edit" | "next-edit" => Some(TaskKind::NextEdit),
            "next_edit_loc" | "next-edit-location" => Some(TaskKind::NextEditLocation),
            "generate-conversation-title" | "title" => Some(TaskKind::Title),
            _ => None,
        }
    }

    pub fn prompt(&self, req: &CanonicalChatRequest) -> TaskPrompt {
        match self {
            TaskKind::Completion => completion_prompt(req),
            TaskKind::Edit => edit_prompt(req),
            TaskKind::NextEdit => next_edit_prompt(req),
            TaskKind::NextEditLocation => next_edit_location_prompt(req),
            TaskKind::Title => title_prompt(req),
        }
    }

    /// Post-process raw model output: code tasks lose their fences, titles their quotes.
    pub fn finish(&self, output: &str) -> String {
        match self {
            TaskKind::Completion | TaskKind::Edit | TaskKind::NextEdit => strip_code_fences(output),
            TaskKind::Title => output.trim().trim_matches('"').trim().to_string(),
            TaskKind::NextEditLocation => output.trim().to_string(),
        }
    }
}

fn fence(lang: &str, body: &str) -> String {
    format!("```{}\n{}\n```", lang, body)
}

fn file_header(req: &CanonicalChatRequest) -> String {
    match (req.path.is_empty(), req.lang.is_empty()) {
        (false, false) => format!("File: {} ({})", req.path, req.lang),
        (false, true) => format!("File: {}", req.path),
        (true, false) => format!("Language: {}", req.lang),
        (true, true) => String::new(),
    }
}

/// Fill-in-the-middle completion at the cursor between `prefix` and `suffix`.
pub fn completion_prompt(req: &CanonicalChatRequest) -> TaskPrompt {
    TaskPrompt {
        system: "You are a code completion engine. Output only the code that belongs at \
                 <CURSOR>. No explanations, no markdown fences."
            .into(),
        user: format!(
            "{}\n{}",
            file_header(req),
            fence(&req.lang, &format!("{}<CURSOR>{}", req.prefix, req.suffix))
        )
        .trim_start()
        .to_string(),
    }
}

/// Rewrite `selected_code` following `instruction`.
pub fn edit_prompt(req: &CanonicalChatRequest) -> TaskPrompt {
    let instruction = if req.instruction.is_empty() {
        &req.message
    } else {
        &req.instruction
    };
    TaskPrompt {
        system: "You edit code. Return only the full replacement for the selected code, \
                 without explanations."
            .into(),
        user: format!(
            "{}\nContext before:\n{}\nSelected code:\n{}\nContext after:\n{}\nInstruction: {}",
            file_header(req),
            fence(&req.lang, &req.prefix),
            fence(&req.lang, &req.selected_code),
            fence(&req.lang, &req.suffix),
            instruction
        )
        .trim_start()
        .to_string(),
    }
}

/// Predict the next edit of the selected region.
pub fn next_edit_prompt(req: &CanonicalChatRequest) -> TaskPrompt {
    TaskPrompt {
        system: "You predict the developer's next edit. Return only the rewritten region \
                 enclosed in a single code block."
            .into(),
        user: format!(
            "{}\nRecent intent: {}\nCode before the region:\n{}\nRegion to rewrite:\n{}\nCode after the region:\n{}",
            file_header(req),
            if req.instruction.is_empty() { "(none)" } else { req.instruction.as_str() },
            fence(&req.lang, &req.prefix),
            fence(&req.lang, &req.selected_code),
            fence(&req.lang, &req.suffix)
        )
        .trim_start()
        .to_string(),
    }
}

/// Ask for candidate locations of the next edit as a JSON array.
pub fn next_edit_location_prompt(req: &CanonicalChatRequest) -> TaskPrompt {
    TaskPrompt {
        system: "You locate where the developer will edit next. Answer with a JSON array of \
                 objects {\"path\": string, \"line_start\": integer, \"line_end\": integer, \
                 \"reason\": string} and nothing else."
            .into(),
        user: format!(
            "{}\nRecent intent: {}\nCurrent code:\n{}",
            file_header(req),
            if req.instruction.is_empty() { &req.message } else { &req.instruction },
            fence(&req.lang, &format!("{}{}{}", req.prefix, req.selected_code, req.suffix))
        )
        .trim_start()
        .to_string(),
    }
}

/// Short conversation title from the first user message.
pub fn title_prompt(req: &CanonicalChatRequest) -> TaskPrompt {
    let first = req
        .chat_history
        .first()
        .map(|e| e.request_message.as_str())
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(&req.message);
    TaskPrompt {
        system: "Generate a short title (at most six words) for this conversation. Output the \
                 title only."
            .into(),
        user: first.to_string(),
    }
}

static FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+\-.]*[ \t]*\n?(.*?)\n?```").unwrap()
});

static LOCATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)([\w./\\-]+\.[A-Za-z0-9]+):(\d+)(?:-(\d+))?").unwrap()
});

/// Content of the first fenced block, or the trimmed text when there is none.
pub fn strip_code_fences(text: &str) -> String {
    match FENCE_RE.captures(text).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().to_string(),
        None => text.trim().to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextEditLocation {
    pub path: String,
    pub line_start: u32,
    pub line_end: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Parse model output into locations: a JSON array (possibly fenced or wrapped in
/// prose), else `path:line[-line]` mentions.
pub fn parse_next_edit_locations(text: &str) -> Vec<NextEditLocation> {
    let body = strip_code_fences(text);
    let candidate = match (body.find('['), body.rfind(']')) {
        (Some(s), Some(e)) if e > s => &body[s..=e],
        _ => body.as_str(),
    };
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(candidate) {
        let parsed: Vec<NextEditLocation> = items.iter().filter_map(location_from_value).collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }
    LOCATION_RE
        .captures_iter(text)
        .filter_map(|c| {
            let start: u32 = c.get(2)?.as_str().parse().ok()?;
            let end: u32 = c
                .get(3)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(start);
            Some(NextEditLocation {
                path: c.get(1)?.as_str().to_string(),
                line_start: start,
                line_end: end.max(start),
                reason: None,
            })
        })
        .collect()
}

fn location_from_value(v: &Value) -> Option<NextEditLocation> {
    let obj = v.as_object()?;
    let path = obj
        .get("path")
        .or_else(|| obj.get("file"))
        .and_then(Value::as_str)?
        .to_string();
    let num = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_u64))
            .map(|n| n as u32)
    };
    let start = num(&["line_start", "lineStart", "start_line", "line"]).unwrap_or(1);
    let end = num(&["line_end", "lineEnd", "end_line"]).unwrap_or(start);
    Some(NextEditLocation {
        path,
        line_start: start,
        line_end: end.max(start),
        reason: obj.get("reason").and_then(Value::as_str).map(String::from),
    })
}
