//! 协议规范化模块：规范请求的容错解析、工具模式转换与消息构建。
//!
//! # Protocol Normalizer
//!
//! Converts between the canonical agent protocol and the pieces every backend driver
//! needs. Nothing in here performs I/O.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`request`] | Raw body → [`CanonicalChatRequest`](crate::types::CanonicalChatRequest) |
//! | [`schema`] | Schema kinds, strict-mode coercion/validation, samples, Gemini cleanup |
//! | [`tools`] | Tool definitions in each backend dialect |
//! | [`messages`] | History + current turn → backend message arrays |
//! | [`prompts`] | Completion / edit / next-edit / title prompts and output parsers |

pub mod messages;
pub mod prompts;
pub mod request;
pub mod schema;
pub mod tools;

pub use messages::{fold_turns, turns_from_messages, Turn, UserPart};
pub use prompts::{parse_next_edit_locations, strip_code_fences, NextEditLocation, TaskKind, TaskPrompt};
pub use request::{normalize_canonical_request, normalize_tool_definition};
pub use schema::{
    check_sample, classify, coerce_strict_schema, sample_json_from_schema, strip_optional_nulls,
    validate_strict_schema, validate_instance, SampleCheck, SchemaIssue, SchemaKind, MAX_SCHEMA_DEPTH,
};
pub use tools::{anthropic_tools, gemini_tools, openai_chat_tools, openai_responses_tools};
