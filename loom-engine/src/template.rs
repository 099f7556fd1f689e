//! Chat-template application.
//!
//! Renders an ordered conversation into the single prompt string a model
//! was trained on.  Well-known formats are built in; models that ship
//! their own Jinja template use [`ChatTemplate::Jinja`].

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"` or `"assistant"`.
    pub role: String,
    /// UTF-8 message text.
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Built-in prompt formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateFormat {
    /// `<|im_start|>role\ncontent<|im_end|>` (Qwen2, OpenHermes, Yi).
    ChatML,
    /// `<s>[INST] <<SYS>>…<</SYS>> … [/INST]` (LLaMA 2, Vicuna).
    Llama2,
    /// `<s>[INST] … [/INST]`, no system section (Mistral, Mixtral).
    Mistral,
    /// `### Instruction: / ### Response:` instruction format.
    Alpaca,
    /// `Role: content` lines with a trailing `Assistant:` cue.
    #[default]
    Raw,
}

impl TemplateFormat {
    /// Render `messages` in this format, ending with the generation cue
    /// for the assistant turn.
    pub fn apply(&self, messages: &[ChatMessage]) -> String {
        match self {
            TemplateFormat::ChatML => apply_chatml(messages),
            TemplateFormat::Llama2 => apply_llama2(messages, true),
            TemplateFormat::Mistral => apply_llama2(messages, false),
            TemplateFormat::Alpaca => apply_alpaca(messages),
            TemplateFormat::Raw => apply_raw(messages),
        }
    }
}

/// The template carried by a model handle.
#[derive(Debug, Clone)]
pub enum ChatTemplate {
    /// One of the built-in formats.
    Format(TemplateFormat),
    /// A custom Jinja template (typically read from GGUF metadata).
    Jinja(String),
}

impl ChatTemplate {
    pub fn apply(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        match self {
            ChatTemplate::Format(format) => Ok(format.apply(messages)),
            ChatTemplate::Jinja(source) => {
                let env = minijinja::Environment::new();
                env.render_str(
                    source,
                    minijinja::context! {
                        messages => messages,
                        add_generation_prompt => true,
                        bos_token => "",
                        eos_token => "",
                    },
                )
                .map_err(|e| EngineError::Template(e.to_string()))
            }
        }
    }
}

fn apply_chatml(messages: &[ChatMessage]) -> String {
    let mut out = String::with_capacity(256);
    for msg in messages {
        out.push_str("<|im_start|>");
        out.push_str(&msg.role);
        out.push('\n');
        out.push_str(&msg.content);
        out.push_str("<|im_end|>\n");
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

/// LLaMA-2 style `[INST]` turns.  With `with_system = false` (Mistral) the
/// system text is folded into the first user turn instead of a `<<SYS>>`
/// section.
fn apply_llama2(messages: &[ChatMessage], with_system: bool) -> String {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();
    let system = system.join("\n");

    let mut out = String::with_capacity(256);
    let mut first_user = true;
    for msg in messages {
        match msg.role.as_str() {
            "user" => {
                out.push_str("<s>[INST] ");
                if first_user && !system.is_empty() {
                    if with_system {
                        out.push_str("<<SYS>>\n");
                        out.push_str(&system);
                        out.push_str("\n<</SYS>>\n\n");
                    } else {
                        out.push_str(&system);
                        out.push_str("\n\n");
                    }
                }
                first_user = false;
                out.push_str(&msg.content);
                out.push_str(" [/INST]");
            }
            "assistant" => {
                out.push(' ');
                out.push_str(&msg.content);
                out.push_str(" </s>");
            }
            _ => {}
        }
    }
    out
}

fn apply_alpaca(messages: &[ChatMessage]) -> String {
    let mut out = String::with_capacity(256);
    for msg in messages {
        match msg.role.as_str() {
            "system" => {
                out.push_str(&msg.content);
                out.push_str("\n\n");
            }
            "user" => {
                out.push_str("### Instruction:\n");
                out.push_str(&msg.content);
                out.push_str("\n\n");
            }
            "assistant" => {
                out.push_str("### Response:\n");
                out.push_str(&msg.content);
                out.push_str("\n\n");
            }
            _ => {}
        }
    }
    out.push_str("### Response:\n");
    out
}

fn apply_raw(messages: &[ChatMessage]) -> String {
    let mut out = String::with_capacity(256);
    for msg in messages {
        out.push_str(capitalize_role(&msg.role));
        out.push_str(": ");
        out.push_str(&msg.content);
        out.push('\n');
    }
    out.push_str("Assistant: ");
    out
}

fn capitalize_role(role: &str) -> &str {
    match role {
        "user" => "User",
        "assistant" => "Assistant",
        "system" => "System",
        other => other,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chatml_wraps_each_turn_and_adds_generation_cue() {
        let prompt = TemplateFormat::ChatML.apply(&[
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
        ]);
        assert!(prompt.contains("<|im_start|>system\nbe brief<|im_end|>\n"));
        assert!(prompt.contains("<|im_start|>user\nhi<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn llama2_puts_system_in_first_inst_only() {
        let prompt = TemplateFormat::Llama2.apply(&[
            ChatMessage::system("sys"),
            ChatMessage::user("one"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("two"),
        ]);
        assert!(prompt.starts_with("<s>[INST] <<SYS>>\nsys\n<</SYS>>\n\none [/INST]"));
        assert!(prompt.contains(" reply </s>"));
        assert!(prompt.ends_with("<s>[INST] two [/INST]"));
        assert_eq!(prompt.matches("<<SYS>>").count(), 1);
    }

    #[test]
    fn mistral_folds_system_into_first_user_turn() {
        let prompt = TemplateFormat::Mistral.apply(&[
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
        ]);
        assert_eq!(prompt, "<s>[INST] sys\n\nhi [/INST]");
    }

    #[test]
    fn raw_matches_role_colon_lines() {
        let prompt = TemplateFormat::Raw.apply(&[ChatMessage::user("hello")]);
        assert_eq!(prompt, "User: hello\nAssistant: ");
    }

    #[test]
    fn jinja_template_renders_messages() {
        let template = ChatTemplate::Jinja(
            "{% for m in messages %}{{ m.role }}={{ m.content }};{% endfor %}\
             {% if add_generation_prompt %}assistant={% endif %}"
                .to_string(),
        );
        let prompt = template.apply(&[ChatMessage::user("x")]).unwrap();
        assert_eq!(prompt, "user=x;assistant=");
    }

    #[test]
    fn jinja_syntax_error_is_reported() {
        let template = ChatTemplate::Jinja("{% broken".to_string());
        assert!(template.apply(&[ChatMessage::user("x")]).is_err());
    }
}
