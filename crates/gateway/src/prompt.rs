//! Provider-agnostic prompt construction and response parsing.

use inbox_core::content::GenerationOptions;
use inbox_core::types::DraftVariant;
use inbox_core::NormalizedInput;
use std::collections::HashSet;
use tracing::debug;

/// Characters of email body included in the prompt.
const PROMPT_CONTENT_CHARS: usize = 1000;

pub const SYSTEM_PROMPT: &str =
    "You are an expert email marketer specializing in subject line optimization.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

pub fn build_prompt(input: &NormalizedInput) -> Prompt {
    let GenerationOptions {
        max_variants,
        max_length,
    } = input.options();
    let excerpt: String = input.content().chars().take(PROMPT_CONTENT_CHARS).collect();
    let numbered: String = (1..=max_variants)
        .map(|i| format!("{i}. [Subject line {i}]\n"))
        .collect();

    let user = format!(
        "Generate exactly {max_variants} compelling email subject lines for the following email content. \
Each subject line must be {max_length} characters or less.\n\n\
Email content:\n{excerpt}\n\n\
Requirements:\n\
- Maximum {max_length} characters per subject line\n\
- Focus on urgency, curiosity, or value proposition\n\
- Avoid spam trigger words\n\
- Make them action-oriented\n\
- Vary the approach across lines\n\n\
Original subject: {}\n\n\
Format your response as a numbered list:\n{numbered}",
        input.original_subject().unwrap_or("None provided"),
    );

    Prompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

/// Candidates extracted from raw provider output, padded to the requested count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVariants {
    pub variants: Vec<DraftVariant>,
    pub placeholders: usize,
}

/// Extract list items from `raw`. Over-length, blank and duplicate lines are
/// dropped; missing slots are filled with placeholders flagged as such.
pub fn parse_variants(raw: &str, options: GenerationOptions) -> ParsedVariants {
    let mut seen = HashSet::new();
    let mut variants = Vec::with_capacity(options.max_variants);

    for line in raw.lines() {
        if variants.len() == options.max_variants {
            break;
        }
        let Some(item) = strip_list_marker(line.trim()) else {
            continue;
        };
        let text = strip_quotes(item);
        if text.is_empty() {
            continue;
        }
        if text.chars().count() > options.max_length {
            debug!(length = text.chars().count(), max = options.max_length, "Rejecting over-length subject line");
            continue;
        }
        if !seen.insert(text.to_lowercase()) {
            continue;
        }
        variants.push(DraftVariant {
            text: text.to_string(),
            placeholder: false,
        });
    }

    let generated = variants.len();
    let mut ordinal = generated;
    while variants.len() < options.max_variants {
        ordinal += 1;
        let text = placeholder_text(ordinal, options.max_length);
        // A generated line may already read like a placeholder.
        if !seen.insert(text.to_lowercase()) {
            continue;
        }
        variants.push(DraftVariant {
            text,
            placeholder: true,
        });
    }

    ParsedVariants {
        placeholders: variants.len() - generated,
        variants,
    }
}

fn placeholder_text(ordinal: usize, max_length: usize) -> String {
    let long = format!("Optimized Subject {ordinal}");
    if long.chars().count() <= max_length {
        long
    } else {
        format!("Subject {ordinal}")
    }
}

/// Accepts `1. x`, `1) x`, `- x` and `* x`; anything else is not a list item.
fn strip_list_marker(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return Some(rest.trim());
    }

    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix('.')
        .or_else(|| rest.strip_prefix(')'))
        .map(str::trim)
}

fn strip_quotes(text: &str) -> &str {
    text.trim_matches(|c| matches!(c, '"' | '\'' | '\u{201c}' | '\u{201d}' | '*'))
        .trim()
}
