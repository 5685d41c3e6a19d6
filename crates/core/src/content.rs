//! Input normalisation and content addressing.
//!
//! Every generation request is reduced to a canonical string covering the
//! email body and the generation parameters. Its SHA-256 digest is the
//! experiment id and the cache key, so identical inputs resolve to the same
//! experiment across processes and restarts.

use crate::error::{InboxError, InboxResult};
use crate::types::ExperimentId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MIN_CONTENT_CHARS: usize = 10;
pub const MAX_CONTENT_CHARS: usize = 10_000;
pub const MAX_SUBJECT_CHARS: usize = 255;
pub const MAX_VARIANTS: usize = 10;
pub const MIN_VARIANT_LENGTH: usize = 10;
pub const MAX_VARIANT_LENGTH: usize = 255;

/// Raw generation request as received from the API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub email_content: String,
    #[serde(default)]
    pub original_subject: Option<String>,
    #[serde(default)]
    pub max_variants: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
}

/// Parameters that shape the generated variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub max_variants: usize,
    pub max_length: usize,
}

/// A validated, normalised request. Construct with [`NormalizedInput::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedInput {
    content: String,
    original_subject: Option<String>,
    options: GenerationOptions,
}

impl NormalizedInput {
    /// Validate and normalise a request. `defaults` fill in missing options.
    pub fn new(request: &GenerationRequest, defaults: GenerationOptions) -> InboxResult<Self> {
        let content = normalize_text(&request.email_content);
        let chars = content.chars().count();
        if chars < MIN_CONTENT_CHARS {
            return Err(InboxError::Validation(format!(
                "email content must be at least {MIN_CONTENT_CHARS} characters"
            )));
        }
        if chars > MAX_CONTENT_CHARS {
            return Err(InboxError::Validation(format!(
                "email content exceeds {MAX_CONTENT_CHARS} characters"
            )));
        }

        let original_subject = request
            .original_subject
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if let Some(subject) = &original_subject {
            if subject.chars().count() > MAX_SUBJECT_CHARS {
                return Err(InboxError::Validation(format!(
                    "original subject exceeds {MAX_SUBJECT_CHARS} characters"
                )));
            }
        }

        let options = GenerationOptions {
            max_variants: request.max_variants.unwrap_or(defaults.max_variants),
            max_length: request.max_length.unwrap_or(defaults.max_length),
        };
        if !(1..=MAX_VARIANTS).contains(&options.max_variants) {
            return Err(InboxError::Validation(format!(
                "max_variants must be between 1 and {MAX_VARIANTS}"
            )));
        }
        if !(MIN_VARIANT_LENGTH..=MAX_VARIANT_LENGTH).contains(&options.max_length) {
            return Err(InboxError::Validation(format!(
                "max_length must be between {MIN_VARIANT_LENGTH} and {MAX_VARIANT_LENGTH}"
            )));
        }

        Ok(Self {
            content,
            original_subject,
            options,
        })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn original_subject(&self) -> Option<&str> {
        self.original_subject.as_deref()
    }

    pub fn options(&self) -> GenerationOptions {
        self.options
    }

    /// Canonical form fed to the hash. Field order and labels are part of the
    /// key format; changing them orphans every existing experiment.
    pub fn canonical(&self) -> String {
        format!(
            "content:{}\nsubject:{}\nvariants:{}\nmax_length:{}",
            self.content,
            self.original_subject.as_deref().unwrap_or(""),
            self.options.max_variants,
            self.options.max_length,
        )
    }

    /// Content address of this input; doubles as experiment id and cache key.
    pub fn experiment_id(&self) -> ExperimentId {
        ExperimentId::from_digest(content_hash(&self.canonical()))
    }
}

/// Hex-encoded SHA-256 of `value`.
pub fn content_hash(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Trim, unify line endings, strip trailing whitespace per line and collapse
/// runs of blank lines to one.
fn normalize_text(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;

    for line in unified.trim().lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out
}
