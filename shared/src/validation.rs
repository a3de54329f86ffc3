use std::collections::HashSet;
use crate::models::{Channel, OptionId};

pub const MAX_OPTION_LENGTH: usize = 40;
pub const MAX_OPTIONS: usize = 20;
pub const MIN_OPTIONS: usize = 2;
pub const MAX_VOTER_TOKEN_LENGTH: usize = 128;
pub const ALL_CHANNEL: &str = "all";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Option identifier exceeds maximum length of {MAX_OPTION_LENGTH}")]
    OptionTooLong,
    #[error("Empty option identifier")]
    EmptyOption,
    #[error("Too many options (maximum {MAX_OPTIONS})")]
    TooManyOptions,
    #[error("Too few options (minimum {MIN_OPTIONS})")]
    TooFewOptions,
    #[error("Duplicate option: {0}")]
    DuplicateOption(String),
    #[error("Option identifier is reserved: {0}")]
    ReservedOption(String),
    #[error("Unknown option: {0}")]
    UnknownOption(String),
    #[error("Voter token exceeds maximum length of {MAX_VOTER_TOKEN_LENGTH}")]
    VoterTokenTooLong,
    #[error("Unsupported channel: {0}")]
    UnsupportedChannel(String),
}

pub fn validate_option_id(raw: &str) -> Result<OptionId, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() { return Err(ValidationError::EmptyOption); }
    if trimmed.len() > MAX_OPTION_LENGTH { return Err(ValidationError::OptionTooLong); }
    Ok(OptionId::new_unchecked(trimmed))
}

/// Validates the configured ballot. Duplicates are detected case-insensitively,
/// the same way ballots reject "Yes" and "yes" as two separate options.
pub fn validate_option_set<S: AsRef<str>>(raw: &[S]) -> Result<Vec<OptionId>, ValidationError> {
    if raw.len() > MAX_OPTIONS { return Err(ValidationError::TooManyOptions); }
    if raw.len() < MIN_OPTIONS { return Err(ValidationError::TooFewOptions); }

    let mut seen = HashSet::with_capacity(raw.len());
    let mut options = Vec::with_capacity(raw.len());
    for entry in raw {
        let option = validate_option_id(entry.as_ref())?;
        if option.as_str().eq_ignore_ascii_case(ALL_CHANNEL) {
            return Err(ValidationError::ReservedOption(option.to_string()));
        }
        if !seen.insert(option.as_str().to_lowercase()) {
            return Err(ValidationError::DuplicateOption(option.to_string()));
        }
        options.push(option);
    }

    Ok(options)
}

/// Resolves an inbound choice against the configured options.
pub fn validate_choice(raw: &str, options: &[OptionId]) -> Result<OptionId, ValidationError> {
    options.iter()
        .find(|opt| opt.as_str() == raw)
        .cloned()
        .ok_or_else(|| ValidationError::UnknownOption(raw.to_string()))
}

pub fn validate_voter_token(token: &str) -> Result<(), ValidationError> {
    if token.len() > MAX_VOTER_TOKEN_LENGTH {
        return Err(ValidationError::VoterTokenTooLong);
    }
    Ok(())
}

/// `None` and `"all"` select the full tally; any configured option id narrows
/// the stream to that option. Everything else is rejected.
pub fn parse_channel(name: Option<&str>, options: &[OptionId]) -> Result<Channel, ValidationError> {
    match name.map(str::trim) {
        None | Some(ALL_CHANNEL) => Ok(Channel::All),
        Some(requested) => options.iter()
            .find(|opt| opt.as_str() == requested)
            .map(|opt| Channel::Option(opt.clone()))
            .ok_or_else(|| ValidationError::UnsupportedChannel(requested.to_string())),
    }
}
