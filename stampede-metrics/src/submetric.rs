use crate::tags::TagSet;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid metric key (missing metric name): {0}")]
    MissingName(String),

    #[error("invalid metric key (missing `}}`): {0}")]
    MissingBrace(String),

    #[error("invalid metric key (empty selector): {0}")]
    EmptySelector(String),

    #[error("invalid selector pair (expected tag:value): {0}")]
    InvalidPair(String),

    #[error("invalid selector pair (empty key/value): {0}")]
    EmptyPair(String),

    #[error("invalid selector (unsupported characters in key/value): {0}")]
    UnsupportedCharacters(String),

    #[error("invalid selector (duplicate tag key `{key}`): {raw}")]
    DuplicateKey { key: String, raw: String },
}

/// Tag-filtered view of a parent metric, named `base{k:v,…}`.
///
/// A sample contributes to the submetric iff its tags are a superset of the
/// selector.
#[derive(Debug, Clone)]
pub struct Submetric {
    pub name: String,
    pub parent: String,
    pub tags: TagSet,
}

/// Split a metric key into its base name and tag selector. Keys without a
/// `{…}` suffix return an empty selector.
pub fn parse_submetric(raw: &str) -> Result<(String, TagSet)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::MissingName(raw.to_string()));
    }

    let Some((name_raw, selector_with_brace)) = raw.split_once('{') else {
        return Ok((raw.to_string(), TagSet::new()));
    };

    let name = name_raw.trim();
    if name.is_empty() {
        return Err(Error::MissingName(raw.to_string()));
    }

    let selector = selector_with_brace
        .strip_suffix('}')
        .ok_or_else(|| Error::MissingBrace(raw.to_string()))?;

    // Simple selector values only: no escaping or quoting. Whitespace is
    // ignored around tokens, not allowed inside keys/values.
    let mut tags = TagSet::new();

    for part in selector.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (k_raw, v_raw) = part
            .split_once(':')
            .ok_or_else(|| Error::InvalidPair(raw.to_string()))?;
        let k = k_raw.trim();
        let v = v_raw.trim();
        if k.is_empty() || v.is_empty() {
            return Err(Error::EmptyPair(raw.to_string()));
        }

        let is_simple = |s: &str| {
            !s.chars()
                .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | ',' | ':'))
        };
        if !is_simple(k) || !is_simple(v) {
            return Err(Error::UnsupportedCharacters(raw.to_string()));
        }

        if tags.get(k).is_some() {
            return Err(Error::DuplicateKey {
                key: k.to_string(),
                raw: raw.to_string(),
            });
        }

        tags.insert(k, v);
    }

    if tags.is_empty() {
        return Err(Error::EmptySelector(raw.to_string()));
    }

    Ok((name.to_string(), tags))
}
