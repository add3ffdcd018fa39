//! Topic name and topic filter handling.
//!
//! A topic name is what PUBLISH carries: no wildcards. A topic filter is
//! what SUBSCRIBE carries: `+` matches exactly one level, `#` matches the
//! remaining levels (including zero) and is only valid as the last level.
//! Topics whose first level starts with `$` are reserved and are never
//! matched by a filter beginning with a wildcard.

use crate::error::{ProtocolError, Result};

/// Longest topic or filter accepted, in bytes.
pub const TOPIC_LENGTH_LIMIT: usize = 65_535;

/// Deepest topic hierarchy accepted. Bounds trie recursion.
pub const TOPIC_HIERARCHY_LIMIT: usize = 200;

fn check_limits(s: &str) -> Result<()> {
    if s.len() > TOPIC_LENGTH_LIMIT {
        return Err(ProtocolError::TopicTooLong {
            len: s.len(),
            max: TOPIC_LENGTH_LIMIT,
        }
        .into());
    }
    let levels = s.bytes().filter(|&b| b == b'/').count() + 1;
    if levels > TOPIC_HIERARCHY_LIMIT {
        return Err(ProtocolError::TopicTooDeep {
            levels,
            max: TOPIC_HIERARCHY_LIMIT,
        }
        .into());
    }
    Ok(())
}

/// Validate a topic name used for publishing.
///
/// Must be non-empty, contain no wildcard characters, and respect the
/// length and hierarchy limits.
pub fn valid_publish_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ProtocolError::InvalidTopic("empty topic").into());
    }
    if topic.bytes().any(|b| b == b'+' || b == b'#') {
        return Err(ProtocolError::InvalidTopic("wildcard in publish topic").into());
    }
    check_limits(topic)
}

/// Validate a topic filter used for subscribing.
///
/// `+` and `#` must occupy a whole level, and `#` must be the final level.
pub fn valid_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(ProtocolError::InvalidFilter("empty filter").into());
    }
    check_limits(filter)?;

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let last = levels.peek().is_none();
        if level.contains('+') && level != "+" {
            return Err(ProtocolError::InvalidFilter("'+' must occupy a whole level").into());
        }
        if level.contains('#') {
            if level != "#" {
                return Err(ProtocolError::InvalidFilter("'#' must occupy a whole level").into());
            }
            if !last {
                return Err(ProtocolError::InvalidFilter("'#' must be the last level").into());
            }
        }
    }
    Ok(())
}

/// Does `topic` match `filter`?
///
/// Both strings are validated; a wildcard in the topic or a misplaced
/// wildcard in the filter is an error, not a non-match. A `$`-prefixed
/// topic never matches a filter that does not itself start with `$`, and
/// vice versa. Zero allocations, linear in the two lengths.
pub fn topic_matches_filter(filter: &str, topic: &str) -> Result<bool> {
    valid_publish_topic(topic)?;
    valid_filter(filter)?;

    // Reserved-root gate: "$SYS/..." is only reachable through a filter
    // that also names the "$" root.
    if (topic.starts_with('$')) != (filter.starts_with('$')) {
        return Ok(false);
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(pattern) = filter_levels.next() {
        if pattern == "#" {
            // Matches the remaining levels, including none: "a/#"
            // matches "a".
            return Ok(true);
        }
        match topic_levels.next() {
            None => return Ok(false),
            Some(level) => {
                if pattern != "+" && pattern != level {
                    return Ok(false);
                }
            }
        }
    }

    Ok(topic_levels.next().is_none())
}
