//! Topic name and filter validation
//!
//! Topic names (PUBLISH) must not contain wildcards; filters may. The
//! multi-level wildcard must terminate the filter and both wildcards must
//! occupy a whole level. `$share/<group>/<filter>` is validated on the inner
//! filter with a non-empty, wildcard-free group name.

/// Shared-subscription prefix per the v5 spec.
pub const SHARE_PREFIX: &str = "$share/";

/// Split a shared filter into (group, inner filter), or `None` for ordinary
/// filters and malformed `$share` forms.
pub fn parse_shared(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix(SHARE_PREFIX)?;
    let slash = rest.find('/')?;
    let (group, inner) = (&rest[..slash], &rest[slash + 1..]);
    if group.is_empty() || group.contains(['+', '#']) || inner.is_empty() {
        return None;
    }
    Some((group, inner))
}

#[inline]
pub fn is_shared_filter(filter: &str) -> bool {
    filter.starts_with(SHARE_PREFIX)
}

/// Validate a topic name as used in PUBLISH.
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > 65535 {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter as used in SUBSCRIBE/UNSUBSCRIBE.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > 65535 {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let inner = if is_shared_filter(filter) {
        match parse_shared(filter) {
            Some((_, inner)) => inner,
            None => return Err("invalid shared subscription format"),
        }
    } else {
        filter
    };

    let levels: Vec<&str> = inner.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err("multi-level wildcard must terminate the filter");
        }
        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy an entire level");
        }
    }
    Ok(())
}

/// Check whether a concrete topic matches a filter. `$`-topics never match
/// filters whose first level is a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some("#"), _) => return true,
            (Some(_), None) => return false,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("test" ; "single level")]
    #[test_case("test/topic" ; "two levels")]
    #[test_case("/leading/sep" ; "leading separator")]
    #[test_case("trailing/" ; "trailing separator")]
    fn valid_topic_names(topic: &str) {
        assert!(validate_topic_name(topic).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("a/+/b" ; "plus wildcard")]
    #[test_case("a/#" ; "hash wildcard")]
    #[test_case("a\0b" ; "null char")]
    fn invalid_topic_names(topic: &str) {
        assert!(validate_topic_name(topic).is_err());
    }

    #[test_case("#" ; "bare hash")]
    #[test_case("+" ; "bare plus")]
    #[test_case("a/+/c" ; "mid plus")]
    #[test_case("a/b/#" ; "trailing hash")]
    #[test_case("$share/g/a/+" ; "shared with wildcard")]
    fn valid_filters(filter: &str) {
        assert!(validate_topic_filter(filter).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("a/#/b" ; "hash not last")]
    #[test_case("a+" ; "plus inside level")]
    #[test_case("a#" ; "hash inside level")]
    #[test_case("$share/g" ; "shared missing filter")]
    #[test_case("$share//a" ; "shared empty group")]
    #[test_case("$share/g+/a" ; "shared wildcard group")]
    fn invalid_filters(filter: &str) {
        assert!(validate_topic_filter(filter).is_err());
    }

    #[test]
    fn shared_parsing() {
        assert_eq!(parse_shared("$share/workers/jobs/#"), Some(("workers", "jobs/#")));
        assert_eq!(parse_shared("jobs/#"), None);
    }

    #[test]
    fn matching_rules() {
        assert!(topic_matches_filter("a/b", "a/b"));
        assert!(topic_matches_filter("a/b", "a/+"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(topic_matches_filter("a/b/c", "#"));
        assert!(!topic_matches_filter("a/b", "a"));
        assert!(!topic_matches_filter("a", "a/b"));
        assert!(!topic_matches_filter("a/b/c", "a/+"));

        // $-topics are isolated from top-level wildcards
        assert!(!topic_matches_filter("$SYS/broker/uptime", "#"));
        assert!(!topic_matches_filter("$SYS/broker/uptime", "+/broker/uptime"));
        assert!(topic_matches_filter("$SYS/broker/uptime", "$SYS/#"));
    }
}
