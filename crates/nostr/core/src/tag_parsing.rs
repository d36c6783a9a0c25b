pub(crate) fn tag_name(tag: &[String]) -> Option<&str> {
    tag.first().map(String::as_str)
}

pub(crate) fn tag_field(tag: &[String], index: usize) -> Option<&str> {
    tag.get(index).map(String::as_str)
}

pub(crate) fn is_tag(tag: &[String], name: &str) -> bool {
    matches!(tag_name(tag), Some(tag_name) if tag_name == name)
}

/// Position of the first `name` tag carrying at least `min_len` elements.
pub(crate) fn position_tag(tags: &[Vec<String>], name: &str, min_len: usize) -> Option<usize> {
    tags.iter()
        .position(|tag| tag.len() >= min_len && is_tag(tag, name))
}

pub(crate) fn find_tag<'a>(
    tags: &'a [Vec<String>],
    name: &str,
    min_len: usize,
) -> Option<&'a [String]> {
    position_tag(tags, name, min_len)
        .and_then(|index| tags.get(index))
        .map(Vec::as_slice)
}

pub(crate) fn find_tag_value<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    find_tag(tags, name, 2).and_then(|tag| tag_field(tag, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Vec<Vec<String>> {
        vec![
            vec!["delegation".to_string(), "short".to_string()],
            vec!["p".to_string(), "first".to_string()],
            vec![
                "delegation".to_string(),
                "pk".to_string(),
                "kind=1".to_string(),
                "token".to_string(),
            ],
            vec!["p".to_string(), "second".to_string()],
        ]
    }

    #[test]
    fn position_respects_minimum_length() {
        let tags = tags();
        assert_eq!(position_tag(&tags, "delegation", 4), Some(2));
        assert_eq!(position_tag(&tags, "delegation", 2), Some(0));
        assert_eq!(position_tag(&tags, "missing", 1), None);
    }

    #[test]
    fn first_matching_value_wins() {
        assert_eq!(find_tag_value(&tags(), "p"), Some("first"));
        assert_eq!(find_tag_value(&[vec!["p".to_string()]], "p"), None);
    }
}
