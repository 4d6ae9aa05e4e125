//! Node naming: `<prefix>-<group>-<index>`

use std::cmp::Ordering;

/// Name of node `index` of `group`
pub fn node_name(prefix: &str, group: &str, index: u32) -> String {
    format!("{}-{}-{}", prefix, group, index)
}

/// Numeric suffix after the last `-`
pub fn node_index(name: &str) -> Option<u32> {
    let (_, suffix) = name.rsplit_once('-')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Split a node name into its group and index.
///
/// ```
/// use candictl_config::naming::split_node_name;
///
/// assert_eq!(split_node_name("test", "test-static-ingress-07"), Some(("static-ingress".to_string(), 7)));
/// assert_eq!(split_node_name("test", "test-master-without-index"), None);
/// ```
pub fn split_node_name(prefix: &str, name: &str) -> Option<(String, u32)> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let (group, _) = rest.rsplit_once('-')?;
    if group.is_empty() {
        return None;
    }
    Some((group.to_string(), node_index(rest)?))
}

/// Order node names for removal: names without a suffix first, then by
/// numeric suffix, highest first.
pub fn sort_by_index_desc(names: &mut [String]) {
    names.sort_by(|a, b| match (node_index(a), node_index(b)) {
        (None, None) => a.cmp(b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.cmp(b)),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_index() {
        assert_eq!(node_index("test-master-0"), Some(0));
        assert_eq!(node_index("ng-10"), Some(10));
        assert_eq!(node_index("test-static-ingress-07"), Some(7));
        assert_eq!(node_index("no-index-"), None);
        assert_eq!(node_index("node-+1"), None);
        assert_eq!(node_index("plain"), None);
    }

    #[test]
    fn test_split_node_name() {
        assert_eq!(
            split_node_name("test", "test-master-1"),
            Some(("master".to_string(), 1))
        );
        assert_eq!(split_node_name("other", "test-master-1"), None);
        assert_eq!(split_node_name("test", "test-7"), None);
    }

    #[test]
    fn test_descending_numeric_order() {
        let mut names: Vec<String> = (0..=10).map(|i| format!("ng-{}", i)).collect();
        sort_by_index_desc(&mut names);
        assert_eq!(names[0], "ng-10");
        assert_eq!(names[1], "ng-9");
        assert_eq!(names[10], "ng-0");

        let mut mixed = vec!["ng-0".to_string(), "ng-broken".to_string(), "ng-1".to_string()];
        sort_by_index_desc(&mut mixed);
        assert_eq!(mixed, vec!["ng-broken", "ng-1", "ng-0"]);
    }

    #[test]
    fn test_node_name() {
        assert_eq!(node_name("test", "front", 3), "test-front-3");
    }
}
