use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// An immutable tag set. Ordered so the string form is canonical.
pub type TagSet = BTreeMap<String, String>;

/// Formats a tag set as `{k=v,k=v}` with keys in sorted order.
pub fn format_tags(tags: &TagSet) -> String {
    let mut s = String::from("{");
    for (i, (k, v)) in tags.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        s.push_str(k);
        s.push('=');
        s.push_str(v);
    }
    s.push('}');
    s
}

/// Parses a `{k=v,k=v}` tag string. The surrounding braces are optional.
pub fn parse_tags(s: &str) -> Result<TagSet, String> {
    let inner = s.trim_start_matches('{').trim_end_matches('}');
    let mut tags = TagSet::new();
    if inner.is_empty() {
        return Ok(tags);
    }
    for pair in inner.split(',') {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid tag pair: {pair}"))?;
        if k.is_empty() {
            return Err(format!("empty tag key in: {s}"));
        }
        tags.insert(k.to_string(), v.to_string());
    }
    Ok(tags)
}

/// Returns true if every pair in `subset` is present in `tags`.
pub fn tags_subset(subset: &TagSet, tags: &TagSet) -> bool {
    subset.iter().all(|(k, v)| tags.get(k) == Some(v))
}

/// Canonical identifier of one alert instance: `<alert-name>{<sorted-tags>}`.
///
/// The string form is the identity: equality, ordering, and hashing are all
/// byte-wise on the canonical form, which keeps keys usable as map keys and
/// comparable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertKey(String);

impl AlertKey {
    pub fn new(name: &str, group: &TagSet) -> Self {
        AlertKey(format!("{}{}", name, format_tags(group)))
    }

    /// The alert rule name (everything before the tag braces).
    pub fn name(&self) -> &str {
        match self.0.find('{') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// The tag set, parsed from the canonical form.
    pub fn group(&self) -> TagSet {
        match self.0.find('{') {
            Some(idx) => parse_tags(&self.0[idx..]).unwrap_or_default(),
            None => TagSet::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AlertKey {
    type Err = String;

    /// Parses and canonicalizes. Tag order in the input does not matter.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.find('{') {
            Some(idx) => {
                let tags = parse_tags(&s[idx..])?;
                Ok(AlertKey::new(&s[..idx], &tags))
            }
            None => Ok(AlertKey::new(s, &TagSet::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_tag_order() {
        let a: AlertKey = "cpu{host=a,dc=x}".parse().unwrap();
        let b: AlertKey = "cpu{dc=x,host=a}".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "cpu{dc=x,host=a}");
    }

    #[test]
    fn name_and_group_accessors() {
        let ak: AlertKey = "disk.low{host=db-01,mount=/}".parse().unwrap();
        assert_eq!(ak.name(), "disk.low");
        let g = ak.group();
        assert_eq!(g.get("host").map(String::as_str), Some("db-01"));
        assert_eq!(g.get("mount").map(String::as_str), Some("/"));
    }

    #[test]
    fn empty_tag_set() {
        let ak: AlertKey = "heartbeat".parse().unwrap();
        assert_eq!(ak.as_str(), "heartbeat{}");
        assert_eq!(ak.name(), "heartbeat");
        assert!(ak.group().is_empty());
    }

    #[test]
    fn ordering_is_bytewise() {
        let a: AlertKey = "a{host=x}".parse().unwrap();
        let b: AlertKey = "b{host=a}".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn rejects_malformed_pairs() {
        assert!(parse_tags("{host}").is_err());
        assert!(parse_tags("{=v}").is_err());
    }
}
