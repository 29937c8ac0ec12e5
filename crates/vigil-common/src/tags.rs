use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Errors produced while parsing tag lists and alert keys.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("invalid tag pair '{0}': expected key=value")]
    InvalidTag(String),

    #[error("duplicate tag key '{0}'")]
    DuplicateTag(String),

    #[error("invalid alert key '{0}'")]
    InvalidKey(String),
}

/// An ordered set of tag key/value pairs identifying one group of results.
///
/// Ordering is by key, which makes the textual form (`{host=a,env=prod}`)
/// stable and usable as part of an [`AlertKey`].
///
/// # Examples
///
/// ```
/// use vigil_common::tags::TagSet;
///
/// let tags: TagSet = "host=web01,env=prod".parse().unwrap();
/// assert_eq!(tags.get("host"), Some("web01"));
/// assert_eq!(tags.to_string(), "{env=prod,host=web01}");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True when the two sets share at least one identical key/value pair.
    pub fn overlaps(&self, other: &TagSet) -> bool {
        other.iter().any(|(k, v)| self.get(k) == Some(v))
    }

    /// True when every pair of `self` is also present in `other`.
    pub fn subset_of(&self, other: &TagSet) -> bool {
        self.iter().all(|(k, v)| other.get(k) == Some(v))
    }

    /// Parses a comma separated `key=value` list. Braces are optional.
    pub fn parse_list(s: &str) -> Result<Self, KeyError> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        let mut tags = TagSet::new();
        if trimmed.trim().is_empty() {
            return Ok(tags);
        }
        for pair in trimmed.split(',') {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| KeyError::InvalidTag(pair.to_string()))?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || v.is_empty() {
                return Err(KeyError::InvalidTag(pair.to_string()));
            }
            if tags.0.contains_key(k) {
                return Err(KeyError::DuplicateTag(k.to_string()));
            }
            tags.insert(k, v);
        }
        Ok(tags)
    }
}

impl FromStr for TagSet {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_list(s)
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Identity of one monitored entity: alert name plus tag group,
/// rendered as `name{k=v,...}`.
///
/// # Examples
///
/// ```
/// use vigil_common::tags::AlertKey;
///
/// let ak: AlertKey = "cpu_high{host=a}".parse().unwrap();
/// assert_eq!(ak.name(), "cpu_high");
/// assert_eq!(ak.group().get("host"), Some("a"));
/// assert_eq!(ak.to_string(), "cpu_high{host=a}");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AlertKey {
    name: String,
    group: TagSet,
}

impl AlertKey {
    pub fn new(name: impl Into<String>, group: TagSet) -> Self {
        Self {
            name: name.into(),
            group,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &TagSet {
        &self.group
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.group)
    }
}

impl FromStr for AlertKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let open = s.find('{').ok_or_else(|| KeyError::InvalidKey(s.to_string()))?;
        if !s.ends_with('}') || open == 0 {
            return Err(KeyError::InvalidKey(s.to_string()));
        }
        let group = TagSet::parse_list(&s[open..])?;
        Ok(Self::new(&s[..open], group))
    }
}

impl From<AlertKey> for String {
    fn from(ak: AlertKey) -> Self {
        ak.to_string()
    }
}

impl TryFrom<String> for AlertKey {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Returns true when `value` matches the glob `pattern`. A bare `*`
/// matches everything.
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    glob_match::glob_match(pattern, value)
}
