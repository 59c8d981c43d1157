use std::collections::BTreeMap;

/// The id the registry assigned to a registration, as a decimal string.
pub const SERVICE_ID: &str = "service.id";

/// Comma-separated list of the names a service is registered under.
pub const OBJECT_CLASS: &str = "objectClass";

/// Signed integer priority among services with the same name. Missing means 0.
pub const SERVICE_RANKING: &str = "service.ranking";

/// A string-to-string property map with case-sensitive keys.
///
/// Registrations, filters and trackers all operate on immutable snapshots
/// (`Arc<Properties>`); mutation happens on an owned value which is then
/// swapped in wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, returning the previous value if any.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the value of `key` parsed as a long, or `default` when the key
    /// is absent or does not parse.
    pub fn get_long(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Returns the value of `key` parsed as a double, or `default` when the
    /// key is absent or does not parse.
    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Returns the value of `key` as a bool. Only the (case-insensitive)
    /// literals `true` and `false` are recognised; anything else yields
    /// `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) if v.trim().eq_ignore_ascii_case("true") => true,
            Some(v) if v.trim().eq_ignore_ascii_case("false") => false,
            _ => default,
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Properties {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        self.entries
            .extend(iter.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}

impl<'a> IntoIterator for &'a Properties {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_sensitive() {
        let mut props = Properties::new();
        props.set("Key", "upper");
        props.set("key", "lower");

        assert_eq!(props.get("Key"), Some("upper"));
        assert_eq!(props.get("key"), Some("lower"));
        assert_eq!(props.get("KEY"), None);
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn set_replaces() {
        let mut props = Properties::new();
        assert_eq!(props.set("k", "1"), None);
        assert_eq!(props.set("k", "2"), Some("1".to_string()));
        assert_eq!(props.get("k"), Some("2"));
    }

    #[test]
    fn typed_accessors() {
        let props: Properties = [
            ("long", "42"),
            ("negative", "-7"),
            ("double", "2.5"),
            ("yes", "TRUE"),
            ("no", "false"),
            ("junk", "not a number"),
        ]
        .into_iter()
        .collect();

        assert_eq!(props.get_long("long", 0), 42);
        assert_eq!(props.get_long("negative", 0), -7);
        assert_eq!(props.get_long("junk", 13), 13);
        assert_eq!(props.get_long("missing", -1), -1);

        assert_eq!(props.get_double("double", 0.0), 2.5);
        assert_eq!(props.get_double("long", 0.0), 42.0);
        assert_eq!(props.get_double("junk", 1.5), 1.5);

        assert!(props.get_bool("yes", false));
        assert!(!props.get_bool("no", true));
        assert!(props.get_bool("junk", true));
        assert!(!props.get_bool("missing", false));
    }

    #[test]
    fn whitespace_tolerant_parsing() {
        let props: Properties = [("padded", " 10 ")].into_iter().collect();
        assert_eq!(props.get_long("padded", 0), 10);
    }
}
