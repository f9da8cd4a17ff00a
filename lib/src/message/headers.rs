use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// Ordered header multimap.
///
/// Names are matched case-insensitively for lookup and removal, but stored
/// as given: duplicates, case and order reach the wire untouched, which is
/// what malformed input tests need.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderList(Vec<(String, String)>);

impl HeaderList {
    pub fn new() -> Self {
        HeaderList(Vec::new())
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// first value for this name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// last value for this name, the one that counts for most framing headers
    pub fn get_last(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Replace the value of the first instance, keeping its name as stored,
    /// and drop the other instances. Appends if the name is absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let mut value = Some(value.into());
        self.0.retain_mut(|(key, current)| {
            if !key.eq_ignore_ascii_case(&name) {
                return true;
            }
            match value.take() {
                Some(value) => {
                    *current = value;
                    true
                }
                None => false,
            }
        });
        if let Some(value) = value {
            self.0.push((name, value));
        }
    }

    /// Remove every instance, returns how many were removed
    pub fn remove_all(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.0.retain(|(name, value)| keep(name, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// lowercase name to values in order of appearance, used for comparisons
    pub fn as_lowercase_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &self.0 {
            map.entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }
        map
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        HeaderList(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

impl<N: Into<String>, V: Into<String>> Extend<(N, V)> for HeaderList {
    fn extend<T: IntoIterator<Item = (N, V)>>(&mut self, iter: T) {
        self.0.extend(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
    }
}

impl fmt::Display for HeaderList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeaderList {
        [
            ("Host", "localhost"),
            ("X-Dup", "1"),
            ("content-type", "text/html"),
            ("x-dup", "2"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let headers = sample();
        assert_eq!(headers.get("HOST"), Some("localhost"));
        assert_eq!(headers.get_all("X-DUP"), vec!["1", "2"]);
        assert_eq!(headers.get_last("x-dup"), Some("2"));
        assert!(headers.contains("Content-Type"));
        assert!(!headers.contains("Content-Length"));
    }

    #[test]
    fn storage_keeps_order_and_case() {
        let headers = sample();
        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Host", "X-Dup", "content-type", "x-dup"]);
        assert_eq!(
            headers.to_string(),
            "Host: localhost\r\nX-Dup: 1\r\ncontent-type: text/html\r\nx-dup: 2\r\n"
        );
    }

    #[test]
    fn set_replaces_first_and_drops_duplicates() {
        let mut headers = sample();
        headers.set("X-DUP", "3");
        assert_eq!(headers.get_all("x-dup"), vec!["3"]);
        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Host", "X-Dup", "content-type"]);

        headers.set("Via", "1.1 tandem");
        assert_eq!(headers.iter().last(), Some(("Via", "1.1 tandem")));
    }

    #[test]
    fn remove_all_and_map() {
        let mut headers = sample();
        assert_eq!(headers.remove_all("X-Dup"), 2);
        assert_eq!(headers.remove_all("X-Dup"), 0);
        headers.add("HOST", "other");
        let map = headers.as_lowercase_map();
        assert_eq!(map["host"], vec!["localhost".to_owned(), "other".to_owned()]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn empty_names_are_kept() {
        let mut headers = HeaderList::new();
        headers.add("", "no name");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.to_string(), ": no name\r\n");
    }
}
