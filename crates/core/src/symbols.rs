//! Case-insensitive concurrent string set.
//!
//! Used both for the allowed-symbol lists and for each downstream client's
//! set of subscribed pair keys.

use dashmap::DashSet;

/// Thread-safe set of upper-cased strings.
#[derive(Debug, Default)]
pub struct SymbolSet {
    items: DashSet<String>,
}

impl SymbolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a comma separated list ("BTC,ETH, xrp").
    pub fn from_csv(list: &str) -> Self {
        let set = Self::new();
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .for_each(|s| {
                set.add(s);
            });
        set
    }

    /// Returns `true` if the value was not present before.
    pub fn add(&self, value: &str) -> bool {
        self.items.insert(value.to_uppercase())
    }

    /// Returns `true` if the value was present.
    pub fn remove(&self, value: &str) -> bool {
        self.items.remove(&value.to_uppercase()).is_some()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.items.contains(&value.to_uppercase())
    }

    /// All values, sorted.
    pub fn all(&self) -> Vec<String> {
        let mut all: Vec<String> = self.items.iter().map(|v| v.key().clone()).collect();
        all.sort();
        all
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for SymbolSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let set = Self::new();
        for value in iter {
            set.add(value.as_ref());
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_symbol_set_is_case_insensitive() {
        let set = SymbolSet::new();
        assert!(set.add("btc"));
        assert!(!set.add("BTC"));
        assert!(set.contains("Btc"));
        assert_eq!(set.len(), 1);

        assert!(set.remove("bTc"));
        assert!(!set.contains("BTC"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_symbol_set_from_csv() {
        let set = SymbolSet::from_csv("BTC, eth,,XRP ");
        assert_eq!(set.all(), vec!["BTC", "ETH", "XRP"]);
    }

    #[test]
    fn test_symbol_set_from_iter() {
        let set: SymbolSet = ["usd", "eur"].into_iter().collect();
        assert!(set.contains("USD"));
        assert!(set.contains("EUR"));
    }
}
