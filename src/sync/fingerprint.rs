//! Change detection over record identity.
//!
//! The digest depends only on which ids are present, so quote-tick updates of
//! a record's fields never re-trigger structural synchronization.

use crate::model::OptionRecord;
use std::fmt;

/// Anything carrying a collection-unique id
pub trait Identified {
    fn record_id(&self) -> &str;
}

impl Identified for OptionRecord {
    fn record_id(&self) -> &str {
        &self.id
    }
}

/// Sorted, comma-joined record ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of<T: Identified>(records: &[T]) -> Self {
        Self::from_ids(records.iter().map(Identified::record_id))
    }

    pub fn from_ids<'a, I>(ids: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut ids: Vec<&str> = ids.into_iter().collect();
        ids.sort_unstable();
        Fingerprint(ids.join(","))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shorthand for [`Fingerprint::of`]
pub fn fingerprint<T: Identified>(records: &[T]) -> Fingerprint {
    Fingerprint::of(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rec(&'static str, f64);

    impl Identified for Rec {
        fn record_id(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_sorted_and_joined() {
        let records = vec![Rec("2", 0.0), Rec("1", 0.0), Rec("3", 0.0)];
        assert_eq!(fingerprint(&records).as_str(), "1,2,3");
    }

    #[test]
    fn test_order_insensitive() {
        let a = vec![Rec("a", 1.0), Rec("b", 2.0)];
        let b = vec![Rec("b", 2.0), Rec("a", 1.0)];
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_field_values_ignored() {
        let before = vec![Rec("1", 12.2)];
        let after = vec![Rec("1", 13.9)];
        assert_eq!(fingerprint(&before), fingerprint(&after));
        assert_ne!(before[0].1, after[0].1);
    }

    #[test]
    fn test_add_then_remove_restores() {
        let mut records = vec![Rec("1", 0.0), Rec("2", 0.0)];
        let original = fingerprint(&records);

        records.push(Rec("3", 0.0));
        assert_ne!(fingerprint(&records), original);

        records.retain(|r| r.0 != "3");
        assert_eq!(fingerprint(&records), original);
    }

    #[test]
    fn test_empty() {
        let records: Vec<Rec> = Vec::new();
        assert!(fingerprint(&records).is_empty());
        assert_eq!(fingerprint(&records), Fingerprint::default());
    }
}
