use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::term::RdfTerm;

/// One solution: a map from variable name to the term bound to it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Binding(BTreeMap<String, RdfTerm>);

impl Binding {
    pub fn new() -> Self { Self::default() }

    /// Builder-style variable binding, for literals in tests and gateways.
    pub fn bind(mut self, variable: impl Into<String>, term: RdfTerm) -> Self {
        self.0.insert(variable.into(), term);
        self
    }

    pub fn insert(&mut self, variable: impl Into<String>, term: RdfTerm) { self.0.insert(variable.into(), term); }

    pub fn get(&self, variable: &str) -> Option<&RdfTerm> { self.0.get(variable) }

    pub fn variables(&self) -> impl Iterator<Item = &str> { self.0.keys().map(String::as_str) }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RdfTerm)> { self.0.iter().map(|(k, v)| (k.as_str(), v)) }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl FromIterator<(String, RdfTerm)> for Binding {
    fn from_iter<T: IntoIterator<Item = (String, RdfTerm)>>(iter: T) -> Self { Self(iter.into_iter().collect()) }
}

/// The result set of a SELECT-style query: a set of bindings with set
/// semantics (duplicate solutions collapse).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingSet(BTreeSet<Binding>);

impl BindingSet {
    pub fn new() -> Self { Self::default() }

    /// Returns false if an equal binding was already present.
    pub fn insert(&mut self, binding: Binding) -> bool { self.0.insert(binding) }

    pub fn contains(&self, binding: &Binding) -> bool { self.0.contains(binding) }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> { self.0.iter() }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Bindings present in `self` but not in `other`. Diffing two successive
    /// result sets with this in both directions yields the added and removed
    /// deltas of an update.
    pub fn difference(&self, other: &BindingSet) -> BindingSet { Self(self.0.difference(&other.0).cloned().collect()) }
}

impl FromIterator<Binding> for BindingSet {
    fn from_iter<T: IntoIterator<Item = Binding>>(iter: T) -> Self { Self(iter.into_iter().collect()) }
}

impl IntoIterator for BindingSet {
    type Item = Binding;
    type IntoIter = std::collections::btree_set::IntoIter<Binding>;
    fn into_iter(self) -> Self::IntoIter { self.0.into_iter() }
}

impl<'a> IntoIterator for &'a BindingSet {
    type Item = &'a Binding;
    type IntoIter = std::collections::btree_set::Iter<'a, Binding>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}
