// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Substrings that hide noisy frames from crash reports.
///
/// A frame is suppressed if any entry is contained in its raw symbol text or in its resolved
/// location. Duplicates are allowed; removing one copy leaves the others in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackFilter {
    patterns: Vec<String>,
}

impl StackFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: &str) {
        // Double on growth so repeated additions stay amortized O(1).
        if self.patterns.len() == self.patterns.capacity() {
            self.patterns.reserve_exact(self.patterns.capacity().max(1));
        }
        self.patterns.push(pattern.to_owned());
    }

    /// Removes the first exact match, keeping the relative order of the rest.
    /// Returns false if nothing matched.
    pub fn remove(&mut self, pattern: &str) -> bool {
        match self.patterns.iter().position(|p| p == pattern) {
            Some(index) => {
                self.patterns.remove(index);
                true
            }
            None => false,
        }
    }

    /// Does not allocate; safe to call while handling a fault.
    pub fn matches(&self, raw: &str, resolved: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| raw.contains(p.as_str()) || resolved.contains(p.as_str()))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
