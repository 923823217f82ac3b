//! Return-address label names.
//!
//! One generator is threaded through a whole module run. It knows every
//! label the input already defines and never hands out one of those, so
//! synthesized names cannot collide with code the builder or a C compiler
//! wrote.

use hashbrown::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct LabelGenerator {
    prefix: String,
    taken: HashSet<String>,
    next: HashMap<String, usize>,
}

impl LabelGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            taken: HashSet::new(),
            next: HashMap::new(),
        }
    }

    /// Mark `name` as defined elsewhere.
    pub fn reserve(&mut self, name: &str) {
        self.taken.insert(name.to_string());
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.taken.contains(name)
    }

    /// A fresh `{prefix}{function}_{n}` label.
    pub fn next_for(&mut self, function: &str) -> String {
        let counter = self.next.entry_ref(function).or_insert(0);
        loop {
            let name = format!("{}{}_{}", self.prefix, function, *counter);
            *counter += 1;
            if self.taken.insert(name.clone()) {
                return name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_function() {
        let mut labels = LabelGenerator::new("__gcmap_IN_");
        assert_eq!(labels.next_for("f"), "__gcmap_IN_f_0");
        assert_eq!(labels.next_for("g"), "__gcmap_IN_g_0");
        assert_eq!(labels.next_for("f"), "__gcmap_IN_f_1");
        assert!(labels.is_taken("__gcmap_IN_g_0"));
    }

    #[test]
    fn test_skips_existing_labels() {
        let mut labels = LabelGenerator::new("L");
        labels.reserve("Lf_0");
        labels.reserve("Lf_1");
        assert_eq!(labels.next_for("f"), "Lf_2");
        assert_eq!(labels.next_for("f"), "Lf_3");
    }
}
