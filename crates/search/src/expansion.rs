//! Query expansion for improving recall.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// How a query should be expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionStrategy {
    /// Use the query as-is.
    #[default]
    None,
    /// One variant: the query augmented with synonyms of its terms.
    /// The bare original query is not included.
    Synonym,
    /// The original query plus one rewritten variant per substitution.
    MultiQuery,
}

impl FromStr for ExpansionStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "synonym" => Ok(Self::Synonym),
            "multi_query" | "multi-query" | "multiquery" => Ok(Self::MultiQuery),
            other => bail!("unknown expansion strategy: {}", other),
        }
    }
}

impl fmt::Display for ExpansionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Synonym => "synonym",
            Self::MultiQuery => "multi_query",
        })
    }
}

/// Produces query variants. Must return at least one query.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(&self, query: &str, strategy: ExpansionStrategy) -> Result<Vec<String>>;

    /// Get the name of this expander.
    fn name(&self) -> &str;
}

/// Table-driven synonym expansion.
#[derive(Debug, Clone, Default)]
pub struct SynonymExpander {
    synonyms: HashMap<String, Vec<String>>,
}

impl SynonymExpander {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `alternatives` for `term` (matched case-insensitively).
    pub fn with_synonyms<I, S>(mut self, term: &str, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.synonyms
            .entry(term.to_lowercase())
            .or_default()
            .extend(alternatives.into_iter().map(Into::into));
        self
    }

    fn lookup(&self, word: &str) -> &[String] {
        self.synonyms.get(&word.to_lowercase()).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[async_trait]
impl QueryExpander for SynonymExpander {
    async fn expand(&self, query: &str, strategy: ExpansionStrategy) -> Result<Vec<String>> {
        let words: Vec<&str> = query.split_whitespace().collect();
        match strategy {
            ExpansionStrategy::None => Ok(vec![query.to_string()]),
            ExpansionStrategy::Synonym => {
                let extra: Vec<&str> = words
                    .iter()
                    .flat_map(|w| self.lookup(w))
                    .map(String::as_str)
                    .collect();
                if extra.is_empty() {
                    return Ok(vec![query.to_string()]);
                }
                Ok(vec![format!("{} {}", query, extra.join(" "))])
            }
            ExpansionStrategy::MultiQuery => {
                let mut variants = vec![query.to_string()];
                for (i, word) in words.iter().enumerate() {
                    for alt in self.lookup(word) {
                        let mut rewritten = words.clone();
                        rewritten[i] = alt.as_str();
                        let variant = rewritten.join(" ");
                        if !variants.contains(&variant) {
                            variants.push(variant);
                        }
                    }
                }
                Ok(variants)
            }
        }
    }

    fn name(&self) -> &str {
        "synonym"
    }
}
