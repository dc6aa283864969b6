//! Message catalog served to clients.
//!
//! The catalog is fixed at startup and shared read-only between all
//! sessions. Selection draws from the calling thread's own generator, so
//! concurrent sessions never contend on a shared random source.

use rand::Rng;
use std::sync::Arc;

/// Proverbs served when the configuration does not supply a catalog.
const DEFAULT_MESSAGES: &[&str] = &[
    "Don't communicate by sharing memory, share memory by communicating.",
    "Concurrency is not parallelism.",
    "Channels orchestrate; mutexes serialize.",
    "The bigger the interface, the weaker the abstraction.",
    "Make the zero value useful.",
    "interface{} says nothing.",
    "Gofmt's style is no one's favorite, yet gofmt is everyone's favorite.",
    "A little copying is better than a little dependency.",
    "Syscall must always be guarded with build tags.",
    "Cgo must always be guarded with build tags.",
    "Cgo is not Go.",
    "With the unsafe package there are no guarantees.",
    "Clear is better than clever.",
    "Reflection is never clear.",
    "Errors are values.",
    "Don't just check errors, handle them gracefully.",
    "Design the architecture, name the components, document the details.",
    "Documentation is for users.",
    "Don't panic.",
];

/// Immutable, non-empty set of single-line messages.
#[derive(Debug, Clone)]
pub struct Catalog {
    messages: Arc<[String]>,
}

impl Catalog {
    /// Build a catalog, rejecting lists that cannot be served line by line.
    pub fn new(messages: Vec<String>) -> Result<Self, CatalogError> {
        if messages.is_empty() {
            return Err(CatalogError::Empty);
        }
        if let Some(index) = messages
            .iter()
            .position(|m| m.contains(['\n', '\r']))
        {
            return Err(CatalogError::Multiline { index });
        }

        Ok(Catalog {
            messages: messages.into(),
        })
    }

    /// Draw one message uniformly at random.
    pub fn next(&self) -> &str {
        self.pick(&mut rand::rng())
    }

    /// Draw one message using the supplied generator.
    pub fn pick<R: Rng>(&self, rng: &mut R) -> &str {
        &self.messages[rng.random_range(0..self.messages.len())]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    pub fn contains(&self, message: &str) -> bool {
        self.messages.iter().any(|m| m == message)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog {
            messages: DEFAULT_MESSAGES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Catalog construction errors
#[derive(Debug, PartialEq, Eq)]
pub enum CatalogError {
    Empty,
    Multiline { index: usize },
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Empty => write!(f, "Message catalog must not be empty"),
            CatalogError::Multiline { index } => {
                write!(f, "Catalog message #{} contains a line break", index)
            }
        }
    }
}

impl std::error::Error for CatalogError {}
