//! Aggregator base types: typed commutative-associative reductions behind a
//! type-erased byte-level interface, plus the catalog of factories that
//! replaces reflective instantiation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::graph::value::WireData;
use crate::utils::GraphyneError;

/// Reserved aggregator name carrying the per-worker request count used for
/// flow-control verification between workers.
pub const COUNT_AGGREGATOR_NAME: &str = "<COUNT>";

/// Type-erased aggregator: combines encoded values. The reduction must be
/// commutative and associative, and `initial_bytes` must encode its
/// identity.
pub trait AnyAggregator: Send + Sync {
    /// Kind identifier carried on the wire; the receiving side instantiates
    /// through its catalog by this identifier.
    fn kind(&self) -> &str;

    /// Encoded identity value.
    fn initial_bytes(&self) -> Vec<u8>;

    /// Combines two encoded values into one.
    fn combine_bytes(
        &self,
        cur: &[u8],
        other: &[u8],
    ) -> Result<Vec<u8>, GraphyneError>;
}

/// A typed reduction wrapped into the byte-level interface.
pub struct TypedAggregator<A: WireData> {
    kind: String,
    initial: A,
    op: Arc<dyn Fn(&mut A, A) + Send + Sync>,
}

impl<A: WireData> TypedAggregator<A> {
    pub fn new(
        kind: impl Into<String>,
        initial: A,
        op: impl Fn(&mut A, A) + Send + Sync + 'static,
    ) -> Self {
        TypedAggregator {
            kind: kind.into(),
            initial,
            op: Arc::new(op),
        }
    }
}

impl<A: WireData> AnyAggregator for TypedAggregator<A> {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn initial_bytes(&self) -> Vec<u8> {
        self.initial.to_bytes()
    }

    fn combine_bytes(
        &self,
        cur: &[u8],
        other: &[u8],
    ) -> Result<Vec<u8>, GraphyneError> {
        let mut cur = A::from_bytes(cur)?;
        let other = A::from_bytes(other)?;
        (self.op)(&mut cur, other);
        Ok(cur.to_bytes())
    }
}

/// Registration record broadcast from the master: aggregator name, kind
/// identifier, and whether the value persists across supersteps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredAggregator {
    pub name: String,
    pub kind: String,
    pub persistent: bool,
}

/// Factory catalog mapping kind identifiers to aggregator constructors.
/// Captured once at configuration time; every place the original design
/// would reflectively instantiate an aggregator class goes through here.
#[derive(Clone)]
pub struct AggregatorCatalog {
    factories:
        HashMap<String, Arc<dyn Fn() -> Arc<dyn AnyAggregator> + Send + Sync>>,
}

impl AggregatorCatalog {
    /// Creates a catalog seeded with the built-in numeric reductions.
    pub fn with_builtins() -> Self {
        let mut catalog = AggregatorCatalog {
            factories: HashMap::new(),
        };
        catalog.register("sum_i64", || {
            Arc::new(TypedAggregator::new("sum_i64", 0i64, |a, b| *a += b))
        });
        catalog.register("sum_f64", || {
            Arc::new(TypedAggregator::new("sum_f64", 0f64, |a, b| *a += b))
        });
        catalog.register("min_i64", || {
            Arc::new(TypedAggregator::new("min_i64", i64::MAX, |a, b| {
                *a = (*a).min(b)
            }))
        });
        catalog.register("max_i64", || {
            Arc::new(TypedAggregator::new("max_i64", i64::MIN, |a, b| {
                *a = (*a).max(b)
            }))
        });
        catalog.register("max_f64", || {
            Arc::new(TypedAggregator::new(
                "max_f64",
                f64::NEG_INFINITY,
                |a, b| *a = a.max(b),
            ))
        });
        catalog.register("count_u64", || {
            Arc::new(TypedAggregator::new("count_u64", 0u64, |a, b| *a += b))
        });
        catalog
    }

    /// Registers a factory under a kind identifier.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: impl Fn() -> Arc<dyn AnyAggregator> + Send + Sync + 'static,
    ) {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// Instantiates an aggregator by kind identifier.
    pub fn instantiate(
        &self,
        kind: &str,
    ) -> Result<Arc<dyn AnyAggregator>, GraphyneError> {
        match self.factories.get(kind) {
            Some(factory) => Ok(factory()),
            None => Err(GraphyneError::ProtocolViolation(format!(
                "unknown aggregator kind '{}'",
                kind
            ))),
        }
    }
}

#[cfg(test)]
mod aggregator_tests {
    use super::*;

    #[test]
    fn typed_sum_combines() -> Result<(), GraphyneError> {
        let agg = TypedAggregator::new("sum_i64", 0i64, |a, b| *a += b);
        let a = 7i64.to_bytes();
        let b = 70i64.to_bytes();
        let combined = agg.combine_bytes(&a, &b)?;
        assert_eq!(i64::from_bytes(&combined)?, 77);
        assert_eq!(i64::from_bytes(&agg.initial_bytes())?, 0);
        Ok(())
    }

    #[test]
    fn catalog_instantiates_builtins() -> Result<(), GraphyneError> {
        let catalog = AggregatorCatalog::with_builtins();
        let min = catalog.instantiate("min_i64")?;
        let combined =
            min.combine_bytes(&5i64.to_bytes(), &(-5i64).to_bytes())?;
        assert_eq!(i64::from_bytes(&combined)?, -5);
        assert!(catalog.instantiate("nonsense").is_err());
        Ok(())
    }

    #[test]
    fn initial_is_identity() -> Result<(), GraphyneError> {
        let catalog = AggregatorCatalog::with_builtins();
        for kind in ["sum_i64", "min_i64", "max_i64"] {
            let agg = catalog.instantiate(kind)?;
            let combined =
                agg.combine_bytes(&agg.initial_bytes(), &42i64.to_bytes())?;
            assert_eq!(i64::from_bytes(&combined)?, 42);
        }
        Ok(())
    }
}
