//! The configuration-time type capability suite: constructor closures and
//! per-job behavior flags captured once and passed into the modules that
//! would otherwise instantiate user types reflectively.

use std::sync::Arc;

use crate::graph::value::{VertexId, WireData};
use crate::program::Combiner;

/// Capability suite over the four user type parameters: how to construct a
/// default vertex value, the optional message combiner, and the resolver's
/// creation policy. Cloning is cheap (shared closures).
pub struct TypeSuite<I, V, E, M> {
    /// Constructor for the default vertex value, used when the resolver
    /// synthesizes a vertex.
    pub default_vertex_value: Arc<dyn Fn() -> V + Send + Sync>,

    /// Optional message combiner; when present the message store keeps at
    /// most one combined message per destination vertex.
    pub combiner: Option<Arc<dyn Combiner<M>>>,

    /// Whether a message addressed to an absent vertex materializes that
    /// vertex at resolution time.
    pub create_vertex_on_messages: bool,

    _marker: std::marker::PhantomData<fn() -> (I, E)>,
}

impl<I: VertexId, V: WireData, E: WireData, M: WireData> TypeSuite<I, V, E, M> {
    pub fn new(
        default_vertex_value: Arc<dyn Fn() -> V + Send + Sync>,
    ) -> Self {
        TypeSuite {
            default_vertex_value,
            combiner: None,
            create_vertex_on_messages: true,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn with_combiner(mut self, combiner: Arc<dyn Combiner<M>>) -> Self {
        self.combiner = Some(combiner);
        self
    }

    pub fn with_create_vertex_on_messages(mut self, create: bool) -> Self {
        self.create_vertex_on_messages = create;
        self
    }
}

impl<I, V: WireData + Default, E, M> Default for TypeSuite<I, V, E, M>
where
    I: VertexId,
    E: WireData,
    M: WireData,
{
    fn default() -> Self {
        TypeSuite {
            default_vertex_value: Arc::new(V::default),
            combiner: None,
            create_vertex_on_messages: true,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<I, V, E, M> Clone for TypeSuite<I, V, E, M> {
    fn clone(&self) -> Self {
        TypeSuite {
            default_vertex_value: self.default_vertex_value.clone(),
            combiner: self.combiner.clone(),
            create_vertex_on_messages: self.create_vertex_on_messages,
            _marker: std::marker::PhantomData,
        }
    }
}
