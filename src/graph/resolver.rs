//! Default resolution of vertex creation/removal, messages to nonexistent
//! vertices, and edge mutations, applied between supersteps.

use std::sync::Arc;

use crate::graph::mutation::VertexChanges;
use crate::graph::value::{VertexId, WireData};
use crate::graph::vertex::Vertex;

/// Resolves one vertex id's buffered changes into the vertex's next state.
/// Deterministic given a fixed iteration order over vertex ids; callers
/// iterate in sorted id order.
pub struct VertexResolver<I, V, E> {
    default_vertex_value: Arc<dyn Fn() -> V + Send + Sync>,
    create_on_messages: bool,
    _marker: std::marker::PhantomData<fn() -> (I, E)>,
}

impl<I: VertexId, V: WireData, E: WireData> VertexResolver<I, V, E> {
    pub fn new(
        default_vertex_value: Arc<dyn Fn() -> V + Send + Sync>,
        create_on_messages: bool,
    ) -> Self {
        VertexResolver {
            default_vertex_value,
            create_on_messages,
            _marker: std::marker::PhantomData,
        }
    }

    /// Applies the changeset for one vertex id. Returns the vertex's next
    /// state (`None` schedules deletion / stays absent):
    ///
    /// 1. prune removed edges off the existing vertex,
    /// 2. drop the vertex if removal was requested,
    /// 3. adopt the first added vertex, or synthesize one when messages are
    ///    pending (if creation-on-message is enabled) or edges are to be
    ///    added,
    /// 4. ignore add-vertex requests against an existing vertex,
    /// 5. append added edges.
    pub fn resolve(
        &self,
        vertex_id: &I,
        vertex: Option<Vertex<I, V, E>>,
        changes: Option<VertexChanges<I, V, E>>,
        has_messages: bool,
    ) -> Option<Vertex<I, V, E>> {
        let (added_vertices, removed_count, added_edges, removed_edges) =
            match changes {
                Some(changes) => changes.into_parts(),
                None => Default::default(),
            };

        // 1. if the vertex exists, first prune the edges
        let mut vertex = vertex;
        if let Some(v) = vertex.as_mut() {
            for target in &removed_edges {
                if v.remove_edge(target).is_none() {
                    pf_warn!(
                        "resolver";
                        "no edge to {:?} on vertex {:?} to remove",
                        target,
                        vertex_id
                    );
                }
            }
        }

        // 2. if vertex removal desired, remove the vertex
        if removed_count > 0 {
            vertex = None;
        }

        // 3./4. vertex creation
        if vertex.is_none() {
            let mut added = added_vertices.into_iter();
            if let Some(first) = added.next() {
                if added.next().is_some() {
                    pf_warn!(
                        "resolver";
                        "multiple added vertices for id {:?}, keeping first",
                        vertex_id
                    );
                }
                vertex = Some(first);
            } else if (has_messages && self.create_on_messages)
                || !added_edges.is_empty()
            {
                vertex = Some(Vertex::new(
                    vertex_id.clone(),
                    (self.default_vertex_value)(),
                ));
            }
        } else if !added_vertices.is_empty() {
            pf_warn!(
                "resolver";
                "vertex {:?} already exists, ignoring add request",
                vertex_id
            );
        }

        // 5. if edge addition, add the edges
        if let Some(v) = vertex.as_mut() {
            for edge in added_edges {
                v.add_edge(edge.target, edge.value);
            }
        }

        vertex
    }
}
