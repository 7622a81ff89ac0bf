//! Input/output format drivers. The runtime consumes only these
//! interfaces: a vertex (or edge) input format yields lazy restartable
//! readers over opaque splits; an output format accepts a stream of
//! vertices at job end.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::graph::{Edge, Vertex, VertexId, WireData, WorkerId};
use crate::utils::GraphyneError;

/// Fallible vertex stream over one split.
pub type VertexReader<I, V, E> = Box<
    dyn Iterator<Item = Result<Vertex<I, V, E>, GraphyneError>> + Send,
>;

/// Fallible `(source id, edge)` stream over one split.
pub type EdgeReader<I, E> =
    Box<dyn Iterator<Item = Result<(I, Edge<I, E>), GraphyneError>> + Send>;

/// Produces opaque split descriptors and restartable readers over them.
pub trait VertexInputFormat<I, V, E>: Send + Sync {
    /// Carves the input into around `desired` opaque splits.
    fn splits(&self, desired: usize) -> Result<Vec<Vec<u8>>, GraphyneError>;

    /// Opens a reader over one split. Reopening the same split restarts it.
    fn open(
        &self,
        split: &[u8],
    ) -> Result<VertexReader<I, V, E>, GraphyneError>;
}

/// Edge-list input: yields `(source id, edge)` pairs.
pub trait EdgeInputFormat<I, E>: Send + Sync {
    fn splits(&self, desired: usize) -> Result<Vec<Vec<u8>>, GraphyneError>;

    fn open(&self, split: &[u8]) -> Result<EdgeReader<I, E>, GraphyneError>;
}

/// Sink for one worker's vertices at job end.
pub trait VertexWriter<I, V, E>: Send {
    fn write_vertex(
        &mut self,
        vertex: &Vertex<I, V, E>,
    ) -> Result<(), GraphyneError>;

    /// Flushes and returns the number of bytes written.
    fn close(&mut self) -> Result<u64, GraphyneError>;
}

/// Creates per-worker vertex writers.
pub trait VertexOutputFormat<I, V, E>: Send + Sync {
    fn create_writer(
        &self,
        worker: WorkerId,
    ) -> Result<Box<dyn VertexWriter<I, V, E>>, GraphyneError>;
}

#[derive(Serialize, Deserialize)]
struct RangeSplit {
    start: usize,
    end: usize,
}

/// In-memory vertex input, split into contiguous index ranges. Mostly used
/// by tests and generated-graph jobs.
pub struct InMemoryVertexInput<I, V, E> {
    vertices: Arc<Vec<Vertex<I, V, E>>>,
}

impl<I: VertexId, V: WireData, E: WireData> InMemoryVertexInput<I, V, E> {
    pub fn new(vertices: Vec<Vertex<I, V, E>>) -> Self {
        InMemoryVertexInput {
            vertices: Arc::new(vertices),
        }
    }
}

fn range_splits(
    total: usize,
    desired: usize,
) -> Result<Vec<Vec<u8>>, GraphyneError> {
    let desired = desired.max(1);
    let chunk = total.div_ceil(desired).max(1);
    let mut splits = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + chunk).min(total);
        splits.push(rmp_serde::encode::to_vec(&RangeSplit { start, end })?);
        start = end;
    }
    Ok(splits)
}

impl<I, V, E> VertexInputFormat<I, V, E> for InMemoryVertexInput<I, V, E>
where
    I: VertexId,
    V: WireData,
    E: WireData,
{
    fn splits(&self, desired: usize) -> Result<Vec<Vec<u8>>, GraphyneError> {
        range_splits(self.vertices.len(), desired)
    }

    fn open(
        &self,
        split: &[u8],
    ) -> Result<VertexReader<I, V, E>, GraphyneError> {
        let range: RangeSplit = rmp_serde::decode::from_slice(split)?;
        let vertices = self.vertices.clone();
        Ok(Box::new(
            (range.start..range.end.min(vertices.len()))
                .map(move |i| Ok(vertices[i].clone())),
        ))
    }
}

/// In-memory edge-list input.
pub struct InMemoryEdgeInput<I, E> {
    edges: Arc<Vec<(I, Edge<I, E>)>>,
}

impl<I: VertexId, E: WireData> InMemoryEdgeInput<I, E> {
    pub fn new(edges: Vec<(I, Edge<I, E>)>) -> Self {
        InMemoryEdgeInput {
            edges: Arc::new(edges),
        }
    }
}

impl<I, E> EdgeInputFormat<I, E> for InMemoryEdgeInput<I, E>
where
    I: VertexId,
    E: WireData,
{
    fn splits(&self, desired: usize) -> Result<Vec<Vec<u8>>, GraphyneError> {
        range_splits(self.edges.len(), desired)
    }

    fn open(&self, split: &[u8]) -> Result<EdgeReader<I, E>, GraphyneError> {
        let range: RangeSplit = rmp_serde::decode::from_slice(split)?;
        let edges = self.edges.clone();
        Ok(Box::new(
            (range.start..range.end.min(edges.len()))
                .map(move |i| Ok(edges[i].clone())),
        ))
    }
}

/// Line-oriented text vertex input; a caller-supplied parser turns each
/// line into a vertex. Splits are line ranges, re-read on every open.
pub struct TextVertexInput<I, V, E> {
    path: PathBuf,
    #[allow(clippy::type_complexity)]
    parser: Arc<
        dyn Fn(&str) -> Result<Vertex<I, V, E>, GraphyneError> + Send + Sync,
    >,
}

impl<I: VertexId, V: WireData, E: WireData> TextVertexInput<I, V, E> {
    pub fn new(
        path: impl Into<PathBuf>,
        parser: impl Fn(&str) -> Result<Vertex<I, V, E>, GraphyneError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        TextVertexInput {
            path: path.into(),
            parser: Arc::new(parser),
        }
    }
}

impl<I, V, E> VertexInputFormat<I, V, E> for TextVertexInput<I, V, E>
where
    I: VertexId,
    V: WireData,
    E: WireData,
{
    fn splits(&self, desired: usize) -> Result<Vec<Vec<u8>>, GraphyneError> {
        let file = File::open(&self.path)?;
        let lines = BufReader::new(file).lines().count();
        range_splits(lines, desired)
    }

    fn open(
        &self,
        split: &[u8],
    ) -> Result<VertexReader<I, V, E>, GraphyneError> {
        let range: RangeSplit = rmp_serde::decode::from_slice(split)?;
        let file = File::open(&self.path)?;
        let parser = self.parser.clone();
        Ok(Box::new(
            BufReader::new(file)
                .lines()
                .skip(range.start)
                .take(range.end - range.start)
                .map(move |line| {
                    let line = line.map_err(GraphyneError::from)?;
                    parser(&line)
                }),
        ))
    }
}

/// Text output: one `part-<worker>.txt` file per worker under a directory,
/// one formatted line per vertex.
pub struct TextVertexOutput<I, V, E> {
    dir: PathBuf,
    #[allow(clippy::type_complexity)]
    formatter: Arc<dyn Fn(&Vertex<I, V, E>) -> String + Send + Sync>,
}

impl<I: VertexId, V: WireData, E: WireData> TextVertexOutput<I, V, E> {
    pub fn new(
        dir: impl Into<PathBuf>,
        formatter: impl Fn(&Vertex<I, V, E>) -> String + Send + Sync + 'static,
    ) -> Self {
        TextVertexOutput {
            dir: dir.into(),
            formatter: Arc::new(formatter),
        }
    }
}

struct TextWriter<I, V, E> {
    out: BufWriter<File>,
    bytes: u64,
    formatter: Arc<dyn Fn(&Vertex<I, V, E>) -> String + Send + Sync>,
}

impl<I, V, E> VertexWriter<I, V, E> for TextWriter<I, V, E>
where
    I: VertexId,
    V: WireData,
    E: WireData,
{
    fn write_vertex(
        &mut self,
        vertex: &Vertex<I, V, E>,
    ) -> Result<(), GraphyneError> {
        let line = (self.formatter)(vertex);
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.bytes += line.len() as u64 + 1;
        Ok(())
    }

    fn close(&mut self) -> Result<u64, GraphyneError> {
        self.out.flush()?;
        Ok(self.bytes)
    }
}

impl<I, V, E> VertexOutputFormat<I, V, E> for TextVertexOutput<I, V, E>
where
    I: VertexId,
    V: WireData,
    E: WireData,
{
    fn create_writer(
        &self,
        worker: WorkerId,
    ) -> Result<Box<dyn VertexWriter<I, V, E>>, GraphyneError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("part-{}.txt", worker));
        let out = BufWriter::new(File::create(path)?);
        Ok(Box::new(TextWriter {
            out,
            bytes: 0,
            formatter: self.formatter.clone(),
        }))
    }
}
