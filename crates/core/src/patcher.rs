//! Request-scoped workflow patching.
//!
//! Every client request gets its own output filename prefix so that the
//! produced file can be found in the engine's shared output directory.
//! [`GraphPatcher::patch`] finds the output node, stamps the fresh prefix on
//! it and repairs a malformed `images` reference. It never mutates the
//! caller's graph.

use serde_json::Value;

use crate::error::CoreError;
use crate::graph::{InputValue, NodeGraph, NodeRef};

/// Node kind written by stock ComfyUI to save images to the output directory.
pub const DEFAULT_OUTPUT_KIND: &str = "SaveImage";

/// Input on the output node holding the filename prefix.
pub const FILENAME_PREFIX_INPUT: &str = "filename_prefix";

/// Input on the output node referencing the images to save.
pub const IMAGES_INPUT: &str = "images";

/// Output location derived for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRequest {
    /// Id of the output node that was patched.
    pub save_node_id: String,
    /// Fresh 32-character lowercase hex prefix.
    pub filename_prefix: String,
}

/// What happened to the output node's `images` input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceRepair {
    /// Already a well-formed link; untouched.
    Canonical,
    /// `[["8", 0]]` was unwrapped to `["8", 0]`.
    Unwrapped,
    /// The first two-element candidate at `index` of a list was selected.
    Selected { index: usize },
    /// No usable reference could be found; the value was left as submitted.
    /// Execution proceeds and the engine reports the problem.
    Unrepaired,
    /// The output node has no `images` input.
    Absent,
}

/// A graph ready to be handed to the engine.
#[derive(Debug, Clone)]
pub struct PatchedGraph {
    pub graph: NodeGraph,
    pub output: OutputRequest,
    pub images: ReferenceRepair,
    /// Further output nodes that were present but not patched.
    pub ignored_outputs: Vec<String>,
}

impl PatchedGraph {
    pub fn prefix(&self) -> &str {
        &self.output.filename_prefix
    }
}

/// Produces request-scoped copies of submitted workflows.
#[derive(Debug, Clone)]
pub struct GraphPatcher {
    output_kinds: Vec<String>,
}

impl Default for GraphPatcher {
    fn default() -> Self {
        Self::new(vec![DEFAULT_OUTPUT_KIND.to_string()])
    }
}

impl GraphPatcher {
    pub fn new(output_kinds: Vec<String>) -> Self {
        Self { output_kinds }
    }

    pub fn output_kinds(&self) -> &[String] {
        &self.output_kinds
    }

    /// Patch a copy of `graph` with a freshly generated prefix.
    pub fn patch(&self, graph: &NodeGraph) -> Result<PatchedGraph, CoreError> {
        self.patch_with_prefix(graph, new_prefix())
    }

    /// Patch a copy of `graph` using the given prefix.
    ///
    /// When several output nodes exist, the first in submission order is
    /// patched and the rest are reported in [`PatchedGraph::ignored_outputs`].
    pub fn patch_with_prefix(
        &self,
        graph: &NodeGraph,
        prefix: String,
    ) -> Result<PatchedGraph, CoreError> {
        let mut outputs = graph.nodes_of_kind(&self.output_kinds);
        let save_node_id = outputs
            .next()
            .ok_or_else(|| CoreError::NoOutputNode {
                expected: self.output_kinds.join(", "),
            })?
            .to_string();
        let ignored_outputs: Vec<String> = outputs.map(str::to_string).collect();

        if !ignored_outputs.is_empty() {
            tracing::warn!(
                node_id = %save_node_id,
                ignored = ?ignored_outputs,
                "Workflow has several output nodes, only the first is patched",
            );
        }

        let mut patched = graph.clone();
        let node = patched
            .get_mut(&save_node_id)
            .ok_or_else(|| CoreError::InvalidGraph(format!("node {save_node_id} vanished")))?;

        node.inputs.insert(
            FILENAME_PREFIX_INPUT.to_string(),
            InputValue::Literal(Value::String(prefix.clone())),
        );

        let images = match node.inputs.get_mut(IMAGES_INPUT) {
            Some(value) => repair_reference(value),
            None => ReferenceRepair::Absent,
        };

        match &images {
            ReferenceRepair::Unrepaired => tracing::warn!(
                node_id = %save_node_id,
                value = ?node.inputs.get(IMAGES_INPUT),
                "Could not normalise images input, leaving it unchanged",
            ),
            ReferenceRepair::Absent => tracing::warn!(
                node_id = %save_node_id,
                "Output node has no images input",
            ),
            other => tracing::debug!(node_id = %save_node_id, repair = ?other, "Images input checked"),
        }

        tracing::debug!(
            node_id = %save_node_id,
            prefix = %prefix,
            nodes = patched.len(),
            "Patched workflow output node",
        );

        Ok(PatchedGraph {
            graph: patched,
            output: OutputRequest {
                save_node_id,
                filename_prefix: prefix,
            },
            images,
            ignored_outputs,
        })
    }
}

/// Generate a 128-bit random prefix as 32 lowercase hex characters.
pub fn new_prefix() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Normalise a link-shaped input in place.
fn repair_reference(value: &mut InputValue) -> ReferenceRepair {
    let items = match value {
        InputValue::Link(_) => return ReferenceRepair::Canonical,
        InputValue::Literal(Value::Array(items)) => items,
        InputValue::Literal(_) => return ReferenceRepair::Unrepaired,
    };

    // `[8, 0]`: a link with an integer id.
    if let Some(link) = NodeRef::from_candidate(&Value::Array(items.clone())) {
        *value = InputValue::Link(link);
        return ReferenceRepair::Canonical;
    }

    let found = items
        .iter()
        .enumerate()
        .find_map(|(index, item)| NodeRef::from_candidate(item).map(|link| (index, link)));

    match found {
        Some((index, link)) => {
            let repair = if items.len() == 1 {
                ReferenceRepair::Unwrapped
            } else {
                ReferenceRepair::Selected { index }
            };
            *value = InputValue::Link(link);
            repair
        }
        None => ReferenceRepair::Unrepaired,
    }
}
