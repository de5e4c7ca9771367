//! Network topology description.
//!
//! A topology is an ordered list of layer nodes. Each node names its parent,
//! so the list describes a DAG rooted at the virtual node `input`. The
//! forecaster executes it as a chain, which is what [`Topology::resolve`]
//! checks for.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{HarnessError, Result};

/// Reserved id of the node that feeds the lookback window into the network.
pub const INPUT_ID: &str = "input";

// ---------------------------------------------------------------------------
// Raw nodes (as written in configuration)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum LayerType {
    Conv1D,
    MaxPooling1D,
    Flatten,
    Dense,
}

/// One node of the topology with its untyped parameter mapping.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LayerNode {
    pub id: String,
    pub parent: String,
    pub layer: LayerType,
    #[serde(default)]
    pub params: Map<String, JsonValue>,
}

impl LayerNode {
    fn new(id: &str, parent: &str, layer: LayerType, params: JsonValue) -> Self {
        LayerNode {
            id: id.to_string(),
            parent: parent.to_string(),
            layer,
            params: match params {
                JsonValue::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    /// Parse the parameter mapping into the typed form for this layer.
    pub fn spec(&self) -> Result<LayerSpec> {
        let params = JsonValue::Object(self.params.clone());
        let invalid = |e: serde_json::Error| {
            HarnessError::InvalidTopology(format!("layer '{}' ({:?}): {e}", self.id, self.layer))
        };
        Ok(match self.layer {
            LayerType::Conv1D => {
                LayerSpec::Conv1D(serde_json::from_value(params).map_err(invalid)?)
            }
            LayerType::MaxPooling1D => {
                LayerSpec::MaxPooling1D(serde_json::from_value(params).map_err(invalid)?)
            }
            LayerType::Flatten => {
                if !self.params.is_empty() {
                    return Err(HarnessError::InvalidTopology(format!(
                        "layer '{}' (Flatten) takes no parameters",
                        self.id
                    )));
                }
                LayerSpec::Flatten
            }
            LayerType::Dense => LayerSpec::Dense(serde_json::from_value(params).map_err(invalid)?),
        })
    }
}

impl fmt::Display for LayerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = serde_json::to_string(&self.params).map_err(|_| fmt::Error)?;
        write!(f, "{:<7} <- {:<7} {:?} {params}", self.id, self.parent, self.layer)
    }
}

// ---------------------------------------------------------------------------
// Typed layer parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Elu,
    Relu,
    Tanh,
    Sigmoid,
    #[default]
    Linear,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConvParams {
    pub filters: usize,
    pub kernel_size: usize,
    #[serde(default)]
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolParams {
    pub pool_size: usize,
    /// Defaults to `pool_size` when omitted.
    #[serde(default)]
    pub strides: Option<usize>,
}

impl PoolParams {
    pub fn stride(&self) -> usize {
        self.strides.unwrap_or(self.pool_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DenseParams {
    pub units: usize,
    #[serde(default)]
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSpec {
    Conv1D(ConvParams),
    MaxPooling1D(PoolParams),
    Flatten,
    Dense(DenseParams),
}

/// A validated node, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLayer {
    pub id: String,
    pub spec: LayerSpec,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Topology {
    pub nodes: Vec<LayerNode>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::reference_cnn()
    }
}

impl Topology {
    /// Three conv/pool stages followed by two dense layers.
    pub fn reference_cnn() -> Self {
        use serde_json::json;
        use LayerType::*;

        let conv = |id, parent, filters: usize, kernel_size: usize| {
            let params = json!({
                "filters": filters,
                "kernel_size": kernel_size,
                "activation": "elu"
            });
            LayerNode::new(id, parent, Conv1D, params)
        };
        let pool = |id, parent, pool_size: usize, strides: usize| {
            let params = json!({"pool_size": pool_size, "strides": strides});
            LayerNode::new(id, parent, MaxPooling1D, params)
        };
        let dense = |id, parent, units: usize| {
            LayerNode::new(id, parent, Dense, json!({"units": units, "activation": "elu"}))
        };

        Topology {
            nodes: vec![
                conv("c1", INPUT_ID, 64, 5),
                pool("mp1", "c1", 3, 1),
                conv("c2", "mp1", 64, 3),
                pool("mp2", "c2", 4, 2),
                conv("c3", "mp2", 128, 3),
                pool("mp3", "c3", 3, 1),
                LayerNode::new("f1", "mp3", Flatten, json!({})),
                dense("d1", "f1", 128),
                dense("output", "d1", 128),
            ],
        }
    }

    /// Read a topology from a JSON array of nodes.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::InvalidTopology(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
            .map_err(|e| HarnessError::InvalidTopology(format!("{}: {e}", path.display())))
    }

    pub fn from_json_str(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Check the graph and return its layers in execution order.
    ///
    /// Requires unique ids, known parents, exactly one node fed by `input`,
    /// no node with more than one child, and every node reachable from
    /// `input` (which also rules out cycles).
    pub fn resolve(&self) -> Result<Vec<ResolvedLayer>> {
        let invalid = |msg: String| Err(HarnessError::InvalidTopology(msg));

        if self.nodes.is_empty() {
            return invalid("topology has no layers".into());
        }

        let mut by_id: HashMap<&str, &LayerNode> = HashMap::new();
        for node in &self.nodes {
            if node.id == INPUT_ID {
                return invalid(format!("'{INPUT_ID}' is reserved and cannot name a layer"));
            }
            if by_id.insert(node.id.as_str(), node).is_some() {
                return invalid(format!("duplicate layer id '{}'", node.id));
            }
        }

        let mut child_of: HashMap<&str, &LayerNode> = HashMap::new();
        for node in &self.nodes {
            if node.parent != INPUT_ID && !by_id.contains_key(node.parent.as_str()) {
                return invalid(format!(
                    "layer '{}' has unknown parent '{}'",
                    node.id, node.parent
                ));
            }
            if let Some(other) = child_of.insert(node.parent.as_str(), node) {
                return invalid(format!(
                    "'{}' feeds both '{}' and '{}'; only chains are supported",
                    node.parent, other.id, node.id
                ));
            }
        }

        let mut ordered = Vec::with_capacity(self.nodes.len());
        let mut seen: HashSet<&str> = HashSet::new();
        let mut cursor = INPUT_ID;
        while let Some(node) = child_of.get(cursor) {
            if !seen.insert(node.id.as_str()) {
                break;
            }
            ordered.push(ResolvedLayer {
                id: node.id.clone(),
                spec: node.spec()?,
            });
            cursor = node.id.as_str();
        }

        if ordered.len() != self.nodes.len() {
            let orphan = self
                .nodes
                .iter()
                .find(|n| !seen.contains(n.id.as_str()))
                .map(|n| n.id.as_str())
                .unwrap_or_default();
            return invalid(format!(
                "layer '{orphan}' is not reachable from '{INPUT_ID}'"
            ));
        }

        Ok(ordered)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            writeln!(f, "  {node}")?;
        }
        Ok(())
    }
}
