//! Column layout for the argument tree. Each depth is a column; within a
//! column a box starts level with the evidence row it answers, pushed down
//! only as far as needed to clear the box above it.

use crate::tree::RenderableNode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_NODE_HEIGHT: f64 = 200.0;
pub const STABLE_TOLERANCE: f64 = 1.0;
const LAYOUT_PASSES: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayoutConfig {
    pub origin: Position,
    pub node_width: f64,
    pub col_gap: f64,
    pub row_gap: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            origin: Position { x: 8.0, y: 90.0 },
            node_width: 462.0,
            col_gap: 32.0,
            row_gap: 12.0,
        }
    }
}

impl LayoutConfig {
    pub fn column_x(&self, depth: usize) -> f64 {
        self.origin.x + depth as f64 * (self.node_width + self.col_gap)
    }
}

/// What the renderer reported for one box.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub height: f64,
    /// Offset of each evidence row from the top of the box.
    pub evidence_offsets: Vec<f64>,
}

pub type Measurements = HashMap<String, Measurement>;
pub type Layout = HashMap<String, Position>;

pub fn compute_layout(
    nodes: &[RenderableNode],
    measurements: &Measurements,
    config: &LayoutConfig,
) -> Layout {
    let mut by_depth: BTreeMap<usize, Vec<&RenderableNode>> = BTreeMap::new();
    for node in nodes {
        by_depth.entry(node.depth).or_default().push(node);
    }

    let mut layout = Layout::new();
    for pass in 0..LAYOUT_PASSES {
        let next = layout_pass(&by_depth, &layout, measurements, config);
        let settled = is_stable(&layout, &next);
        layout = next;
        if settled {
            tracing::trace!("[layout] Settled after {} passes", pass + 1);
            break;
        }
    }
    layout
}

fn layout_pass(
    by_depth: &BTreeMap<usize, Vec<&RenderableNode>>,
    previous: &Layout,
    measurements: &Measurements,
    config: &LayoutConfig,
) -> Layout {
    let mut positions = Layout::new();
    for (&depth, column) in by_depth {
        let mut offset = config.origin.y;
        for node in column {
            let y = match parent_row_y(node, &positions, previous, measurements) {
                Some(row) => row.max(offset),
                None => offset,
            };
            positions.insert(
                node.id.clone(),
                Position {
                    x: config.column_x(depth),
                    y,
                },
            );
            let height = match measurements.get(&node.id) {
                Some(m) if m.height > 0.0 => m.height,
                _ => DEFAULT_NODE_HEIGHT,
            };
            offset = y + height + config.row_gap;
        }
    }
    positions
}

/// Absolute y of the evidence row a node hangs from, once its parent box has
/// both a position and a measurement for that row.
fn parent_row_y(
    node: &RenderableNode,
    current: &Layout,
    previous: &Layout,
    measurements: &Measurements,
) -> Option<f64> {
    let parent = node.parent_id.as_deref()?;
    let index = node.parent_evidence_index?;
    let row_offset = *measurements.get(parent)?.evidence_offsets.get(index)?;
    let parent_pos = current.get(parent).or_else(|| previous.get(parent))?;
    Some(parent_pos.y + row_offset)
}

/// True when both layouts place the same boxes within a pixel of each other.
pub fn is_stable(a: &Layout, b: &Layout) -> bool {
    a.len() == b.len()
        && a.iter().all(|(id, p)| match b.get(id) {
            Some(q) => {
                (p.x - q.x).abs() <= STABLE_TOLERANCE && (p.y - q.y).abs() <= STABLE_TOLERANCE
            }
            None => false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeType;

    fn node(id: &str, depth: usize, parent: Option<&str>, slot: Option<usize>) -> RenderableNode {
        RenderableNode {
            id: id.to_string(),
            kind: NodeType::Argument,
            node_id: id.to_string(),
            depth,
            parent_node_id: "s-1".to_string(),
            parent_id: parent.map(str::to_string),
            parent_evidence_index: slot,
        }
    }

    fn measured(height: f64, rows: &[f64]) -> Measurement {
        Measurement {
            height,
            evidence_offsets: rows.to_vec(),
        }
    }

    fn at(layout: &Layout, id: &str) -> Position {
        match layout.get(id) {
            Some(p) => *p,
            None => panic!("{} was not placed", id),
        }
    }

    #[test]
    fn test_child_aligns_with_parent_evidence_row() {
        let nodes = vec![
            node("root", 0, None, None),
            node("left", 1, Some("root"), Some(0)),
            node("right", 1, Some("root"), Some(2)),
        ];
        let mut m = Measurements::new();
        m.insert("root".into(), measured(600.0, &[100.0, 250.0, 400.0]));
        m.insert("left".into(), measured(120.0, &[]));

        let config = LayoutConfig::default();
        let layout = compute_layout(&nodes, &m, &config);

        assert_eq!(at(&layout, "root"), Position { x: 8.0, y: 90.0 });
        assert_eq!(at(&layout, "left"), Position { x: 502.0, y: 190.0 });
        assert_eq!(at(&layout, "right").y, 490.0);
    }

    #[test]
    fn test_siblings_never_overlap() {
        let nodes = vec![
            node("root", 0, None, None),
            node("first", 1, Some("root"), Some(0)),
            node("second", 1, Some("root"), Some(1)),
            node("third", 1, Some("root"), Some(1)),
        ];
        let mut m = Measurements::new();
        m.insert("root".into(), measured(300.0, &[10.0, 20.0]));
        m.insert("first".into(), measured(150.0, &[]));
        m.insert("second".into(), measured(80.0, &[]));

        let config = LayoutConfig::default();
        let layout = compute_layout(&nodes, &m, &config);

        let first = at(&layout, "first").y;
        let second = at(&layout, "second").y;
        let third = at(&layout, "third").y;
        assert_eq!(first, 100.0);
        assert_eq!(second, first + 150.0 + config.row_gap);
        assert_eq!(third, second + 80.0 + config.row_gap);
    }

    #[test]
    fn test_unmeasured_parent_falls_back_to_column_offset() {
        let nodes = vec![
            node("root", 0, None, None),
            node("child", 1, Some("root"), Some(3)),
            node("next", 1, Some("root"), Some(0)),
        ];
        let mut m = Measurements::new();
        m.insert("root".into(), measured(300.0, &[40.0]));

        let layout = compute_layout(&nodes, &m, &LayoutConfig::default());
        assert_eq!(at(&layout, "child").y, 90.0);
        // Unmeasured child takes the default height.
        assert_eq!(at(&layout, "next").y, 90.0 + DEFAULT_NODE_HEIGHT + 12.0);
    }

    #[test]
    fn test_stability_uses_pixel_tolerance() {
        let mut a = Layout::new();
        a.insert("n".into(), Position { x: 8.0, y: 90.0 });
        let mut b = a.clone();
        assert!(is_stable(&a, &b));
        b.insert("n".into(), Position { x: 8.0, y: 90.8 });
        assert!(is_stable(&a, &b));
        b.insert("n".into(), Position { x: 8.0, y: 91.5 });
        assert!(!is_stable(&a, &b));
        b.insert("m".into(), Position::default());
        assert!(!is_stable(&a, &b));
    }
}
