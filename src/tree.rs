//! The argument tree: the backend's wire shape, the typed tree built from it,
//! and the flat depth-ordered list the layout works on.

use crate::types::{LearnFlowError, Result};
use serde::{Deserialize, Serialize};

pub const SUBJECT_FALLBACK_TITLE: &str = "주제";

// --- Backend wire format ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiNodeType {
    Claim,
    Counter,
    Subject,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEvidence {
    pub id: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiNode {
    pub id: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(rename = "type")]
    pub kind: ApiNodeType,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub evidences: Vec<ApiEvidence>,
    #[serde(default)]
    pub children: Vec<ApiNode>,
    #[serde(default)]
    pub triggered_by_evidence_id: Option<i64>,
}

// --- Typed tree ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Argument,
    Evidence,
    Counterargument,
    Question,
    Answer,
    Subject,
}

impl NodeType {
    /// Prefix of the node ids handed to the UI, e.g. `a-12`.
    pub fn initial(&self) -> &'static str {
        match self {
            Self::Argument => "a",
            Self::Counterargument => "c",
            Self::Evidence => "e",
            Self::Question => "q",
            Self::Answer => "ans",
            Self::Subject => "s",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Argument => "주장",
            Self::Evidence => "근거",
            Self::Counterargument => "예상 반론",
            Self::Question => "예상 질문",
            Self::Answer => "답변",
            Self::Subject => SUBJECT_FALLBACK_TITLE,
        }
    }

    pub fn node_id(&self, id: i64) -> String {
        format!("{}-{}", self.initial(), id)
    }
}

impl From<ApiNodeType> for NodeType {
    fn from(kind: ApiNodeType) -> Self {
        match kind {
            ApiNodeType::Counter => Self::Counterargument,
            ApiNodeType::Subject => Self::Subject,
            ApiNodeType::Claim | ApiNodeType::Unknown => Self::Argument,
        }
    }
}

/// An argument or counterargument with its ordered evidence rows.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArgNode {
    pub node_id: String,
    #[serde(rename = "type")]
    pub kind: NodeType,
    pub content: String,
    pub summary: Option<String>,
    pub evidences: Vec<EvidenceNode>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceNode {
    pub node_id: String,
    pub content: String,
    pub summary: Option<String>,
    pub source: Option<String>,
    pub url: Option<String>,
    /// 1-based position under its argument.
    pub index: usize,
    pub children: Vec<EvidenceChild>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum EvidenceChild {
    Argument(ArgNode),
    Question(QuestionNode),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionNode {
    pub node_id: String,
    pub content: String,
    pub summary: Option<String>,
    pub answer: Option<AnswerNode>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerNode {
    pub node_id: String,
    pub content: String,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubjectNode {
    pub node_id: String,
    pub content: String,
    pub children: Vec<ArgNode>,
}

impl ArgNode {
    /// Builds an argument from its wire form. Children are hung under the
    /// evidence named by their `triggeredByEvidenceId`; a child that names no
    /// evidence of this node has nowhere to go and is dropped.
    pub fn from_api(api: &ApiNode) -> Self {
        let kind = match NodeType::from(api.kind) {
            NodeType::Counterargument => NodeType::Counterargument,
            _ => NodeType::Argument,
        };

        let mut evidences: Vec<EvidenceNode> = api
            .evidences
            .iter()
            .enumerate()
            .map(|(i, e)| EvidenceNode {
                node_id: NodeType::Evidence.node_id(e.id),
                content: e.content.clone(),
                summary: e.summary.clone(),
                source: e.source.clone(),
                url: e.url.clone(),
                index: i + 1,
                children: Vec::new(),
            })
            .collect();

        for child in &api.children {
            if child.kind == ApiNodeType::Subject {
                tracing::warn!("[tree] Ignoring nested subject node {}", child.id);
                continue;
            }
            let target = match child.triggered_by_evidence_id {
                Some(id) if id != 0 => NodeType::Evidence.node_id(id),
                _ => {
                    tracing::debug!("[tree] Node {} has no triggering evidence; skipped", child.id);
                    continue;
                }
            };
            match evidences.iter_mut().find(|e| e.node_id == target) {
                Some(evidence) => evidence
                    .children
                    .push(EvidenceChild::Argument(ArgNode::from_api(child))),
                None => tracing::debug!(
                    "[tree] Node {} points at unknown evidence {}; skipped",
                    child.id,
                    target
                ),
            }
        }

        Self {
            node_id: kind.node_id(api.id),
            kind,
            content: api.content.clone(),
            summary: api.summary.clone(),
            evidences,
        }
    }
}

impl SubjectNode {
    pub fn from_api(api: &ApiNode) -> Self {
        let content = if api.content.is_empty() {
            SUBJECT_FALLBACK_TITLE.to_string()
        } else {
            api.content.clone()
        };
        Self {
            node_id: NodeType::Subject.node_id(api.id),
            content,
            children: api
                .children
                .iter()
                .filter(|c| c.kind != ApiNodeType::Subject)
                .map(ArgNode::from_api)
                .collect(),
        }
    }
}

// --- Render list ---

/// An argument, counterargument or question box placed by the layout.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderableNode {
    /// `<type>-<nodeId>-<depth>`, unique within one tree.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeType,
    pub node_id: String,
    pub depth: usize,
    /// Tree node id of the logical parent: the subject for top-level
    /// arguments, otherwise the evidence the box hangs from.
    pub parent_node_id: String,
    /// Render id of the box holding that evidence row.
    pub parent_id: Option<String>,
    /// 0-based evidence row within the parent box.
    pub parent_evidence_index: Option<usize>,
}

fn render_id(kind: NodeType, node_id: &str, depth: usize) -> String {
    let name = match kind {
        NodeType::Argument => "argument",
        NodeType::Counterargument => "counterargument",
        NodeType::Question => "question",
        NodeType::Evidence => "evidence",
        NodeType::Answer => "answer",
        NodeType::Subject => "subject",
    };
    format!("{}-{}-{}", name, node_id, depth)
}

struct ParentSlot<'a> {
    node_id: &'a str,
    render_id: Option<&'a str>,
    evidence_index: Option<usize>,
}

/// Flattens an argument and everything under it, parents before children.
pub fn collect_renderable(node: &ArgNode, depth: usize, parent_node_id: &str) -> Vec<RenderableNode> {
    let mut out = Vec::new();
    collect_into(
        node,
        depth,
        ParentSlot {
            node_id: parent_node_id,
            render_id: None,
            evidence_index: None,
        },
        &mut out,
    );
    out
}

fn collect_into(node: &ArgNode, depth: usize, parent: ParentSlot<'_>, out: &mut Vec<RenderableNode>) {
    let id = render_id(node.kind, &node.node_id, depth);
    out.push(RenderableNode {
        id: id.clone(),
        kind: node.kind,
        node_id: node.node_id.clone(),
        depth,
        parent_node_id: parent.node_id.to_string(),
        parent_id: parent.render_id.map(str::to_string),
        parent_evidence_index: parent.evidence_index,
    });

    for evidence in &node.evidences {
        let slot = evidence.index.checked_sub(1);
        for child in &evidence.children {
            match child {
                EvidenceChild::Question(q) => out.push(RenderableNode {
                    id: render_id(NodeType::Question, &q.node_id, depth + 1),
                    kind: NodeType::Question,
                    node_id: q.node_id.clone(),
                    depth: depth + 1,
                    parent_node_id: evidence.node_id.clone(),
                    parent_id: Some(id.clone()),
                    parent_evidence_index: slot,
                }),
                EvidenceChild::Argument(arg) => collect_into(
                    arg,
                    depth + 1,
                    ParentSlot {
                        node_id: &evidence.node_id,
                        render_id: Some(&id),
                        evidence_index: slot,
                    },
                    out,
                ),
            }
        }
    }
}

/// A fetched tree plus its precomputed render list. Rebuild it whenever the
/// tree is fetched again.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TreeData {
    pub root: SubjectNode,
    pub renderable_nodes: Vec<RenderableNode>,
}

impl TreeData {
    pub fn from_api(api: &ApiNode) -> Result<Self> {
        if api.kind != ApiNodeType::Subject {
            return Err(LearnFlowError::Protocol(format!(
                "tree root must be a SUBJECT node, got {:?}",
                api.kind
            ))
            .into());
        }
        let root = SubjectNode::from_api(api);
        let renderable_nodes = root
            .children
            .iter()
            .flat_map(|child| collect_renderable(child, 0, &root.node_id))
            .collect();
        Ok(Self {
            root,
            renderable_nodes,
        })
    }

    pub fn max_depth(&self) -> usize {
        self.renderable_nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ApiNode {
        let raw = serde_json::json!({
            "id": 1, "content": "", "type": "SUBJECT", "evidences": [],
            "children": [{
                "id": 10, "content": "고령화는 심화된다", "summary": "고령화", "type": "CLAIM",
                "createdBy": "student", "createdAt": "2025-05-01", "updatedAt": "2025-05-01",
                "evidences": [
                    {"id": 100, "content": "출산율 하락", "summary": null, "source": null, "url": null},
                    {"id": 101, "content": "기대수명 증가", "summary": null, "source": "통계청", "url": "https://kostat.go.kr"}
                ],
                "children": [
                    {"id": 20, "content": "이민 확대", "type": "COUNTER", "evidences": [
                        {"id": 200, "content": "노동력 유입", "summary": null, "source": null, "url": null}
                    ], "children": [], "triggeredByEvidenceId": 101},
                    {"id": 21, "content": "orphan", "type": "COUNTER", "evidences": [], "children": [],
                     "triggeredByEvidenceId": 999},
                    {"id": 22, "content": "untriggered", "type": "CLAIM", "evidences": [], "children": [],
                     "triggeredByEvidenceId": null}
                ],
                "triggeredByEvidenceId": null
            }],
            "triggeredByEvidenceId": null
        });
        match serde_json::from_value(raw) {
            Ok(node) => node,
            Err(e) => panic!("fixture did not parse: {}", e),
        }
    }

    #[test]
    fn test_children_attach_to_triggering_evidence() {
        let tree = match TreeData::from_api(&sample()) {
            Ok(t) => t,
            Err(e) => panic!("{}", e),
        };
        assert_eq!(tree.root.node_id, "s-1");
        assert_eq!(tree.root.content, SUBJECT_FALLBACK_TITLE);

        let claim = &tree.root.children[0];
        assert_eq!(claim.node_id, "a-10");
        assert_eq!(claim.evidences[1].node_id, "e-101");
        assert_eq!(claim.evidences[1].index, 2);
        assert!(claim.evidences[0].children.is_empty());
        match &claim.evidences[1].children[..] {
            [EvidenceChild::Argument(counter)] => {
                assert_eq!(counter.node_id, "c-20");
                assert_eq!(counter.kind, NodeType::Counterargument);
            }
            other => panic!("unexpected children: {:?}", other),
        }
    }

    #[test]
    fn test_render_list_carries_depth_and_zero_based_slot() {
        let tree = match TreeData::from_api(&sample()) {
            Ok(t) => t,
            Err(e) => panic!("{}", e),
        };
        let nodes = &tree.renderable_nodes;
        assert_eq!(nodes.len(), 2);

        assert_eq!(nodes[0].id, "argument-a-10-0");
        assert_eq!(nodes[0].parent_node_id, "s-1");
        assert_eq!(nodes[0].parent_evidence_index, None);

        assert_eq!(nodes[1].id, "counterargument-c-20-1");
        assert_eq!(nodes[1].depth, 1);
        assert_eq!(nodes[1].parent_node_id, "e-101");
        assert_eq!(nodes[1].parent_id.as_deref(), Some("argument-a-10-0"));
        assert_eq!(nodes[1].parent_evidence_index, Some(1));
        assert_eq!(tree.max_depth(), 1);
    }

    #[test]
    fn test_questions_are_rendered_beside_their_evidence() {
        let arg = ArgNode {
            node_id: "a-1".into(),
            kind: NodeType::Argument,
            content: "claim".into(),
            summary: None,
            evidences: vec![EvidenceNode {
                node_id: "e-5".into(),
                content: "evidence".into(),
                summary: None,
                source: None,
                url: None,
                index: 1,
                children: vec![EvidenceChild::Question(QuestionNode {
                    node_id: "q-9".into(),
                    content: "why?".into(),
                    summary: None,
                    answer: None,
                })],
            }],
        };
        let nodes = collect_renderable(&arg, 0, "s-1");
        assert_eq!(nodes[1].id, "question-q-9-1");
        assert_eq!(nodes[1].parent_node_id, "e-5");
        assert_eq!(nodes[1].parent_evidence_index, Some(0));
    }

    #[test]
    fn test_non_subject_root_is_rejected() {
        let mut root = sample();
        root.kind = ApiNodeType::Claim;
        assert!(TreeData::from_api(&root).is_err());
        assert_eq!(NodeType::from(ApiNodeType::Unknown), NodeType::Argument);
        let unknown: ApiNodeType = match serde_json::from_str("\"REBUTTAL\"") {
            Ok(k) => k,
            Err(e) => panic!("{}", e),
        };
        assert_eq!(unknown, ApiNodeType::Unknown);
    }
}
