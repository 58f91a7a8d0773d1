use super::tree::{NodeId, XmlTree};
use super::{PARAGRAPH, Segment, TEXT_LEAF};

/// Walks the tree once in document order and emits one segment per
/// paragraph that carries non-blank text.
pub(crate) fn extract_segments(tree: &XmlTree) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut stack: Vec<NodeId> = tree.roots().iter().rev().copied().collect();
    while let Some(node) = stack.pop() {
        if tree.is_element(node, PARAGRAPH) {
            emit_paragraph(tree, node, &mut segments);
        }
        // Paragraphs nested in text boxes are reached through here after their
        // enclosing paragraph has been emitted.
        stack.extend(tree.children(node).iter().rev());
    }
    segments
}

fn emit_paragraph(tree: &XmlTree, paragraph: NodeId, segments: &mut Vec<Segment>) {
    let leaves = collect_leaves(tree, paragraph);
    let source_text: String = leaves.iter().map(|leaf| tree.element_text(*leaf)).collect();
    if source_text.trim().is_empty() {
        return;
    }
    segments.push(Segment::new(segments.len(), source_text, leaves));
}

fn collect_leaves(tree: &XmlTree, paragraph: NodeId) -> Vec<NodeId> {
    let mut leaves = Vec::new();
    let mut stack: Vec<NodeId> = tree.children(paragraph).iter().rev().copied().collect();
    while let Some(node) = stack.pop() {
        if tree.is_element(node, PARAGRAPH) {
            continue;
        }
        if tree.is_element(node, TEXT_LEAF) {
            leaves.push(node);
            continue;
        }
        stack.extend(tree.children(node).iter().rev());
    }
    leaves
}
