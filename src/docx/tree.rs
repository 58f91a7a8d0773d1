use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::error::DocumentError;

/// Deepest element nesting accepted from a document body.
pub(crate) const MAX_DEPTH: usize = 1024;

/// Stable handle to a node in an [`XmlTree`]. Indices never move once a node
/// is allocated, so handles stay valid while the tree is edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
enum Node {
    Element {
        start: quick_xml::events::BytesStart<'static>,
        children: Vec<NodeId>,
        self_closing: bool,
    },
    // `raw` is written back verbatim until the text is replaced.
    Text {
        raw: Event<'static>,
        text: String,
    },
    Markup(Event<'static>),
}

/// Arena-backed markup tree. Keeps every event it was parsed from so an
/// untouched tree serializes back to the same markup.
#[derive(Debug, Clone, Default)]
pub(crate) struct XmlTree {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
}

impl XmlTree {
    pub(crate) fn parse(xml: &[u8]) -> Result<Self, DocumentError> {
        let mut reader = Reader::from_reader(Cursor::new(xml));
        reader.trim_text(false);
        let mut buf = Vec::new();
        let mut tree = XmlTree::default();
        let mut open: Vec<NodeId> = Vec::new();

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|err| DocumentError::InvalidBody(err.to_string()))?;
            let parent = open.last().copied();
            match event {
                Event::Start(e) => {
                    if open.len() >= MAX_DEPTH {
                        return Err(DocumentError::InvalidBody(format!(
                            "markup nested deeper than {} levels",
                            MAX_DEPTH
                        )));
                    }
                    let id = tree.push(
                        parent,
                        Node::Element {
                            start: e.into_owned(),
                            children: Vec::new(),
                            self_closing: false,
                        },
                    );
                    open.push(id);
                }
                Event::End(_) => {
                    if open.pop().is_none() {
                        return Err(DocumentError::InvalidBody(
                            "closing tag without matching start".to_string(),
                        ));
                    }
                }
                Event::Empty(e) => {
                    tree.push(
                        parent,
                        Node::Element {
                            start: e.into_owned(),
                            children: Vec::new(),
                            self_closing: true,
                        },
                    );
                }
                Event::Text(e) => {
                    let text = e
                        .unescape()
                        .map_err(|err| DocumentError::InvalidBody(err.to_string()))?
                        .into_owned();
                    tree.push(
                        parent,
                        Node::Text {
                            raw: Event::Text(e.into_owned()),
                            text,
                        },
                    );
                }
                Event::CData(e) => {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    tree.push(
                        parent,
                        Node::Text {
                            raw: Event::CData(e.into_owned()),
                            text,
                        },
                    );
                }
                Event::Eof => break,
                other => {
                    tree.push(parent, Node::Markup(other.into_owned()));
                }
            }
            buf.clear();
        }

        if !open.is_empty() {
            return Err(DocumentError::InvalidBody(format!(
                "{} element(s) left unclosed",
                open.len()
            )));
        }
        Ok(tree)
    }

    fn push(&mut self, parent: Option<NodeId>, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        match parent.and_then(|parent| self.nodes.get_mut(parent.0)) {
            Some(Node::Element { children, .. }) => children.push(id),
            _ => self.roots.push(id),
        }
        id
    }

    pub(crate) fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub(crate) fn children(&self, id: NodeId) -> &[NodeId] {
        match self.nodes.get(id.0) {
            Some(Node::Element { children, .. }) => children,
            _ => &[],
        }
    }

    pub(crate) fn is_element(&self, id: NodeId, name: &[u8]) -> bool {
        match self.nodes.get(id.0) {
            Some(Node::Element { start, .. }) => start.name().as_ref() == name,
            _ => false,
        }
    }

    /// Concatenated text content directly under an element.
    pub(crate) fn element_text(&self, id: NodeId) -> String {
        self.children(id)
            .iter()
            .filter_map(|child| match &self.nodes[child.0] {
                Node::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replaces the text content of an element, keeping the element itself
    /// and its attributes untouched.
    pub(crate) fn set_element_text(&mut self, id: NodeId, value: &str) {
        let fresh = Node::Text {
            raw: Event::Text(BytesText::new(value).into_owned()),
            text: value.to_string(),
        };
        let reuse = match self.nodes.get(id.0) {
            Some(Node::Element { children, .. }) => match children.as_slice() {
                [only] if matches!(self.nodes[only.0], Node::Text { .. }) => Some(*only),
                _ => None,
            },
            _ => return,
        };
        if let Some(existing) = reuse {
            self.nodes[existing.0] = fresh;
            return;
        }

        let text_id = NodeId(self.nodes.len());
        self.nodes.push(fresh);
        if let Some(Node::Element {
            children,
            self_closing,
            ..
        }) = self.nodes.get_mut(id.0)
        {
            *children = vec![text_id];
            *self_closing = false;
        }
    }

    pub(crate) fn has_attribute(&self, id: NodeId, key: &[u8]) -> bool {
        match self.nodes.get(id.0) {
            Some(Node::Element { start, .. }) => start
                .attributes()
                .flatten()
                .any(|attr| attr.key.as_ref() == key),
            _ => false,
        }
    }

    pub(crate) fn push_attribute(&mut self, id: NodeId, key: &str, value: &str) {
        if let Some(Node::Element { start, .. }) = self.nodes.get_mut(id.0) {
            start.push_attribute((key, value));
        }
    }

    pub(crate) fn count_elements(&self, name: &[u8]) -> usize {
        let mut count = 0;
        let mut stack: Vec<NodeId> = self.roots.clone();
        while let Some(id) = stack.pop() {
            if self.is_element(id, name) {
                count += 1;
            }
            stack.extend_from_slice(self.children(id));
        }
        count
    }

    pub(crate) fn serialize(&self) -> Result<Vec<u8>, DocumentError> {
        let mut writer = Writer::new(Vec::new());
        let mut stack: Vec<Walk> = self.roots.iter().rev().map(|id| Walk::Enter(*id)).collect();
        while let Some(step) = stack.pop() {
            match step {
                Walk::Enter(id) => self.write_node(&mut writer, id, &mut stack)?,
                Walk::Leave(id) => {
                    if let Some(Node::Element { start, .. }) = self.nodes.get(id.0) {
                        writer
                            .write_event(Event::End(start.to_end()))
                            .map_err(serialization_error)?;
                    }
                }
            }
        }
        Ok(writer.into_inner())
    }

    // Writes the opening side of a node and queues its children and closing
    // tag on `stack`.
    fn write_node(
        &self,
        writer: &mut Writer<Vec<u8>>,
        id: NodeId,
        stack: &mut Vec<Walk>,
    ) -> Result<(), DocumentError> {
        let node = self
            .nodes
            .get(id.0)
            .ok_or_else(|| DocumentError::Serialization(format!("dangling node {}", id.0)))?;
        match node {
            Node::Element {
                start,
                children,
                self_closing,
            } => {
                if *self_closing && children.is_empty() {
                    writer
                        .write_event(Event::Empty(start.borrow()))
                        .map_err(serialization_error)?;
                    return Ok(());
                }
                writer
                    .write_event(Event::Start(start.borrow()))
                    .map_err(serialization_error)?;
                stack.push(Walk::Leave(id));
                stack.extend(children.iter().rev().map(|child| Walk::Enter(*child)));
            }
            Node::Text { raw, .. } => {
                writer
                    .write_event(raw.borrow())
                    .map_err(serialization_error)?;
            }
            Node::Markup(event) => {
                writer
                    .write_event(event.borrow())
                    .map_err(serialization_error)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Walk {
    Enter(NodeId),
    Leave(NodeId),
}

fn serialization_error(err: quick_xml::Error) -> DocumentError {
    DocumentError::Serialization(err.to_string())
}
