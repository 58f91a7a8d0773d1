mod extract;
mod tree;
mod writer;

use std::io::{Cursor, Read};
use zip::ZipArchive;

use crate::error::DocumentError;

pub use tree::NodeId;
use tree::XmlTree;

/// Main body part of a word-processing package.
pub const BODY_PART: &str = "word/document.xml";

pub(crate) const PARAGRAPH: &[u8] = b"w:p";
pub(crate) const TEXT_LEAF: &[u8] = b"w:t";

/// One translatable paragraph and the text leaves it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: usize,
    pub source_text: String,
    pub translated_text: Option<String>,
    run_refs: Vec<NodeId>,
}

impl Segment {
    pub(crate) fn new(id: usize, source_text: String, run_refs: Vec<NodeId>) -> Self {
        Self {
            id,
            source_text,
            translated_text: None,
            run_refs,
        }
    }

    /// Leaf nodes in document order. Only meaningful for the document the
    /// segment was extracted from.
    pub fn run_refs(&self) -> &[NodeId] {
        &self.run_refs
    }

    pub fn is_translated(&self) -> bool {
        self.translated_text.is_some()
    }
}

/// A parsed document package: the original archive bytes plus the markup
/// tree of its body part.
#[derive(Debug, Clone)]
pub struct Document {
    archive: Vec<u8>,
    body_part: String,
    tree: XmlTree,
}

impl Document {
    pub fn parse(bytes: Vec<u8>) -> Result<(Document, Vec<Segment>), DocumentError> {
        let body = read_body_part(&bytes, BODY_PART)?;
        let tree = XmlTree::parse(&body)?;
        let segments = extract::extract_segments(&tree);
        let document = Document {
            archive: bytes,
            body_part: BODY_PART.to_string(),
            tree,
        };
        Ok((document, segments))
    }

    /// Applies every translated segment to the tree and returns the
    /// repackaged archive.
    pub fn write(&mut self, segments: &[Segment]) -> Result<Vec<u8>, DocumentError> {
        writer::apply_segments(&mut self.tree, segments)?;
        let body = self.tree.serialize()?;
        writer::repackage(&self.archive, &self.body_part, &body)
    }

    pub fn leaf_texts(&self, refs: &[NodeId]) -> Vec<String> {
        refs.iter()
            .map(|leaf| self.tree.element_text(*leaf))
            .collect()
    }

    pub fn text_leaf_count(&self) -> usize {
        self.tree.count_elements(TEXT_LEAF)
    }

    pub fn body_xml(&self) -> Result<String, DocumentError> {
        let body = self.tree.serialize()?;
        String::from_utf8(body).map_err(|err| DocumentError::Serialization(err.to_string()))
    }
}

fn read_body_part(bytes: &[u8], name: &str) -> Result<Vec<u8>, DocumentError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| DocumentError::InvalidContainer(err.to_string()))?;
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => {
            return Err(DocumentError::MissingBodyPart(name.to_string()));
        }
        Err(err) => return Err(DocumentError::InvalidContainer(err.to_string())),
    };
    let mut body = Vec::new();
    file.read_to_end(&mut body)
        .map_err(|err| DocumentError::InvalidContainer(err.to_string()))?;
    Ok(body)
}
