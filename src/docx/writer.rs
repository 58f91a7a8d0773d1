use std::io::{Cursor, Write};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::error::DocumentError;

use super::tree::XmlTree;
use super::{Segment, TEXT_LEAF};

/// Writes translated text back into the leaves each segment references.
///
/// References that do not point at a text leaf are rejected before anything
/// is touched. A reference that lands on some other text leaf is not caught.
pub(crate) fn apply_segments(tree: &mut XmlTree, segments: &[Segment]) -> Result<(), DocumentError> {
    for segment in segments {
        if let Some(node) = segment
            .run_refs()
            .iter()
            .find(|node| !tree.is_element(**node, TEXT_LEAF))
        {
            return Err(DocumentError::StaleReference {
                segment: segment.id,
                node: node.index(),
            });
        }
    }

    for segment in segments {
        let Some(translated) = segment.translated_text.as_deref() else {
            continue;
        };
        let Some((first, rest)) = segment.run_refs().split_first() else {
            continue;
        };
        tree.set_element_text(*first, translated);
        if needs_preserved_space(translated) && !tree.has_attribute(*first, b"xml:space") {
            tree.push_attribute(*first, "xml:space", "preserve");
        }
        for leaf in rest {
            tree.set_element_text(*leaf, "");
        }
    }
    Ok(())
}

fn needs_preserved_space(text: &str) -> bool {
    text.starts_with(char::is_whitespace) || text.ends_with(char::is_whitespace)
}

/// Rebuilds the archive with `body_part` replaced. Every other entry is
/// copied without recompression.
pub(crate) fn repackage(
    archive: &[u8],
    body_part: &str,
    body: &[u8],
) -> Result<Vec<u8>, DocumentError> {
    let mut archive = ZipArchive::new(Cursor::new(archive))
        .map_err(|err| DocumentError::InvalidContainer(err.to_string()))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for i in 0..archive.len() {
        let file = archive
            .by_index_raw(i)
            .map_err(|err| DocumentError::InvalidContainer(err.to_string()))?;
        if file.name() != body_part {
            writer.raw_copy_file(file).map_err(zip_error)?;
            continue;
        }

        let name = file.name().to_string();
        let options = FileOptions::default()
            .compression_method(file.compression())
            .last_modified_time(file.last_modified());
        drop(file);
        writer.start_file(name, options).map_err(zip_error)?;
        writer
            .write_all(body)
            .map_err(|err| DocumentError::Serialization(err.to_string()))?;
    }

    let bytes = writer.finish().map_err(zip_error)?.into_inner();
    Ok(bytes)
}

fn zip_error(err: zip::result::ZipError) -> DocumentError {
    DocumentError::Serialization(err.to_string())
}
