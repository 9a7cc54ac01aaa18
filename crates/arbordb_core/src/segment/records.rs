//! Record constructors written through a [`SegmentBufferWriter`].
//!
//! Each function reserves its record with
//! [`prepare`](SegmentBufferWriter::prepare) and then streams the record
//! content. Values and strings pick the smallest length form; payloads too
//! large to inline are chunked into block records, collected in a list and
//! referenced from an 8-byte long length header.

use crate::error::{CoreError, CoreResult};
use crate::segment::id::RecordId;
use crate::segment::writer::SegmentBufferWriter;
use crate::types::RecordType;
use arbordb_codec::blob::{self, SMALL_BLOB_ID_LIMIT};
use arbordb_codec::length::{self, MAX_VALUE_LENGTH, MEDIUM_LIMIT};
use arbordb_codec::template::{pack_header, MAX_MIXIN_COUNT, MAX_PROPERTY_COUNT};
use arbordb_codec::{CodecError, RECORD_REF_BYTES};

/// Size of one block of an out-of-line value.
pub const BLOCK_SIZE: usize = 4096;

/// Largest number of record ids per list bucket.
pub const MAX_BUCKET_ENTRIES: usize = 255;

/// Number of bits of a map head word holding the entry count; the level
/// occupies the remaining top bits.
const MAP_SIZE_BITS: u32 = 28;

/// Writes a value record.
///
/// Payloads under the medium limit are stored in place behind a small or
/// medium length header. Larger payloads are chunked into
/// [`BLOCK_SIZE`]-byte block records, collected in a list, and the value
/// record holds the 8-byte long header plus a record id pointing at the
/// list.
///
/// # Errors
///
/// Returns [`CodecError::ValueTooLong`] for payloads of 2^31 bytes or
/// more.
pub fn write_value(writer: &mut SegmentBufferWriter, data: &[u8]) -> CoreResult<RecordId> {
    let len = data.len() as u64;
    if len >= MAX_VALUE_LENGTH {
        return Err(CodecError::ValueTooLong { length: len }.into());
    }
    let header = length::encode(len).map_err(CoreError::from)?;
    if len < MEDIUM_LIMIT {
        let id = writer.prepare(RecordType::Value, header.len() + data.len(), &[])?;
        writer.write_bytes(header.as_bytes())?;
        writer.write_bytes(data)?;
        return Ok(id);
    }

    let blocks = write_blocks(writer, data)?;
    let list_id = write_list(writer, &blocks)?;
    let id = writer.prepare(RecordType::Value, header.len(), std::slice::from_ref(&list_id))?;
    writer.write_bytes(header.as_bytes())?;
    writer.write_record_id(&list_id)?;
    Ok(id)
}

/// Writes a string as a value record.
pub fn write_string(writer: &mut SegmentBufferWriter, value: &str) -> CoreResult<RecordId> {
    write_value(writer, value.as_bytes())
}

/// Writes a raw block of bytes.
pub fn write_block(writer: &mut SegmentBufferWriter, data: &[u8]) -> CoreResult<RecordId> {
    let id = writer.prepare(RecordType::Block, data.len(), &[])?;
    writer.write_bytes(data)?;
    Ok(id)
}

fn write_blocks(writer: &mut SegmentBufferWriter, data: &[u8]) -> CoreResult<Vec<RecordId>> {
    data.chunks(BLOCK_SIZE)
        .map(|chunk| write_block(writer, chunk))
        .collect()
}

/// Writes a blob identifier record.
///
/// Identifiers shorter than 4096 bytes are stored in place; longer ones
/// are written as a value record first and referenced.
pub fn write_blob_id(writer: &mut SegmentBufferWriter, blob_id: &[u8]) -> CoreResult<RecordId> {
    if blob_id.len() < SMALL_BLOB_ID_LIMIT {
        let header = blob::small_header(blob_id.len()).map_err(CoreError::from)?;
        let id = writer.prepare(RecordType::Value, header.len() + blob_id.len(), &[])?;
        writer.write_bytes(&header)?;
        writer.write_bytes(blob_id)?;
        return Ok(id);
    }

    let value_id = write_value(writer, blob_id)?;
    let id = writer.prepare(RecordType::Value, 1, std::slice::from_ref(&value_id))?;
    writer.write_u8(blob::LONG_BLOB_ID_MARKER)?;
    writer.write_record_id(&value_id)?;
    Ok(id)
}

/// Writes a list record over `ids`.
///
/// The record holds the entry count and, for non-empty lists, the root of
/// a bucket tree with up to [`MAX_BUCKET_ENTRIES`] ids per bucket.
pub fn write_list(writer: &mut SegmentBufferWriter, ids: &[RecordId]) -> CoreResult<RecordId> {
    if ids.is_empty() {
        let id = writer.prepare(RecordType::List, 4, &[])?;
        writer.write_u32(0)?;
        return Ok(id);
    }

    let mut level: Vec<RecordId> = ids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(MAX_BUCKET_ENTRIES));
        for chunk in level.chunks(MAX_BUCKET_ENTRIES) {
            if chunk.len() == 1 {
                next.push(chunk[0].clone());
            } else {
                next.push(write_list_bucket(writer, chunk)?);
            }
        }
        level = next;
    }
    let root = level.remove(0);

    let id = writer.prepare(RecordType::List, 4, std::slice::from_ref(&root))?;
    writer.write_u32(ids.len() as u32)?;
    writer.write_record_id(&root)?;
    Ok(id)
}

/// Writes one bucket of a list's bucket tree.
pub fn write_list_bucket(
    writer: &mut SegmentBufferWriter,
    ids: &[RecordId],
) -> CoreResult<RecordId> {
    let id = writer.prepare(RecordType::Bucket, 0, ids)?;
    for entry in ids {
        writer.write_record_id(entry)?;
    }
    Ok(id)
}

/// One entry of a map leaf record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    /// Hash of the entry key.
    pub hash: u32,
    /// Record id of the key.
    pub key: RecordId,
    /// Record id of the value.
    pub value: RecordId,
}

/// Writes a map leaf record holding the given entries at trie `level`.
///
/// Entries are stored sorted by hash, ties broken by key identity, so a
/// reader can binary-search the hash array.
pub fn write_map_leaf(
    writer: &mut SegmentBufferWriter,
    level: u32,
    entries: &[MapEntry],
) -> CoreResult<RecordId> {
    if entries.is_empty() {
        let id = writer.prepare(RecordType::Leaf, 4, &[])?;
        writer.write_u32(0)?;
        return Ok(id);
    }

    let mut sorted: Vec<&MapEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| {
        (
            e.hash,
            e.key.segment_id().msb(),
            e.key.segment_id().lsb(),
            e.key.number(),
        )
    });

    let mut refs = Vec::with_capacity(2 * sorted.len());
    for entry in &sorted {
        refs.push(entry.key.clone());
        refs.push(entry.value.clone());
    }

    let id = writer.prepare(RecordType::Leaf, 4 + 4 * sorted.len(), &refs)?;
    writer.write_u32((level << MAP_SIZE_BITS) | sorted.len() as u32)?;
    for entry in &sorted {
        writer.write_u32(entry.hash)?;
    }
    for entry in &sorted {
        writer.write_record_id(&entry.key)?;
        writer.write_record_id(&entry.value)?;
    }
    Ok(id)
}

/// Writes a map branch record at trie `level`: the total entry count of
/// the subtree, the occupancy bitmap, and one record id per set bit.
pub fn write_map_branch(
    writer: &mut SegmentBufferWriter,
    level: u32,
    entry_count: u32,
    bitmap: u32,
    ids: &[RecordId],
) -> CoreResult<RecordId> {
    let id = writer.prepare(RecordType::Branch, 8, ids)?;
    writer.write_u32((level << MAP_SIZE_BITS) | entry_count)?;
    writer.write_u32(bitmap)?;
    for branch in ids {
        writer.write_record_id(branch)?;
    }
    Ok(id)
}

/// The child-node mode of a template descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChildNodes {
    /// The node has no child nodes.
    None,
    /// The node has more than one child node.
    Many,
    /// The node has exactly one child; the id points at its name record.
    One(RecordId),
}

/// The template of a node, with all referenced records already written.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateDescriptor {
    /// Record id of the primary type name.
    pub primary_type: Option<RecordId>,
    /// Record ids of the mixin type names.
    pub mixins: Vec<RecordId>,
    /// The child-node mode.
    pub children: ChildNodes,
    /// Record id of the property-name list.
    pub property_names: Option<RecordId>,
    /// One type byte per property.
    pub property_types: Vec<u8>,
}

/// Writes a template record.
///
/// # Errors
///
/// Returns [`CoreError::InvalidOperation`] if the mixin or property counts
/// exceed their header fields, or if property names and types are not
/// given together.
pub fn write_template(
    writer: &mut SegmentBufferWriter,
    template: &TemplateDescriptor,
) -> CoreResult<RecordId> {
    if template.mixins.len() > MAX_MIXIN_COUNT {
        return Err(CoreError::invalid_operation(format!(
            "{} mixins exceed the maximum of {MAX_MIXIN_COUNT}",
            template.mixins.len()
        )));
    }
    if template.property_types.len() > MAX_PROPERTY_COUNT {
        return Err(CoreError::invalid_operation(format!(
            "{} properties exceed the maximum of {MAX_PROPERTY_COUNT}",
            template.property_types.len()
        )));
    }
    if template.property_names.is_some() != !template.property_types.is_empty() {
        return Err(CoreError::invalid_operation(
            "property names and property types must be given together",
        ));
    }

    let mut refs = Vec::new();
    if let Some(primary) = &template.primary_type {
        refs.push(primary.clone());
    }
    refs.extend(template.mixins.iter().cloned());
    if let ChildNodes::One(name) = &template.children {
        refs.push(name.clone());
    }
    if let Some(names) = &template.property_names {
        refs.push(names.clone());
    }

    let header = pack_header(
        template.primary_type.is_some(),
        !template.mixins.is_empty(),
        matches!(template.children, ChildNodes::None),
        matches!(template.children, ChildNodes::Many),
        template.mixins.len(),
        template.property_types.len(),
    );

    let id = writer.prepare(
        RecordType::Template,
        4 + template.property_types.len(),
        &refs,
    )?;
    writer.write_u32(header)?;
    for reference in &refs {
        writer.write_record_id(reference)?;
    }
    writer.write_bytes(&template.property_types)?;
    Ok(id)
}

/// Writes a node record: the stable id followed by the child and property
/// record ids.
///
/// When no stable id is given the record's own id is written in its place,
/// marking a node that was never rewritten.
pub fn write_node(
    writer: &mut SegmentBufferWriter,
    stable_id: Option<&RecordId>,
    ids: &[RecordId],
) -> CoreResult<RecordId> {
    let id = writer.prepare(RecordType::Node, RECORD_REF_BYTES, ids)?;
    writer.write_record_id(stable_id.unwrap_or(&id))?;
    for reference in ids {
        writer.write_record_id(reference)?;
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentBufferWriter;
    use crate::store::{SegmentStore, Store};
    use crate::types::Generation;
    use arbordb_codec::{Children, StringValue};
    use std::sync::Arc;

    fn writer() -> (Arc<Store>, SegmentBufferWriter) {
        let store = Arc::new(Store::memory());
        let writer = SegmentBufferWriter::new(
            Arc::clone(&store) as Arc<dyn SegmentStore>,
            "w.0000".to_string(),
            Generation::new(0),
            256 * 1024,
            0,
        );
        (store, writer)
    }

    #[test]
    fn small_value_bytes() {
        let (store, mut w) = writer();
        let payload = vec![b'x'; 127];
        let id = write_value(&mut w, &payload).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        let bytes = segment.read_bytes(id.number(), 0, 128).unwrap();
        assert_eq!(bytes[0], 0x7F);
        assert_eq!(&bytes[1..], &payload[..]);
    }

    #[test]
    fn medium_value_bytes() {
        let (store, mut w) = writer();
        let payload = vec![b'x'; 16511];
        let id = write_value(&mut w, &payload).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        let bytes = segment.read_bytes(id.number(), 0, 2 + 16511).unwrap();
        assert_eq!(&bytes[..2], &[0xBF, 0xFF]);
        assert_eq!(&bytes[2..], &payload[..]);
    }

    #[test]
    fn zero_length_value() {
        let (store, mut w) = writer();
        let id = write_value(&mut w, &[]).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_bytes(id.number(), 0, 1).unwrap(), &[0x00]);
        assert_eq!(segment.read_string(id.number()).unwrap().as_inline(), Some(""));
    }

    #[test]
    fn long_value_is_stored_out_of_line() {
        let (store, mut w) = writer();
        let payload = vec![b'y'; 16512];
        let id = write_value(&mut w, &payload).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        // 8-byte long header encoding length 16512, then a record id.
        let header = segment.read_u64(id.number(), 0).unwrap();
        assert_eq!(header, 0xC000_0000_0000_0000);
        assert_eq!(segment.read_length(id.number()).unwrap(), 16512);

        match segment.read_string(id.number()).unwrap() {
            StringValue::External { length, .. } => assert_eq!(length, 16512),
            StringValue::Inline(_) => panic!("expected an external string"),
        }
    }

    #[test]
    fn small_blob_id_bytes() {
        let (store, mut w) = writer();
        let id = write_blob_id(&mut w, &[b'x'; 16]).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        let bytes = segment.read_bytes(id.number(), 0, 18).unwrap();
        assert_eq!(&bytes[..2], &[0xE0, 0x10]);
        assert_eq!(&bytes[2..], &[b'x'; 16][..]);
        assert_eq!(
            segment.read_blob_ref(id.number()).unwrap(),
            arbordb_codec::BlobRef::Inline(vec![b'x'; 16])
        );
    }

    #[test]
    fn long_blob_id_references_a_value() {
        let (store, mut w) = writer();
        let blob_id = vec![b'b'; SMALL_BLOB_ID_LIMIT];
        let id = write_blob_id(&mut w, &blob_id).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_u8(id.number(), 0).unwrap(), 0xF0);
        match segment.read_blob_ref(id.number()).unwrap() {
            arbordb_codec::BlobRef::External(r) => {
                let value_id = segment.resolve_ref(r).unwrap();
                let value = store.read_string(&value_id).unwrap();
                assert_eq!(value.as_bytes(), &blob_id[..]);
            }
            arbordb_codec::BlobRef::Inline(_) => panic!("expected an external blob id"),
        }
    }

    #[test]
    fn empty_list() {
        let (store, mut w) = writer();
        let id = write_list(&mut w, &[]).unwrap();
        w.flush().unwrap();

        assert_eq!(store.read_list(&id).unwrap(), Vec::new());
    }

    #[test]
    fn single_entry_list_points_at_the_entry() {
        let (store, mut w) = writer();
        let entry = write_block(&mut w, b"entry").unwrap();
        let id = write_list(&mut w, std::slice::from_ref(&entry)).unwrap();
        w.flush().unwrap();

        assert_eq!(store.read_list(&id).unwrap(), vec![entry]);
    }

    #[test]
    fn bucketed_list_roundtrip() {
        let (store, mut w) = writer();
        let mut ids = Vec::new();
        for i in 0..300u32 {
            ids.push(write_block(&mut w, &i.to_be_bytes()).unwrap());
        }
        let list = write_list(&mut w, &ids).unwrap();
        w.flush().unwrap();

        let read_back = store.read_list(&list).unwrap();
        assert_eq!(read_back, ids);
    }

    #[test]
    fn map_leaf_sorts_entries_by_hash() {
        let (store, mut w) = writer();
        let k1 = write_string(&mut w, "zebra").unwrap();
        let v1 = write_string(&mut w, "1").unwrap();
        let k2 = write_string(&mut w, "ant").unwrap();
        let v2 = write_string(&mut w, "2").unwrap();

        let entries = vec![
            MapEntry { hash: 9, key: k1.clone(), value: v1.clone() },
            MapEntry { hash: 3, key: k2.clone(), value: v2.clone() },
        ];
        let id = write_map_leaf(&mut w, 0, &entries).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_u32(id.number(), 0).unwrap(), 2);
        assert_eq!(segment.read_u32(id.number(), 4).unwrap(), 3);
        assert_eq!(segment.read_u32(id.number(), 8).unwrap(), 9);
        assert_eq!(segment.read_record_id(id.number(), 12).unwrap(), k2);
        assert_eq!(
            segment
                .read_record_id(id.number(), 12 + RECORD_REF_BYTES)
                .unwrap(),
            v2
        );
    }

    #[test]
    fn map_branch_head_word_packs_level_and_count() {
        let (store, mut w) = writer();
        let child = write_map_leaf(&mut w, 1, &[]).unwrap();
        let id = write_map_branch(&mut w, 0, 17, 0b1000_0001, std::slice::from_ref(&child))
            .unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_u32(id.number(), 0).unwrap(), 17);
        assert_eq!(segment.read_u32(id.number(), 4).unwrap(), 0b1000_0001);
        assert_eq!(segment.read_record_id(id.number(), 8).unwrap(), child);
    }

    #[test]
    fn template_roundtrip() {
        let (store, mut w) = writer();
        let primary = write_string(&mut w, "app:document").unwrap();
        let mixin = write_string(&mut w, "mix:versionable").unwrap();
        let names = write_list(&mut w, &[]).unwrap();

        let descriptor = TemplateDescriptor {
            primary_type: Some(primary.clone()),
            mixins: vec![mixin.clone()],
            children: ChildNodes::None,
            property_names: Some(names.clone()),
            property_types: vec![1, 2, 5],
        };
        let id = write_template(&mut w, &descriptor).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        let template = segment.read_template(id.number()).unwrap();

        assert_eq!(
            segment.resolve_ref(template.primary_type().unwrap()).unwrap(),
            primary
        );
        assert_eq!(template.mixins().len(), 1);
        assert_eq!(segment.resolve_ref(template.mixins()[0]).unwrap(), mixin);
        assert_eq!(template.children(), Children::None);
        assert_eq!(
            segment
                .resolve_ref(template.property_names().unwrap())
                .unwrap(),
            names
        );
        assert_eq!(template.property_types(), &[1, 2, 5]);
    }

    #[test]
    fn template_with_single_child() {
        let (store, mut w) = writer();
        let name = write_string(&mut w, "only-child").unwrap();
        let descriptor = TemplateDescriptor {
            primary_type: None,
            mixins: Vec::new(),
            children: ChildNodes::One(name.clone()),
            property_names: None,
            property_types: Vec::new(),
        };
        let id = write_template(&mut w, &descriptor).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        let template = segment.read_template(id.number()).unwrap();
        match template.children() {
            Children::One(r) => assert_eq!(segment.resolve_ref(r).unwrap(), name),
            other => panic!("expected a single child, got {other:?}"),
        }
    }

    #[test]
    fn template_property_consistency_is_enforced() {
        let (_store, mut w) = writer();
        let descriptor = TemplateDescriptor {
            primary_type: None,
            mixins: Vec::new(),
            children: ChildNodes::Many,
            property_names: None,
            property_types: vec![1],
        };
        assert!(matches!(
            write_template(&mut w, &descriptor),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    mod template_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]
            #[test]
            fn arbitrary_templates_roundtrip(
                has_primary in any::<bool>(),
                mixin_count in 0usize..4,
                mode in 0u8..3,
                property_count in 0usize..6,
            ) {
                let (store, mut w) = writer();

                let primary = has_primary
                    .then(|| write_string(&mut w, "t:primary").unwrap());
                let mixins: Vec<RecordId> = (0..mixin_count)
                    .map(|i| write_string(&mut w, &format!("t:mixin-{i}")).unwrap())
                    .collect();
                let children = match mode {
                    0 => ChildNodes::None,
                    1 => ChildNodes::Many,
                    _ => ChildNodes::One(write_string(&mut w, "t:child").unwrap()),
                };
                let property_names = (property_count > 0)
                    .then(|| write_list(&mut w, &[]).unwrap());
                let property_types: Vec<u8> =
                    (0..property_count).map(|i| i as u8).collect();

                let descriptor = TemplateDescriptor {
                    primary_type: primary.clone(),
                    mixins: mixins.clone(),
                    children: children.clone(),
                    property_names: property_names.clone(),
                    property_types: property_types.clone(),
                };
                let id = write_template(&mut w, &descriptor).unwrap();
                w.flush().unwrap();

                let segment = store.segment(id.segment_id()).unwrap();
                let template = segment.read_template(id.number()).unwrap();

                let resolve = |r| segment.resolve_ref(r).unwrap();
                prop_assert_eq!(template.primary_type().map(resolve), primary);
                let read_mixins: Vec<RecordId> =
                    template.mixins().iter().map(|r| resolve(*r)).collect();
                prop_assert_eq!(read_mixins, mixins);
                match (&children, template.children()) {
                    (ChildNodes::None, Children::None)
                    | (ChildNodes::Many, Children::Many) => {}
                    (ChildNodes::One(expected), Children::One(r)) => {
                        prop_assert_eq!(expected, &resolve(r));
                    }
                    (expected, got) => {
                        prop_assert!(false, "expected {:?}, got {:?}", expected, got);
                    }
                }
                prop_assert_eq!(
                    template.property_names().map(resolve),
                    property_names
                );
                prop_assert_eq!(template.property_types(), &property_types[..]);
            }
        }
    }

    #[test]
    fn node_without_stable_id_points_at_itself() {
        let (store, mut w) = writer();
        let child = write_block(&mut w, b"payload").unwrap();
        let id = write_node(&mut w, None, std::slice::from_ref(&child)).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_record_id(id.number(), 0).unwrap(), id);
        assert_eq!(
            segment
                .read_record_id(id.number(), RECORD_REF_BYTES)
                .unwrap(),
            child
        );
    }

    #[test]
    fn node_with_stable_id_keeps_it() {
        let (store, mut w) = writer();
        let stable = write_block(&mut w, b"origin").unwrap();
        let id = write_node(&mut w, Some(&stable), &[]).unwrap();
        w.flush().unwrap();

        let segment = store.segment(id.segment_id()).unwrap();
        assert_eq!(segment.read_record_id(id.number(), 0).unwrap(), stable);
    }
}
