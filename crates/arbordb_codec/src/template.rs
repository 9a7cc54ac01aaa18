//! The packed template record.
//!
//! A template captures the parts of a node that change rarely: primary
//! type, mixin types, child-node mode and the property shape. The record
//! starts with a 32-bit header
//!
//! ```text
//! ABCD EEEE  EEEE EEFF  FFFF FFFF  FFFF FFFF
//! ```
//!
//! where `A` marks a primary type, `B` a non-empty mixin list, `C` a node
//! with no children, `D` a node with more than one child, `E` is the 10-bit
//! mixin count and `F` the 18-bit property count. The body then carries, in
//! order: the primary type reference, the mixin references, the sole-child
//! name reference (only when neither `C` nor `D` is set), and the
//! property-name list reference followed by one type byte per property
//! (only when `F > 0`).

use crate::error::{CodecError, CodecResult};
use crate::ids::RecordRef;

/// Maximum number of mixin types a template can carry.
pub const MAX_MIXIN_COUNT: usize = (1 << 10) - 1;

/// Maximum number of properties a template can carry.
pub const MAX_PROPERTY_COUNT: usize = (1 << 18) - 1;

/// The child-node mode of a template.
///
/// A node either has no children, many children, or exactly one child whose
/// name is stored by reference. The enum makes the three modes mutually
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Children {
    /// The node has no child nodes.
    None,
    /// The node has more than one child node.
    Many,
    /// The node has exactly one child; the reference points at its name.
    One(RecordRef),
}

/// A decoded template record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Template {
    primary_type: Option<RecordRef>,
    mixins: Vec<RecordRef>,
    children: Children,
    property_names: Option<RecordRef>,
    property_types: Vec<u8>,
}

impl Template {
    /// Starts building a template.
    #[must_use]
    pub fn builder() -> TemplateBuilder {
        TemplateBuilder::default()
    }

    /// Returns the reference to the primary type name, if any.
    #[must_use]
    pub fn primary_type(&self) -> Option<RecordRef> {
        self.primary_type
    }

    /// Returns the references to the mixin type names.
    #[must_use]
    pub fn mixins(&self) -> &[RecordRef] {
        &self.mixins
    }

    /// Returns the child-node mode.
    #[must_use]
    pub fn children(&self) -> Children {
        self.children
    }

    /// Returns the reference to the property-name list, if the node has
    /// properties.
    #[must_use]
    pub fn property_names(&self) -> Option<RecordRef> {
        self.property_names
    }

    /// Returns one type byte per property.
    #[must_use]
    pub fn property_types(&self) -> &[u8] {
        &self.property_types
    }

    /// Packs the 32-bit header for this template.
    #[must_use]
    pub fn header(&self) -> u32 {
        pack_header(
            self.primary_type.is_some(),
            !self.mixins.is_empty(),
            matches!(self.children, Children::None),
            matches!(self.children, Children::Many),
            self.mixins.len(),
            self.property_types.len(),
        )
    }
}

/// Packs the template header bits.
#[must_use]
pub fn pack_header(
    has_primary: bool,
    has_mixins: bool,
    no_children: bool,
    many_children: bool,
    mixin_count: usize,
    property_count: usize,
) -> u32 {
    let mut header = (property_count as u32) & 0x3_FFFF;
    header |= ((mixin_count as u32) & 0x3FF) << 18;
    if many_children {
        header |= 1 << 28;
    }
    if no_children {
        header |= 1 << 29;
    }
    if has_mixins {
        header |= 1 << 30;
    }
    if has_primary {
        header |= 1 << 31;
    }
    header
}

/// Unpacked template header bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateHeader {
    /// The template has a primary type reference.
    pub has_primary: bool,
    /// The template has a non-empty mixin list.
    pub has_mixins: bool,
    /// The node has no child nodes.
    pub no_children: bool,
    /// The node has more than one child node.
    pub many_children: bool,
    /// Number of mixin references.
    pub mixin_count: usize,
    /// Number of properties.
    pub property_count: usize,
}

/// Unpacks a 32-bit template header.
#[must_use]
pub fn unpack_header(header: u32) -> TemplateHeader {
    TemplateHeader {
        has_primary: header & (1 << 31) != 0,
        has_mixins: header & (1 << 30) != 0,
        no_children: header & (1 << 29) != 0,
        many_children: header & (1 << 28) != 0,
        mixin_count: ((header >> 18) & 0x3FF) as usize,
        property_count: (header & 0x3_FFFF) as usize,
    }
}

/// Builder for [`Template`].
#[derive(Debug, Default)]
pub struct TemplateBuilder {
    primary_type: Option<RecordRef>,
    mixins: Vec<RecordRef>,
    children: Option<Children>,
    property_names: Option<RecordRef>,
    property_types: Vec<u8>,
}

impl TemplateBuilder {
    /// Sets the primary type reference.
    #[must_use]
    pub fn primary_type(mut self, id: RecordRef) -> Self {
        self.primary_type = Some(id);
        self
    }

    /// Sets the mixin type references.
    #[must_use]
    pub fn mixins(mut self, ids: Vec<RecordRef>) -> Self {
        self.mixins = ids;
        self
    }

    /// Sets the child-node mode.
    #[must_use]
    pub fn children(mut self, children: Children) -> Self {
        self.children = Some(children);
        self
    }

    /// Sets the property-name list reference and the per-property type
    /// bytes.
    #[must_use]
    pub fn properties(mut self, names: RecordRef, types: Vec<u8>) -> Self {
        self.property_names = Some(names);
        self.property_types = types;
        self
    }

    /// Builds the template.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidTemplate`] if the mixin or property
    /// counts exceed their header fields, or if a property-name list is
    /// present without property types (or vice versa).
    pub fn build(self) -> CodecResult<Template> {
        if self.mixins.len() > MAX_MIXIN_COUNT {
            return Err(CodecError::invalid_template(format!(
                "{} mixins exceed the maximum of {MAX_MIXIN_COUNT}",
                self.mixins.len()
            )));
        }
        if self.property_types.len() > MAX_PROPERTY_COUNT {
            return Err(CodecError::invalid_template(format!(
                "{} properties exceed the maximum of {MAX_PROPERTY_COUNT}",
                self.property_types.len()
            )));
        }
        if self.property_names.is_some() != !self.property_types.is_empty() {
            return Err(CodecError::invalid_template(
                "property names and property types must be given together",
            ));
        }
        Ok(Template {
            primary_type: self.primary_type,
            mixins: self.mixins,
            children: self.children.unwrap_or(Children::Many),
            property_names: self.property_names,
            property_types: self.property_types,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_bits() {
        let header = pack_header(true, true, false, true, 3, 7);
        assert_eq!(header >> 31, 1);
        assert_eq!((header >> 30) & 1, 1);
        assert_eq!((header >> 29) & 1, 0);
        assert_eq!((header >> 28) & 1, 1);
        assert_eq!((header >> 18) & 0x3FF, 3);
        assert_eq!(header & 0x3_FFFF, 7);
    }

    #[test]
    fn single_child_excludes_other_modes() {
        let t = Template::builder()
            .children(Children::One(RecordRef::new(0, 9)))
            .build()
            .unwrap();
        let h = unpack_header(t.header());
        assert!(!h.no_children);
        assert!(!h.many_children);
    }

    #[test]
    fn property_names_require_types() {
        let result = Template::builder()
            .properties(RecordRef::new(0, 1), Vec::new())
            .build();
        assert!(matches!(result, Err(CodecError::InvalidTemplate { .. })));
    }

    #[test]
    fn mixin_overflow_is_rejected() {
        let mixins = vec![RecordRef::new(0, 0); MAX_MIXIN_COUNT + 1];
        let result = Template::builder().mixins(mixins).build();
        assert!(matches!(result, Err(CodecError::InvalidTemplate { .. })));
    }

    proptest! {
        #[test]
        fn header_roundtrip(
            has_primary in any::<bool>(),
            has_mixins in any::<bool>(),
            mode in 0u8..3,
            mixin_count in 0usize..=MAX_MIXIN_COUNT,
            property_count in 0usize..=MAX_PROPERTY_COUNT,
        ) {
            let (no_children, many_children) = match mode {
                0 => (true, false),
                1 => (false, true),
                _ => (false, false),
            };
            let header = pack_header(
                has_primary, has_mixins, no_children, many_children,
                mixin_count, property_count,
            );
            let unpacked = unpack_header(header);
            prop_assert_eq!(unpacked.has_primary, has_primary);
            prop_assert_eq!(unpacked.has_mixins, has_mixins);
            prop_assert_eq!(unpacked.no_children, no_children);
            prop_assert_eq!(unpacked.many_children, many_children);
            prop_assert_eq!(unpacked.mixin_count, mixin_count);
            prop_assert_eq!(unpacked.property_count, property_count);
        }
    }
}
