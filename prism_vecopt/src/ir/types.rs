//! Scalar element types seen by the vectorizer.
//!
//! Trace values are either machine words (`i64`) or doubles (`f64`). Narrower
//! integers only exist in memory: a `RawLoad` of a 4-byte element produces a
//! word whose *element width* is still 4, which is what decides how many
//! lanes of that value fit into one vector register.

use std::fmt;

/// Size of a machine word in bytes.
pub const WORD_SIZE: usize = 8;

// =============================================================================
// Datatype
// =============================================================================

/// Register class of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    /// Integer (or pointer) value.
    Int,
    /// IEEE-754 floating point value.
    Float,
    /// Operation without a result.
    Void,
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datatype::Int => write!(f, "i"),
            Datatype::Float => write!(f, "f"),
            Datatype::Void => write!(f, "v"),
        }
    }
}

// =============================================================================
// Element Type
// =============================================================================

/// Element type of a value: register class plus the width of one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElemType {
    /// Register class.
    pub datatype: Datatype,
    /// Bytes occupied by one lane.
    pub bytes: usize,
    /// Whether narrow integer lanes are sign extended.
    pub signed: bool,
}

impl ElemType {
    /// A full machine word integer.
    pub const WORD: ElemType = ElemType {
        datatype: Datatype::Int,
        bytes: WORD_SIZE,
        signed: true,
    };

    /// A double.
    pub const FLOAT: ElemType = ElemType {
        datatype: Datatype::Float,
        bytes: 8,
        signed: true,
    };

    /// No value.
    pub const VOID: ElemType = ElemType {
        datatype: Datatype::Void,
        bytes: 0,
        signed: false,
    };

    /// Integer lane of the given width.
    pub const fn int(bytes: usize, signed: bool) -> Self {
        ElemType {
            datatype: Datatype::Int,
            bytes,
            signed,
        }
    }

    /// Check if this is a floating point element.
    #[inline]
    pub fn is_float(&self) -> bool {
        self.datatype == Datatype::Float
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.datatype, self.bytes * 8)
    }
}

// =============================================================================
// Array Descriptor
// =============================================================================

/// Describes the elements addressed by a raw memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayDescr {
    /// Size of one element in bytes.
    pub item_size: usize,
    /// Register class of an element.
    pub datatype: Datatype,
    /// Whether narrow integer elements are sign extended when loaded.
    pub signed: bool,
}

impl ArrayDescr {
    /// Signed integer elements of `item_size` bytes.
    pub const fn int(item_size: usize) -> Self {
        ArrayDescr {
            item_size,
            datatype: Datatype::Int,
            signed: true,
        }
    }

    /// Unsigned integer elements of `item_size` bytes.
    pub const fn uint(item_size: usize) -> Self {
        ArrayDescr {
            item_size,
            datatype: Datatype::Int,
            signed: false,
        }
    }

    /// Double elements.
    pub const fn float() -> Self {
        ArrayDescr {
            item_size: 8,
            datatype: Datatype::Float,
            signed: true,
        }
    }

    /// Element type produced by a load through this descriptor.
    pub fn elem_type(&self) -> ElemType {
        ElemType {
            datatype: self.datatype,
            bytes: self.item_size,
            signed: self.signed,
        }
    }
}
