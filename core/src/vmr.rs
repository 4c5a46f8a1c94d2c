//! VMR: ordered value/mask/action/priority rule sets bound to one table.
//!
//! Keys are [`BitVec`]s. Bit 0 is the most significant bit of the first key
//! field; fields are concatenated in table order with padding excluded.
//!
//! | Match kind | Accepted masks                                  |
//! |------------|-------------------------------------------------|
//! | exact      | all ones                                        |
//! | lpm        | contiguous run of ones from the most significant bit |
//! | ternary    | anything                                        |

use std::fmt;
use std::ops::Index;

use bitvec::prelude::*;

use crate::config::parse_int;
use crate::{ActionId, CompileError, MatchKind, Program, Result, TableId};

// ═══════════════════════════════════════════════════════════════════════════════
// Bit helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// `width` bits of `value`, most significant first. Widths above 64 are
/// zero-extended on the left; narrower widths keep the low bits.
#[must_use]
pub fn bits_from_u64(value: u64, width: usize) -> BitVec {
    (0..width)
        .map(|i| {
            let shift = width - 1 - i;
            shift < 64 && (value >> shift) & 1 == 1
        })
        .collect()
}

/// Integer value of a most-significant-first bit slice (low 64 bits).
#[must_use]
pub fn bits_to_u64(bits: &BitSlice) -> u64 {
    bits.iter()
        .by_vals()
        .fold(0u64, |acc, bit| (acc << 1) | u64::from(bit))
}

/// `true` if set mask bits form a run starting at the most significant bit.
#[must_use]
pub fn is_prefix(mask: &BitSlice) -> bool {
    mask.windows(2).all(|w| w[0] || !w[1])
}

// ═══════════════════════════════════════════════════════════════════════════════
// Actions
// ═══════════════════════════════════════════════════════════════════════════════

/// The action an entry executes, with or without runtime data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmrAction {
    /// A parameterless action reference.
    Unbound(ActionId),
    /// An action with concrete runtime data, one value per parameter.
    Bound {
        /// The action.
        action: ActionId,
        /// Runtime data.
        data: Vec<u64>,
    },
}

impl VmrAction {
    /// Bind `data` to `action`.
    #[must_use]
    pub fn bound(action: ActionId, data: Vec<u64>) -> Self {
        Self::Bound { action, data }
    }

    /// The referenced action.
    #[must_use]
    pub fn action(&self) -> ActionId {
        match self {
            Self::Unbound(action) | Self::Bound { action, .. } => *action,
        }
    }

    /// Runtime data (empty when unbound).
    #[must_use]
    pub fn data(&self) -> &[u64] {
        match self {
            Self::Unbound(_) => &[],
            Self::Bound { data, .. } => data,
        }
    }

    /// Semantic equality: same action, and data equal once each value is
    /// truncated to the declared width of its parameter.
    #[must_use]
    pub fn equivalent(&self, program: &Program, other: &Self) -> bool {
        if self.action() != other.action() || self.data().len() != other.data().len() {
            return false;
        }
        let widths = program.action(self.action()).param_widths();
        self.data()
            .iter()
            .zip(other.data())
            .enumerate()
            .all(|(i, (&x, &y))| match widths.get(i) {
                Some(&w) if w < 64 => {
                    let mask = (1u64 << w) - 1;
                    x & mask == y & mask
                }
                _ => x == y,
            })
    }

    /// Check the data against the action signature.
    pub(crate) fn check_signature(&self, program: &Program) -> Result<()> {
        let action = program.action(self.action());
        if action.arity() != self.data().len() {
            return Err(CompileError::invalid_argument(format!(
                "action {} expects {} runtime values, got {}",
                action.name(),
                action.arity(),
                self.data().len()
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Entries
// ═══════════════════════════════════════════════════════════════════════════════

/// One prioritized match entry. Higher priority wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmrEntry {
    /// Match value.
    pub value: BitVec,
    /// Match mask (`true` = bit is compared).
    pub mask: BitVec,
    /// Action executed on a hit.
    pub action: VmrAction,
    /// Entry priority.
    pub priority: u64,
}

impl VmrEntry {
    /// Create an entry.
    ///
    /// # Errors
    ///
    /// [`CompileError::BitWidthMismatch`] if value and mask lengths differ.
    pub fn new(value: BitVec, mask: BitVec, action: VmrAction, priority: u64) -> Result<Self> {
        if value.len() != mask.len() {
            return Err(CompileError::BitWidthMismatch {
                expected: value.len(),
                actual: mask.len(),
                context: "entry mask".to_owned(),
            });
        }
        Ok(Self {
            value,
            mask,
            action,
            priority,
        })
    }

    /// Create an entry from a ternary pattern such as `"01*1"`.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] for characters other than `0`, `1`, `*`.
    pub fn ternary(pattern: &str, action: VmrAction, priority: u64) -> Result<Self> {
        let mut value = BitVec::with_capacity(pattern.len());
        let mut mask = BitVec::with_capacity(pattern.len());
        for c in pattern.chars() {
            let (v, m) = match c {
                '0' => (false, true),
                '1' => (true, true),
                '*' => (false, false),
                other => {
                    return Err(CompileError::invalid_argument(format!(
                        "unexpected character {other:?} in ternary pattern {pattern:?}"
                    )))
                }
            };
            value.push(v);
            mask.push(m);
        }
        Self::new(value, mask, action, priority)
    }

    /// Key width in bits.
    #[must_use]
    pub fn width(&self) -> usize {
        self.value.len()
    }

    /// `true` if `key` agrees with the value on every masked bit.
    #[must_use]
    pub fn matches(&self, key: &BitSlice) -> bool {
        key.len() == self.width()
            && self
                .mask
                .iter()
                .by_vals()
                .zip(self.value.iter().by_vals().zip(key.iter().by_vals()))
                .all(|(m, (v, k))| !m || v == k)
    }

    /// Ternary rendering of value and mask (`0`, `1`, `*`).
    #[must_use]
    pub fn pattern(&self) -> String {
        self.value
            .iter()
            .by_vals()
            .zip(self.mask.iter().by_vals())
            .map(|(v, m)| match (m, v) {
                (false, _) => '*',
                (true, false) => '0',
                (true, true) => '1',
            })
            .collect()
    }
}

impl fmt::Display for VmrEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} => {:?} @{}",
            self.pattern(),
            self.action,
            self.priority
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-field match parameters
// ═══════════════════════════════════════════════════════════════════════════════

/// An externally supplied match on one key field, before canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchParam {
    /// Exact value.
    Exact {
        /// Field value.
        value: u64,
    },
    /// Value with a prefix length.
    Lpm {
        /// Field value.
        value: u64,
        /// Number of leading bits compared.
        prefix_len: usize,
    },
    /// Value with an arbitrary mask.
    Ternary {
        /// Field value.
        value: u64,
        /// Field mask.
        mask: u64,
    },
}

impl MatchParam {
    /// Parse `"5"`, `"10/2"` (value/prefix length) or `"0x2&&&0x3"` (value&&&mask).
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] for malformed numbers.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((value, mask)) = s.split_once("&&&") {
            return Ok(Self::Ternary {
                value: parse_int(value)?,
                mask: parse_int(mask)?,
            });
        }
        if let Some((value, prefix_len)) = s.split_once('/') {
            let prefix_len = usize::try_from(parse_int(prefix_len)?).map_err(|_| {
                CompileError::invalid_argument(format!("prefix length out of range in {s:?}"))
            })?;
            return Ok(Self::Lpm {
                value: parse_int(value)?,
                prefix_len,
            });
        }
        Ok(Self::Exact {
            value: parse_int(s)?,
        })
    }

    fn to_bits(self, width: usize) -> std::result::Result<(BitVec, BitVec), String> {
        let (value, mask) = match self {
            Self::Exact { value } | Self::Lpm { value, .. } => (value, 0),
            Self::Ternary { value, mask } => (value, mask),
        };
        if width < 64 && (value >> width != 0 || mask >> width != 0) {
            return Err(format!(
                "value {value:#x} or mask {mask:#x} does not fit field width {width}"
            ));
        }
        match self {
            Self::Exact { value } => Ok((bits_from_u64(value, width), BitVec::repeat(true, width))),
            Self::Lpm { value, prefix_len } => {
                if prefix_len > width {
                    return Err(format!(
                        "prefix length {prefix_len} exceeds field width {width}"
                    ));
                }
                let mut mask = BitVec::repeat(false, width);
                mask[..prefix_len].fill(true);
                Ok((bits_from_u64(value, width), mask))
            }
            Self::Ternary { value, mask } => {
                Ok((bits_from_u64(value, width), bits_from_u64(mask, width)))
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule set
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered, prioritized entries bound to one table, plus an optional default.
///
/// Entry order is not a priority guarantee; priority is explicit per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vmr {
    table: TableId,
    bit_width: usize,
    entries: Vec<VmrEntry>,
    default_action: Option<VmrAction>,
}

impl Vmr {
    /// Create an empty rule set for `table`; the width is the table key width.
    #[must_use]
    pub fn new(program: &Program, table: TableId) -> Self {
        Self {
            table,
            bit_width: program.table_key_width(table),
            entries: Vec::new(),
            default_action: None,
        }
    }

    /// An empty, compatible rule set bound to a different table.
    #[must_use]
    pub fn create_instance(&self, program: &Program, table: TableId) -> Self {
        Self::new(program, table)
    }

    /// Bound table.
    #[must_use]
    pub fn table(&self) -> TableId {
        self.table
    }

    /// Key width in bits.
    #[must_use]
    pub fn bit_width(&self) -> usize {
        self.bit_width
    }

    /// Number of non-default entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if there are no non-default entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in order.
    #[must_use]
    pub fn entries(&self) -> &[VmrEntry] {
        &self.entries
    }

    /// Iterate over entries in order.
    pub fn iter(&self) -> std::slice::Iter<'_, VmrEntry> {
        self.entries.iter()
    }

    /// Entry at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&VmrEntry> {
        self.entries.get(index)
    }

    /// Append an entry.
    ///
    /// # Errors
    ///
    /// [`CompileError::BitWidthMismatch`] if the entry width differs from [`bit_width`](Self::bit_width).
    pub fn push(&mut self, entry: VmrEntry) -> Result<()> {
        self.check_width(&entry)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Replace the entry at `index`.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if out of bounds, or a width mismatch.
    pub fn set(&mut self, index: usize, entry: VmrEntry) -> Result<()> {
        self.check_width(&entry)?;
        let len = self.entries.len();
        let slot = self
            .entries
            .get_mut(index)
            .ok_or_else(|| out_of_bounds(index, len))?;
        *slot = entry;
        Ok(())
    }

    /// Insert an entry before `index` (`index == len` appends).
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if out of bounds, or a width mismatch.
    pub fn insert(&mut self, index: usize, entry: VmrEntry) -> Result<()> {
        self.check_width(&entry)?;
        if index > self.entries.len() {
            return Err(out_of_bounds(index, self.entries.len()));
        }
        self.entries.insert(index, entry);
        Ok(())
    }

    /// Remove and return the entry at `index`.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] if out of bounds.
    pub fn remove(&mut self, index: usize) -> Result<VmrEntry> {
        if index >= self.entries.len() {
            return Err(out_of_bounds(index, self.entries.len()));
        }
        Ok(self.entries.remove(index))
    }

    /// Action executed when no entry matches.
    #[must_use]
    pub fn default_action(&self) -> Option<&VmrAction> {
        self.default_action.as_ref()
    }

    /// Set or clear the default action.
    pub fn set_default_action(&mut self, action: Option<VmrAction>) {
        self.default_action = action;
    }

    /// Highest-priority entry matching `key`, ties going to the earlier entry.
    #[must_use]
    pub fn lookup(&self, key: &BitSlice) -> Option<&VmrEntry> {
        self.entries
            .iter()
            .filter(|e| e.matches(key))
            .fold(None, |best: Option<&VmrEntry>, e| match best {
                Some(b) if b.priority >= e.priority => Some(b),
                _ => Some(e),
            })
    }

    /// Check that this rule set fits the key of `table`.
    ///
    /// # Errors
    ///
    /// [`CompileError::BitWidthMismatch`] when widths differ.
    pub fn check_compatible(&self, program: &Program, table: TableId) -> Result<()> {
        let expected = program.table_key_width(table);
        if expected != self.bit_width {
            return Err(CompileError::BitWidthMismatch {
                expected,
                actual: self.bit_width,
                context: format!("rule set for table {}", program.table(table).name()),
            });
        }
        Ok(())
    }

    /// Build an entry for `table` from one [`MatchParam`] per key field.
    ///
    /// Sub-fields are concatenated in table field order. Exact fields must
    /// carry an all-ones mask and lpm fields a prefix mask.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidMask`] on a mask violation,
    /// [`CompileError::InvalidArgument`] if the parameter count differs from
    /// the number of key fields.
    pub fn canonicalize(
        program: &Program,
        table: TableId,
        params: &[MatchParam],
        action: VmrAction,
        priority: u64,
    ) -> Result<VmrEntry> {
        let t = program.table(table);
        let key: Vec<_> = t
            .match_fields()
            .iter()
            .filter(|mf| !program.field(mf.field).is_padding())
            .collect();
        if key.len() != params.len() {
            return Err(CompileError::invalid_argument(format!(
                "table {} has {} key fields, got {} match parameters",
                t.name(),
                key.len(),
                params.len()
            )));
        }

        let mut value = BitVec::new();
        let mut mask = BitVec::new();
        for (mf, param) in key.into_iter().zip(params) {
            let field = program.field(mf.field);
            let invalid = |reason: String| CompileError::InvalidMask {
                table: t.name().to_owned(),
                field: program.field_path(mf.field),
                reason,
            };
            let (v, m) = param.to_bits(field.width()).map_err(&invalid)?;
            match mf.kind {
                MatchKind::Exact if !m.all() => {
                    return Err(invalid("exact match requires an all-ones mask".to_owned()));
                }
                MatchKind::Lpm if !is_prefix(&m) => {
                    return Err(invalid(
                        "prefix match requires a contiguous mask from the most significant bit"
                            .to_owned(),
                    ));
                }
                _ => {}
            }
            value.extend_from_bitslice(&v);
            mask.extend_from_bitslice(&m);
        }
        VmrEntry::new(value, mask, action, priority)
    }

    fn check_width(&self, entry: &VmrEntry) -> Result<()> {
        if entry.width() != self.bit_width || entry.mask.len() != self.bit_width {
            return Err(CompileError::BitWidthMismatch {
                expected: self.bit_width,
                actual: entry.width(),
                context: "rule-set entry".to_owned(),
            });
        }
        Ok(())
    }
}

fn out_of_bounds(index: usize, len: usize) -> CompileError {
    CompileError::invalid_argument(format!(
        "entry index {index} out of bounds for rule set of length {len}"
    ))
}

impl Index<usize> for Vmr {
    type Output = VmrEntry;

    fn index(&self, index: usize) -> &VmrEntry {
        &self.entries[index]
    }
}

impl<'a> IntoIterator for &'a Vmr {
    type Item = &'a VmrEntry;
    type IntoIter = std::slice::Iter<'a, VmrEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
