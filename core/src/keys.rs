//! Key construction from arbitrary bit ranges of existing fields.
//!
//! A re-keyed table matches on a single new field that a setup action fills
//! by concatenating bit ranges of the original key fields. The ranges come
//! from [`bits_to_subkeys`]; the field and its setup action from
//! [`KeyConstructor::add`].

use log::debug;

use crate::session::PrimitiveCache;
use crate::{
    ActionId, CallArg, CompileError, FieldId, HeaderId, InstanceId, Namespace, Program, Result,
};

/// A bit range `[start, end)` of one field, counted from its most significant bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subkey {
    /// Source field.
    pub field: FieldId,
    /// First bit (inclusive).
    pub start: usize,
    /// Last bit (exclusive).
    pub end: usize,
}

impl Subkey {
    /// Create a subkey.
    #[must_use]
    pub fn new(field: FieldId, start: usize, end: usize) -> Self {
        Self { field, start, end }
    }

    /// Number of bits covered.
    #[must_use]
    pub fn width(&self) -> usize {
        self.end - self.start
    }
}

/// Translate global key bit indices into the minimal ordered list of subkeys.
///
/// `fields` is the padding-free key of a table in match order; bit `i` is the
/// `i`-th bit of their concatenation. The result reproduces `bits` in exactly
/// the requested order. A new subkey starts whenever the next index is not
/// the previous one plus one, or when a run crosses a field boundary.
/// Repeated or backward indices are allowed.
///
/// # Errors
///
/// [`CompileError::InvalidArgument`] if an index is past the end of the key.
///
/// # Example
///
/// ```
/// # use p4t::prelude::*;
/// # use p4t::{bits_to_subkeys, Subkey};
/// let mut program = Program::new();
/// let header = program.add_header("h_t").unwrap();
/// program.add_header_field(header, "x", 4).unwrap();
/// let h = program.add_instance(header, "h", true).unwrap();
/// let x = program.instance_field(h, "x").unwrap();
///
/// let subkeys = bits_to_subkeys(&program, &[x], &[0, 2]).unwrap();
/// assert_eq!(subkeys, [Subkey::new(x, 0, 1), Subkey::new(x, 2, 3)]);
/// ```
pub fn bits_to_subkeys(program: &Program, fields: &[FieldId], bits: &[usize]) -> Result<Vec<Subkey>> {
    let bit_map: Vec<(FieldId, usize)> = fields
        .iter()
        .flat_map(|&f| (0..program.field(f).width()).map(move |offset| (f, offset)))
        .collect();

    let mut subkeys: Vec<Subkey> = Vec::new();
    let mut previous: Option<usize> = None;
    for &bit in bits {
        let &(field, offset) = bit_map.get(bit).ok_or_else(|| {
            CompileError::invalid_argument(format!(
                "bit {bit} is out of range for a {}-bit key",
                bit_map.len()
            ))
        })?;
        let continues = previous.is_some_and(|p| p + 1 == bit);
        match subkeys.last_mut() {
            Some(last) if continues && last.field == field => last.end = offset + 1,
            _ => subkeys.push(Subkey::new(field, offset, offset + 1)),
        }
        previous = Some(bit);
    }
    Ok(subkeys)
}

/// Allocates key fields in a shared scratch header and emits their setup actions.
///
/// One constructor exists per compilation session. Its header (`keys_t`) and
/// instance (`keys`) are named in the session namespace; key field names get
/// their own flat namespace so they stay short.
#[derive(Debug, Clone)]
pub struct KeyConstructor {
    header: HeaderId,
    instance: InstanceId,
    fields: Namespace,
}

impl KeyConstructor {
    /// Create the scratch header and its metadata instance.
    ///
    /// # Errors
    ///
    /// Propagates name clashes from the [`Program`].
    pub fn new(program: &mut Program, namespace: &mut Namespace) -> Result<Self> {
        let header = program.add_header(&namespace.nested_name("keys_t"))?;
        let instance = program.add_instance(header, &namespace.nested_name("keys"), true)?;
        Ok(Self {
            header,
            instance,
            fields: Namespace::root(),
        })
    }

    /// Scratch header type.
    #[must_use]
    pub fn header(&self) -> HeaderId {
        self.header
    }

    /// Scratch header instance holding every key field.
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Allocate a key field of width `Σ subkey widths` and a setup action
    /// that fills it by calling `compress_k` with the destination first, then
    /// `(source, from, to)` per subkey.
    ///
    /// # Errors
    ///
    /// [`CompileError::InvalidArgument`] for an empty subkey list or a range
    /// outside its field.
    pub fn add(
        &mut self,
        program: &mut Program,
        namespace: &mut Namespace,
        primitives: &mut PrimitiveCache,
        name: &str,
        subkeys: &[Subkey],
    ) -> Result<(FieldId, ActionId)> {
        if subkeys.is_empty() {
            return Err(CompileError::invalid_argument(format!(
                "key {name} needs at least one subkey"
            )));
        }
        for subkey in subkeys {
            let width = program.field(subkey.field).width();
            if subkey.start >= subkey.end || subkey.end > width {
                return Err(CompileError::invalid_argument(format!(
                    "subkey [{}, {}) does not fit {} ({width} bits)",
                    subkey.start,
                    subkey.end,
                    program.field_path(subkey.field)
                )));
            }
        }

        let total: usize = subkeys.iter().map(Subkey::width).sum();
        let key_name = self.fields.nested_name(name);
        program.add_header_field(self.header, &key_name, total)?;
        let key = program.instance_field(self.instance, &key_name)?;

        let compress = primitives.compress(program, subkeys.len())?;
        let setup = program.add_action(&namespace.nested_name(&format!("compress_{key_name}")), vec![])?;
        let mut args = vec![CallArg::Field(key)];
        for subkey in subkeys {
            args.push(CallArg::Field(subkey.field));
            args.push(CallArg::Value(subkey.start as u64));
            args.push(CallArg::Value(subkey.end as u64));
        }
        program.add_call(setup, compress, args)?;

        debug!(
            "key {} ({total} bits) from {} subkeys",
            program.field_path(key),
            subkeys.len()
        );
        Ok((key, setup))
    }
}
