//! XDR wire codec and the process-wide type registry.
//!
//! The wire grammar is network byte order with 4-byte alignment:
//!
//! - `u32`/`i32`: 4 bytes big-endian.
//! - `u64`/`i64`: two u32 words, high then low.
//! - `f32`/`f64`: raw IEEE bits in network order.
//! - byte array: N bytes plus zero padding to a 4-byte boundary; the length
//!   travels in a *sibling* count field, never as a prefix.
//! - string: u32 length prefix, bytes, zero padding.
//! - struct: fields concatenated in declaration order.
//! - union: u32 type tag, then the payload encoded per the registered codec
//!   for that tag.
//!
//! Every message type is described by a [`Codec`]. Most implementations are
//! the declarative [`StructCodec`], which interprets a [`FieldDef`] table to
//! encode, decode, print (human, key=value, CSV) and scan textual
//! parameters. Types whose shape does not fit a flat field table implement
//! [`Codec`] by hand.
//!
//! The [`XdrRegistry`] maps type ids to codecs and data-request populators.
//! It is populated during process initialization and treated as read-only
//! once the event loop runs.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use log::warn;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XdrError {
    #[error("buffer truncated: needed {needed} bytes, {have} available")]
    Truncated { needed: usize, have: usize },
    #[error("no codec registered for type {0:#010x}")]
    UnknownType(u32),
    #[error("value is not a `{0}`")]
    ValueType(&'static str),
    #[error("unknown parameter key `{0}`")]
    UnknownField(String),
    #[error("cannot parse `{text}` as {what}")]
    Parse { what: &'static str, text: String },
    #[error("variable-length field has no preceding count field")]
    MissingCount,
    #[error("field does not accept textual input")]
    NotScannable,
}

pub type XdrResult<T> = Result<T, XdrError>;

// ---------------------------------------------------------------------------
// Primitive encoders/decoders
// ---------------------------------------------------------------------------

fn need(buf: &[u8], n: usize) -> XdrResult<()> {
    if buf.len() < n {
        return Err(XdrError::Truncated {
            needed: n,
            have: buf.len(),
        });
    }
    Ok(())
}

fn pad_len(n: usize) -> usize {
    (4 - n % 4) % 4
}

pub fn encode_u32(v: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn decode_u32(buf: &[u8]) -> XdrResult<(u32, usize)> {
    need(buf, 4)?;
    Ok((u32::from_be_bytes(buf[..4].try_into().unwrap()), 4))
}

pub fn encode_i32(v: i32, out: &mut Vec<u8>) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn decode_i32(buf: &[u8]) -> XdrResult<(i32, usize)> {
    need(buf, 4)?;
    Ok((i32::from_be_bytes(buf[..4].try_into().unwrap()), 4))
}

pub fn encode_u64(v: u64, out: &mut Vec<u8>) {
    encode_u32((v >> 32) as u32, out);
    encode_u32(v as u32, out);
}

pub fn decode_u64(buf: &[u8]) -> XdrResult<(u64, usize)> {
    let (hi, _) = decode_u32(buf)?;
    let (lo, _) = decode_u32(&buf[4..])?;
    Ok((((hi as u64) << 32) | lo as u64, 8))
}

pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
    encode_i32((v >> 32) as i32, out);
    encode_u32(v as u32, out);
}

pub fn decode_i64(buf: &[u8]) -> XdrResult<(i64, usize)> {
    let (hi, _) = decode_i32(buf)?;
    let (lo, _) = decode_u32(&buf[4..])?;
    Ok((((hi as i64) << 32) | lo as i64, 8))
}

pub fn encode_f32(v: f32, out: &mut Vec<u8>) {
    encode_u32(v.to_bits(), out);
}

pub fn decode_f32(buf: &[u8]) -> XdrResult<(f32, usize)> {
    let (bits, n) = decode_u32(buf)?;
    Ok((f32::from_bits(bits), n))
}

pub fn encode_f64(v: f64, out: &mut Vec<u8>) {
    encode_u64(v.to_bits(), out);
}

pub fn decode_f64(buf: &[u8]) -> XdrResult<(f64, usize)> {
    let (bits, n) = decode_u64(buf)?;
    Ok((f64::from_bits(bits), n))
}

/// Bytes plus zero padding; the count travels in a sibling field.
pub fn encode_bytes(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(data);
    out.extend(std::iter::repeat_n(0u8, pad_len(data.len())));
}

pub fn decode_bytes(buf: &[u8], count: usize) -> XdrResult<(Vec<u8>, usize)> {
    let total = count + pad_len(count);
    need(buf, total)?;
    Ok((buf[..count].to_vec(), total))
}

/// Length-prefixed string (only valid inside an array context on the wire).
pub fn encode_string(s: &str, out: &mut Vec<u8>) {
    encode_u32(s.len() as u32, out);
    encode_bytes(s.as_bytes(), out);
}

pub fn decode_string(buf: &[u8]) -> XdrResult<(String, usize)> {
    let (len, used) = decode_u32(buf)?;
    let (bytes, n) = decode_bytes(&buf[used..], len as usize)?;
    Ok((String::from_utf8_lossy(&bytes).into_owned(), used + n))
}

/// Uppercase hex, no separators.
pub fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = fmt::Write::write_fmt(&mut s, format_args!("{b:02X}"));
    }
    s
}

/// Parse hex text back into bytes; invalid digits read as zero.
pub fn parse_hex(text: &str) -> Vec<u8> {
    let digits: Vec<u8> = text
        .bytes()
        .map(|c| (c as char).to_digit(16).unwrap_or(0) as u8)
        .collect();
    digits
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
        .collect()
}

// ---------------------------------------------------------------------------
// Values and unions
// ---------------------------------------------------------------------------

/// A type-tagged payload.
///
/// Decoded payloads are owned boxes; dropping the union releases them.
/// A `None` payload encodes as an empty body and is only meaningful for
/// types whose encoding is empty (the void type).
pub struct UnionValue {
    pub type_id: u32,
    pub data: Option<Box<dyn Any>>,
}

impl Default for UnionValue {
    fn default() -> Self {
        UnionValue {
            type_id: 0,
            data: None,
        }
    }
}

impl UnionValue {
    pub fn new<T: Any>(type_id: u32, value: T) -> Self {
        UnionValue {
            type_id,
            data: Some(Box::new(value)),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|d| d.downcast_ref())
    }
}

impl fmt::Debug for UnionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionValue")
            .field("type_id", &self.type_id)
            .field("data", &self.data.as_ref().map(|_| ".."))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Codec trait
// ---------------------------------------------------------------------------

/// Textual rendering form for decoded structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintStyle {
    /// Numbered lines with field names, unit scaling and unit suffixes.
    Human,
    /// `key=value` pairs, one per line.
    KeyValue,
    /// CSV header row of field keys.
    CsvHeader,
    /// CSV data row.
    CsvData,
}

/// `(value / divisor) + offset` scaling applied to human-readable output.
#[derive(Debug, Clone, Copy)]
pub struct UnitScale {
    pub offset: f64,
    pub divisor: f64,
}

impl UnitScale {
    fn apply(&self, v: f64) -> f64 {
        if self.divisor != 0.0 {
            v / self.divisor + self.offset
        } else {
            v
        }
    }
}

/// Scannable-field metadata for usage output.
pub struct FieldHelp {
    pub key: &'static str,
    pub description: Option<&'static str>,
}

/// Wire codec for one registered type.
pub trait Codec {
    fn type_id(&self) -> u32;

    /// Decode one value, returning it with the number of bytes consumed.
    fn decode(&self, reg: &XdrRegistry, buf: &[u8]) -> XdrResult<(Box<dyn Any>, usize)>;

    /// Append the encoding of `value` to `out`.
    fn encode(&self, reg: &XdrRegistry, value: &dyn Any, out: &mut Vec<u8>) -> XdrResult<()>;

    /// Render `value` in the requested style.
    fn print(
        &self,
        reg: &XdrRegistry,
        value: &dyn Any,
        out: &mut dyn Write,
        style: PrintStyle,
    ) -> io::Result<()>;

    /// Fresh default instance, for callers that build values from textual
    /// parameters. `None` when the type cannot be built this way.
    fn new_value(&self) -> Option<Box<dyn Any>> {
        None
    }

    /// Parse a `key=value` textual parameter into `value`.
    fn scan(&self, _value: &mut dyn Any, key: &str, _text: &str) -> XdrResult<()> {
        Err(XdrError::UnknownField(key.to_string()))
    }

    /// Keys accepted by [`Codec::scan`].
    fn field_keys(&self) -> Vec<FieldHelp> {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// Declarative struct codecs
// ---------------------------------------------------------------------------

/// Accessors for one struct member.
pub enum FieldKind<T> {
    U32(fn(&T) -> u32, fn(&mut T, u32)),
    I32(fn(&T) -> i32, fn(&mut T, i32)),
    U64(fn(&T) -> u64, fn(&mut T, u64)),
    I64(fn(&T) -> i64, fn(&mut T, i64)),
    F32(fn(&T) -> f32, fn(&mut T, f32)),
    F64(fn(&T) -> f64, fn(&mut T, f64)),
    /// Element count of the next variable-length field. Encoded as i32; the
    /// in-memory count lives in the owning container, so decode only stashes
    /// the value for the field that follows.
    Count(fn(&T) -> u32),
    Bytes(fn(&T) -> &[u8], fn(&mut T, Vec<u8>)),
    Str(fn(&T) -> &str, fn(&mut T, String)),
    U32Array(fn(&T) -> &[u32], fn(&mut T, Vec<u32>)),
    Union(fn(&T) -> &UnionValue, fn(&mut T, UnionValue)),
}

/// One member of a declaratively coded struct.
pub struct FieldDef<T> {
    pub key: Option<&'static str>,
    pub name: Option<&'static str>,
    pub unit: Option<&'static str>,
    pub description: Option<&'static str>,
    pub scale: Option<UnitScale>,
    pub kind: FieldKind<T>,
}

impl<T> FieldDef<T> {
    /// Anonymous field: encoded and decoded but never printed or scanned.
    pub fn bare(kind: FieldKind<T>) -> Self {
        FieldDef {
            key: None,
            name: None,
            unit: None,
            description: None,
            scale: None,
            kind,
        }
    }

    /// Field addressable by key in textual forms.
    pub fn keyed(key: &'static str, kind: FieldKind<T>) -> Self {
        FieldDef {
            key: Some(key),
            ..Self::bare(kind)
        }
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_scale(mut self, offset: f64, divisor: f64) -> Self {
        self.scale = Some(UnitScale { offset, divisor });
        self
    }

    pub fn described(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }
}

/// Generic codec driven by a field table.
pub struct StructCodec<T> {
    type_id: u32,
    fields: Vec<FieldDef<T>>,
}

impl<T: Default + Any> StructCodec<T> {
    pub fn new(type_id: u32, fields: Vec<FieldDef<T>>) -> Self {
        StructCodec { type_id, fields }
    }

    pub fn decode_value(&self, reg: &XdrRegistry, buf: &[u8]) -> XdrResult<(T, usize)> {
        let mut value = T::default();
        let mut used = 0usize;
        let mut pending_count: Option<usize> = None;

        for field in &self.fields {
            let rest = &buf[used.min(buf.len())..];
            match &field.kind {
                FieldKind::U32(_, set) => {
                    let (v, n) = decode_u32(rest)?;
                    set(&mut value, v);
                    used += n;
                }
                FieldKind::I32(_, set) => {
                    let (v, n) = decode_i32(rest)?;
                    set(&mut value, v);
                    used += n;
                }
                FieldKind::U64(_, set) => {
                    let (v, n) = decode_u64(rest)?;
                    set(&mut value, v);
                    used += n;
                }
                FieldKind::I64(_, set) => {
                    let (v, n) = decode_i64(rest)?;
                    set(&mut value, v);
                    used += n;
                }
                FieldKind::F32(_, set) => {
                    let (v, n) = decode_f32(rest)?;
                    set(&mut value, v);
                    used += n;
                }
                FieldKind::F64(_, set) => {
                    let (v, n) = decode_f64(rest)?;
                    set(&mut value, v);
                    used += n;
                }
                FieldKind::Count(_) => {
                    let (v, n) = decode_i32(rest)?;
                    pending_count = Some(v.max(0) as usize);
                    used += n;
                }
                FieldKind::Bytes(_, set) => {
                    let count = pending_count.take().ok_or(XdrError::MissingCount)?;
                    let (v, n) = decode_bytes(rest, count)?;
                    set(&mut value, v);
                    used += n;
                }
                FieldKind::Str(_, set) => {
                    let (v, n) = decode_string(rest)?;
                    set(&mut value, v);
                    used += n;
                }
                FieldKind::U32Array(_, set) => {
                    let count = pending_count.take().ok_or(XdrError::MissingCount)?;
                    need(rest, count * 4)?;
                    let mut items = Vec::with_capacity(count);
                    let mut off = 0;
                    for _ in 0..count {
                        let (v, n) = decode_u32(&rest[off..])?;
                        items.push(v);
                        off += n;
                    }
                    set(&mut value, items);
                    used += off;
                }
                FieldKind::Union(_, set) => {
                    let (v, n) = reg.decode_union(rest)?;
                    set(&mut value, v);
                    used += n;
                }
            }
        }

        Ok((value, used))
    }

    pub fn encode_value(&self, reg: &XdrRegistry, value: &T, out: &mut Vec<u8>) -> XdrResult<()> {
        for field in &self.fields {
            match &field.kind {
                FieldKind::U32(get, _) => encode_u32(get(value), out),
                FieldKind::I32(get, _) => encode_i32(get(value), out),
                FieldKind::U64(get, _) => encode_u64(get(value), out),
                FieldKind::I64(get, _) => encode_i64(get(value), out),
                FieldKind::F32(get, _) => encode_f32(get(value), out),
                FieldKind::F64(get, _) => encode_f64(get(value), out),
                FieldKind::Count(get) => encode_i32(get(value) as i32, out),
                FieldKind::Bytes(get, _) => encode_bytes(get(value), out),
                FieldKind::Str(get, _) => encode_string(get(value), out),
                FieldKind::U32Array(get, _) => {
                    for v in get(value) {
                        encode_u32(*v, out);
                    }
                }
                FieldKind::Union(get, _) => reg.encode_union(get(value), out)?,
            }
        }
        Ok(())
    }

    fn print_field_value(
        &self,
        reg: &XdrRegistry,
        field: &FieldDef<T>,
        value: &T,
        out: &mut dyn Write,
        style: PrintStyle,
    ) -> io::Result<()> {
        let scaled = |v: f64| -> Option<f64> {
            match (style, field.scale) {
                (PrintStyle::Human, Some(scale)) => Some(scale.apply(v)),
                _ => None,
            }
        };

        match &field.kind {
            FieldKind::U32(get, _) => match scaled(get(value) as f64) {
                Some(v) => write!(out, "{v}"),
                None => write!(out, "{}", get(value)),
            },
            FieldKind::I32(get, _) => match scaled(get(value) as f64) {
                Some(v) => write!(out, "{v}"),
                None => write!(out, "{}", get(value)),
            },
            FieldKind::U64(get, _) => match scaled(get(value) as f64) {
                Some(v) => write!(out, "{v}"),
                None => write!(out, "{}", get(value)),
            },
            FieldKind::I64(get, _) => match scaled(get(value) as f64) {
                Some(v) => write!(out, "{v}"),
                None => write!(out, "{}", get(value)),
            },
            FieldKind::F32(get, _) => match scaled(get(value) as f64) {
                Some(v) => write!(out, "{v}"),
                None => write!(out, "{}", get(value)),
            },
            FieldKind::F64(get, _) => match scaled(get(value)) {
                Some(v) => write!(out, "{v}"),
                None => write!(out, "{}", get(value)),
            },
            FieldKind::Count(get) => write!(out, "{}", get(value)),
            FieldKind::Bytes(get, _) => write!(out, "{}", hex_string(get(value))),
            FieldKind::Str(get, _) => write!(out, "{}", get(value)),
            FieldKind::U32Array(get, _) => {
                for (i, v) in get(value).iter().enumerate() {
                    if i > 0 {
                        write!(out, ",")?;
                    }
                    write!(out, "{v}")?;
                }
                Ok(())
            }
            FieldKind::Union(get, _) => {
                let u = get(value);
                let Some(codec) = reg.codec(u.type_id) else {
                    return Ok(());
                };
                match &u.data {
                    Some(data) => codec.print(reg, &**data, out, style),
                    None => Ok(()),
                }
            }
        }
    }

    fn scan_field(&self, field: &FieldDef<T>, value: &mut T, text: &str) -> XdrResult<()> {
        fn parse<V: std::str::FromStr>(what: &'static str, text: &str) -> XdrResult<V> {
            text.trim().parse().map_err(|_| XdrError::Parse {
                what,
                text: text.to_string(),
            })
        }

        match &field.kind {
            FieldKind::U32(_, set) => set(value, parse::<u32>("u32", text)?),
            FieldKind::I32(_, set) => set(value, parse::<i32>("i32", text)?),
            FieldKind::U64(_, set) => set(value, parse::<u64>("u64", text)?),
            FieldKind::I64(_, set) => set(value, parse::<i64>("i64", text)?),
            FieldKind::F32(_, set) => set(value, parse::<f32>("f32", text)?),
            FieldKind::F64(_, set) => set(value, parse::<f64>("f64", text)?),
            FieldKind::Str(_, set) => set(value, text.to_string()),
            FieldKind::Bytes(_, set) => set(value, parse_hex(text)),
            FieldKind::U32Array(_, set) => {
                let items = if text.is_empty() {
                    Vec::new()
                } else {
                    text.split(',')
                        .map(|part| parse::<u32>("u32", part))
                        .collect::<XdrResult<Vec<u32>>>()?
                };
                set(value, items);
            }
            FieldKind::Count(_) | FieldKind::Union(_, _) => return Err(XdrError::NotScannable),
        }
        Ok(())
    }
}

impl<T: Default + Any> Codec for StructCodec<T> {
    fn type_id(&self) -> u32 {
        self.type_id
    }

    fn decode(&self, reg: &XdrRegistry, buf: &[u8]) -> XdrResult<(Box<dyn Any>, usize)> {
        let (value, used) = self.decode_value(reg, buf)?;
        Ok((Box::new(value), used))
    }

    fn new_value(&self) -> Option<Box<dyn Any>> {
        Some(Box::new(T::default()))
    }

    fn encode(&self, reg: &XdrRegistry, value: &dyn Any, out: &mut Vec<u8>) -> XdrResult<()> {
        let value = value
            .downcast_ref::<T>()
            .ok_or(XdrError::ValueType(std::any::type_name::<T>()))?;
        self.encode_value(reg, value, out)
    }

    fn print(
        &self,
        reg: &XdrRegistry,
        value: &dyn Any,
        out: &mut dyn Write,
        style: PrintStyle,
    ) -> io::Result<()> {
        let Some(value) = value.downcast_ref::<T>() else {
            return Ok(());
        };

        let mut line = 0;
        for field in &self.fields {
            match style {
                PrintStyle::KeyValue => {
                    if let Some(key) = field.key {
                        write!(out, "{key}=")?;
                        self.print_field_value(reg, field, value, out, style)?;
                        writeln!(out)?;
                    }
                }
                PrintStyle::Human => {
                    if field.key.is_some() || field.name.is_some() {
                        let label = field.name.or(field.key).unwrap();
                        write!(out, "{line:03}:  {label:<32}")?;
                        line += 1;
                        self.print_field_value(reg, field, value, out, style)?;
                        match field.unit {
                            Some(unit) => writeln!(out, "    [{unit}]")?,
                            None => writeln!(out)?,
                        }
                    }
                }
                PrintStyle::CsvHeader => {
                    if let Some(key) = field.key {
                        write!(out, "{key},")?;
                    }
                }
                PrintStyle::CsvData => {
                    if field.key.is_some() {
                        self.print_field_value(reg, field, value, out, style)?;
                        write!(out, ",")?;
                    }
                }
            }
        }
        Ok(())
    }

    fn scan(&self, value: &mut dyn Any, key: &str, text: &str) -> XdrResult<()> {
        let value = value
            .downcast_mut::<T>()
            .ok_or(XdrError::ValueType(std::any::type_name::<T>()))?;
        let field = self
            .fields
            .iter()
            .find(|f| f.key.is_some_and(|k| k.eq_ignore_ascii_case(key)))
            .ok_or_else(|| XdrError::UnknownField(key.to_string()))?;
        self.scan_field(field, value, text)
    }

    fn field_keys(&self) -> Vec<FieldHelp> {
        self.fields
            .iter()
            .filter(|f| !matches!(f.kind, FieldKind::Count(_) | FieldKind::Union(_, _)))
            .filter_map(|f| {
                f.key.map(|key| FieldHelp {
                    key,
                    description: f.description,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Produces a fresh instance of a registered type on demand, or a wire-level
/// result code on failure. Used to serve data requests.
pub type Populator = Box<dyn FnMut() -> Result<Box<dyn Any>, u32>>;

/// Keyed-by-type-id table of codecs and populators.
///
/// Registration phase: before the event loop runs. Run phase: lookups only.
#[derive(Default)]
pub struct XdrRegistry {
    codecs: RefCell<HashMap<u32, Rc<dyn Codec>>>,
    populators: RefCell<HashMap<u32, Populator>>,
}

impl XdrRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, codec: Rc<dyn Codec>) {
        let type_id = Codec::type_id(codec.as_ref());
        if self.codecs.borrow_mut().insert(type_id, codec).is_some() {
            warn!("replacing codec for type {type_id:#010x}");
        }
    }

    pub fn codec(&self, type_id: u32) -> Option<Rc<dyn Codec>> {
        self.codecs.borrow().get(&type_id).cloned()
    }

    /// Attach a data producer to a registered type.
    pub fn register_populator(&self, type_id: u32, populator: Populator) {
        if self.codec(type_id).is_none() {
            warn!("populator for unregistered type {type_id:#010x} ignored");
            return;
        }
        self.populators.borrow_mut().insert(type_id, populator);
    }

    pub fn has_populator(&self, type_id: u32) -> bool {
        self.populators.borrow().contains_key(&type_id)
    }

    /// Run the populator for `type_id`. `None` when no populator is
    /// registered.
    pub fn populate(&self, type_id: u32) -> Option<Result<Box<dyn Any>, u32>> {
        // Detach the populator while it runs so it may itself consult the
        // registry.
        let mut populator = self.populators.borrow_mut().remove(&type_id)?;
        let res = populator();
        self.populators.borrow_mut().insert(type_id, populator);
        Some(res)
    }

    pub fn decode_union(&self, buf: &[u8]) -> XdrResult<(UnionValue, usize)> {
        let (type_id, used) = decode_u32(buf)?;
        let codec = self.codec(type_id).ok_or(XdrError::UnknownType(type_id))?;
        let (data, n) = codec.decode(self, &buf[used..])?;
        Ok((
            UnionValue {
                type_id,
                data: Some(data),
            },
            used + n,
        ))
    }

    pub fn encode_union(&self, u: &UnionValue, out: &mut Vec<u8>) -> XdrResult<()> {
        encode_u32(u.type_id, out);
        match &u.data {
            Some(data) => {
                let codec = self.codec(u.type_id).ok_or(XdrError::UnknownType(u.type_id))?;
                codec.encode(self, &**data, out)
            }
            // Empty payload; only the void type encodes to nothing.
            None => Ok(()),
        }
    }

    /// Encode `value` as a self-describing union body (type tag + payload).
    pub fn encode_tagged(&self, type_id: u32, value: &dyn Any) -> XdrResult<Vec<u8>> {
        let codec = self.codec(type_id).ok_or(XdrError::UnknownType(type_id))?;
        let mut out = Vec::new();
        encode_u32(type_id, &mut out);
        codec.encode(self, value, &mut out)?;
        Ok(out)
    }

    /// Decode `buf` as an instance of `type_id`.
    pub fn decode_as(&self, type_id: u32, buf: &[u8]) -> XdrResult<(Box<dyn Any>, usize)> {
        let codec = self.codec(type_id).ok_or(XdrError::UnknownType(type_id))?;
        codec.decode(self, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE_TELEMETRY: u32 = 0x0200_0001;
    const TYPE_BLOB: u32 = 0x0200_0002;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Telemetry {
        mode: u32,
        temperature: i32,
        uptime: u64,
        bus_voltage: f32,
    }

    fn telemetry_codec() -> StructCodec<Telemetry> {
        StructCodec::new(
            TYPE_TELEMETRY,
            vec![
                FieldDef::keyed("mode", FieldKind::U32(|t: &Telemetry| t.mode, |t, v| t.mode = v)),
                FieldDef::keyed(
                    "temp",
                    FieldKind::I32(|t: &Telemetry| t.temperature, |t, v| t.temperature = v),
                )
                .named("Temperature")
                .with_unit("C")
                .with_scale(-273.15, 10.0),
                FieldDef::keyed(
                    "uptime",
                    FieldKind::U64(|t: &Telemetry| t.uptime, |t, v| t.uptime = v),
                ),
                FieldDef::keyed(
                    "bus_v",
                    FieldKind::F32(|t: &Telemetry| t.bus_voltage, |t, v| t.bus_voltage = v),
                ),
            ],
        )
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Blob {
        body: Vec<u8>,
        label: String,
    }

    fn blob_codec() -> StructCodec<Blob> {
        StructCodec::new(
            TYPE_BLOB,
            vec![
                FieldDef::bare(FieldKind::Count(|b: &Blob| b.body.len() as u32)),
                FieldDef::keyed("body", FieldKind::Bytes(|b: &Blob| &b.body, |b, v| b.body = v)),
                FieldDef::keyed("label", FieldKind::Str(|b: &Blob| &b.label, |b, v| b.label = v)),
            ],
        )
    }

    fn registry() -> XdrRegistry {
        let reg = XdrRegistry::new();
        reg.register(Rc::new(telemetry_codec()));
        reg.register(Rc::new(blob_codec()));
        reg
    }

    #[test]
    fn primitives_round_trip() {
        let mut out = Vec::new();
        encode_u32(0xDEADBEEF, &mut out);
        encode_i32(-42, &mut out);
        encode_u64(0x1234_5678_9ABC_DEF0, &mut out);
        encode_i64(-5_000_000_000, &mut out);
        encode_f64(-273.15, &mut out);

        let mut off = 0;
        let (v, n) = decode_u32(&out[off..]).unwrap();
        assert_eq!(v, 0xDEADBEEF);
        off += n;
        let (v, n) = decode_i32(&out[off..]).unwrap();
        assert_eq!(v, -42);
        off += n;
        let (v, n) = decode_u64(&out[off..]).unwrap();
        assert_eq!(v, 0x1234_5678_9ABC_DEF0);
        off += n;
        let (v, n) = decode_i64(&out[off..]).unwrap();
        assert_eq!(v, -5_000_000_000);
        off += n;
        let (v, n) = decode_f64(&out[off..]).unwrap();
        assert_eq!(v, -273.15);
        assert_eq!(off + n, out.len());
    }

    #[test]
    fn u64_encodes_high_word_first() {
        let mut out = Vec::new();
        encode_u64(0x0000_0001_0000_0002, &mut out);
        assert_eq!(out, vec![0, 0, 0, 1, 0, 0, 0, 2]);
    }

    #[test]
    fn byte_arrays_pad_to_four_bytes() {
        for (len, expect_total) in [(0usize, 0usize), (1, 4), (4, 4), (5, 8)] {
            let data = vec![0xAB; len];
            let mut out = Vec::new();
            encode_bytes(&data, &mut out);
            assert_eq!(out.len(), expect_total);
            let (back, used) = decode_bytes(&out, len).unwrap();
            assert_eq!(back, data);
            assert_eq!(used, expect_total);
        }
    }

    #[test]
    fn struct_round_trip_preserves_value_and_length() {
        let reg = registry();
        let value = Telemetry {
            mode: 3,
            temperature: -1234,
            uptime: 86_400_000,
            bus_voltage: 3.3,
        };

        let mut out = Vec::new();
        telemetry_codec().encode_value(&reg, &value, &mut out).unwrap();
        let (back, used) = telemetry_codec().decode_value(&reg, &out).unwrap();
        assert_eq!(back, value);
        assert_eq!(used, out.len());
    }

    #[test]
    fn sibling_count_round_trip() {
        let reg = registry();
        let value = Blob {
            body: vec![0xDE, 0xAD, 0xBE],
            label: "boot".to_string(),
        };

        let mut out = Vec::new();
        blob_codec().encode_value(&reg, &value, &mut out).unwrap();
        // count word + 3 bytes padded to 4 + string (4 + 4)
        assert_eq!(out.len(), 4 + 4 + 8);
        let (back, used) = blob_codec().decode_value(&reg, &out).unwrap();
        assert_eq!(back, value);
        assert_eq!(used, out.len());
    }

    #[test]
    fn oversized_count_is_rejected() {
        let reg = registry();
        // Claim 64 payload bytes but provide none.
        let mut out = Vec::new();
        encode_i32(64, &mut out);
        let err = blob_codec().decode_value(&reg, &out).unwrap_err();
        assert!(matches!(err, XdrError::Truncated { .. }));
    }

    #[test]
    fn truncated_struct_is_rejected() {
        let reg = registry();
        let value = Telemetry::default();
        let mut out = Vec::new();
        telemetry_codec().encode_value(&reg, &value, &mut out).unwrap();
        let err = telemetry_codec().decode_value(&reg, &out[..out.len() - 1]).unwrap_err();
        assert!(matches!(err, XdrError::Truncated { .. }));
    }

    #[test]
    fn union_round_trip() {
        let reg = registry();
        let u = UnionValue::new(
            TYPE_TELEMETRY,
            Telemetry {
                mode: 1,
                temperature: 2931,
                uptime: 17,
                bus_voltage: 8.2,
            },
        );

        let mut out = Vec::new();
        reg.encode_union(&u, &mut out).unwrap();
        let (back, used) = reg.decode_union(&out).unwrap();
        assert_eq!(used, out.len());
        assert_eq!(back.type_id, TYPE_TELEMETRY);
        let t = back.downcast_ref::<Telemetry>().unwrap();
        assert_eq!(t.mode, 1);
        assert_eq!(t.uptime, 17);
    }

    #[test]
    fn union_with_unknown_type_fails() {
        let reg = registry();
        let mut out = Vec::new();
        encode_u32(0x7777_7777, &mut out);
        assert!(matches!(
            reg.decode_union(&out),
            Err(XdrError::UnknownType(0x7777_7777))
        ));
    }

    #[test]
    fn key_value_print() {
        let reg = registry();
        let value = Telemetry {
            mode: 2,
            temperature: 2931,
            uptime: 99,
            bus_voltage: 3.29,
        };
        let mut out = Vec::new();
        telemetry_codec()
            .print(&reg, &value, &mut out, PrintStyle::KeyValue)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("mode=2\n"));
        assert!(text.contains("temp=2931\n"));
        assert!(text.contains("uptime=99\n"));
    }

    #[test]
    fn human_print_applies_unit_scaling() {
        let reg = registry();
        let value = Telemetry {
            temperature: 2931, // 2931 / 10 - 273.15 = 19.95 C
            ..Default::default()
        };
        let mut out = Vec::new();
        telemetry_codec()
            .print(&reg, &value, &mut out, PrintStyle::Human)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Temperature"), "{text}");
        assert!(text.contains("19.95"), "{text}");
        assert!(text.contains("[C]"), "{text}");
    }

    #[test]
    fn csv_print_header_then_data() {
        let reg = registry();
        let value = Telemetry {
            mode: 7,
            ..Default::default()
        };
        let codec = telemetry_codec();
        let mut header = Vec::new();
        codec.print(&reg, &value, &mut header, PrintStyle::CsvHeader).unwrap();
        assert_eq!(String::from_utf8(header).unwrap(), "mode,temp,uptime,bus_v,");
        let mut row = Vec::new();
        codec.print(&reg, &value, &mut row, PrintStyle::CsvData).unwrap();
        assert!(String::from_utf8(row).unwrap().starts_with("7,"));
    }

    #[test]
    fn bytes_print_as_uppercase_hex() {
        let reg = registry();
        let value = Blob {
            body: vec![0xDE, 0xAD, 0x01],
            label: String::new(),
        };
        let mut out = Vec::new();
        blob_codec().print(&reg, &value, &mut out, PrintStyle::KeyValue).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("body=DEAD01\n"));
    }

    #[test]
    fn scan_parses_keys_case_insensitively() {
        let codec = telemetry_codec();
        let mut value: Box<dyn Any> = Box::new(Telemetry::default());
        codec.scan(&mut *value, "MODE", "5").unwrap();
        codec.scan(&mut *value, "temp", "-40").unwrap();
        codec.scan(&mut *value, "bus_v", "3.3").unwrap();
        let t = value.downcast_ref::<Telemetry>().unwrap();
        assert_eq!(t.mode, 5);
        assert_eq!(t.temperature, -40);
        assert_eq!(t.bus_voltage, 3.3);
    }

    #[test]
    fn scan_rejects_unknown_key_and_bad_value() {
        let codec = telemetry_codec();
        let mut value: Box<dyn Any> = Box::new(Telemetry::default());
        assert!(matches!(
            codec.scan(&mut *value, "bogus", "1"),
            Err(XdrError::UnknownField(_))
        ));
        assert!(matches!(
            codec.scan(&mut *value, "mode", "not-a-number"),
            Err(XdrError::Parse { .. })
        ));
    }

    #[test]
    fn scan_hex_bytes() {
        let codec = blob_codec();
        let mut value: Box<dyn Any> = Box::new(Blob::default());
        codec.scan(&mut *value, "body", "DeadBeef").unwrap();
        let b = value.downcast_ref::<Blob>().unwrap();
        assert_eq!(b.body, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn populator_runs_through_registry() {
        let reg = registry();
        reg.register_populator(
            TYPE_TELEMETRY,
            Box::new(|| {
                Ok(Box::new(Telemetry {
                    mode: 9,
                    ..Default::default()
                }))
            }),
        );
        let value = reg.populate(TYPE_TELEMETRY).unwrap().unwrap();
        assert_eq!(value.downcast_ref::<Telemetry>().unwrap().mode, 9);
        assert!(reg.populate(TYPE_BLOB).is_none());
    }
}
