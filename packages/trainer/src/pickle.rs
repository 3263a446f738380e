//! Pickle reader for dataset files.
//!
//! Handles protocols 2 to 5: scalars, strings, bytes and the builtin
//! containers, plus the reductions numpy uses to pickle arrays
//! (`_reconstruct` followed by `BUILD`, `_frombuffer`, and the
//! `_codecs.encode` wrapper protocol 2 uses for raw bytes). Arrays are
//! decoded straight to `f32` in C order.

use std::{collections::HashMap, io::Read, rc::Rc};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PickleError {
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported opcode 0x{code:02x} at byte {at}")]
    UnsupportedOpcode { code: u8, at: u64 },
    #[error("stack underflow at byte {0}")]
    StackUnderflow(u64),
    #[error("memo key {0} read before it was stored")]
    MissingMemo(u32),
    #[error("malformed pickle at byte {at}: {reason}")]
    Malformed { at: u64, reason: String },
    #[error("cannot decode numpy array: {0}")]
    Array(String),
    #[error("pickle ended without a STOP opcode")]
    MissingStop,
}

/// A decoded pickle value.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    List(Vec<Object>),
    Tuple(Vec<Object>),
    Dict(Vec<(Object, Object)>),
    Global {
        module: String,
        name: String,
    },
    /// A call the reader does not evaluate, kept with its `BUILD` state.
    Reduce {
        callable: Box<Object>,
        args: Box<Object>,
        state: Option<Box<Object>>,
    },
    Array(NdArray),
}

impl Object {
    /// Text of a `str`, or of a protocol-2 `bytes`/py2 `str` holding UTF-8.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Removes and returns the dict entry whose key reads as `key`.
    pub fn take_entry(&mut self, key: &str) -> Option<Object> {
        let Self::Dict(entries) = self else {
            return None;
        };
        let at = entries.iter().position(|(k, _)| k.text() == Some(key))?;
        Some(entries.swap_remove(at).1)
    }
}

/// A numeric numpy array, values widened or narrowed to `f32`, C order.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub data: Rc<[f32]>,
}

impl NdArray {
    fn new(shape: Vec<usize>, data: Vec<f32>, fortran: bool) -> Result<Self, PickleError> {
        let count = shape.iter().product::<usize>();
        if count != data.len() {
            return Err(PickleError::Array(format!(
                "shape {shape:?} holds {count} values, buffer holds {}",
                data.len()
            )));
        }
        let data = if fortran && shape.len() > 1 {
            fortran_to_c(&data, &shape)
        } else {
            data
        };
        Ok(Self {
            shape,
            data: Rc::from(data),
        })
    }
}

pub fn from_reader<R: Read>(reader: R) -> Result<Object, PickleError> {
    Machine::new(reader).run()
}

pub fn from_slice(bytes: &[u8]) -> Result<Object, PickleError> {
    from_reader(bytes)
}

pub(crate) mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const BINUNICODE: u8 = b'X';
    pub const BINFLOAT: u8 = b'G';
    pub const APPEND: u8 = b'a';
    pub const APPENDS: u8 = b'e';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const REDUCE: u8 = b'R';
    pub const SETITEM: u8 = b's';
    pub const SETITEMS: u8 = b'u';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
}

struct Slot {
    value: Object,
    /// Memo key this value was stored under, so `BUILD` can refresh it.
    memo: Option<u32>,
}

struct Machine<R> {
    reader: R,
    pos: u64,
    op_start: u64,
    stack: Vec<Slot>,
    marks: Vec<usize>,
    memo: HashMap<u32, Object>,
}

impl<R: Read> Machine<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            pos: 0,
            op_start: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<Object, PickleError> {
        loop {
            self.op_start = self.pos;
            let code = match self.fixed::<1>() {
                Ok([code]) => code,
                Err(PickleError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(PickleError::MissingStop)
                }
                Err(e) => return Err(e),
            };

            match code {
                op::PROTO => {
                    self.fixed::<1>()?;
                }
                op::FRAME => {
                    self.fixed::<8>()?;
                }
                op::STOP => return self.pop(),
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    self.pop()?;
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let value = self.top_mut()?.value.clone();
                    self.push(value);
                }

                op::NONE => self.push(Object::None),
                op::NEWTRUE => self.push(Object::Bool(true)),
                op::NEWFALSE => self.push(Object::Bool(false)),
                op::BININT => {
                    let v = i32::from_le_bytes(self.fixed()?);
                    self.push(Object::Int(v.into()));
                }
                op::BININT1 => {
                    let [v] = self.fixed()?;
                    self.push(Object::Int(v.into()));
                }
                op::BININT2 => {
                    let v = u16::from_le_bytes(self.fixed()?);
                    self.push(Object::Int(v.into()));
                }
                op::LONG1 => {
                    let [len] = self.fixed()?;
                    let bytes = self.take(len.into())?;
                    let v = self.decode_long(&bytes)?;
                    self.push(Object::Int(v));
                }
                op::LONG4 => {
                    let len = self.length_i32()?;
                    let bytes = self.take(len)?;
                    let v = self.decode_long(&bytes)?;
                    self.push(Object::Int(v));
                }
                op::BINFLOAT => {
                    let v = f64::from_be_bytes(self.fixed()?);
                    self.push(Object::Float(v));
                }

                op::SHORT_BINUNICODE => {
                    let [len] = self.fixed()?;
                    self.push_unicode(len.into())?;
                }
                op::BINUNICODE => {
                    let len = u32::from_le_bytes(self.fixed()?);
                    self.push_unicode(len.into())?;
                }
                op::BINUNICODE8 => {
                    let len = u64::from_le_bytes(self.fixed()?);
                    self.push_unicode(len)?;
                }
                op::SHORT_BINSTRING | op::SHORT_BINBYTES => {
                    let [len] = self.fixed()?;
                    self.push_bytes(len.into())?;
                }
                op::BINSTRING => {
                    let len = self.length_i32()?;
                    self.push_bytes(len)?;
                }
                op::BINBYTES => {
                    let len = u32::from_le_bytes(self.fixed()?);
                    self.push_bytes(len.into())?;
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let len = u64::from_le_bytes(self.fixed()?);
                    self.push_bytes(len)?;
                }

                op::EMPTY_TUPLE => self.push(Object::Tuple(Vec::new())),
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.push(Object::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = usize::from(code - op::TUPLE1) + 1;
                    let items = self.pop_n(n)?;
                    self.push(Object::Tuple(items));
                }
                op::EMPTY_LIST | op::EMPTY_SET => self.push(Object::List(Vec::new())),
                op::LIST | op::FROZENSET => {
                    let items = self.pop_mark()?;
                    self.push(Object::List(items));
                }
                op::APPEND => {
                    let item = self.pop()?;
                    self.list_top()?.push(item);
                }
                op::APPENDS | op::ADDITEMS => {
                    let items = self.pop_mark()?;
                    self.list_top()?.extend(items);
                }
                op::EMPTY_DICT => self.push(Object::Dict(Vec::new())),
                op::DICT => {
                    let items = self.pop_mark()?;
                    let entries = self.pairs(items)?;
                    self.push(Object::Dict(entries));
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.dict_top()?.push((key, value));
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    let entries = self.pairs(items)?;
                    self.dict_top()?.extend(entries);
                }

                op::GLOBAL => {
                    let module = self.line()?;
                    let name = self.line()?;
                    self.push(Object::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop_text()?;
                    let module = self.pop_text()?;
                    self.push(Object::Global { module, name });
                }
                op::REDUCE | op::NEWOBJ => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = reduce(callable, args)?;
                    self.push(value);
                }
                op::BUILD => {
                    let state = self.pop()?;
                    let slot = self.top_mut()?;
                    build(&mut slot.value, state)?;
                    let refreshed = slot.memo.map(|key| (key, slot.value.clone()));
                    if let Some((key, value)) = refreshed {
                        self.memo.insert(key, value);
                    }
                }

                op::BINPUT => {
                    let [key] = self.fixed()?;
                    self.store(key.into())?;
                }
                op::LONG_BINPUT => {
                    let key = u32::from_le_bytes(self.fixed()?);
                    self.store(key)?;
                }
                op::PUT => {
                    let key = self.line_key()?;
                    self.store(key)?;
                }
                op::MEMOIZE => {
                    let key = self.memo.len() as u32;
                    self.store(key)?;
                }
                op::BINGET => {
                    let [key] = self.fixed()?;
                    self.fetch(key.into())?;
                }
                op::LONG_BINGET => {
                    let key = u32::from_le_bytes(self.fixed()?);
                    self.fetch(key)?;
                }
                op::GET => {
                    let key = self.line_key()?;
                    self.fetch(key)?;
                }

                code => {
                    return Err(PickleError::UnsupportedOpcode {
                        code,
                        at: self.op_start,
                    })
                }
            }
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> PickleError {
        PickleError::Malformed {
            at: self.op_start,
            reason: reason.into(),
        }
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let mut buf = [0_u8; N];
        self.reader.read_exact(&mut buf)?;
        self.pos += N as u64;
        Ok(buf)
    }

    fn take(&mut self, len: u64) -> Result<Vec<u8>, PickleError> {
        let mut buf = Vec::new();
        (&mut self.reader).take(len).read_to_end(&mut buf)?;
        if buf.len() as u64 != len {
            return Err(self.malformed(format!("truncated: wanted {len} bytes")));
        }
        self.pos += len;
        Ok(buf)
    }

    fn line(&mut self) -> Result<String, PickleError> {
        let mut bytes = Vec::new();
        loop {
            let [b] = self.fixed()?;
            if b == b'\n' {
                break;
            }
            bytes.push(b);
        }
        String::from_utf8(bytes).map_err(|_| self.malformed("line is not utf-8"))
    }

    fn line_key(&mut self) -> Result<u32, PickleError> {
        let line = self.line()?;
        line.trim()
            .parse()
            .map_err(|_| self.malformed(format!("bad memo key {line:?}")))
    }

    fn length_i32(&mut self) -> Result<u64, PickleError> {
        let len = i32::from_le_bytes(self.fixed()?);
        u64::try_from(len).map_err(|_| self.malformed("negative length"))
    }

    fn decode_long(&self, bytes: &[u8]) -> Result<i64, PickleError> {
        if bytes.len() > 8 {
            return Err(self.malformed("integer wider than 64 bits"));
        }
        let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);
        let mut buf = if negative { [0xff; 8] } else { [0; 8] };
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    fn push(&mut self, value: Object) {
        self.stack.push(Slot { value, memo: None });
    }

    fn push_unicode(&mut self, len: u64) -> Result<(), PickleError> {
        let bytes = self.take(len)?;
        let text = String::from_utf8(bytes).map_err(|_| self.malformed("string is not utf-8"))?;
        self.push(Object::Str(Rc::from(text)));
        Ok(())
    }

    fn push_bytes(&mut self, len: u64) -> Result<(), PickleError> {
        let bytes = self.take(len)?;
        self.push(Object::Bytes(Rc::from(bytes)));
        Ok(())
    }

    fn pop(&mut self) -> Result<Object, PickleError> {
        self.stack
            .pop()
            .map(|slot| slot.value)
            .ok_or(PickleError::StackUnderflow(self.op_start))
    }

    fn pop_text(&mut self) -> Result<String, PickleError> {
        let value = self.pop()?;
        value
            .text()
            .map(str::to_string)
            .ok_or_else(|| self.malformed("expected a string"))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Object>, PickleError> {
        let start = self
            .stack
            .len()
            .checked_sub(n)
            .ok_or(PickleError::StackUnderflow(self.op_start))?;
        Ok(self.stack.drain(start..).map(|slot| slot.value).collect())
    }

    fn pop_mark(&mut self) -> Result<Vec<Object>, PickleError> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| self.malformed("no mark on the stack"))?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow(self.op_start));
        }
        Ok(self.stack.drain(mark..).map(|slot| slot.value).collect())
    }

    fn top_mut(&mut self) -> Result<&mut Slot, PickleError> {
        let at = self.op_start;
        self.stack.last_mut().ok_or(PickleError::StackUnderflow(at))
    }

    fn list_top(&mut self) -> Result<&mut Vec<Object>, PickleError> {
        let at = self.op_start;
        match &mut self.top_mut()?.value {
            Object::List(items) => Ok(items),
            _ => Err(PickleError::Malformed {
                at,
                reason: "append target is not a list".to_string(),
            }),
        }
    }

    fn dict_top(&mut self) -> Result<&mut Vec<(Object, Object)>, PickleError> {
        let at = self.op_start;
        match &mut self.top_mut()?.value {
            Object::Dict(entries) => Ok(entries),
            _ => Err(PickleError::Malformed {
                at,
                reason: "setitem target is not a dict".to_string(),
            }),
        }
    }

    fn pairs(&self, items: Vec<Object>) -> Result<Vec<(Object, Object)>, PickleError> {
        if items.len() % 2 != 0 {
            return Err(self.malformed("odd number of dict items"));
        }
        let mut entries = Vec::with_capacity(items.len() / 2);
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn store(&mut self, key: u32) -> Result<(), PickleError> {
        let value = {
            let slot = self.top_mut()?;
            slot.memo = Some(key);
            slot.value.clone()
        };
        self.memo.insert(key, value);
        Ok(())
    }

    fn fetch(&mut self, key: u32) -> Result<(), PickleError> {
        let value = self
            .memo
            .get(&key)
            .cloned()
            .ok_or(PickleError::MissingMemo(key))?;
        self.stack.push(Slot {
            value,
            memo: Some(key),
        });
        Ok(())
    }
}

fn is_numpy(module: &str) -> bool {
    module == "numpy" || module.starts_with("numpy.")
}

fn is_global(obj: &Object, check: impl Fn(&str, &str) -> bool) -> bool {
    matches!(obj, Object::Global { module, name } if check(module, name))
}

fn reduce(callable: Object, args: Object) -> Result<Object, PickleError> {
    if let Object::Global { module, name } = &callable {
        match (module.as_str(), name.as_str()) {
            ("_codecs", "encode") => return encoded_bytes(&args).map(Object::Bytes),
            ("__builtin__" | "builtins", "bytes" | "bytearray") => {
                return builtin_bytes(&args).map(Object::Bytes)
            }
            ("__builtin__" | "builtins", "set" | "frozenset" | "list") => {
                return match args {
                    Object::Tuple(mut items) if items.len() == 1 => match items.remove(0) {
                        Object::List(values) | Object::Tuple(values) => Ok(Object::List(values)),
                        _ => Err(PickleError::Array(format!("{name}() of a non-sequence"))),
                    },
                    Object::Tuple(items) if items.is_empty() => Ok(Object::List(Vec::new())),
                    _ => Err(PickleError::Array(format!("unexpected {name}() arguments"))),
                };
            }
            (module, "_frombuffer") if is_numpy(module) => {
                return from_buffer(&args).map(Object::Array)
            }
            _ => {}
        }
    }
    Ok(Object::Reduce {
        callable: Box::new(callable),
        args: Box::new(args),
        state: None,
    })
}

fn build(target: &mut Object, state: Object) -> Result<(), PickleError> {
    let reconstruct = matches!(
        &*target,
        Object::Reduce { callable, .. }
            if is_global(callable, |m, n| is_numpy(m) && n == "_reconstruct")
    );
    if reconstruct {
        *target = Object::Array(array_from_state(&state)?);
        return Ok(());
    }
    match target {
        Object::Reduce { state: slot, .. } => {
            *slot = Some(Box::new(state));
            Ok(())
        }
        // BUILD on plain containers only sets instance attributes.
        Object::Dict(_) | Object::List(_) => Ok(()),
        other => Err(PickleError::Array(format!(
            "BUILD applied to {other:?}"
        ))),
    }
}

fn latin1(text: &str) -> Result<Vec<u8>, PickleError> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| PickleError::Array("latin-1 payload has a code point above 255".to_string()))
}

/// `_codecs.encode(text, 'latin1')`, how protocol 2 spells `bytes`.
fn encoded_bytes(args: &Object) -> Result<Rc<[u8]>, PickleError> {
    let Object::Tuple(items) = args else {
        return Err(PickleError::Array("encode() without an argument tuple".to_string()));
    };
    let text = items.first().and_then(Object::text).ok_or_else(|| {
        PickleError::Array("encode() payload is not a string".to_string())
    })?;
    match items.get(1).and_then(Object::text) {
        Some("latin1" | "latin-1" | "iso-8859-1") | None => latin1(text).map(Rc::from),
        Some(other) => Err(PickleError::Array(format!(
            "encode() with unsupported encoding {other}"
        ))),
    }
}

fn builtin_bytes(args: &Object) -> Result<Rc<[u8]>, PickleError> {
    match args {
        Object::Tuple(items) => match items.as_slice() {
            [] => Ok(Rc::from(Vec::new())),
            [Object::Bytes(b)] => Ok(b.clone()),
            [_, _] => encoded_bytes(args),
            _ => Err(PickleError::Array("unexpected bytes() arguments".to_string())),
        },
        _ => Err(PickleError::Array("bytes() without an argument tuple".to_string())),
    }
}

fn shape_of(obj: &Object) -> Result<Vec<usize>, PickleError> {
    let (Object::Tuple(dims) | Object::List(dims)) = obj else {
        return Err(PickleError::Array(format!("shape is not a tuple: {obj:?}")));
    };
    dims.iter()
        .map(|d| match d {
            Object::Int(n) => usize::try_from(*n).ok(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| PickleError::Array(format!("bad shape {dims:?}")))
}

fn raw_values(dtype: &Dtype, raw: &Object) -> Result<Vec<f32>, PickleError> {
    match raw {
        Object::Bytes(bytes) => dtype.decode(bytes),
        Object::Str(text) => dtype.decode(&latin1(text)?),
        Object::List(items) => items
            .iter()
            .map(|item| match item {
                Object::Float(v) => Some(*v as f32),
                Object::Int(v) => Some(*v as f32),
                Object::Bool(v) => Some(f32::from(u8::from(*v))),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| PickleError::Array("object array holds non-numbers".to_string())),
        other => Err(PickleError::Array(format!("unexpected array payload {other:?}"))),
    }
}

/// `ndarray.__setstate__` tuple: `([version,] shape, dtype, is_fortran, raw)`.
fn array_from_state(state: &Object) -> Result<NdArray, PickleError> {
    let Object::Tuple(items) = state else {
        return Err(PickleError::Array("array state is not a tuple".to_string()));
    };
    let fields = match items.len() {
        5 => &items[1..],
        4 => &items[..],
        n => return Err(PickleError::Array(format!("array state has {n} fields"))),
    };
    let shape = shape_of(&fields[0])?;
    let dtype = Dtype::from_object(&fields[1])?;
    let fortran = matches!(fields[2], Object::Bool(true) | Object::Int(1));
    let data = raw_values(&dtype, &fields[3])?;
    NdArray::new(shape, data, fortran)
}

/// `_frombuffer(buffer, dtype, shape, order)`, used from protocol 5 on.
fn from_buffer(args: &Object) -> Result<NdArray, PickleError> {
    let Object::Tuple(items) = args else {
        return Err(PickleError::Array("_frombuffer without an argument tuple".to_string()));
    };
    let [raw, dtype, shape, order] = items.as_slice() else {
        return Err(PickleError::Array(format!(
            "_frombuffer takes 4 arguments, got {}",
            items.len()
        )));
    };
    let dtype = Dtype::from_object(dtype)?;
    let data = raw_values(&dtype, raw)?;
    NdArray::new(shape_of(shape)?, data, order.text() == Some("F"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dtype {
    kind: char,
    size: usize,
    big_endian: bool,
}

impl Dtype {
    /// From `numpy.dtype(descr, align, copy)` plus its `BUILD` state, whose
    /// second field is the byte order. A dtype fetched from the memo before
    /// its `BUILD` ran carries no state; native order is assumed then.
    fn from_object(obj: &Object) -> Result<Self, PickleError> {
        let Object::Reduce {
            callable,
            args,
            state,
        } = obj
        else {
            return Err(PickleError::Array(format!("dtype is not a numpy dtype: {obj:?}")));
        };
        if !is_global(callable, |m, n| is_numpy(m) && n == "dtype") {
            return Err(PickleError::Array(format!("unexpected dtype constructor {callable:?}")));
        }
        let descr = match &**args {
            Object::Tuple(items) => items.first().and_then(Object::text),
            _ => None,
        }
        .ok_or_else(|| PickleError::Array("dtype without a type string".to_string()))?;
        let order = state.as_deref().and_then(|s| match s {
            Object::Tuple(items) => items.get(1).and_then(Object::text),
            _ => None,
        });
        Self::parse(descr, order)
    }

    fn parse(descr: &str, order: Option<&str>) -> Result<Self, PickleError> {
        let (prefix, body) = match descr.chars().next() {
            Some(c @ ('<' | '>' | '|' | '=')) => (Some(c), &descr[1..]),
            _ => (None, descr),
        };
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| PickleError::Array(format!("empty dtype {descr:?}")))?;
        let size: usize = chars
            .as_str()
            .parse()
            .map_err(|_| PickleError::Array(format!("unsupported dtype {descr:?}")))?;
        if !matches!(
            (kind, size),
            ('f', 4 | 8) | ('i' | 'u', 1 | 2 | 4 | 8) | ('b', 1)
        ) {
            return Err(PickleError::Array(format!("unsupported dtype {descr:?}")));
        }

        let order = order.and_then(|o| o.chars().next()).or(prefix).unwrap_or('=');
        let big_endian = match order {
            '>' => true,
            '<' | '|' => false,
            '=' => cfg!(target_endian = "big"),
            other => {
                return Err(PickleError::Array(format!("unknown byte order {other:?}")))
            }
        };
        Ok(Self {
            kind,
            size,
            big_endian,
        })
    }

    fn decode(&self, raw: &[u8]) -> Result<Vec<f32>, PickleError> {
        if raw.len() % self.size != 0 {
            return Err(PickleError::Array(format!(
                "{} bytes is not a whole number of {}-byte values",
                raw.len(),
                self.size
            )));
        }
        Ok(raw.chunks_exact(self.size).map(|c| self.value(c)).collect())
    }

    fn value(&self, chunk: &[u8]) -> f32 {
        let mut buf = [0_u8; 8];
        let bytes = &mut buf[..self.size];
        bytes.copy_from_slice(chunk);
        if self.big_endian {
            bytes.reverse();
        }
        let [b0, b1, b2, b3, ..] = buf;
        match (self.kind, self.size) {
            ('f', 4) => f32::from_le_bytes([b0, b1, b2, b3]),
            ('f', 8) => f64::from_le_bytes(buf) as f32,
            ('u' | 'b', 1) => f32::from(b0),
            ('i', 1) => f32::from(b0 as i8),
            ('u', 2) => f32::from(u16::from_le_bytes([b0, b1])),
            ('i', 2) => f32::from(i16::from_le_bytes([b0, b1])),
            ('u', 4) => u32::from_le_bytes([b0, b1, b2, b3]) as f32,
            ('i', 4) => i32::from_le_bytes([b0, b1, b2, b3]) as f32,
            ('u', 8) => u64::from_le_bytes(buf) as f32,
            ('i', 8) => i64::from_le_bytes(buf) as f32,
            // parse() admits only the kinds above
            _ => f32::NAN,
        }
    }
}

fn fortran_to_c(data: &[f32], shape: &[usize]) -> Vec<f32> {
    let mut out = Vec::with_capacity(data.len());
    let mut index = vec![0_usize; shape.len()];
    for _ in 0..data.len() {
        let mut offset = 0;
        let mut stride = 1;
        for (i, dim) in index.iter().zip(shape) {
            offset += i * stride;
            stride *= dim;
        }
        out.push(data[offset]);
        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

/// Emits pickles opcode by opcode, the way CPython and numpy lay them out.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::op;

    pub(crate) struct PickleWriter {
        buf: Vec<u8>,
        next_memo: u32,
        reconstruct: Option<u32>,
        ndarray: Option<u32>,
        encode: Option<u32>,
        dtypes: Vec<(String, u32)>,
    }

    impl PickleWriter {
        pub(crate) fn new(protocol: u8) -> Self {
            Self {
                buf: vec![op::PROTO, protocol],
                next_memo: 0,
                reconstruct: None,
                ndarray: None,
                encode: None,
                dtypes: Vec::new(),
            }
        }

        pub(crate) fn finish(mut self) -> Vec<u8> {
            self.buf.push(op::STOP);
            self.buf
        }

        pub(crate) fn op(&mut self, code: u8) -> &mut Self {
            self.buf.push(code);
            self
        }

        pub(crate) fn mark(&mut self) -> &mut Self {
            self.buf.push(op::MARK);
            self
        }

        pub(crate) fn raw(&mut self, bytes: &[u8]) -> &mut Self {
            self.buf.extend(bytes);
            self
        }

        pub(crate) fn put(&mut self) -> u32 {
            let key = self.next_memo;
            self.next_memo += 1;
            if let Ok(short) = u8::try_from(key) {
                self.buf.extend([op::BINPUT, short]);
            } else {
                self.buf.push(op::LONG_BINPUT);
                self.buf.extend(key.to_le_bytes());
            }
            key
        }

        pub(crate) fn get(&mut self, key: u32) -> &mut Self {
            if let Ok(short) = u8::try_from(key) {
                self.buf.extend([op::BINGET, short]);
            } else {
                self.buf.push(op::LONG_BINGET);
                self.buf.extend(key.to_le_bytes());
            }
            self
        }

        pub(crate) fn global(&mut self, module: &str, name: &str) -> u32 {
            self.buf.push(op::GLOBAL);
            self.buf.extend(format!("{module}\n{name}\n").bytes());
            self.put()
        }

        pub(crate) fn unicode(&mut self, text: &str) -> &mut Self {
            self.buf.push(op::BINUNICODE);
            self.buf.extend((text.len() as u32).to_le_bytes());
            self.buf.extend(text.bytes());
            self
        }

        pub(crate) fn short_unicode(&mut self, text: &str) -> &mut Self {
            self.buf.extend([op::SHORT_BINUNICODE, text.len() as u8]);
            self.buf.extend(text.bytes());
            self
        }

        pub(crate) fn short_bytes(&mut self, raw: &[u8]) -> &mut Self {
            self.buf.extend([op::SHORT_BINBYTES, raw.len() as u8]);
            self.buf.extend(raw);
            self
        }

        pub(crate) fn bytes(&mut self, raw: &[u8]) -> &mut Self {
            self.buf.push(op::BINBYTES);
            self.buf.extend((raw.len() as u32).to_le_bytes());
            self.buf.extend(raw);
            self
        }

        pub(crate) fn int(&mut self, v: i64) -> &mut Self {
            match (u8::try_from(v), u16::try_from(v), i32::try_from(v)) {
                (Ok(b), _, _) => self.buf.extend([op::BININT1, b]),
                (_, Ok(w), _) => {
                    self.buf.push(op::BININT2);
                    self.buf.extend(w.to_le_bytes());
                }
                (_, _, Ok(d)) => {
                    self.buf.push(op::BININT);
                    self.buf.extend(d.to_le_bytes());
                }
                _ => {
                    self.buf.extend([op::LONG1, 8]);
                    self.buf.extend(v.to_le_bytes());
                }
            }
            self
        }

        pub(crate) fn tuple(&mut self, items: impl FnOnce(&mut Self)) -> &mut Self {
            self.mark();
            items(self);
            self.buf.push(op::TUPLE);
            self
        }

        /// Protocol-2 `bytes`: `_codecs.encode(latin1_text, 'latin1')`.
        fn p2_bytes(&mut self, raw: &[u8]) {
            match self.encode {
                Some(key) => {
                    self.get(key);
                }
                None => self.encode = Some(self.global("_codecs", "encode")),
            }
            let text = raw.iter().map(|b| char::from(*b)).collect::<String>();
            self.unicode(&text).unicode("latin1").op(op::TUPLE2);
            self.put();
            self.op(op::REDUCE);
            self.put();
        }

        fn dtype(&mut self, descr: &str, order: &str) {
            if let Some((_, key)) = self.dtypes.iter().find(|(d, _)| d == descr) {
                let key = *key;
                self.get(key);
                return;
            }
            self.global("numpy", "dtype");
            self.unicode(descr)
                .op(op::NEWFALSE)
                .op(op::NEWTRUE)
                .op(op::TUPLE3);
            self.put();
            self.op(op::REDUCE);
            let key = self.put();
            self.dtypes.push((descr.to_string(), key));
            self.tuple(|w| {
                w.int(3).unicode(order);
                w.op(op::NONE).op(op::NONE).op(op::NONE);
                w.int(-1).int(-1).int(0);
            });
            self.op(op::BUILD);
        }

        /// Writes one ndarray the way `pickle.dumps(arr, protocol=2)` does,
        /// sharing globals and dtypes with earlier arrays through the memo.
        pub(crate) fn p2_array(&mut self, shape: &[usize], descr: &str, order: &str, raw: &[u8]) {
            match self.reconstruct {
                Some(key) => {
                    self.get(key);
                }
                None => {
                    self.reconstruct = Some(self.global("numpy.core.multiarray", "_reconstruct"))
                }
            }
            match self.ndarray {
                Some(key) => {
                    self.get(key);
                }
                None => self.ndarray = Some(self.global("numpy", "ndarray")),
            }
            self.int(0).op(op::TUPLE1);
            self.put();
            self.p2_bytes(b"b");
            self.op(op::TUPLE3);
            self.put();
            self.op(op::REDUCE);
            self.put();

            self.mark().int(1);
            self.tuple(|w| {
                for dim in shape {
                    w.int(*dim as i64);
                }
            });
            self.put();
            self.dtype(descr, order);
            self.op(op::NEWFALSE);
            self.p2_bytes(raw);
            self.buf.push(op::TUPLE);
            self.put();
            self.op(op::BUILD);
        }
    }

    pub(crate) fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::fixtures::{f32_bytes, PickleWriter};
    use super::*;

    fn array(obj: &Object) -> &NdArray {
        match obj {
            Object::Array(a) => a,
            other => panic!("expected an array, got {other:?}"),
        }
    }

    #[test]
    fn reads_plain_containers_written_by_serde_pickle() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), vec![vec![1.5_f64, -2.0], vec![0.25, 4.0]]);
        map.insert("b".to_string(), Vec::new());
        let bytes = serde_pickle::to_vec(&map, serde_pickle::SerOptions::new()).unwrap();

        let mut root = from_slice(&bytes).unwrap();
        assert_eq!(
            root.take_entry("a"),
            Some(Object::List(vec![
                Object::List(vec![Object::Float(1.5), Object::Float(-2.0)]),
                Object::List(vec![Object::Float(0.25), Object::Float(4.0)]),
            ]))
        );
        assert_eq!(root.take_entry("b"), Some(Object::List(Vec::new())));
        assert_eq!(root.take_entry("c"), None);
    }

    #[test]
    fn reads_wide_and_negative_integers() {
        let values = vec![0_i64, 200, 70_000, -5, i64::MIN, i64::MAX];
        let bytes = serde_pickle::to_vec(&values, serde_pickle::SerOptions::new()).unwrap();
        let decoded = from_slice(&bytes).unwrap();
        assert_eq!(
            decoded,
            Object::List(values.into_iter().map(Object::Int).collect())
        );
    }

    #[test]
    fn protocol2_arrays_share_memoized_dtype() {
        let mut w = PickleWriter::new(2);
        w.op(op::EMPTY_LIST);
        w.put();
        w.mark();
        w.p2_array(&[2, 2], "f4", "<", &f32_bytes(&[0.5, -0.5, 1.0, 0.0]));
        w.p2_array(&[2, 2], "f4", "<", &f32_bytes(&[-1.0, 0.25, 0.75, 1.0]));
        w.op(op::APPENDS);

        let decoded = from_slice(&w.finish()).unwrap();
        let Object::List(items) = decoded else {
            panic!("expected a list");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(array(&items[0]).shape, vec![2, 2]);
        assert_eq!(&*array(&items[0]).data, &[0.5, -0.5, 1.0, 0.0]);
        assert_eq!(&*array(&items[1]).data, &[-1.0, 0.25, 0.75, 1.0]);
    }

    #[test]
    fn big_endian_order_survives_memo_reuse() {
        let be = |values: &[f32]| values.iter().flat_map(|v| v.to_be_bytes()).collect::<Vec<_>>();
        let mut w = PickleWriter::new(2);
        w.op(op::EMPTY_LIST);
        w.put();
        w.mark();
        w.p2_array(&[2], "f4", ">", &be(&[1.0, 2.0]));
        w.p2_array(&[2], "f4", ">", &be(&[3.0, -4.0]));
        w.op(op::APPENDS);

        let Object::List(items) = from_slice(&w.finish()).unwrap() else {
            panic!("expected a list");
        };
        assert_eq!(&*array(&items[1]).data, &[3.0, -4.0]);
    }

    #[test]
    fn protocol4_fortran_array_is_reordered() {
        // 2x3 float64 in column-major order: [[1, 2, 3], [4, 5, 6]]
        let raw = [1.0_f64, 4.0, 2.0, 5.0, 3.0, 6.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<_>>();
        let mut w = PickleWriter::new(4);
        w.op(op::FRAME);
        w.raw(&[0; 8]);
        w.short_unicode("numpy.core.multiarray").op(op::MEMOIZE);
        w.short_unicode("_reconstruct").op(op::MEMOIZE);
        w.op(op::STACK_GLOBAL).op(op::MEMOIZE);
        w.short_unicode("numpy").op(op::MEMOIZE);
        w.short_unicode("ndarray").op(op::MEMOIZE);
        w.op(op::STACK_GLOBAL).op(op::MEMOIZE);
        w.int(0).op(op::TUPLE1).op(op::MEMOIZE);
        w.short_bytes(b"b").op(op::MEMOIZE);
        w.op(op::TUPLE3).op(op::MEMOIZE).op(op::REDUCE).op(op::MEMOIZE);
        w.mark();
        w.int(1).int(2).int(3).op(op::TUPLE2).op(op::MEMOIZE);
        w.short_unicode("numpy").op(op::MEMOIZE);
        w.short_unicode("dtype").op(op::MEMOIZE);
        w.op(op::STACK_GLOBAL).op(op::MEMOIZE);
        w.short_unicode("f8").op(op::MEMOIZE);
        w.op(op::NEWFALSE).op(op::NEWTRUE).op(op::TUPLE3).op(op::MEMOIZE);
        w.op(op::REDUCE).op(op::MEMOIZE);
        w.tuple(|w| {
            w.int(3).short_unicode("<").op(op::MEMOIZE);
            w.op(op::NONE).op(op::NONE).op(op::NONE);
            w.int(-1).int(-1).int(0);
        });
        w.op(op::MEMOIZE).op(op::BUILD);
        w.op(op::NEWTRUE);
        w.bytes(&raw).op(op::MEMOIZE);
        w.op(op::TUPLE).op(op::MEMOIZE).op(op::BUILD);

        let decoded = from_slice(&w.finish()).unwrap();
        let a = array(&decoded);
        assert_eq!(a.shape, vec![2, 3]);
        assert_eq!(&*a.data, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn frombuffer_reduction_decodes_uint8() {
        let mut w = PickleWriter::new(5);
        w.global("numpy.core.numeric", "_frombuffer");
        w.tuple(|w| {
            w.bytes(&[0, 128, 255, 7]);
            w.global("numpy", "dtype");
            w.unicode("u1").op(op::NEWFALSE).op(op::NEWTRUE).op(op::TUPLE3);
            w.op(op::REDUCE);
            w.tuple(|w| {
                w.int(3).unicode("|");
                w.op(op::NONE).op(op::NONE).op(op::NONE);
                w.int(-1).int(-1).int(0);
            });
            w.op(op::BUILD);
            w.int(2).int(2).op(op::TUPLE2);
            w.unicode("C");
        });
        w.op(op::REDUCE);

        let decoded = from_slice(&w.finish()).unwrap();
        let a = array(&decoded);
        assert_eq!(a.shape, vec![2, 2]);
        assert_eq!(&*a.data, &[0.0, 128.0, 255.0, 7.0]);
    }

    #[test]
    fn truncated_and_unknown_input_is_rejected() {
        let bytes = serde_pickle::to_vec(&vec![1.0_f64, 2.0], serde_pickle::SerOptions::new())
            .unwrap();
        assert!(matches!(
            from_slice(&bytes[..bytes.len() - 1]),
            Err(PickleError::MissingStop)
        ));

        // persistent ids are not part of any dataset file
        assert!(matches!(
            from_slice(&[op::PROTO, 2, b'Q', op::STOP]),
            Err(PickleError::UnsupportedOpcode { code: b'Q', at: 2 })
        ));
        assert!(matches!(
            from_slice(&[op::PROTO, 2, op::BINGET, 9, op::STOP]),
            Err(PickleError::MissingMemo(9))
        ));
    }

    #[test]
    fn array_shape_must_match_buffer() {
        let mut w = PickleWriter::new(2);
        w.p2_array(&[3], "f4", "<", &f32_bytes(&[1.0, 2.0]));
        assert!(matches!(
            from_slice(&w.finish()),
            Err(PickleError::Array(_))
        ));
    }

    #[test]
    fn dtype_parse_covers_prefixes_and_rejects_strings() {
        let d = Dtype::parse("<f8", None).unwrap();
        assert_eq!((d.kind, d.size, d.big_endian), ('f', 8, false));
        assert!(Dtype::parse("f4", Some(">")).unwrap().big_endian);
        assert!(Dtype::parse("U8", None).is_err());
        assert!(Dtype::parse("f2", None).is_err());
    }

    #[test]
    fn fortran_to_c_transposes_three_axes() {
        // shape (2, 2, 2); Fortran offset = i + 2j + 4k
        let fortran = (0..8).map(|v| v as f32).collect::<Vec<_>>();
        let c = fortran_to_c(&fortran, &[2, 2, 2]);
        assert_eq!(c, vec![0.0, 4.0, 2.0, 6.0, 1.0, 5.0, 3.0, 7.0]);
    }
}
