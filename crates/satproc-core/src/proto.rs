//! Built-in wire types of the command protocol.
//!
//! Numeric bases are part of the wire contract: command numbers start at
//! 256, so the first byte of an XDR datagram's leading u32 is always zero,
//! which is what distinguishes the format from legacy datagrams whose first
//! byte is a command number in 1..=255.

use std::any::Any;
use std::io::{self, Write};
use std::rc::Rc;

use crate::xdr::{
    Codec, FieldDef, FieldKind, PrintStyle, StructCodec, UnionValue, XdrError, XdrRegistry,
    XdrResult, decode_bytes, decode_i32, decode_u32, encode_bytes, encode_i32, encode_u32,
};

pub const CMD_BASE: u32 = 256;
/// Reserved command tag marking a datagram as a response.
pub const CMD_RESPONSE: u32 = CMD_BASE;
pub const CMD_STATUS: u32 = CMD_BASE + 1;
pub const CMD_DATA_REQ: u32 = CMD_BASE + 2;

const TYPE_BASE: u32 = 16_777_472;
pub const TYPE_VOID: u32 = 0;
pub const TYPE_OPAQUE_STRUCT: u32 = TYPE_BASE + 1;
pub const TYPE_OPAQUE_STRUCT_LIST: u32 = TYPE_BASE + 2;
pub const TYPE_COMMAND: u32 = TYPE_BASE + 3;
pub const TYPE_RESPONSE: u32 = TYPE_BASE + 4;
pub const TYPE_DATA_REQUEST: u32 = TYPE_BASE + 5;
pub const TYPE_RESPONSE_HEADER: u32 = TYPE_BASE + 6;
pub const TYPE_HEARTBEAT: u32 = TYPE_BASE + 7;
pub const TYPE_POPULATOR_ERROR: u32 = TYPE_BASE + 8;

const RESULT_BASE: u32 = 33_554_688;
pub const RESULT_SUCCESS: u32 = RESULT_BASE;
pub const RESULT_INCORRECT_PARAMETER_TYPE: u32 = RESULT_BASE + 1;
pub const RESULT_UNSUPPORTED: u32 = RESULT_BASE + 2;
pub const RESULT_ALLOCATION_ERROR: u32 = RESULT_BASE + 3;

/// Legacy single-byte status poll and its reply command number.
pub const LEGACY_STATUS_REQUEST: u8 = 0x01;
pub const LEGACY_STATUS_RESPONSE: u8 = 0xF1;

/// Largest datagram the receive paths will buffer.
pub const MAX_PACKET_SIZE: usize = 65535;

// ---------------------------------------------------------------------------
// Wire structs
// ---------------------------------------------------------------------------

/// Zero-field placeholder payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Void;

/// A request packet in the self-describing format.
#[derive(Debug, Default)]
pub struct Command {
    pub cmd: u32,
    pub ipcref: u32,
    pub parameters: UnionValue,
}

/// A reply packet. `result` is one of the `RESULT_*` codes or an
/// application-registered error id.
#[derive(Debug, Default)]
pub struct Response {
    pub cmd: u32,
    pub ipcref: u32,
    pub result: u32,
    pub data: UnionValue,
}

/// Prefix of [`Response`] that can be peeked without decoding the payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub cmd: u32,
    pub ipcref: u32,
    pub result: u32,
}

/// Aliveness counters served by the built-in heartbeat populator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub commands: u64,
    pub responses: u64,
    pub heartbeats: u64,
}

/// Parameter of the data-request compound command: the type ids to gather.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub types: Vec<u32>,
}

/// A pre-encoded tagged struct carried opaquely.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OpaqueStruct {
    pub data: Vec<u8>,
}

/// Array of opaque structs; the data-request response for multi-type lists.
#[derive(Debug, Default)]
pub struct OpaqueStructList {
    pub entries: Vec<OpaqueStruct>,
}

/// Placeholder embedded in a data-request response when a populator fails.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PopulatorError {
    pub type_id: u32,
    pub error: u32,
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

fn void_codec() -> StructCodec<Void> {
    StructCodec::new(TYPE_VOID, Vec::new())
}

fn command_codec() -> StructCodec<Command> {
    StructCodec::new(
        TYPE_COMMAND,
        vec![
            FieldDef::bare(FieldKind::U32(|c: &Command| c.cmd, |c, v| c.cmd = v)),
            FieldDef::bare(FieldKind::U32(|c: &Command| c.ipcref, |c, v| c.ipcref = v)),
            FieldDef::bare(FieldKind::Union(
                |c: &Command| &c.parameters,
                |c, v| c.parameters = v,
            )),
        ],
    )
}

fn response_codec() -> StructCodec<Response> {
    StructCodec::new(
        TYPE_RESPONSE,
        vec![
            FieldDef::bare(FieldKind::U32(|r: &Response| r.cmd, |r, v| r.cmd = v)),
            FieldDef::bare(FieldKind::U32(|r: &Response| r.ipcref, |r, v| r.ipcref = v)),
            FieldDef::bare(FieldKind::U32(|r: &Response| r.result, |r, v| r.result = v)),
            FieldDef::bare(FieldKind::Union(|r: &Response| &r.data, |r, v| r.data = v)),
        ],
    )
}

fn response_header_codec() -> StructCodec<ResponseHeader> {
    StructCodec::new(
        TYPE_RESPONSE_HEADER,
        vec![
            FieldDef::bare(FieldKind::U32(|r: &ResponseHeader| r.cmd, |r, v| r.cmd = v)),
            FieldDef::bare(FieldKind::U32(
                |r: &ResponseHeader| r.ipcref,
                |r, v| r.ipcref = v,
            )),
            FieldDef::bare(FieldKind::U32(
                |r: &ResponseHeader| r.result,
                |r, v| r.result = v,
            )),
        ],
    )
}

fn heartbeat_codec() -> StructCodec<Heartbeat> {
    StructCodec::new(
        TYPE_HEARTBEAT,
        vec![
            FieldDef::keyed(
                "proc_commands",
                FieldKind::U64(|h: &Heartbeat| h.commands, |h, v| h.commands = v),
            )
            .named("Commands")
            .described("The number of commands received by the process"),
            FieldDef::keyed(
                "proc_responses",
                FieldKind::U64(|h: &Heartbeat| h.responses, |h, v| h.responses = v),
            )
            .named("Responses")
            .described("The number of command responses received by the process"),
            FieldDef::keyed(
                "proc_heartbeats",
                FieldKind::U64(|h: &Heartbeat| h.heartbeats, |h, v| h.heartbeats = v),
            )
            .named("Heartbeats")
            .described("The number of heartbeat commands received by the process"),
        ],
    )
}

fn data_request_codec() -> StructCodec<DataRequest> {
    StructCodec::new(
        TYPE_DATA_REQUEST,
        vec![
            FieldDef::bare(FieldKind::Count(|d: &DataRequest| d.types.len() as u32)),
            FieldDef::keyed(
                "types",
                FieldKind::U32Array(|d: &DataRequest| &d.types, |d, v| d.types = v),
            ),
        ],
    )
}

fn opaque_struct_codec() -> StructCodec<OpaqueStruct> {
    StructCodec::new(
        TYPE_OPAQUE_STRUCT,
        vec![
            FieldDef::bare(FieldKind::Count(|o: &OpaqueStruct| o.data.len() as u32)),
            FieldDef::bare(FieldKind::Bytes(|o: &OpaqueStruct| &o.data, |o, v| o.data = v)),
        ],
    )
}

fn populator_error_codec() -> StructCodec<PopulatorError> {
    StructCodec::new(
        TYPE_POPULATOR_ERROR,
        vec![
            FieldDef::keyed(
                "type",
                FieldKind::U32(|p: &PopulatorError| p.type_id, |p, v| p.type_id = v),
            ),
            FieldDef::keyed(
                "error",
                FieldKind::U32(|p: &PopulatorError| p.error, |p, v| p.error = v),
            ),
        ],
    )
}

/// The opaque-struct array does not fit the flat field grammar (each entry
/// is length-framed), so it carries a hand-written codec.
struct OpaqueStructListCodec;

impl Codec for OpaqueStructListCodec {
    fn type_id(&self) -> u32 {
        TYPE_OPAQUE_STRUCT_LIST
    }

    fn decode(&self, _reg: &XdrRegistry, buf: &[u8]) -> XdrResult<(Box<dyn Any>, usize)> {
        let (count, mut used) = decode_i32(buf)?;
        let mut entries = Vec::new();
        for _ in 0..count.max(0) {
            let (len, n) = decode_i32(&buf[used..])?;
            used += n;
            let (data, n) = decode_bytes(&buf[used..], len.max(0) as usize)?;
            used += n;
            entries.push(OpaqueStruct { data });
        }
        Ok((Box::new(OpaqueStructList { entries }), used))
    }

    fn encode(&self, _reg: &XdrRegistry, value: &dyn Any, out: &mut Vec<u8>) -> XdrResult<()> {
        let list = value
            .downcast_ref::<OpaqueStructList>()
            .ok_or(XdrError::ValueType("OpaqueStructList"))?;
        encode_i32(list.entries.len() as i32, out);
        for entry in &list.entries {
            encode_i32(entry.data.len() as i32, out);
            encode_bytes(&entry.data, out);
        }
        Ok(())
    }

    fn print(
        &self,
        reg: &XdrRegistry,
        value: &dyn Any,
        out: &mut dyn Write,
        style: PrintStyle,
    ) -> io::Result<()> {
        let Some(list) = value.downcast_ref::<OpaqueStructList>() else {
            return Ok(());
        };
        for entry in &list.entries {
            let Ok((u, _)) = reg.decode_union(&entry.data) else {
                continue;
            };
            if let (Some(codec), Some(data)) = (reg.codec(u.type_id), &u.data) {
                codec.print(reg, &**data, out, style)?;
            }
        }
        Ok(())
    }
}

/// Register every built-in protocol type.
pub fn register_builtin_types(reg: &XdrRegistry) {
    reg.register(Rc::new(void_codec()));
    reg.register(Rc::new(command_codec()));
    reg.register(Rc::new(response_codec()));
    reg.register(Rc::new(response_header_codec()));
    reg.register(Rc::new(heartbeat_codec()));
    reg.register(Rc::new(data_request_codec()));
    reg.register(Rc::new(opaque_struct_codec()));
    reg.register(Rc::new(OpaqueStructListCodec));
    reg.register(Rc::new(populator_error_codec()));
}

// ---------------------------------------------------------------------------
// Helpers shared by the engine and the CLI
// ---------------------------------------------------------------------------

/// Peek the response prefix without consulting the registry.
pub fn decode_response_header(buf: &[u8]) -> XdrResult<(ResponseHeader, usize)> {
    let (cmd, mut used) = decode_u32(buf)?;
    let (ipcref, n) = decode_u32(&buf[used..])?;
    used += n;
    let (result, n) = decode_u32(&buf[used..])?;
    used += n;
    Ok((
        ResponseHeader {
            cmd,
            ipcref,
            result,
        },
        used,
    ))
}

/// Encode a command datagram: `{cmd, ipcref, Union{param_type, params}}`.
pub fn encode_command(
    reg: &XdrRegistry,
    cmd: u32,
    ipcref: u32,
    param_type: u32,
    params: Option<&dyn Any>,
) -> XdrResult<Vec<u8>> {
    let mut out = Vec::new();
    encode_u32(cmd, &mut out);
    encode_u32(ipcref, &mut out);
    encode_u32(param_type, &mut out);
    if let Some(params) = params {
        let codec = reg.codec(param_type).ok_or(XdrError::UnknownType(param_type))?;
        codec.encode(reg, params, &mut out)?;
    }
    Ok(out)
}

/// Encode a response datagram for `(ipcref, result)` carrying `data`.
pub fn encode_response(
    reg: &XdrRegistry,
    ipcref: u32,
    result: u32,
    data_type: u32,
    data: Option<&dyn Any>,
) -> XdrResult<Vec<u8>> {
    let mut out = Vec::new();
    encode_u32(CMD_RESPONSE, &mut out);
    encode_u32(ipcref, &mut out);
    encode_u32(result, &mut out);
    encode_u32(data_type, &mut out);
    if let Some(data) = data {
        let codec = reg.codec(data_type).ok_or(XdrError::UnknownType(data_type))?;
        codec.encode(reg, data, &mut out)?;
    }
    Ok(out)
}

/// Print the encoded tagged struct (or opaque-struct array) in `buf`.
///
/// This is the response-payload renderer: the payload of a decoded response
/// is a union body, possibly an array of nested union bodies.
pub fn print_encoded(
    reg: &XdrRegistry,
    buf: &[u8],
    out: &mut dyn Write,
    style: PrintStyle,
) -> XdrResult<()> {
    let (type_id, used) = decode_u32(buf)?;

    if type_id != TYPE_OPAQUE_STRUCT_LIST {
        let codec = reg.codec(type_id).ok_or(XdrError::UnknownType(type_id))?;
        let (value, _) = codec.decode(reg, &buf[used..])?;
        let _ = codec.print(reg, &*value, out, style);
        return Ok(());
    }

    let (count, n) = decode_i32(&buf[used..])?;
    let mut off = used + n;
    for _ in 0..count.max(0) {
        let (len, n) = decode_i32(&buf[off..])?;
        off += n;
        let len = len.max(0) as usize;
        if off + len > buf.len() {
            return Err(XdrError::Truncated {
                needed: len,
                have: buf.len() - off,
            });
        }
        print_encoded(reg, &buf[off..off + len], out, style)?;
        // Union bodies are 4-byte aligned, so entries carry no padding.
        off += len + (4 - len % 4) % 4;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> XdrRegistry {
        let reg = XdrRegistry::new();
        register_builtin_types(&reg);
        reg
    }

    #[test]
    fn command_datagram_starts_with_zero_byte() {
        let reg = registry();
        let buf = encode_command(&reg, CMD_STATUS, 7, TYPE_VOID, None).unwrap();
        assert_eq!(buf[0], 0, "XDR datagrams are distinguished by byte0 == 0");
    }

    #[test]
    fn command_round_trip_with_heartbeat_parameters() {
        let reg = registry();
        let hb = Heartbeat {
            commands: 5,
            responses: 2,
            heartbeats: 9,
        };
        let buf = encode_command(&reg, CMD_STATUS, 42, TYPE_HEARTBEAT, Some(&hb)).unwrap();

        let (cmd, used) = reg.decode_as(TYPE_COMMAND, &buf).unwrap();
        assert_eq!(used, buf.len());
        let cmd = cmd.downcast_ref::<Command>().unwrap();
        assert_eq!(cmd.cmd, CMD_STATUS);
        assert_eq!(cmd.ipcref, 42);
        assert_eq!(cmd.parameters.type_id, TYPE_HEARTBEAT);
        assert_eq!(cmd.parameters.downcast_ref::<Heartbeat>(), Some(&hb));
    }

    #[test]
    fn response_header_is_a_prefix_of_response() {
        let reg = registry();
        let buf = encode_response(&reg, 99, RESULT_SUCCESS, TYPE_VOID, Some(&Void)).unwrap();

        let (hdr, used) = decode_response_header(&buf).unwrap();
        assert_eq!(used, 12);
        assert_eq!(
            hdr,
            ResponseHeader {
                cmd: CMD_RESPONSE,
                ipcref: 99,
                result: RESULT_SUCCESS,
            }
        );

        let (resp, used) = reg.decode_as(TYPE_RESPONSE, &buf).unwrap();
        assert_eq!(used, buf.len());
        let resp = resp.downcast_ref::<Response>().unwrap();
        assert_eq!(resp.ipcref, 99);
        assert_eq!(resp.data.type_id, TYPE_VOID);
    }

    #[test]
    fn data_request_round_trip_including_empty() {
        let reg = registry();
        for types in [vec![], vec![TYPE_HEARTBEAT], vec![1, 2, 3]] {
            let req = DataRequest {
                types: types.clone(),
            };
            let mut out = Vec::new();
            reg.codec(TYPE_DATA_REQUEST)
                .unwrap()
                .encode(&reg, &req, &mut out)
                .unwrap();
            let (back, used) = reg.decode_as(TYPE_DATA_REQUEST, &out).unwrap();
            assert_eq!(used, out.len());
            assert_eq!(back.downcast_ref::<DataRequest>().unwrap().types, types);
        }
    }

    #[test]
    fn opaque_struct_list_round_trip() {
        let reg = registry();
        let hb = Heartbeat {
            commands: 1,
            responses: 2,
            heartbeats: 3,
        };
        let list = OpaqueStructList {
            entries: vec![
                OpaqueStruct {
                    data: reg.encode_tagged(TYPE_HEARTBEAT, &hb).unwrap(),
                },
                OpaqueStruct {
                    data: reg
                        .encode_tagged(
                            TYPE_POPULATOR_ERROR,
                            &PopulatorError {
                                type_id: 77,
                                error: RESULT_UNSUPPORTED,
                            },
                        )
                        .unwrap(),
                },
            ],
        };

        let mut out = Vec::new();
        reg.codec(TYPE_OPAQUE_STRUCT_LIST)
            .unwrap()
            .encode(&reg, &list, &mut out)
            .unwrap();
        let (back, used) = reg.decode_as(TYPE_OPAQUE_STRUCT_LIST, &out).unwrap();
        assert_eq!(used, out.len());
        let back = back.downcast_ref::<OpaqueStructList>().unwrap();
        assert_eq!(back.entries.len(), 2);

        let (u, _) = reg.decode_union(&back.entries[0].data).unwrap();
        assert_eq!(u.downcast_ref::<Heartbeat>(), Some(&hb));
        let (u, _) = reg.decode_union(&back.entries[1].data).unwrap();
        assert_eq!(u.downcast_ref::<PopulatorError>().unwrap().type_id, 77);
    }

    #[test]
    fn print_encoded_renders_heartbeat_and_lists() {
        let reg = registry();
        let hb = Heartbeat {
            commands: 5,
            responses: 2,
            heartbeats: 9,
        };
        let tagged = reg.encode_tagged(TYPE_HEARTBEAT, &hb).unwrap();

        let mut out = Vec::new();
        print_encoded(&reg, &tagged, &mut out, PrintStyle::KeyValue).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("proc_commands=5\n"), "{text}");
        assert!(text.contains("proc_heartbeats=9\n"), "{text}");

        let list = OpaqueStructList {
            entries: vec![OpaqueStruct { data: tagged }],
        };
        let body = reg.encode_tagged(TYPE_OPAQUE_STRUCT_LIST, &list).unwrap();
        let mut out = Vec::new();
        print_encoded(&reg, &body, &mut out, PrintStyle::KeyValue).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("proc_responses=2\n"));
    }
}
