//! Subcommand implementations.

use std::io::Write;
use std::time::Duration;

use log::debug;

use satproc_core::cmd::{CommandCatalog, CommandSpec, ErrorCatalog};
use satproc_core::net;
use satproc_core::proto::{self, DataRequest};
use satproc_core::xdr::{PrintStyle, XdrRegistry};

pub struct SendArgs {
    pub command: Option<String>,
    pub number: Option<u32>,
    pub proc: String,
    pub host: String,
    pub format: String,
    pub timeout_ms: u64,
    pub params: Vec<String>,
}

fn registry() -> XdrRegistry {
    let reg = XdrRegistry::new();
    proto::register_builtin_types(&reg);
    reg
}

fn parse_style(format: &str) -> PrintStyle {
    match format {
        "kvp" => PrintStyle::KeyValue,
        "csv" => PrintStyle::CsvData,
        _ => PrintStyle::Human,
    }
}

fn lookup<'a>(
    catalog: &'a CommandCatalog,
    name: Option<&str>,
    number: Option<u32>,
) -> Option<&'a CommandSpec> {
    match (name, number) {
        (Some(name), _) => catalog.by_name(name),
        (None, Some(number)) => catalog.by_number(number),
        (None, None) => None,
    }
}

pub fn send(args: SendArgs) -> i32 {
    let reg = registry();
    let catalog = CommandCatalog::with_builtins();
    let errors = ErrorCatalog::with_builtins();
    let style = parse_style(&args.format);

    let Some(spec) = lookup(&catalog, args.command.as_deref(), args.number) else {
        eprintln!("unknown command; try `satctl list`");
        return 2;
    };

    // Assemble the datagram: either a data-request expansion or a command
    // with parameters scanned from key=value pairs.
    let datagram = if spec.command == 0 {
        let req = DataRequest {
            types: spec.datareq_types.to_vec(),
        };
        proto::encode_command(&reg, proto::CMD_DATA_REQ, 1, proto::TYPE_DATA_REQUEST, Some(&req))
    } else if spec.param_type != 0 {
        let Some(codec) = reg.codec(spec.param_type) else {
            eprintln!("{}: parameter type is not registered", spec.name);
            return 2;
        };
        let Some(mut value) = codec.new_value() else {
            eprintln!("{}: parameters cannot be built from text", spec.name);
            return 2;
        };
        for pair in &args.params {
            let Some((key, text)) = pair.split_once('=') else {
                eprintln!("parameter `{pair}` is not of the form key=value");
                return usage(spec);
            };
            if let Err(e) = codec.scan(&mut *value, key, text) {
                eprintln!("{key}: {e}");
                return usage(spec);
            }
        }
        proto::encode_command(&reg, spec.command, 1, spec.param_type, Some(&*value))
    } else {
        if !args.params.is_empty() {
            eprintln!("{} takes no parameters", spec.name);
            return usage(spec);
        }
        proto::encode_command(&reg, spec.command, 1, proto::TYPE_VOID, None)
    };

    let datagram = match datagram {
        Ok(buf) => buf,
        Err(e) => {
            eprintln!("failed to encode command: {e}");
            return 1;
        }
    };

    debug!(
        "sending {} ({} bytes) to {}:{}",
        spec.name,
        datagram.len(),
        args.host,
        args.proc
    );

    let response = match net::send_and_await_response(
        Some(&args.host),
        &args.proc,
        &datagram,
        Duration::from_millis(args.timeout_ms),
    ) {
        Ok(buf) => buf,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    print_response(&reg, &errors, &response, style)
}

fn print_response(reg: &XdrRegistry, errors: &ErrorCatalog, buf: &[u8], style: PrintStyle) -> i32 {
    let Ok((hdr, used)) = proto::decode_response_header(buf) else {
        eprintln!("response too short to decode");
        return 1;
    };
    if hdr.cmd != proto::CMD_RESPONSE {
        println!("Packet received, but not a response type!");
        return 1;
    }
    if hdr.result != proto::RESULT_SUCCESS {
        println!("Error: {}", errors.message(hdr.result));
        return 1;
    }

    let payload = &buf[used..];
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if style == PrintStyle::CsvData {
        if proto::print_encoded(reg, payload, &mut out, PrintStyle::CsvHeader).is_ok() {
            let _ = writeln!(out);
        }
    }
    match proto::print_encoded(reg, payload, &mut out, style) {
        Ok(()) => {
            if style == PrintStyle::CsvData {
                let _ = writeln!(out);
            }
            0
        }
        Err(e) => {
            eprintln!("failed to decode response payload: {e}");
            1
        }
    }
}

fn usage(spec: &CommandSpec) -> i32 {
    let reg = registry();
    println!("{} [-H <destination>] [-f <kvp | csv | human>]", spec.name);
    println!("  {}", spec.summary);

    if spec.param_type != 0 {
        if let Some(codec) = reg.codec(spec.param_type) {
            let keys = codec.field_keys();
            if !keys.is_empty() {
                println!("  Valid parameter/value pairs are:");
                for help in keys {
                    match help.description {
                        Some(d) => println!("    {:>24} -- {d}", help.key),
                        None => println!("    {:>24} -- UNDOCUMENTED", help.key),
                    }
                }
            }
        }
    }
    2
}

pub fn list() -> i32 {
    let catalog = CommandCatalog::with_builtins();
    println!("Available commands:");
    let mut specs: Vec<&CommandSpec> = catalog.iter().collect();
    specs.sort_by_key(|s| s.name);
    for spec in specs {
        println!("  {:>24} -- {}", spec.name, spec.summary);
    }
    0
}

pub fn describe(name: &str) -> i32 {
    let catalog = CommandCatalog::with_builtins();
    match catalog.by_name(name) {
        Some(spec) => usage(spec),
        None => {
            eprintln!("unknown command `{name}`; try `satctl list`");
            2
        }
    }
}

pub fn errors() -> i32 {
    let errors = ErrorCatalog::with_builtins();
    let mut infos: Vec<_> = errors.iter().collect();
    infos.sort_by_key(|e| e.id);
    println!("Registered result codes:");
    for info in infos {
        println!("  {:>10}  {:<28} {}", info.id, info.name, info.description);
    }
    0
}
