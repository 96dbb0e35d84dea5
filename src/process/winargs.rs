//! Windows spawn computations, kept portable.
//!
//! Building a `CreateProcess` invocation is mostly string and byte
//! manipulation: quoting argv into a single command line, assembling the
//! environment block, and packing the CRT stdio inheritance payload that
//! wires up the child runtime's fds. None of that needs a Windows host, so
//! it lives here as pure functions with unit tests; only the actual
//! process-creation call is platform glue.

/// Quotes one argument with the rules `CommandLineToArgvW` undoes:
/// no quoting when nothing needs it, plain wrapping when the argument has
/// no quotes or backslashes, and otherwise full escaping where every
/// backslash run before a quote (including the closing one) is doubled.
fn quote_arg(arg: &str, dst: &mut String) {
    if arg.is_empty() {
        return;
    }

    if !arg.contains([' ', '\t', '"']) {
        dst.push_str(arg);
        return;
    }

    if !arg.contains(['"', '\\']) {
        dst.push('"');
        dst.push_str(arg);
        dst.push('"');
        return;
    }

    // Walk the argument backwards so a backslash run is doubled exactly
    // when it precedes a quote; the escaped text is reversed back at the
    // end.
    dst.push('"');
    let mut reversed = Vec::new();
    let mut quote_hit = true;
    for ch in arg.chars().rev() {
        reversed.push(ch);
        if quote_hit && ch == '\\' {
            reversed.push('\\');
        } else if ch == '"' {
            quote_hit = true;
            reversed.push('\\');
        } else {
            quote_hit = false;
        }
    }
    dst.extend(reversed.iter().rev());
    dst.push('"');
}

/// Joins argv into one command line. Verbatim mode copies arguments
/// untouched, for programs that parse their own command line.
pub fn make_command_line(args: &[String], verbatim: bool) -> String {
    let mut line = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        if verbatim {
            line.push_str(arg);
        } else {
            quote_arg(arg, &mut line);
        }
    }
    line
}

/// Variables the child cannot start without; `CreateProcess` fills in none
/// of them for an explicit environment block.
const REQUIRED_VARS: [&str; 3] = ["SYSTEMROOT", "SYSTEMDRIVE", "TEMP"];

/// Builds a UTF-16 environment block: `VAR=value\0` entries with a final
/// extra NUL. Required variables missing from `env` are taken from
/// `parent` (the parent's environment in production).
pub fn make_env_block(
    env: &[(String, String)],
    parent: impl Fn(&str) -> Option<String>,
) -> Vec<u16> {
    let mut block = Vec::new();

    let mut push_entry = |key: &str, value: &str| {
        block.extend(key.encode_utf16());
        block.push(b'=' as u16);
        block.extend(value.encode_utf16());
        block.push(0);
    };

    for (key, value) in env {
        push_entry(key, value);
    }

    for required in REQUIRED_VARS {
        if env.iter().any(|(key, _)| key == required) {
            continue;
        }
        if let Some(value) = parent(required) {
            push_entry(required, &value);
        }
    }

    block.push(0);
    block
}

/// CRT descriptor mode flags, as the child's C runtime expects them.
const FOPEN: u8 = 0x01;
const FPIPE: u8 = 0x08;
const FDEV: u8 = 0x40;

/// One slot of the CRT stdio inheritance payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrtStdio {
    /// Slot not open in the child.
    Closed,
    Pipe(usize),
    /// Character device (console, NUL).
    Dev(usize),
    File(usize),
}

const INVALID_HANDLE: usize = usize::MAX;

/// Packs the payload passed through the startup info's reserved fields:
/// a count, one CRT flag byte per fd, then one OS handle per fd. The
/// child's C runtime reads it back to wire up fds `0..count`.
pub fn make_stdio_payload(slots: &[CrtStdio]) -> Vec<u8> {
    let count = slots.len();
    let mut payload = Vec::with_capacity(
        std::mem::size_of::<i32>() + count + count * std::mem::size_of::<usize>(),
    );

    payload.extend_from_slice(&(count as i32).to_ne_bytes());
    for slot in slots {
        payload.push(match slot {
            CrtStdio::Closed => 0,
            CrtStdio::Pipe(_) => FOPEN | FPIPE,
            CrtStdio::Dev(_) => FOPEN | FDEV,
            CrtStdio::File(_) => FOPEN,
        });
    }
    for slot in slots {
        let handle = match slot {
            CrtStdio::Closed => INVALID_HANDLE,
            CrtStdio::Pipe(handle) | CrtStdio::Dev(handle) | CrtStdio::File(handle) => *handle,
        };
        payload.extend_from_slice(&handle.to_ne_bytes());
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quoted(arg: &str) -> String {
        let mut out = String::new();
        quote_arg(arg, &mut out);
        out
    }

    #[test]
    fn quoting_table() {
        assert_eq!(quoted("plain"), "plain");
        assert_eq!(quoted(r"hello\world"), r"hello\world");
        assert_eq!(quoted(r"hello\\world"), r"hello\\world");
        assert_eq!(quoted("hello world"), r#""hello world""#);
        assert_eq!(quoted(r#"hello"world"#), r#""hello\"world""#);
        assert_eq!(quoted(r#"hello""world"#), r#""hello\"\"world""#);
        assert_eq!(quoted(r#"hello\"world"#), r#""hello\\\"world""#);
        assert_eq!(quoted(r#"hello\\"world"#), r#""hello\\\\\"world""#);
        assert_eq!(quoted("hello world\\"), "\"hello world\\\\\"");
    }

    #[test]
    fn command_line_joins_and_quotes() {
        let args = vec!["prog".to_string(), "a b".to_string(), "c".to_string()];
        assert_eq!(make_command_line(&args, false), r#"prog "a b" c"#);
        assert_eq!(make_command_line(&args, true), "prog a b c");
    }

    #[test]
    fn env_block_fills_required_vars() {
        let env = vec![("FOO".to_string(), "bar".to_string())];
        let block = make_env_block(&env, |name| match name {
            "SYSTEMROOT" => Some(r"C:\Windows".to_string()),
            "SYSTEMDRIVE" => Some("C:".to_string()),
            _ => None,
        });

        let as_string = String::from_utf16(&block).unwrap();
        let entries: Vec<&str> = as_string.split('\0').filter(|s| !s.is_empty()).collect();
        assert!(entries.contains(&"FOO=bar"));
        assert!(entries.contains(&r"SYSTEMROOT=C:\Windows"));
        assert!(entries.contains(&"SYSTEMDRIVE=C:"));
        // TEMP unavailable from the parent, so it is simply absent.
        assert!(!entries.iter().any(|e| e.starts_with("TEMP=")));

        // Double-NUL terminated.
        assert_eq!(&block[block.len() - 2..], &[0, 0]);
    }

    #[test]
    fn env_block_keeps_explicit_required_var() {
        let env = vec![("SYSTEMROOT".to_string(), r"D:\Win".to_string())];
        let block = make_env_block(&env, |_| Some("ignored".to_string()));
        let as_string = String::from_utf16(&block).unwrap();
        assert_eq!(
            as_string.matches("SYSTEMROOT=").count(),
            1,
            "explicit value must not be duplicated"
        );
    }

    #[test]
    fn stdio_payload_layout() {
        let slots = [
            CrtStdio::Pipe(0x1234),
            CrtStdio::Closed,
            CrtStdio::Dev(0x5678),
        ];
        let payload = make_stdio_payload(&slots);

        let handle_size = std::mem::size_of::<usize>();
        assert_eq!(payload.len(), 4 + 3 + 3 * handle_size);
        assert_eq!(i32::from_ne_bytes(payload[0..4].try_into().unwrap()), 3);
        assert_eq!(payload[4], FOPEN | FPIPE);
        assert_eq!(payload[5], 0);
        assert_eq!(payload[6], FOPEN | FDEV);

        let handles = &payload[7..];
        let read = |i: usize| {
            usize::from_ne_bytes(
                handles[i * handle_size..(i + 1) * handle_size]
                    .try_into()
                    .unwrap(),
            )
        };
        assert_eq!(read(0), 0x1234);
        assert_eq!(read(1), INVALID_HANDLE);
        assert_eq!(read(2), 0x5678);
    }
}
