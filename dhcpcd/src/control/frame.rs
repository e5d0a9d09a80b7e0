//! Control command framing.
//!
//! A command is its arguments, each terminated by a NUL byte, with the
//! final NUL replaced by a newline.

use crate::error::Error;
use std::str;

/// Encode the arguments of one command.
pub fn encode_argv<S: AsRef<str>>(argv: &[S]) -> Vec<u8> {
    let mut frame = Vec::new();
    for arg in argv {
        frame.extend_from_slice(arg.as_ref().as_bytes());
        frame.push(0);
    }
    match frame.last_mut() {
        Some(last) => *last = b'\n',
        None => frame.push(b'\n'),
    }
    frame
}

/// Decode one command, including its trailing newline.
pub fn parse_argv(frame: &[u8]) -> Result<Vec<String>, Error> {
    let body = match frame.split_last() {
        Some((b'\n', body)) => body,
        _ => return Err(Error::Protocol("unterminated command")),
    };
    if body.is_empty() {
        return Err(Error::Protocol("empty command"));
    }

    body.split(|byte| *byte == 0)
        .map(|arg| {
            str::from_utf8(arg)
                .map(ToString::to_string)
                .map_err(|_| Error::Protocol("invalid argument encoding"))
        })
        .collect()
}

/// Decode all commands of a read.
///
/// The read must end with a complete command; partial frames are not
/// buffered.
pub fn parse_frames(data: &[u8]) -> Result<Vec<Vec<String>>, Error> {
    if data.last() != Some(&b'\n') {
        return Err(Error::Protocol("unterminated command"));
    }
    data.split_inclusive(|byte| *byte == b'\n')
        .map(parse_argv)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{encode_argv, parse_argv, parse_frames};
    use crate::error::Error;

    #[test]
    fn test_single_argument() {
        assert_eq!(encode_argv(&["b"]), b"b\n");
        assert_eq!(parse_argv(b"b\n").unwrap(), vec!["b"]);
    }

    #[test]
    fn test_arguments() {
        let frame = encode_argv(&["--getinterfaces", "eth0", ""]);
        assert_eq!(frame, b"--getinterfaces\0eth0\0\n");
        assert_eq!(
            parse_argv(&frame).unwrap(),
            vec!["--getinterfaces", "eth0", ""]
        );
    }

    #[test]
    fn test_unterminated() {
        assert!(matches!(parse_argv(b"b\0"), Err(Error::Protocol(_))));
        assert!(matches!(parse_frames(b"b"), Err(Error::Protocol(_))));
        assert!(matches!(parse_frames(b"a\nb"), Err(Error::Protocol(_))));
        assert!(matches!(parse_frames(b""), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_invalid() {
        assert!(parse_argv(b"\n").is_err());
        assert!(parse_argv(b"\xff\xfe\n").is_err());
    }

    #[test]
    fn test_frames() {
        let mut data = encode_argv(&["--version"]);
        data.extend(encode_argv(&["--listen"]));
        data.extend(encode_argv(&["-n", "eth0"]));

        assert_eq!(
            parse_frames(&data).unwrap(),
            vec![
                vec!["--version".to_string()],
                vec!["--listen".to_string()],
                vec!["-n".to_string(), "eth0".to_string()],
            ]
        );
    }
}
