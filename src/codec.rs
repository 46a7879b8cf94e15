//! CRLF-terminated line reading/writing shared by both legs of the bridge.

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// A parsed client/origin request line.
///
/// `raw` keeps the exact bytes read (including the trailing CRLF/LF) so that
/// unknown verbs can be forwarded byte-for-byte; `command`/`param` are the
/// trimmed, split-on-first-space form used for dispatch.
#[derive(Debug, Clone, Default)]
pub struct ParsedLine {
    pub raw: String,
    pub command: String,
    pub param: String,
}

/// Read one line from `reader`, terminated by the first `\n`.
///
/// Returns `Ok(None)` on EOF (no bytes read before the stream closed).
pub async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Split a raw line into verb/param, uppercasing the verb for dispatch.
///
/// The parameter is preserved byte-for-byte (no further trimming beyond the
/// single splitting space and the line terminator).
pub fn parse_line(raw: &str) -> ParsedLine {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.splitn(2, ' ');
    let command = parts.next().unwrap_or("").to_ascii_uppercase();
    let param = parts.next().unwrap_or("").to_string();

    ParsedLine {
        raw: raw.to_string(),
        command,
        param,
    }
}

/// Write `"<code> <message>\r\n"` to `writer` and flush it.
pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: u16,
    message: &str,
) -> std::io::Result<()> {
    let line = format!("{code} {message}\r\n");
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Write a raw, already-framed line (used to forward opaque origin replies
/// and unknown-verb passthrough byte-exactly).
pub async fn write_raw<W: AsyncWrite + Unpin>(writer: &mut W, raw: &str) -> std::io::Result<()> {
    writer.write_all(raw.as_bytes()).await?;
    writer.flush().await
}

/// Whether `line` opens a multi-line FTP reply (`"ddd-"`) as opposed to
/// closing one or standing alone (`"ddd "`).
pub fn opens_multiline_reply(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    if bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b'-' {
        Some(&line[..3])
    } else {
        None
    }
}

/// Whether `line` closes a multi-line reply opened with reply code `code`.
pub fn closes_multiline_reply(line: &str, code: &str) -> bool {
    line.len() >= 4 && &line[..3] == code && line.as_bytes()[3] == b' '
}
