//! Minimal SMTP client for alert delivery.
//!
//! Speaks just enough of RFC 5321 to hand one message to a relay: EHLO,
//! STARTTLS, AUTH PLAIN, MAIL/RCPT/DATA, QUIT. STARTTLS is attempted first;
//! if the upgrade cannot be negotiated the session is abandoned and a fresh
//! implicit-TLS connection is tried instead. Plaintext delivery is never
//! attempted.
//!
//! The per-attempt deadline is enforced through socket timeouts set at
//! connect time; a stalled relay surfaces as a timeout error the dispatcher
//! treats like any other transient failure.

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use std::io::{Read, Write};
use std::net::TcpStream;

use super::tls::{self, TlsStream};
use crate::config::SmtpConfig;

const MAX_REPLY_LINE: usize = 1024;
const CLIENT_NAME: &str = "vigil";

/// Deliver one message. Connect, negotiate TLS, authenticate when
/// credentials are configured, send, quit.
pub fn send_mail(cfg: &SmtpConfig, recipient: &str, subject: &str, body: &str) -> Result<()> {
    let host = cfg
        .host
        .as_deref()
        .ok_or_else(|| anyhow!("SMTP_HOST not configured"))?;

    match starttls_session(cfg, host) {
        Ok(mut wire) => deliver(&mut wire, cfg, recipient, subject, body),
        Err(err) => {
            log::warn!(
                "smtp starttls negotiation with {} failed, retrying with implicit tls: {:#}",
                host,
                err
            );
            let stream = tls::connect(host, cfg.port, cfg.timeout)
                .with_context(|| format!("implicit tls connect to {}:{}", host, cfg.port))?;
            let mut wire = Wire::Tls(Box::new(stream));
            expect(&mut wire, &[220]).context("smtp greeting")?;
            ehlo(&mut wire)?;
            deliver(&mut wire, cfg, recipient, subject, body)
        }
    }
}

/// Plain connect, then upgrade via STARTTLS. Any negotiation failure is
/// returned so the caller can fall back.
fn starttls_session(cfg: &SmtpConfig, host: &str) -> Result<Wire> {
    let stream = tls::connect_tcp(host, cfg.port, cfg.timeout)
        .with_context(|| format!("connect to {}:{}", host, cfg.port))?;
    let mut wire = Wire::Plain(stream);
    expect(&mut wire, &[220]).context("smtp greeting")?;
    let extensions = ehlo(&mut wire)?;
    if !extensions
        .iter()
        .any(|line| line.to_ascii_uppercase().contains("STARTTLS"))
    {
        return Err(anyhow!("relay does not advertise STARTTLS"));
    }
    command(&mut wire, "STARTTLS", &[220]).context("starttls command")?;

    let Wire::Plain(stream) = wire else {
        unreachable!("starttls path starts on a plain socket");
    };
    let upgraded = tls::wrap(stream, host).context("starttls upgrade")?;
    let mut wire = Wire::Tls(Box::new(upgraded));
    // Extensions must be re-discovered on the encrypted channel.
    ehlo(&mut wire)?;
    Ok(wire)
}

fn deliver(
    wire: &mut Wire,
    cfg: &SmtpConfig,
    recipient: &str,
    subject: &str,
    body: &str,
) -> Result<()> {
    if let (Some(user), Some(password)) = (&cfg.user, &cfg.password) {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("\0{}\0{}", user, password));
        command(wire, &format!("AUTH PLAIN {}", token), &[235]).context("smtp auth")?;
    }

    command(wire, &format!("MAIL FROM:<{}>", cfg.from), &[250]).context("mail from")?;
    command(wire, &format!("RCPT TO:<{}>", recipient), &[250, 251]).context("rcpt to")?;
    command(wire, "DATA", &[354]).context("data")?;

    let message = format_message(&cfg.from, recipient, subject, body);
    wire.write_all(message.as_bytes()).context("message body")?;
    wire.write_all(b"\r\n.\r\n").context("message terminator")?;
    wire.flush()?;
    expect(wire, &[250]).context("message accepted")?;

    // Best-effort goodbye; the message is already accepted.
    let _ = command(wire, "QUIT", &[221]);
    Ok(())
}

fn ehlo(wire: &mut Wire) -> Result<Vec<String>> {
    let (code, lines) = send_and_read(wire, &format!("EHLO {}", CLIENT_NAME))?;
    if code != 250 {
        return Err(anyhow!("EHLO rejected with {}", code));
    }
    Ok(lines)
}

fn command(wire: &mut Wire, cmd: &str, accept: &[u16]) -> Result<()> {
    let (code, lines) = send_and_read(wire, cmd)?;
    if accept.contains(&code) {
        Ok(())
    } else {
        Err(anyhow!(
            "'{}' rejected with {} {}",
            cmd.split_whitespace().next().unwrap_or(cmd),
            code,
            lines.first().map(String::as_str).unwrap_or("")
        ))
    }
}

fn expect(wire: &mut Wire, accept: &[u16]) -> Result<()> {
    let (code, lines) = read_reply(wire)?;
    if accept.contains(&code) {
        Ok(())
    } else {
        Err(anyhow!(
            "unexpected reply {} {}",
            code,
            lines.first().map(String::as_str).unwrap_or("")
        ))
    }
}

fn send_and_read(wire: &mut Wire, cmd: &str) -> Result<(u16, Vec<String>)> {
    wire.write_all(cmd.as_bytes())?;
    wire.write_all(b"\r\n")?;
    wire.flush()?;
    read_reply(wire)
}

/// Read one (possibly multiline) SMTP reply: `NNN-text` continuations until
/// the `NNN text` terminator.
fn read_reply(reader: &mut impl Read) -> Result<(u16, Vec<String>)> {
    let mut lines = Vec::new();
    loop {
        let line = read_line(reader)?;
        let (code, more, text) = parse_reply_line(&line)?;
        lines.push(text);
        if !more {
            return Ok((code, lines));
        }
    }
}

fn read_line(reader: &mut impl Read) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte)?;
        if n == 0 {
            return Err(anyhow!("smtp connection closed mid-reply"));
        }
        if byte[0] == b'\n' {
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            return Ok(String::from_utf8_lossy(&buf).to_string());
        }
        buf.push(byte[0]);
        if buf.len() > MAX_REPLY_LINE {
            return Err(anyhow!("smtp reply line too long"));
        }
    }
}

fn parse_reply_line(line: &str) -> Result<(u16, bool, String)> {
    if line.len() < 3 {
        return Err(anyhow!("malformed smtp reply '{}'", line));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| anyhow!("malformed smtp reply code '{}'", line))?;
    let (more, text) = match line.as_bytes().get(3) {
        Some(b'-') => (true, &line[4..]),
        Some(b' ') => (false, &line[4..]),
        None => (false, ""),
        Some(_) => return Err(anyhow!("malformed smtp reply separator '{}'", line)),
    };
    Ok((code, more, text.to_string()))
}

/// RFC 5322 message with dot-stuffed body lines.
fn format_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    let mut message = String::new();
    message.push_str(&format!("From: {}\r\n", from));
    message.push_str(&format!("To: {}\r\n", to));
    message.push_str(&format!("Subject: {}\r\n", subject));
    message.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
    message.push_str("MIME-Version: 1.0\r\n");
    message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    message.push_str("\r\n");
    for line in body.lines() {
        if line.starts_with('.') {
            message.push('.');
        }
        message.push_str(line);
        message.push_str("\r\n");
    }
    message
}

enum Wire {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_single_line_reply() {
        let mut input = Cursor::new(b"220 relay ready\r\n".to_vec());
        let (code, lines) = read_reply(&mut input).unwrap();
        assert_eq!(code, 220);
        assert_eq!(lines, vec!["relay ready"]);
    }

    #[test]
    fn parses_multiline_ehlo_reply() {
        let mut input =
            Cursor::new(b"250-relay.example\r\n250-STARTTLS\r\n250 SIZE 10240000\r\n".to_vec());
        let (code, lines) = read_reply(&mut input).unwrap();
        assert_eq!(code, 250);
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().any(|l| l.contains("STARTTLS")));
    }

    #[test]
    fn rejects_truncated_reply() {
        let mut input = Cursor::new(b"25".to_vec());
        assert!(read_reply(&mut input).is_err());
    }

    #[test]
    fn bare_code_terminates_reply() {
        let (code, more, text) = parse_reply_line("221").unwrap();
        assert_eq!(code, 221);
        assert!(!more);
        assert!(text.is_empty());
    }

    #[test]
    fn message_has_headers_and_crlf_body() {
        let message = format_message("a@x", "b@y", "Alert", "line one\nline two");
        assert!(message.starts_with("From: a@x\r\n"));
        assert!(message.contains("Subject: Alert\r\n"));
        assert!(message.contains("\r\n\r\nline one\r\nline two\r\n"));
    }

    #[test]
    fn leading_dots_are_stuffed() {
        let message = format_message("a@x", "b@y", "s", ".hidden\nvisible");
        assert!(message.contains("\r\n..hidden\r\n"));
    }
}
