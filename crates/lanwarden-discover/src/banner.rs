//! Banner hints for open ports.
//!
//! Services such as SSH, FTP, SMTP and telnet greet first, so a plain read is
//! enough. HTTP ports get a `HEAD /` request and the response is condensed to
//! the status line plus the `Server` header.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Ports that receive an HTTP request instead of a passive read.
pub const HTTP_PORTS: [u16; 3] = [80, 8080, 8000];

const MAX_BANNER_BYTES: usize = 512;
const MAX_HINT_CHARS: usize = 96;

const HEAD_REQUEST: &[u8] = b"HEAD / HTTP/1.0\r\nUser-Agent: lanwarden\r\nAccept: */*\r\n\r\n";

/// Read a one-line hint from a freshly connected stream.
pub async fn read_hint(mut stream: TcpStream, port: u16, limit: Duration) -> Option<String> {
    let is_http = HTTP_PORTS.contains(&port);

    let raw = timeout(limit, async {
        if is_http {
            stream.write_all(HEAD_REQUEST).await.ok()?;
        }
        let mut buf = vec![0u8; MAX_BANNER_BYTES];
        let n = stream.read(&mut buf).await.ok()?;
        buf.truncate(n);
        (n > 0).then_some(buf)
    })
    .await
    .ok()
    .flatten()?;

    if is_http {
        condense_http(&raw)
    } else {
        first_line(&raw)
    }
}

/// `HTTP/1.1 401 Unauthorized; server=lighttpd/1.4.59`
pub fn condense_http(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.lines();
    let status = lines.next()?.trim();
    if !status.starts_with("HTTP/") {
        return first_line(raw);
    }

    let server = lines
        .take_while(|line| !line.trim().is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("server")
                .then(|| value.trim().to_string())
        });

    let hint = match server {
        Some(server) if !server.is_empty() => format!("{status}; server={server}"),
        _ => status.to_string(),
    };
    Some(printable(&hint)).filter(|h| !h.is_empty())
}

/// First non-empty printable line of a greeting.
pub fn first_line(raw: &[u8]) -> Option<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(printable)
        .find(|line| !line.is_empty())
}

/// Status code of a condensed HTTP hint, if the hint is one.
pub fn http_status(hint: &str) -> Option<u16> {
    let mut parts = hint.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts
        .next()?
        .trim_end_matches(';')
        .parse()
        .ok()
}

/// Whether the hint names a server implementation (an HTTP `Server` header
/// or a self-identifying greeting such as `SSH-2.0-...`).
pub fn identifies_server(hint: &str) -> bool {
    hint.contains("server=") || hint.starts_with("SSH-")
}

fn printable(line: &str) -> String {
    line.chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(MAX_HINT_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_condense_http() {
        let raw = b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"admin\"\r\nServer: lighttpd/1.4.59\r\n\r\n";
        let hint = condense_http(raw).unwrap();
        assert_eq!(hint, "HTTP/1.1 401 Unauthorized; server=lighttpd/1.4.59");
        assert_eq!(http_status(&hint), Some(401));
        assert!(identifies_server(&hint));
    }

    #[test]
    fn test_condense_http_without_server_header() {
        let hint = condense_http(b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(hint, "HTTP/1.0 200 OK");
        assert_eq!(http_status(&hint), Some(200));
        assert!(!identifies_server(&hint));
    }

    #[test]
    fn test_first_line_strips_control_bytes() {
        let ssh = b"SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13\r\n";
        assert_eq!(
            first_line(ssh).as_deref(),
            Some("SSH-2.0-OpenSSH_9.6p1 Ubuntu-3ubuntu13")
        );

        let telnet = b"\xff\xfd\x18\xff\xfd\x20\r\nrouter login: ";
        assert_eq!(first_line(telnet).as_deref(), Some("router login:"));

        assert_eq!(first_line(b"\r\n\r\n"), None);
        assert_eq!(http_status("SSH-2.0-OpenSSH"), None);
    }

    #[tokio::test]
    async fn test_read_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 ftp.lan FTP server ready\r\n").await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let hint = read_hint(stream, addr.port(), Duration::from_secs(2)).await;
        assert_eq!(hint.as_deref(), Some("220 ftp.lan FTP server ready"));
    }

    #[tokio::test]
    async fn test_silent_service_has_no_hint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let hint = read_hint(stream, addr.port(), Duration::from_millis(100)).await;
        assert_eq!(hint, None);
    }
}
