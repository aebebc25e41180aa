//! Minimal HTTP/1.1 client pieces used by the DoH, tunnel and public-IP
//! probes. These run over whatever stream the caller already established,
//! which is the point: proxied and TLS-wrapped connections reuse them.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

const MAX_BODY: usize = 1024 * 1024;

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", user, password)))
}

pub async fn write_get<S>(stream: &mut S, host: &str, path: &str, headers: &[(&str, &str)]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut req = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, host);
    for (name, value) in headers {
        req.push_str(&format!("{}: {}\r\n", name, value));
    }
    req.push_str("Connection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn write_post<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    content_type: &str,
    body: &[u8],
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let req = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: {}\r\nAccept: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        path,
        host,
        content_type,
        content_type,
        body.len()
    );
    stream.write_all(req.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a status line, headers and body. Bodies are delimited by
/// Content-Length, chunked framing, or connection close, whichever the
/// server chose.
pub async fn read_response<S>(stream: S) -> Result<HttpResponse>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);

    let status_line = read_line(&mut reader).await?;
    let status = parse_status_line(&status_line)?;

    let mut headers = Vec::new();
    loop {
        let line = read_line(&mut reader).await?;
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let response = HttpResponse {
        status,
        headers,
        body: Vec::new(),
    };

    // These statuses never carry a body.
    if matches!(status, 101 | 204 | 304) || (100..200).contains(&status) {
        return Ok(response);
    }

    let mut response = response;
    if response
        .header("Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        response.body = read_chunked(&mut reader).await?;
    } else if let Some(len) = response.header("Content-Length") {
        let len: usize = len.trim().parse().context("bad Content-Length")?;
        if len > MAX_BODY {
            bail!("response body too large: {}", len);
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        response.body = body;
    } else {
        let mut body = Vec::new();
        reader
            .take(MAX_BODY as u64)
            .read_to_end(&mut body)
            .await?;
        response.body = body;
    }

    Ok(response)
}

fn parse_status_line(line: &str) -> Result<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        bail!("not an http response: {:?}", line);
    }
    parts
        .next()
        .and_then(|s| s.parse().ok())
        .context("missing http status code")
}

async fn read_line<S>(reader: &mut BufReader<S>) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if byte != b'\r' {
            line.push(byte);
        }
        if line.len() > 16 * 1024 {
            bail!("http header line too long");
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

async fn read_chunked<S>(reader: &mut BufReader<S>) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let size_line = read_line(reader).await?;
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or("").trim(), 16)
            .context("bad chunk size")?;
        if size == 0 {
            // Trailing headers until the blank line.
            loop {
                if read_line(reader).await?.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        if body.len() + size > MAX_BODY {
            bail!("chunked body too large");
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        body.extend_from_slice(&chunk);
        // Chunk terminator CRLF.
        let _ = read_line(reader).await?;
    }
}
